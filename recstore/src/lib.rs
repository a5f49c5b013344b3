pub mod config;
pub mod connection;
mod errors;
pub mod packets;
pub mod registry;
pub mod sem;
pub mod signals;
pub mod store;

#[cfg(test)]
mod tests;

pub use config::{ClientConfig, RegistryConfig, ServerConfig};
pub use errors::{RecStoreError, Result};
pub use registry::{Detached, ProcessDescriptor, Registry};
pub use sem::{RwSemaphore, SemKey, SemaphoreBank};
pub use store::{Record, RecordStore};

pub const DEFAULT_REGISTRY_CAPACITY: usize = config::DEFAULT_REGISTRY_CAPACITY;

use std::{fmt, io};

use shared_memory::ShmemError;

#[derive(Debug)]
pub enum RecStoreError {
    SharedMemory(ShmemError),
    Semaphore { op: &'static str, source: io::Error },
    Io(io::Error),
    RegistryFull { capacity: usize },
    Logic(String),
}

impl RecStoreError {
    /// Captures `errno` for a failed System V semaphore call.
    pub(crate) fn last_semaphore_error(op: &'static str) -> Self {
        RecStoreError::Semaphore { op, source: io::Error::last_os_error() }
    }
}

impl fmt::Display for RecStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecStoreError::SharedMemory(e) => write!(f, "Shared memory error: {}", e),
            RecStoreError::Semaphore { op, source } => write!(f, "Semaphore {} failed: {}", op, source),
            RecStoreError::Io(e) => write!(f, "IO error: {}", e),
            RecStoreError::RegistryFull { capacity } => {
                write!(f, "Process registry is full ({} slots)", capacity)
            }
            RecStoreError::Logic(s) => write!(f, "Logic error: {}", s),
        }
    }
}

impl std::error::Error for RecStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecStoreError::SharedMemory(e) => Some(e),
            RecStoreError::Semaphore { source, .. } => Some(source),
            RecStoreError::Io(e) => Some(e),
            RecStoreError::RegistryFull { .. } => None,
            RecStoreError::Logic(_) => None,
        }
    }
}

impl From<ShmemError> for RecStoreError {
    fn from(err: ShmemError) -> Self {
        RecStoreError::SharedMemory(err)
    }
}

impl From<io::Error> for RecStoreError {
    fn from(err: io::Error) -> Self {
        RecStoreError::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, RecStoreError>;

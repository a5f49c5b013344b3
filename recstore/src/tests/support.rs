use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::RegistryConfig;
use crate::errors::Result;
use crate::sem::{self, SemKey, SemaphoreBank};

static ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Routes library logs to the test output; `RUST_LOG=debug` shows lock traffic.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn next_id() -> usize {
    ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// A System V key no other test in this process uses.
pub fn unique_key() -> SemKey {
    let pid = std::process::id() as SemKey & 0xffff;
    0x5200_0000 | (pid << 8) | (next_id() as SemKey & 0xff)
}

pub fn registry_config(capacity: usize) -> RegistryConfig {
    RegistryConfig {
        segment_name: format!("/recstore-test-{}-{}", std::process::id(), next_id()),
        capacity,
    }
}

/// Bank that is removed when the test ends, whether or not it passed.
pub struct ScratchBank {
    bank: SemaphoreBank,
}

impl ScratchBank {
    pub fn new(groups: usize) -> Result<ScratchBank> {
        Ok(ScratchBank { bank: SemaphoreBank::create_or_attach(unique_key(), groups)? })
    }
}

impl Deref for ScratchBank {
    type Target = SemaphoreBank;

    fn deref(&self) -> &SemaphoreBank {
        &self.bank
    }
}

impl Drop for ScratchBank {
    fn drop(&mut self) {
        // Already gone when a registry tore it down.
        let _ = sem::remove_bank(self.bank.id());
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libc::c_int;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::debug;

use crate::errors::Result;

/// Set once a termination signal arrives.
///
/// The signal no longer kills the process. Loops poll [`Closing::is_closing`]
/// and leave between critical sections, so no lock is abandoned mid-hold.
#[derive(Clone)]
pub struct Closing {
    flag: Arc<AtomicBool>,
}

impl Closing {
    /// Routes SIGHUP, SIGINT, SIGQUIT and SIGTERM to the flag.
    pub fn install() -> Result<Closing> {
        Closing::install_for(&[SIGHUP, SIGINT, SIGQUIT, SIGTERM])
    }

    pub fn install_for(signals: &[c_int]) -> Result<Closing> {
        let flag = Arc::new(AtomicBool::new(false));
        for &signal in signals {
            signal_hook::flag::register(signal, Arc::clone(&flag))?;
        }
        debug!(?signals, "signals routed to closing flag");
        Ok(Closing { flag })
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Clears a request that was declined.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

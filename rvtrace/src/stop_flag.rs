//! Graceful-stop signal (§5 "external stop propagates by flipping it"):
//! Ctrl+C sets a flag the driver loops poll once per burst/step instead of
//! being torn down mid-checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Install a Ctrl+C handler that flips the flag. Only ever fails if a
    /// handler was already installed elsewhere in the process.
    pub fn install() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let handler_flag = Arc::clone(&flag);
        if let Err(err) = ctrlc::set_handler(move || {
            handler_flag.store(true, Ordering::SeqCst);
        }) {
            log::warn!("failed to install Ctrl+C handler: {err}");
        }
        StopFlag(flag)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        StopFlag(Arc::new(AtomicBool::new(false)))
    }

    #[cfg(test)]
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear_and_can_be_set() {
        let flag = StopFlag::new_for_test();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }
}

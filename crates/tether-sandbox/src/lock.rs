//! Execution lock
//!
//! The sandbox is single-threaded; "releasing" the lock means other threads
//! may interrupt the released section through an [`InterruptHandle`]. An
//! interrupt while released calls the section's unblocking function; one that
//! arrives while the lock is held stays pending and fires as soon as the next
//! section releases the lock.

use std::sync::Arc;

use parking_lot::Mutex;
use tether::runtime::UnblockFn;

#[derive(Default)]
struct LockState {
    released: bool,
    unblock: Option<UnblockFn>,
    pending: bool,
}

#[derive(Default)]
pub(crate) struct ExecutionLock {
    state: Arc<Mutex<LockState>>,
}

impl ExecutionLock {
    pub fn handle(&self) -> InterruptHandle {
        InterruptHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Run `body` released, then take the lock back even if `body` unwinds.
    pub fn release(&self, body: &mut dyn FnMut(), unblock: Option<UnblockFn>) {
        let pending = {
            let mut state = self.state.lock();
            state.released = true;
            state.unblock = unblock.clone();
            std::mem::take(&mut state.pending)
        };
        let _reacquire = Reacquire(self);
        if pending {
            match &unblock {
                Some(unblock) => {
                    log::trace!("delivering pending interrupt");
                    unblock();
                }
                None => self.state.lock().pending = true,
            }
        }
        body();
    }
}

struct Reacquire<'a>(&'a ExecutionLock);

impl Drop for Reacquire<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.released = false;
        state.unblock = None;
    }
}

/// Interrupts released sections from any thread.
#[derive(Clone)]
pub struct InterruptHandle {
    state: Arc<Mutex<LockState>>,
}

impl InterruptHandle {
    /// Ask the current released section to stop.
    ///
    /// Returns whether an unblocking function ran; otherwise the interrupt is
    /// left pending for the next section.
    pub fn interrupt(&self) -> bool {
        let unblock = {
            let mut state = self.state.lock();
            match (&state.unblock, state.released) {
                (Some(unblock), true) => Some(Arc::clone(unblock)),
                _ => {
                    state.pending = true;
                    None
                }
            }
        };
        match unblock {
            Some(unblock) => {
                unblock();
                true
            }
            None => false,
        }
    }

    /// Whether some thread currently runs with the lock released.
    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pending_interrupt_fires_on_release() {
        let lock = ExecutionLock::default();
        let handle = lock.handle();
        assert!(!handle.interrupt());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let unblock: UnblockFn = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut ran = false;
        lock.release(&mut || ran = true, Some(unblock));
        assert!(ran);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!lock.is_released());
    }

    #[test]
    fn test_interrupt_while_released() {
        let lock = ExecutionLock::default();
        let handle = lock.handle();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let unblock: UnblockFn = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        lock.release(
            &mut || {
                assert!(handle.is_released());
                assert!(handle.interrupt());
            },
            Some(unblock),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!handle.is_released());
    }
}

//! Running native work without the execution lock
//!
//! While the lock is released other runtime threads may run, so the closure
//! must not touch handles or call back into the runtime. Handles are `!Send`,
//! which makes capturing one a compile error here:
//!
//! ```compile_fail
//! use tether::{lock::without_lock, Handle};
//!
//! let handle = Handle::NIL;
//! let _ = without_lock(move || handle.is_nil());
//! ```

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::runtime::{with_runtime, UnblockFn};

/// Run `f` with the execution lock released.
pub fn without_lock<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    release(f, None)
}

/// Run `f` with the execution lock released; `unblock` is called, possibly
/// from another thread, when the runtime wants `f` to stop early.
pub fn without_lock_interruptible<F, R, U>(f: F, unblock: U) -> Result<R>
where
    F: FnOnce() -> R + Send,
    R: Send,
    U: Fn() + Send + Sync + 'static,
{
    release(f, Some(Arc::new(unblock)))
}

fn release<F, R>(f: F, unblock: Option<UnblockFn>) -> Result<R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    let mut f = Some(f);
    let mut result = None;
    with_runtime(|rt| {
        log::trace!("releasing execution lock");
        rt.without_lock(
            &mut || {
                if let Some(f) = f.take() {
                    result = Some(f());
                }
            },
            unblock,
        );
        log::trace!("reacquired execution lock");
    })?;
    result.ok_or_else(|| Error::Runtime("runtime did not run the unlocked section".to_string()))
}

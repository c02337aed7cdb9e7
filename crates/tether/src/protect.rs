//! Protected calls across the runtime boundary
//!
//! Outbound: [`protect`] runs a runtime operation so that any raise or jump it
//! performs is captured as an [`Error`] instead of escaping through native
//! frames.
//!
//! Inbound: [`call_guarded`] wraps the body of every native entry. Nothing
//! leaves it as an unwind: errors and panics are turned into a [`Transfer`]
//! that is armed on the runtime, and the entry returns [`Handle::UNDEF`] so the
//! runtime can replay the transfer in its own frames.

use std::panic::{self, AssertUnwindSafe};

use crate::error::{Error, Jump, Result, Tag, Transfer};
use crate::handle::{Handle, ReprValue};
use crate::runtime::{Runtime, Session};

// ============================================================================
// Outbound
// ============================================================================

/// Run `f` against the attached runtime, capturing non-local transfers.
///
/// A raise becomes [`Error::ManagedRaise`] carrying the exception object; any
/// other transfer becomes [`Error::NonLocalTransfer`].
pub fn protect<R>(f: impl FnOnce(&dyn Runtime) -> R) -> Result<R> {
    let session = Session::current()?;
    protect_with(session.runtime(), f)
}

pub(crate) fn protect_with<R>(rt: &dyn Runtime, f: impl FnOnce(&dyn Runtime) -> R) -> Result<R> {
    let mut f = Some(f);
    let mut result = None;
    let tag = rt.protect(&mut || {
        if let Some(f) = f.take() {
            result = Some(f(rt));
        }
    });
    check_jump_tag(rt, tag)?;
    result.ok_or_else(|| Error::Runtime("protected call returned without running".to_string()))
}

/// Turn a tag reported by [`Runtime::protect`] into a result.
pub fn check_jump_tag(rt: &dyn Runtime, tag: Tag) -> Result<()> {
    match tag {
        Tag::NONE => Ok(()),
        Tag::RAISE => Err(Error::ManagedRaise(rt.take_errinfo())),
        other => Err(Error::NonLocalTransfer(other)),
    }
}

impl Error {
    /// Build an exception of `class` right away.
    ///
    /// The result is a [`Error::ManagedRaise`] carrying the new exception, or
    /// whatever failure constructing it produced.
    pub fn new<C: ReprValue>(class: C, message: &str) -> Error {
        let class = class.handle();
        let built = protect(|rt| {
            let message = rt.str_new(message);
            rt.new_instance(class, &[message])
        });
        match built {
            Ok(exception) => Error::ManagedRaise(exception),
            Err(err) => err,
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Run a native entry body, delivering every failure to the runtime.
///
/// Returns the body's handle on success and [`Handle::UNDEF`] after arming a
/// transfer.
pub fn call_guarded<F>(body: F) -> Handle
where
    F: FnOnce() -> Result<Handle>,
{
    let err = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(handle)) => return handle,
        Ok(Err(err)) => err,
        Err(payload) => match payload.downcast::<Jump>() {
            Ok(jump) => unwound_transfer(jump.tag()),
            Err(payload) => Error::from_panic(payload),
        },
    };
    deliver(err);
    Handle::UNDEF
}

/// A runtime transfer that unwound through native frames unprotected.
fn unwound_transfer(tag: Tag) -> Error {
    if tag != Tag::RAISE {
        return Error::NonLocalTransfer(tag);
    }
    match Session::current() {
        Ok(session) => Error::ManagedRaise(session.runtime().take_errinfo()),
        Err(_) => Error::NonLocalTransfer(tag),
    }
}

fn deliver(err: Error) {
    let session = match Session::current() {
        Ok(session) => session,
        Err(_) => {
            log::error!("no runtime attached; dropping native error: {err}");
            return;
        }
    };
    let rt = session.runtime();
    let transfer = into_transfer(rt, err);
    log::trace!("arming {transfer:?}");
    rt.arm_transfer(transfer);
}

/// The transfer that delivers `err` to the runtime.
///
/// Forwarded conditions keep their identity; everything else becomes a fresh
/// exception of [`Error::exception_class`] carrying the error's message.
pub fn into_transfer(rt: &dyn Runtime, err: Error) -> Transfer {
    match err {
        Error::ManagedRaise(exception) => Transfer::Raise(exception),
        Error::NonLocalTransfer(tag) => Transfer::Jump(tag),
        other => {
            let class = rt.builtin(other.exception_class());
            let message = other.to_string();
            let built = protect_with(rt, |rt| {
                let message = rt.str_new(&message);
                rt.new_instance(class, &[message])
            });
            match built {
                Ok(exception) => Transfer::Raise(exception),
                Err(Error::ManagedRaise(exception)) => Transfer::Raise(exception),
                Err(Error::NonLocalTransfer(tag)) => Transfer::Jump(tag),
                Err(nested) => {
                    log::error!("could not build exception for {other}: {nested}");
                    Transfer::Jump(Tag::FATAL)
                }
            }
        }
    }
}

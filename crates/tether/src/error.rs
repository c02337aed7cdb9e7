//! Error types for the bridge
//!
//! Every failure that can happen on the native side of a call is an
//! [`Error`]. Two variants are opaque carriers for conditions that started in
//! the managed runtime ([`Error::ManagedRaise`] and
//! [`Error::NonLocalTransfer`]); they are forwarded back unchanged when they
//! reach a trampoline. Everything else is materialized as a fresh exception of
//! the class named by [`Error::exception_class`].

use std::any::Any;
use std::fmt;

use crate::handle::Handle;
use crate::runtime::Builtin;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Transfer tags
// ============================================================================

/// Kind of non-local control transfer in progress inside the runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(i32);

impl Tag {
    /// No transfer
    pub const NONE: Tag = Tag(0);
    /// `return` out of a block
    pub const RETURN: Tag = Tag(1);
    /// `break` out of a block
    pub const BREAK: Tag = Tag(2);
    /// `next` inside a block
    pub const NEXT: Tag = Tag(3);
    /// `retry` in a rescue clause
    pub const RETRY: Tag = Tag(4);
    /// `redo` inside a block
    pub const REDO: Tag = Tag(5);
    /// An exception is being raised; the exception is in the pending slot
    pub const RAISE: Tag = Tag(6);
    /// `throw` towards a matching `catch`
    pub const THROW: Tag = Tag(7);
    /// Unrecoverable condition
    pub const FATAL: Tag = Tag(8);

    /// Tag from its raw runtime value.
    pub const fn from_raw(raw: i32) -> Self {
        Tag(raw)
    }

    /// Raw runtime value.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Whether a transfer actually happened.
    pub fn is_none(self) -> bool {
        self == Tag::NONE
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Tag::NONE => "NONE",
            Tag::RETURN => "RETURN",
            Tag::BREAK => "BREAK",
            Tag::NEXT => "NEXT",
            Tag::RETRY => "RETRY",
            Tag::REDO => "REDO",
            Tag::RAISE => "RAISE",
            Tag::THROW => "THROW",
            Tag::FATAL => "FATAL",
            _ => return write!(f, "Tag({})", self.0),
        };
        f.write_str(name)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Unwind payload used by runtimes that implement transfers by unwinding.
///
/// A runtime that lets a raise or jump unwind through native frames must use
/// this type as the payload so that trampolines can recognize and forward it
/// instead of reporting it as a native fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jump {
    tag: Tag,
}

impl Jump {
    /// Payload for a transfer of kind `tag`.
    pub fn new(tag: Tag) -> Self {
        Jump { tag }
    }

    /// Transfer kind.
    pub fn tag(&self) -> Tag {
        self.tag
    }
}

/// A transfer armed by a native entry for the runtime to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Raise this exception object
    Raise(Handle),
    /// Resume a non-exceptional transfer
    Jump(Tag),
}

// ============================================================================
// Error
// ============================================================================

/// Bridge error
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Missing or surplus arguments, wrong tuple length
    #[error("{0}")]
    Argument(String),

    /// Dynamic type does not match the expected native type
    #[error("{0}")]
    Type(String),

    /// Numeric narrowing overflow
    #[error("{0}")]
    Range(String),

    /// Mutating access to a frozen object
    #[error("{0}")]
    Frozen(String),

    /// Native-bound object accessed before construction
    #[error("{type_name} object is not yet initialized")]
    Uninitialized {
        /// Name of the bound native type
        type_name: String,
    },

    /// Overlapping access to a native payload
    #[error("{0}")]
    Borrow(String),

    /// Misuse of the binding surface (double bind, misplaced splat, ...)
    #[error("{0}")]
    Definition(String),

    /// Generic runtime-level failure
    #[error("{0}")]
    Runtime(String),

    /// Trampoline code generation failed
    #[error("trampoline generation failed: {0}")]
    Trampoline(String),

    /// An exception raised by the managed runtime, forwarded as-is
    #[error("managed exception {0:?}")]
    ManagedRaise(Handle),

    /// A non-exceptional transfer, forwarded as-is
    #[error("non-local transfer {0}")]
    NonLocalTransfer(Tag),

    /// A native failure with a recoverable type name and message
    #[error("{type_name}: {message}")]
    NativeFault {
        /// Name of the native error type
        type_name: String,
        /// The error's message
        message: String,
    },

    /// A native failure carrying no type information
    #[error("unknown: ")]
    UnknownFault,
}

impl Error {
    /// Wrap a native error, keeping its type name and message.
    pub fn native<E>(err: E) -> Self
    where
        E: std::error::Error + 'static,
    {
        Error::NativeFault {
            type_name: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
        }
    }

    /// Classify a panic payload caught at a trampoline boundary.
    ///
    /// Runtime [`Jump`] payloads are not faults; callers forward those before
    /// reaching here.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<String>() {
            Ok(message) => Error::NativeFault {
                type_name: "panic".to_string(),
                message: *message,
            },
            Err(payload) => match payload.downcast_ref::<&'static str>() {
                Some(message) => Error::NativeFault {
                    type_name: "panic".to_string(),
                    message: (*message).to_string(),
                },
                None => Error::UnknownFault,
            },
        }
    }

    /// Whether this error is a managed condition being forwarded.
    pub fn is_transfer(&self) -> bool {
        matches!(self, Error::ManagedRaise(_) | Error::NonLocalTransfer(_))
    }

    /// The managed exception object, if this is a forwarded raise.
    pub fn exception(&self) -> Option<Handle> {
        match self {
            Error::ManagedRaise(exception) => Some(*exception),
            _ => None,
        }
    }

    /// Built-in exception class this error is delivered as.
    ///
    /// Forwarded conditions have no class of their own and report
    /// `RuntimeError`; they are never materialized.
    pub fn exception_class(&self) -> Builtin {
        match self {
            Error::Argument(_) => Builtin::ArgumentError,
            Error::Type(_) | Error::Definition(_) => Builtin::TypeError,
            Error::Range(_) => Builtin::RangeError,
            Error::Frozen(_) => Builtin::FrozenError,
            Error::Uninitialized { .. }
            | Error::Borrow(_)
            | Error::Runtime(_)
            | Error::Trampoline(_)
            | Error::NativeFault { .. }
            | Error::UnknownFault
            | Error::ManagedRaise(_)
            | Error::NonLocalTransfer(_) => Builtin::RuntimeError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Overheated;

    impl fmt::Display for Overheated {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("core temperature exceeded")
        }
    }

    impl std::error::Error for Overheated {}

    #[test]
    fn test_native_error_keeps_type_and_message() {
        let err = Error::native(Overheated);
        let text = err.to_string();
        assert!(text.ends_with("Overheated: core temperature exceeded"), "{text}");
        assert_eq!(err.exception_class(), Builtin::RuntimeError);
    }

    #[test]
    fn test_panic_payloads() {
        let err = Error::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "panic: boom");

        let err = Error::from_panic(Box::new(String::from("owned boom")));
        assert_eq!(err.to_string(), "panic: owned boom");

        let err = Error::from_panic(Box::new(42_u32));
        assert!(matches!(err, Error::UnknownFault));
        assert_eq!(err.to_string(), "unknown: ");
    }

    #[test]
    fn test_exception_classes() {
        assert_eq!(Error::Argument("x".into()).exception_class(), Builtin::ArgumentError);
        assert_eq!(Error::Range("x".into()).exception_class(), Builtin::RangeError);
        assert_eq!(Error::Frozen("x".into()).exception_class(), Builtin::FrozenError);
        assert_eq!(Error::Definition("x".into()).exception_class(), Builtin::TypeError);
        assert!(Error::NonLocalTransfer(Tag::THROW).is_transfer());
        assert!(!Error::UnknownFault.is_transfer());
    }

    #[test]
    fn test_tag_debug() {
        assert_eq!(format!("{:?}", Tag::THROW), "THROW");
        assert_eq!(format!("{:?}", Tag::from_raw(42)), "Tag(42)");
    }
}

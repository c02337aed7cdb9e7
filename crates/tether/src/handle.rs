//! Object handles
//!
//! A [`Handle`] is the machine word a managed runtime uses to name one of its
//! objects. The bridge never looks inside a handle beyond the four immediates
//! fixed by the call-in ABI; every other bit pattern is runtime-defined and is
//! interpreted through [`Runtime`](crate::Runtime).
//!
//! Handles are deliberately neither `Send` nor `Sync`. A handle is only valid
//! on the thread that currently holds the runtime's execution lock, and that
//! restriction is what lets [`without_lock`](crate::lock::without_lock) reject
//! closures that capture handles at compile time.

use std::fmt;
use std::marker::PhantomData;

// ============================================================================
// Handle
// ============================================================================

/// Opaque reference to a managed-runtime object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle {
    bits: usize,
    _thread_bound: PhantomData<*const ()>,
}

impl Handle {
    /// The `false` immediate
    pub const FALSE: Handle = Handle::from_bits(0x00);
    /// The `nil` immediate
    pub const NIL: Handle = Handle::from_bits(0x08);
    /// The `true` immediate
    pub const TRUE: Handle = Handle::from_bits(0x14);
    /// Sentinel returned by native entries that armed a transfer.
    ///
    /// Never a valid object; runtimes must not hand it to native code.
    pub const UNDEF: Handle = Handle::from_bits(0x34);

    /// Wrap a raw machine word.
    pub const fn from_bits(bits: usize) -> Self {
        Handle {
            bits,
            _thread_bound: PhantomData,
        }
    }

    /// The raw machine word.
    pub const fn to_bits(self) -> usize {
        self.bits
    }

    /// Handle for a native boolean.
    pub const fn from_bool(value: bool) -> Self {
        if value {
            Handle::TRUE
        } else {
            Handle::FALSE
        }
    }

    /// Whether this is the `nil` immediate.
    pub fn is_nil(self) -> bool {
        self == Handle::NIL
    }

    /// Whether this is the [`UNDEF`](Handle::UNDEF) sentinel.
    pub fn is_undef(self) -> bool {
        self == Handle::UNDEF
    }

    /// Managed truthiness: everything except `nil` and `false` is true.
    pub fn is_truthy(self) -> bool {
        self != Handle::NIL && self != Handle::FALSE
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Handle::FALSE => f.write_str("Handle(false)"),
            Handle::NIL => f.write_str("Handle(nil)"),
            Handle::TRUE => f.write_str("Handle(true)"),
            Handle::UNDEF => f.write_str("Handle(undef)"),
            other => write!(f, "Handle({:#x})", other.bits),
        }
    }
}

// ============================================================================
// Value types
// ============================================================================

/// Coarse dynamic type of a handle, as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// `nil`
    Nil,
    /// `true`
    True,
    /// `false`
    False,
    /// The UNDEF sentinel
    Undef,
    /// Integer of any magnitude
    Integer,
    /// Floating-point number
    Float,
    /// Symbol
    Symbol,
    /// Mutable byte string
    String,
    /// Ordered collection
    Array,
    /// Module
    Module,
    /// Class
    Class,
    /// Callable block object
    Proc,
    /// Object carrying a native payload slot
    Data,
    /// Any other plain object, including exceptions
    Object,
}

impl ValueType {
    /// Human-readable name used in conversion errors.
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Nil => "nil",
            ValueType::True => "true",
            ValueType::False => "false",
            ValueType::Undef => "undef",
            ValueType::Integer => "Integer",
            ValueType::Float => "Float",
            ValueType::Symbol => "Symbol",
            ValueType::String => "String",
            ValueType::Array => "Array",
            ValueType::Module => "Module",
            ValueType::Class => "Class",
            ValueType::Proc => "Proc",
            ValueType::Data => "Data",
            ValueType::Object => "Object",
        }
    }
}

/// Types that are nothing more than a handle with a static type claim.
///
/// # Safety
///
/// Implementors must be `#[repr(transparent)]` over [`Handle`] (directly or
/// through another `ReprValue`) so that `from_handle_unchecked` is a pure
/// reinterpretation.
pub unsafe trait ReprValue: Copy {
    /// The underlying handle.
    fn handle(self) -> Handle;

    /// Reinterpret a handle without checking its dynamic type.
    ///
    /// # Safety
    ///
    /// The caller guarantees `handle` has the dynamic type `Self` claims.
    unsafe fn from_handle_unchecked(handle: Handle) -> Self;
}

unsafe impl ReprValue for Handle {
    fn handle(self) -> Handle {
        self
    }

    unsafe fn from_handle_unchecked(handle: Handle) -> Self {
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Handle::NIL.is_truthy());
        assert!(!Handle::FALSE.is_truthy());
        assert!(Handle::TRUE.is_truthy());
        assert!(Handle::from_bits(0x1001).is_truthy());
    }

    #[test]
    fn test_bool_roundtrip_immediates() {
        assert_eq!(Handle::from_bool(true), Handle::TRUE);
        assert_eq!(Handle::from_bool(false), Handle::FALSE);
        assert_eq!(Handle::from_bits(0x08).to_bits(), Handle::NIL.to_bits());
    }

    #[test]
    fn test_debug_names_immediates() {
        assert_eq!(format!("{:?}", Handle::NIL), "Handle(nil)");
        assert_eq!(format!("{:?}", Handle::from_bits(0x1010)), "Handle(0x1010)");
    }
}

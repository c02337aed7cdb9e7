//! Typed handle wrappers
//!
//! [`Value`] is a handle of unknown dynamic type. The other wrappers carry a
//! static claim checked on conversion ([`FromHandle`](crate::FromHandle)) and
//! expose the runtime operations that make sense for that type.

mod array;
mod module;
mod proc;
mod string;

pub use array::Array;
pub use module::{Class, Module};
pub use proc::Proc;
pub use string::{RString, Symbol};

use std::fmt;

use crate::args::ArgList;
use crate::convert::{FromHandle, IntoArgs, IntoHandle, ReturnValue};
use crate::error::{Error, Result};
use crate::handle::{Handle, ReprValue, ValueType};
use crate::ident::IntoId;
use crate::protect::{protect, protect_with};
use crate::runtime::{Runtime, Session};

/// Implements the plumbing shared by every handle wrapper.
macro_rules! handle_wrapper {
    ($name:ident) => {
        unsafe impl $crate::handle::ReprValue for $name {
            fn handle(self) -> $crate::handle::Handle {
                $crate::handle::ReprValue::handle(self.0)
            }

            unsafe fn from_handle_unchecked(handle: $crate::handle::Handle) -> Self {
                $name($crate::handle::ReprValue::from_handle_unchecked(handle))
            }
        }

        impl $name {
            /// The underlying handle.
            pub fn as_handle(self) -> $crate::handle::Handle {
                $crate::handle::ReprValue::handle(self)
            }

            /// View as an untyped value.
            pub fn as_value(self) -> $crate::value::Value {
                $crate::value::Value::from_handle(self.as_handle())
            }
        }

        impl From<$name> for $crate::value::Value {
            fn from(value: $name) -> Self {
                value.as_value()
            }
        }

        impl $crate::convert::IntoHandle for $name {
            fn into_handle(self) -> $crate::error::Result<$crate::handle::Handle> {
                Ok(self.as_handle())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(&self.as_value(), f)
            }
        }
    };
}

pub(crate) use handle_wrapper;

/// Fail with a `TypeError` unless `handle`'s dynamic type is accepted.
pub(crate) fn check_type(
    handle: Handle,
    expected: &str,
    accepts: impl Fn(ValueType) -> bool,
) -> Result<()> {
    let session = Session::current()?;
    let rt = session.runtime();
    if accepts(rt.value_type(handle)) {
        return Ok(());
    }
    Err(Error::Type(format!(
        "Expected a {expected} but got a {}",
        class_name(rt, handle)
    )))
}

/// Class name of a handle, for messages.
pub(crate) fn class_name(rt: &dyn Runtime, handle: Handle) -> String {
    rt.str_read(rt.class_path(rt.class_of(handle)))
}

// ============================================================================
// Value
// ============================================================================

/// A handle of any dynamic type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(Handle);

unsafe impl ReprValue for Value {
    fn handle(self) -> Handle {
        self.0
    }

    unsafe fn from_handle_unchecked(handle: Handle) -> Self {
        Value(handle)
    }
}

impl Value {
    /// Any handle is a value.
    pub const fn from_handle(handle: Handle) -> Self {
        Value(handle)
    }

    /// `nil`
    pub const fn nil() -> Self {
        Value(Handle::NIL)
    }

    /// `true` or `false`
    pub const fn from_bool(value: bool) -> Self {
        Value(Handle::from_bool(value))
    }

    /// The underlying handle.
    pub fn as_handle(self) -> Handle {
        self.0
    }

    /// Whether this is `nil`.
    pub fn is_nil(self) -> bool {
        self.0.is_nil()
    }

    /// Managed truthiness.
    pub fn is_truthy(self) -> bool {
        self.0.is_truthy()
    }

    /// Coarse dynamic type.
    pub fn value_type(self) -> Result<ValueType> {
        let session = Session::current()?;
        Ok(session.runtime().value_type(self.0))
    }

    /// Class of this value.
    pub fn class(self) -> Result<Class> {
        let session = Session::current()?;
        let class = session.runtime().class_of(self.0);
        // SAFETY: the runtime reports a class.
        Ok(unsafe { Class::from_handle_unchecked(class) })
    }

    /// Whether this is an instance of `class` or one of its subclasses.
    pub fn is_kind_of(self, class: Class) -> Result<bool> {
        let class = class.as_handle();
        protect(|rt| rt.is_kind_of(self.0, class))
    }

    /// Whether this is a direct instance of `class`.
    pub fn is_instance_of(self, class: Class) -> Result<bool> {
        let class = class.as_handle();
        protect(|rt| rt.is_instance_of(self.0, class))
    }

    /// Whether this value is frozen.
    pub fn is_frozen(self) -> Result<bool> {
        let session = Session::current()?;
        Ok(session.runtime().is_frozen(self.0))
    }

    /// Freeze in place.
    pub fn freeze(self) -> Result<Self> {
        protect(|rt| rt.freeze(self.0)).map(Value)
    }

    /// Fail with the runtime's `FrozenError` if frozen.
    pub fn check_frozen(self) -> Result<()> {
        protect(|rt| rt.check_frozen(self.0))
    }

    /// Send a message.
    pub fn send<R: FromHandle>(self, method: impl IntoId, args: impl IntoArgs) -> Result<R> {
        self.send_inner(method, args, None)
    }

    /// Send a message with a block attached.
    pub fn send_with_block<R: FromHandle>(
        self,
        method: impl IntoId,
        args: impl IntoArgs,
        block: Proc,
    ) -> Result<R> {
        self.send_inner(method, args, Some(block.as_handle()))
    }

    fn send_inner<R: FromHandle>(
        self,
        method: impl IntoId,
        args: impl IntoArgs,
        block: Option<Handle>,
    ) -> Result<R> {
        let args = args.into_args()?;
        let session = Session::current()?;
        let rt = session.runtime();
        let method = method.into_raw_id(rt)?;
        let result = protect_with(rt, |rt| rt.funcall(self.0, method, &args, block))?;
        R::from_handle(result)
    }

    /// Whether this value responds to `method`.
    pub fn respond_to(self, method: impl IntoId) -> Result<bool> {
        let session = Session::current()?;
        let rt = session.runtime();
        let method = method.into_raw_id(rt)?;
        Ok(rt.respond_to(self.0, method))
    }

    /// Structural equality through the runtime's `==`.
    pub fn equal(self, other: Value) -> Result<bool> {
        self.send("==", (other,))
    }

    /// Debug representation.
    pub fn inspect(self) -> Result<String> {
        let repr = protect(|rt| rt.inspect(self.0))?;
        String::from_handle(repr)
    }

    /// Display representation.
    pub fn to_s(self) -> Result<String> {
        let repr = protect(|rt| rt.to_s(self.0))?;
        String::from_handle(repr)
    }

    /// Read an instance variable (`@name`).
    pub fn ivar_get<T: FromHandle>(self, name: impl IntoId) -> Result<T> {
        let session = Session::current()?;
        let rt = session.runtime();
        let name = name.into_raw_id(rt)?;
        T::from_handle(rt.ivar_get(self.0, name))
    }

    /// Write an instance variable (`@name`).
    pub fn ivar_set<T: IntoHandle>(self, name: impl IntoId, value: T) -> Result<()> {
        let value = value.into_handle()?;
        let session = Session::current()?;
        let rt = session.runtime();
        let name = name.into_raw_id(rt)?;
        protect_with(rt, |rt| rt.ivar_set(self.0, name, value))
    }

    /// Whether an instance variable is set.
    pub fn ivar_defined(self, name: impl IntoId) -> Result<bool> {
        let session = Session::current()?;
        let rt = session.runtime();
        let name = name.into_raw_id(rt)?;
        Ok(rt.ivar_defined(self.0, name))
    }

    /// Singleton class, created on demand.
    pub fn singleton_class(self) -> Result<Class> {
        let class = protect(|rt| rt.singleton_class(self.0))?;
        // SAFETY: the runtime returns a class.
        Ok(unsafe { Class::from_handle_unchecked(class) })
    }

    /// Define a method on this object's singleton class.
    pub fn define_singleton_method<S, F, R>(self, name: &str, specs: S, f: F) -> Result<Self>
    where
        S: ArgList + 'static,
        F: Fn(S::Output) -> R + 'static,
        R: ReturnValue,
    {
        self.singleton_class()?.define_method(name, specs, f)?;
        Ok(self)
    }
}

impl From<Handle> for Value {
    fn from(handle: Handle) -> Self {
        Value(handle)
    }
}

impl fmt::Display for Value {
    /// `{}` uses `to_s`, `{:#}` uses `inspect`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = if f.alternate() {
            self.inspect()
        } else {
            self.to_s()
        };
        match text {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inspect() {
            Ok(text) => write!(f, "Value({text})"),
            Err(_) => write!(f, "Value({:?})", self.0),
        }
    }
}

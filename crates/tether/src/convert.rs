//! Conversions between native values and handles
//!
//! [`IntoHandle`] and [`FromHandle`] form the conversion registry: exactly one
//! impl per native type. Conversions that need the runtime to coerce or check
//! a value run inside [`protect`], so a raise in the runtime surfaces as an
//! [`Error`] rather than unwinding through the caller.
//!
//! Integers go through the runtime's integer coercion protocol and are then
//! narrowed here, so every integer type reports overflow the same way:
//!
//! ```text
//! integer 300 too big to convert to 'i8'
//! ```

use crate::error::{Error, Result};
use crate::handle::{Handle, ValueType};
use crate::protect::protect;
use crate::runtime::{with_runtime, Session};
use crate::value::{check_type, Array, Value};

// ============================================================================
// Traits
// ============================================================================

/// Convert a native value into a handle.
pub trait IntoHandle {
    /// Perform the conversion.
    fn into_handle(self) -> Result<Handle>;
}

/// Convert a handle into a native value, checking its dynamic type.
pub trait FromHandle: Sized {
    /// Perform the conversion.
    fn from_handle(handle: Handle) -> Result<Self>;
}

/// Convert `value` into a handle.
pub fn into_handle<T: IntoHandle>(value: T) -> Result<Handle> {
    value.into_handle()
}

/// Convert `handle` into a `T`.
pub fn from_handle<T: FromHandle>(handle: Handle) -> Result<T> {
    T::from_handle(handle)
}

/// Result of a native method body.
///
/// Plain values are converted with [`IntoHandle`]; a `Result` delivers its
/// error to the caller instead.
pub trait ReturnValue {
    /// Convert into the handle returned to the runtime.
    fn into_return(self) -> Result<Handle>;
}

impl<T: IntoHandle> ReturnValue for T {
    fn into_return(self) -> Result<Handle> {
        self.into_handle()
    }
}

impl<T: IntoHandle> ReturnValue for Result<T> {
    fn into_return(self) -> Result<Handle> {
        self.and_then(IntoHandle::into_handle)
    }
}

/// Argument lists for outbound calls.
pub trait IntoArgs {
    /// Convert every argument, left to right.
    fn into_args(self) -> Result<Vec<Handle>>;
}

impl<T: IntoHandle + Copy> IntoArgs for &[T] {
    fn into_args(self) -> Result<Vec<Handle>> {
        self.iter().map(|arg| (*arg).into_handle()).collect()
    }
}

impl<T: IntoHandle> IntoArgs for Vec<T> {
    fn into_args(self) -> Result<Vec<Handle>> {
        self.into_iter().map(IntoHandle::into_handle).collect()
    }
}

macro_rules! into_args_tuple {
    ($($ty:ident),*) => {
        impl<$($ty: IntoHandle),*> IntoArgs for ($($ty,)*) {
            #[allow(non_snake_case)]
            fn into_args(self) -> Result<Vec<Handle>> {
                let ($($ty,)*) = self;
                Ok(vec![$($ty.into_handle()?),*])
            }
        }
    };
}

impl IntoArgs for () {
    fn into_args(self) -> Result<Vec<Handle>> {
        Ok(Vec::new())
    }
}

into_args_tuple!(A);
into_args_tuple!(A, B);
into_args_tuple!(A, B, C);
into_args_tuple!(A, B, C, D);
into_args_tuple!(A, B, C, D, E);
into_args_tuple!(A, B, C, D, E, F);

// ============================================================================
// Handles and values
// ============================================================================

impl IntoHandle for Handle {
    fn into_handle(self) -> Result<Handle> {
        Ok(self)
    }
}

impl FromHandle for Handle {
    fn from_handle(handle: Handle) -> Result<Self> {
        Ok(handle)
    }
}

impl FromHandle for Value {
    fn from_handle(handle: Handle) -> Result<Self> {
        Ok(Value::from_handle(handle))
    }
}

impl IntoHandle for Value {
    fn into_handle(self) -> Result<Handle> {
        Ok(self.as_handle())
    }
}

impl IntoHandle for () {
    fn into_handle(self) -> Result<Handle> {
        Ok(Handle::NIL)
    }
}

// ============================================================================
// Scalars
// ============================================================================

impl IntoHandle for bool {
    fn into_handle(self) -> Result<Handle> {
        Ok(Handle::from_bool(self))
    }
}

impl FromHandle for bool {
    fn from_handle(handle: Handle) -> Result<Self> {
        Ok(handle.is_truthy())
    }
}

fn out_of_range(value: i128, type_name: &str, too_small: bool) -> Error {
    let direction = if too_small { "small" } else { "big" };
    Error::Range(format!(
        "integer {value} too {direction} to convert to '{type_name}'"
    ))
}

/// Narrow a coerced integer to `T`, checking both directions.
fn narrow<T>(value: i128, type_name: &str) -> Result<T>
where
    T: TryFrom<i128> + Bounded,
{
    if value < T::MIN {
        return Err(out_of_range(value, type_name, true));
    }
    if value > T::MAX {
        return Err(out_of_range(value, type_name, false));
    }
    T::try_from(value).map_err(|_| out_of_range(value, type_name, false))
}

trait Bounded {
    const MIN: i128;
    const MAX: i128;
}

macro_rules! integer_conversions {
    ($($ty:ty),* $(,)?) => {$(
        impl Bounded for $ty {
            const MIN: i128 = <$ty>::MIN as i128;
            const MAX: i128 = <$ty>::MAX as i128;
        }

        impl IntoHandle for $ty {
            fn into_handle(self) -> Result<Handle> {
                with_runtime(|rt| rt.integer_new(self as i128))
            }
        }

        impl FromHandle for $ty {
            fn from_handle(handle: Handle) -> Result<Self> {
                let value = protect(|rt| rt.integer_value(handle))?;
                narrow::<$ty>(value, stringify!($ty))
            }
        }
    )*};
}

integer_conversions!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize);

impl IntoHandle for f64 {
    fn into_handle(self) -> Result<Handle> {
        with_runtime(|rt| rt.float_new(self))
    }
}

impl FromHandle for f64 {
    fn from_handle(handle: Handle) -> Result<Self> {
        protect(|rt| rt.float_value(handle))
    }
}

impl IntoHandle for f32 {
    fn into_handle(self) -> Result<Handle> {
        f64::from(self).into_handle()
    }
}

impl FromHandle for f32 {
    fn from_handle(handle: Handle) -> Result<Self> {
        Ok(f64::from_handle(handle)? as f32)
    }
}

// ============================================================================
// Strings
// ============================================================================

impl IntoHandle for &str {
    fn into_handle(self) -> Result<Handle> {
        with_runtime(|rt| rt.str_new(self))
    }
}

impl IntoHandle for String {
    fn into_handle(self) -> Result<Handle> {
        self.as_str().into_handle()
    }
}

impl IntoHandle for &String {
    fn into_handle(self) -> Result<Handle> {
        self.as_str().into_handle()
    }
}

impl FromHandle for String {
    fn from_handle(handle: Handle) -> Result<Self> {
        check_type(handle, "String", |ty| ty == ValueType::String)?;
        let session = Session::current()?;
        Ok(session.runtime().str_read(handle))
    }
}

// ============================================================================
// Composites
// ============================================================================

impl<T: IntoHandle> IntoHandle for Option<T> {
    fn into_handle(self) -> Result<Handle> {
        match self {
            Some(value) => value.into_handle(),
            None => Ok(Handle::NIL),
        }
    }
}

impl<T: FromHandle> FromHandle for Option<T> {
    fn from_handle(handle: Handle) -> Result<Self> {
        if handle.is_nil() {
            Ok(None)
        } else {
            T::from_handle(handle).map(Some)
        }
    }
}

impl<T: IntoHandle> IntoHandle for Vec<T> {
    fn into_handle(self) -> Result<Handle> {
        let elements = self
            .into_iter()
            .map(IntoHandle::into_handle)
            .collect::<Result<Vec<_>>>()?;
        with_runtime(|rt| rt.ary_new(&elements))
    }
}

impl<T: FromHandle> FromHandle for Vec<T> {
    fn from_handle(handle: Handle) -> Result<Self> {
        Array::from_handle(handle)?.to_vec()
    }
}

/// Array handle of exactly `len` elements.
fn fixed_array(handle: Handle, len: usize) -> Result<Array> {
    let array = Array::from_handle(handle)
        .map_err(|_| Error::Argument(format!("Array of length {len} is expected")))?;
    if array.len()? != len {
        return Err(Error::Argument(format!("Array of length {len} is expected")));
    }
    Ok(array)
}

macro_rules! tuple_conversions {
    ($len:literal; $($ty:ident => $index:tt),*) => {
        impl<$($ty: IntoHandle),*> IntoHandle for ($($ty,)*) {
            fn into_handle(self) -> Result<Handle> {
                let elements = [$(self.$index.into_handle()?),*];
                with_runtime(|rt| rt.ary_new(&elements))
            }
        }

        impl<$($ty: FromHandle),*> FromHandle for ($($ty,)*) {
            fn from_handle(handle: Handle) -> Result<Self> {
                let array = fixed_array(handle, $len)?;
                Ok(($(array.get::<$ty>($index)?,)*))
            }
        }
    };
}

tuple_conversions!(1; A => 0);
tuple_conversions!(2; A => 0, B => 1);
tuple_conversions!(3; A => 0, B => 1, C => 2);
tuple_conversions!(4; A => 0, B => 1, C => 2, D => 3);
tuple_conversions!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
tuple_conversions!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

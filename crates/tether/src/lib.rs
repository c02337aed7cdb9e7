//! Tether - bind native Rust code to a garbage-collected managed runtime
//!
//! The crate sits between native code and a dynamically typed managed
//! runtime consumed through the [`Runtime`] trait:
//!
//! - [`convert`]: typed conversions between Rust values and [`Handle`]s
//! - [`args`]: declarative parameter lists parsed left to right
//! - [`trampoline`]: JIT-emitted native entry points for arbitrary closures
//! - [`protect`]: raise/jump capture outbound, error delivery inbound
//! - [`typed_data`] and [`gc`]: native payloads the collector can trace,
//!   move around and free
//! - [`lock`]: native work with the execution lock released
//!
//! # Example
//!
//! ```ignore
//! use tether::args::{arg, receiver};
//! use tether::{Builtin, Class};
//!
//! let integer = Class::builtin(Builtin::Integer)?;
//! integer.define_method("add", (receiver::<i64>(), arg::<i64>("n")), |(this, n)| this + n)?;
//! ```

#![warn(missing_docs)]

pub mod args;
pub mod convert;
pub mod error;
pub mod gc;
pub mod handle;
pub mod ident;
pub mod lock;
pub mod protect;
pub mod runtime;
pub mod trampoline;
pub mod typed_data;
pub mod value;

pub use convert::{from_handle, into_handle, FromHandle, IntoArgs, IntoHandle, ReturnValue};
pub use error::{Error, Jump, Result, Tag, Transfer};
pub use gc::{Gc, Phase, Pinned, PinnedOpt};
pub use handle::{Handle, ReprValue, ValueType};
pub use ident::{Id, IntoId, RawId};
pub use protect::{call_guarded, protect};
pub use runtime::{attach, is_attached, with_runtime, Attachment, Builtin, Collector, NativeFn, Runtime, Session};
pub use trampoline::{OptLevel, TrampolineOptions};
pub use typed_data::{owner_of, AssociatedValue, DataType, DataTypeDescriptor, Obj, ObjMut, TypedClass, TypedData};
pub use value::{Array, Class, Module, Proc, RString, Symbol, Value};

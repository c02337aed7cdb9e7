use crate::convert::{FromHandle, IntoArgs};
use crate::error::Result;
use crate::handle::{Handle, ValueType};
use crate::protect::protect;
use crate::runtime::Session;
use crate::value::{check_type, handle_wrapper};

/// A callable block object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Proc(Handle);

handle_wrapper!(Proc);

impl FromHandle for Proc {
    fn from_handle(handle: Handle) -> Result<Self> {
        check_type(handle, "Proc", |ty| ty == ValueType::Proc)?;
        Ok(Proc(handle))
    }
}

impl Proc {
    /// Call with `args`.
    pub fn call<R: FromHandle>(self, args: impl IntoArgs) -> Result<R> {
        let args = args.into_args()?;
        let result = protect(|rt| rt.proc_call(self.0, &args))?;
        R::from_handle(result)
    }

    /// Whether this proc has lambda semantics.
    pub fn is_lambda(self) -> Result<bool> {
        let session = Session::current()?;
        Ok(session.runtime().proc_is_lambda(self.0))
    }
}

use std::ops::Deref;

use crate::args::ArgList;
use crate::convert::{FromHandle, IntoArgs, IntoHandle, ReturnValue};
use crate::error::Result;
use crate::handle::{Handle, ReprValue, ValueType};
use crate::ident::IntoId;
use crate::protect::{protect, protect_with};
use crate::runtime::{Builtin, NativeFn, Session};
use crate::trampoline;
use crate::typed_data::{self, TypedClass, TypedData};
use crate::value::{check_type, handle_wrapper, Value};

// ============================================================================
// Module
// ============================================================================

/// A module (or a class viewed as a namespace).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Module(Handle);

handle_wrapper!(Module);

impl FromHandle for Module {
    fn from_handle(handle: Handle) -> Result<Self> {
        check_type(handle, "Module", |ty| matches!(ty, ValueType::Module | ValueType::Class))?;
        Ok(Module(handle))
    }
}

impl Module {
    /// The top-level namespace.
    pub fn object() -> Result<Module> {
        Ok(Class::builtin(Builtin::Object)?.as_module())
    }

    /// New anonymous module.
    pub fn new() -> Result<Module> {
        let session = Session::current()?;
        Ok(Module(session.runtime().module_new()))
    }

    /// Fully qualified name.
    pub fn name(self) -> Result<String> {
        let session = Session::current()?;
        let rt = session.runtime();
        Ok(rt.str_read(rt.class_path(self.0)))
    }

    /// Define or reopen a module nested in this one.
    pub fn define_module(self, name: &str) -> Result<Module> {
        protect(|rt| {
            let id = rt.intern(name);
            rt.define_module_under(self.0, id)
        })
        .map(Module)
    }

    /// Define or reopen a class nested in this one.
    pub fn define_class(self, name: &str, superclass: Class) -> Result<Class> {
        let superclass = superclass.as_handle();
        let class = protect(|rt| {
            let id = rt.intern(name);
            rt.define_class_under(self.0, id, superclass)
        })?;
        Ok(Class(Module(class)))
    }

    /// Define a class whose instances carry a `T` payload.
    pub fn define_data_class<T: TypedData>(self, name: &str, superclass: Class) -> Result<TypedClass<T>> {
        typed_data::define_data_class(self, name, superclass)
    }

    /// Register a native method.
    ///
    /// `specs` describes how the call's receiver and arguments are parsed;
    /// `f` receives the parsed tuple.
    pub fn define_method<S, F, R>(self, name: &str, specs: S, f: F) -> Result<Self>
    where
        S: ArgList + 'static,
        F: Fn(S::Output) -> R + 'static,
        R: ReturnValue,
    {
        let label = format!("{}#{}", self.name()?, name);
        let entry = trampoline::method_callback(&label, specs, f)?;
        self.define_native(name, entry)
    }

    pub(crate) fn define_native(self, name: &str, entry: NativeFn) -> Result<Self> {
        protect(|rt| {
            let id = rt.intern(name);
            rt.define_method(self.0, id, entry)
        })?;
        Ok(self)
    }

    /// Look up a constant.
    pub fn const_get<T: FromHandle>(self, name: impl IntoId) -> Result<T> {
        let session = Session::current()?;
        let rt = session.runtime();
        let name = name.into_raw_id(rt)?;
        let value = protect_with(rt, |rt| rt.const_get(self.0, name))?;
        T::from_handle(value)
    }

    /// Set a constant.
    pub fn const_set<T: IntoHandle>(self, name: impl IntoId, value: T) -> Result<()> {
        let value = value.into_handle()?;
        let session = Session::current()?;
        let rt = session.runtime();
        let name = name.into_raw_id(rt)?;
        protect_with(rt, |rt| rt.const_set(self.0, name, value))
    }

    /// Whether a constant is defined.
    pub fn const_defined(self, name: impl IntoId) -> Result<bool> {
        let session = Session::current()?;
        let rt = session.runtime();
        let name = name.into_raw_id(rt)?;
        Ok(rt.const_defined(self.0, name))
    }
}

// ============================================================================
// Class
// ============================================================================

/// A class.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Class(Module);

handle_wrapper!(Class);

impl FromHandle for Class {
    fn from_handle(handle: Handle) -> Result<Self> {
        check_type(handle, "Class", |ty| ty == ValueType::Class)?;
        Ok(Class(Module(handle)))
    }
}

impl Deref for Class {
    type Target = Module;

    fn deref(&self) -> &Module {
        &self.0
    }
}

impl Class {
    /// A built-in class.
    pub fn builtin(which: Builtin) -> Result<Class> {
        let session = Session::current()?;
        Ok(Class(Module(session.runtime().builtin(which))))
    }

    /// New anonymous subclass of `superclass`.
    pub fn new(superclass: Class) -> Result<Class> {
        let superclass = superclass.as_handle();
        protect(|rt| rt.class_new(superclass)).map(|class| Class(Module(class)))
    }

    /// View as a namespace.
    pub fn as_module(self) -> Module {
        self.0
    }

    /// Superclass, `None` at the root.
    pub fn superclass(self) -> Result<Option<Class>> {
        let session = Session::current()?;
        let parent = session.runtime().superclass(self.as_handle());
        Ok((!parent.is_nil()).then(|| Class(Module(parent))))
    }

    /// Whether this is `ancestor` or inherits from it.
    pub fn inherits(self, ancestor: Class) -> Result<bool> {
        let mut current = Some(self);
        while let Some(class) = current {
            if class == ancestor {
                return Ok(true);
            }
            current = class.superclass()?;
        }
        Ok(false)
    }

    /// Allocate and initialize an instance.
    pub fn new_instance(self, args: impl IntoArgs) -> Result<Value> {
        let args = args.into_args()?;
        protect(|rt| rt.new_instance(self.as_handle(), &args)).map(Value::from_handle)
    }

    /// Allocate an instance without running `initialize`.
    pub fn allocate(self) -> Result<Value> {
        protect(|rt| rt.obj_alloc(self.as_handle())).map(Value::from_handle)
    }
}

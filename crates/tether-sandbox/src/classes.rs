//! Built-in class tree
//!
//! ```text
//! Object
//! ├── Module ── Class
//! ├── NilClass, TrueClass, FalseClass
//! ├── Integer, Float, String, Symbol, Array, Proc
//! └── Exception
//!     └── StandardError
//!         ├── ArgumentError ── UncaughtThrowError
//!         ├── TypeError
//!         ├── RangeError ── FloatDomainError
//!         ├── RuntimeError ── FrozenError
//!         ├── NameError ── NoMethodError
//!         └── LocalJumpError
//! ```
//!
//! Plus the `GC` module. Every built-in class is registered as a constant on
//! `Object` and, like every module, is never moved or collected.

use tether::{Builtin, Handle, RawId};

use crate::heap::{Heap, InstanceKind, Kind, ModuleData, Object};
use crate::methods;
use crate::symbols::SymbolTable;

/// Handles of the built-in classes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Classes {
    pub object: Handle,
    pub module: Handle,
    pub class: Handle,
    pub nil_class: Handle,
    pub true_class: Handle,
    pub false_class: Handle,
    pub integer: Handle,
    pub float: Handle,
    pub string: Handle,
    pub symbol: Handle,
    pub array: Handle,
    pub proc: Handle,
    pub exception: Handle,
    pub standard_error: Handle,
    pub argument_error: Handle,
    pub uncaught_throw_error: Handle,
    pub type_error: Handle,
    pub range_error: Handle,
    pub float_domain_error: Handle,
    pub runtime_error: Handle,
    pub frozen_error: Handle,
    pub name_error: Handle,
    pub no_method_error: Handle,
    pub local_jump_error: Handle,
    pub gc: Handle,
}

impl Classes {
    pub fn builtin(&self, which: Builtin) -> Handle {
        match which {
            Builtin::Object => self.object,
            Builtin::Module => self.module,
            Builtin::Class => self.class,
            Builtin::Integer => self.integer,
            Builtin::Float => self.float,
            Builtin::String => self.string,
            Builtin::Symbol => self.symbol,
            Builtin::Array => self.array,
            Builtin::Proc => self.proc,
            Builtin::Exception => self.exception,
            Builtin::StandardError => self.standard_error,
            Builtin::ArgumentError => self.argument_error,
            Builtin::TypeError => self.type_error,
            Builtin::RangeError => self.range_error,
            Builtin::RuntimeError => self.runtime_error,
            Builtin::FrozenError => self.frozen_error,
        }
    }

    fn all(&self) -> [Handle; 25] {
        [
            self.object,
            self.module,
            self.class,
            self.nil_class,
            self.true_class,
            self.false_class,
            self.integer,
            self.float,
            self.string,
            self.symbol,
            self.array,
            self.proc,
            self.exception,
            self.standard_error,
            self.argument_error,
            self.uncaught_throw_error,
            self.type_error,
            self.range_error,
            self.float_domain_error,
            self.runtime_error,
            self.frozen_error,
            self.name_error,
            self.no_method_error,
            self.local_jump_error,
            self.gc,
        ]
    }
}

/// Identifiers the sandbox itself looks up.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ids {
    pub initialize: RawId,
    pub initialize_copy: RawId,
    pub new: RawId,
    pub message: RawId,
    pub inspect: RawId,
    pub to_s: RawId,
    pub to_int: RawId,
    pub to_f: RawId,
    pub eq: RawId,
}

impl Ids {
    fn intern(symbols: &mut SymbolTable) -> Self {
        Ids {
            initialize: symbols.intern("initialize"),
            initialize_copy: symbols.intern("initialize_copy"),
            new: symbols.intern("new"),
            message: symbols.intern("@message"),
            inspect: symbols.intern("inspect"),
            to_s: symbols.intern("to_s"),
            to_int: symbols.intern("to_int"),
            to_f: symbols.intern("to_f"),
            eq: symbols.intern("=="),
        }
    }
}

fn class(heap: &mut Heap, name: &str, superclass: Option<Handle>, kind: Option<InstanceKind>) -> Handle {
    let mut module = ModuleData::new(Some(name.to_string()), true, superclass);
    module.instance_kind = kind;
    heap.alloc(Object::new(Handle::NIL, Kind::Module(Box::new(module))))
}

/// Build the class tree and install the built-in methods.
pub(crate) fn bootstrap(heap: &mut Heap, symbols: &mut SymbolTable) -> (Classes, Ids) {
    let object = class(heap, "Object", None, Some(InstanceKind::Plain));
    let module = class(heap, "Module", Some(object), Some(InstanceKind::Unallocatable));
    let class_class = class(heap, "Class", Some(module), None);
    let exception = class(heap, "Exception", Some(object), None);
    let standard_error = class(heap, "StandardError", Some(exception), None);
    let argument_error = class(heap, "ArgumentError", Some(standard_error), None);
    let range_error = class(heap, "RangeError", Some(standard_error), None);
    let runtime_error = class(heap, "RuntimeError", Some(standard_error), None);
    let name_error = class(heap, "NameError", Some(standard_error), None);

    let gc = heap.alloc(Object::new(
        module,
        Kind::Module(Box::new(ModuleData::new(Some("GC".to_string()), false, None))),
    ));

    let classes = Classes {
        object,
        module,
        class: class_class,
        nil_class: class(heap, "NilClass", Some(object), Some(InstanceKind::Unallocatable)),
        true_class: class(heap, "TrueClass", Some(object), Some(InstanceKind::Unallocatable)),
        false_class: class(heap, "FalseClass", Some(object), Some(InstanceKind::Unallocatable)),
        integer: class(heap, "Integer", Some(object), Some(InstanceKind::Unallocatable)),
        float: class(heap, "Float", Some(object), Some(InstanceKind::Unallocatable)),
        string: class(heap, "String", Some(object), Some(InstanceKind::String)),
        symbol: class(heap, "Symbol", Some(object), Some(InstanceKind::Unallocatable)),
        array: class(heap, "Array", Some(object), Some(InstanceKind::Array)),
        proc: class(heap, "Proc", Some(object), Some(InstanceKind::Unallocatable)),
        exception,
        standard_error,
        argument_error,
        uncaught_throw_error: class(heap, "UncaughtThrowError", Some(argument_error), None),
        type_error: class(heap, "TypeError", Some(standard_error), None),
        range_error,
        float_domain_error: class(heap, "FloatDomainError", Some(range_error), None),
        runtime_error,
        frozen_error: class(heap, "FrozenError", Some(runtime_error), None),
        name_error,
        no_method_error: class(heap, "NoMethodError", Some(name_error), None),
        local_jump_error: class(heap, "LocalJumpError", Some(standard_error), None),
        gc,
    };

    let mut constants = Vec::new();
    for handle in classes.all() {
        if let Some(entry) = heap.get_mut(handle) {
            if handle != gc {
                entry.class = class_class;
            }
            if let Some(name) = entry.module().and_then(|m| m.name.clone()) {
                constants.push((symbols.intern(&name), handle));
            }
        }
    }
    if let Some(root) = heap.get_mut(object).and_then(Object::module_mut) {
        root.constants.extend(constants);
    }

    let ids = Ids::intern(symbols);
    methods::install(heap, symbols, &classes);
    (classes, ids)
}

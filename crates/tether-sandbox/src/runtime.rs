//! [`tether::Runtime`] for the sandbox

use std::ffi::c_void;
use std::ptr::{self, NonNull};

use tether::runtime::UnblockFn;
use tether::{Builtin, DataTypeDescriptor, Handle, NativeFn, RawId, Runtime, Tag, Transfer, ValueType};

use crate::heap::{decode, symbol, DataSlot, Imm, Kind, Method, ProcData};
use crate::Sandbox;

impl Runtime for Sandbox {
    // ========================================================================
    // Identifiers
    // ========================================================================

    fn intern(&self, name: &str) -> RawId {
        self.id(name)
    }

    fn id_from_symbol(&self, value: Handle) -> RawId {
        if let Imm::Symbol(id) = decode(value) {
            return id;
        }
        match self.string_contents(value) {
            Some(name) => self.id(&name),
            None => {
                let message = format!("{} is not a symbol nor a string", self.inspect_string(value));
                self.type_error(&message)
            }
        }
    }

    fn id_to_symbol(&self, id: RawId) -> Handle {
        symbol(id)
    }

    fn id_name(&self, id: RawId) -> String {
        self.name_of(id)
    }

    // ========================================================================
    // Object model
    // ========================================================================

    fn value_type(&self, value: Handle) -> ValueType {
        match decode(value) {
            Imm::Nil => ValueType::Nil,
            Imm::True => ValueType::True,
            Imm::False => ValueType::False,
            Imm::Undef => ValueType::Undef,
            Imm::Fixnum(_) => ValueType::Integer,
            Imm::Symbol(_) => ValueType::Symbol,
            Imm::Heap(_) => self
                .with_object(value, |object| match &object.kind {
                    Kind::Plain => ValueType::Object,
                    Kind::Str(_) => ValueType::String,
                    Kind::Array(_) => ValueType::Array,
                    Kind::Float(_) => ValueType::Float,
                    Kind::Bignum(_) => ValueType::Integer,
                    Kind::Module(module) if module.is_class => ValueType::Class,
                    Kind::Module(_) => ValueType::Module,
                    Kind::Proc(_) => ValueType::Proc,
                    Kind::Data(_) => ValueType::Data,
                })
                .unwrap_or(ValueType::Undef),
        }
    }

    fn class_of(&self, value: Handle) -> Handle {
        self.real_class(value)
    }

    fn superclass(&self, class: Handle) -> Handle {
        self.superclass_of(class).unwrap_or(Handle::NIL)
    }

    fn is_kind_of(&self, value: Handle, class: Handle) -> bool {
        self.require_module(class);
        self.kind_of(value, class)
    }

    fn is_instance_of(&self, value: Handle, class: Handle) -> bool {
        self.require_module(class);
        self.real_class(value) == class
    }

    fn is_frozen(&self, value: Handle) -> bool {
        self.frozen(value)
    }

    fn freeze(&self, value: Handle) -> Handle {
        self.with_object_mut(value, |object| object.frozen = true);
        value
    }

    fn check_frozen(&self, value: Handle) {
        self.ensure_mutable(value);
    }

    fn inspect(&self, value: Handle) -> Handle {
        let text = self.inspect_string(value);
        self.string(&text)
    }

    fn to_s(&self, value: Handle) -> Handle {
        let text = self.display_string(value);
        self.string(&text)
    }

    fn class_path(&self, module: Handle) -> Handle {
        let name = self.module_name(module);
        self.string(&name)
    }

    fn funcall(&self, receiver: Handle, method: RawId, args: &[Handle], block: Option<Handle>) -> Handle {
        self.call_method(receiver, method, args, block)
    }

    fn respond_to(&self, receiver: Handle, method: RawId) -> bool {
        self.method_for(receiver, method).is_some()
    }

    fn ivar_get(&self, object: Handle, name: RawId) -> Handle {
        self.with_object(object, |o| o.ivar(name))
            .flatten()
            .unwrap_or(Handle::NIL)
    }

    fn ivar_set(&self, object: Handle, name: RawId, value: Handle) {
        self.ensure_mutable(object);
        self.with_object_mut(object, |o| o.set_ivar(name, value));
    }

    fn ivar_defined(&self, object: Handle, name: RawId) -> bool {
        self.with_object(object, |o| o.ivar(name).is_some())
            .unwrap_or(false)
    }

    // ========================================================================
    // Modules and classes
    // ========================================================================

    fn builtin(&self, which: Builtin) -> Handle {
        self.classes.builtin(which)
    }

    fn module_new(&self) -> Handle {
        self.new_module(None)
    }

    fn class_new(&self, superclass: Handle) -> Handle {
        self.new_class(None, superclass)
    }

    fn define_module_under(&self, outer: Handle, name: RawId) -> Handle {
        self.require_module(outer);
        self.check_const_name(name);
        let existing = self.with_module(outer, |m| m.constants.get(&name).copied()).flatten();
        if let Some(existing) = existing {
            if self.with_module(existing, |m| !m.is_class) == Some(true) {
                return existing;
            }
            let message = format!("{} is not a module", self.name_of(name));
            self.type_error(&message)
        }
        let module = self.new_module(Some(self.child_path(outer, name)));
        self.set_const(outer, name, module);
        log::debug!("defined module {}", self.module_name(module));
        module
    }

    fn define_class_under(&self, outer: Handle, name: RawId, superclass: Handle) -> Handle {
        self.require_module(outer);
        self.check_const_name(name);
        let existing = self.with_module(outer, |m| m.constants.get(&name).copied()).flatten();
        if let Some(existing) = existing {
            if !self.is_class(existing) {
                let message = format!("{} is not a class", self.name_of(name));
                self.type_error(&message)
            }
            if self.superclass_of(existing) != Some(superclass) {
                let message = format!("superclass mismatch for class {}", self.name_of(name));
                self.type_error(&message)
            }
            return existing;
        }
        let class = self.new_class(Some(self.child_path(outer, name)), superclass);
        self.set_const(outer, name, class);
        log::debug!("defined class {}", self.module_name(class));
        class
    }

    fn define_method(&self, module: Handle, name: RawId, entry: NativeFn) {
        self.require_module(module);
        self.ensure_mutable(module);
        self.with_module_mut(module, |m| m.methods.insert(name, Method::Native(entry)));
        log::trace!("defined {}#{}", self.module_name(module), self.name_of(name));
    }

    fn singleton_class(&self, object: Handle) -> Handle {
        self.singleton_of(object)
    }

    fn const_get(&self, module: Handle, name: RawId) -> Handle {
        self.require_module(module);
        self.check_const_name(name);
        match self.lookup_const(module, name) {
            Some(value) => value,
            None => {
                let message = format!("uninitialized constant {}", self.child_path(module, name));
                self.raise_new(self.classes.name_error, &message)
            }
        }
    }

    fn const_set(&self, module: Handle, name: RawId, value: Handle) {
        self.check_const_name(name);
        self.set_const(module, name, value);
    }

    fn const_defined(&self, module: Handle, name: RawId) -> bool {
        self.lookup_const(module, name).is_some()
    }

    fn obj_alloc(&self, class: Handle) -> Handle {
        self.allocate(class)
    }

    fn new_instance(&self, class: Handle, args: &[Handle]) -> Handle {
        self.call_method(class, self.ids.new, args, None)
    }

    // ========================================================================
    // Exceptions and non-local transfers
    // ========================================================================

    fn protect(&self, body: &mut dyn FnMut()) -> Tag {
        self.protect_body(body)
    }

    fn take_errinfo(&self) -> Handle {
        self.errinfo.replace(Handle::NIL)
    }

    fn arm_transfer(&self, transfer: Transfer) {
        if let Some(previous) = self.armed.replace(Some(transfer)) {
            log::warn!("replacing armed {previous:?} with {transfer:?}");
        }
    }

    // ========================================================================
    // Numbers
    // ========================================================================

    fn integer_value(&self, value: Handle) -> i128 {
        self.coerce_integer(value)
    }

    fn integer_new(&self, value: i128) -> Handle {
        self.make_integer(value)
    }

    fn float_value(&self, value: Handle) -> f64 {
        self.coerce_float(value)
    }

    fn float_new(&self, value: f64) -> Handle {
        self.make_float(value)
    }

    // ========================================================================
    // Strings, arrays and procs
    // ========================================================================

    fn str_new(&self, text: &str) -> Handle {
        self.alloc(self.classes.string, Kind::Str(text.to_string()))
    }

    fn str_intern(&self, text: &str) -> Handle {
        if let Some(existing) = self.interned.borrow().get(text) {
            return *existing;
        }
        let string = self.str_new(text);
        self.freeze(string);
        self.interned.borrow_mut().insert(text.to_string(), string);
        string
    }

    fn str_read(&self, string: Handle) -> String {
        if let Imm::Symbol(id) = decode(string) {
            return self.name_of(id);
        }
        self.string_contents(string).unwrap_or_default()
    }

    fn ary_new(&self, elements: &[Handle]) -> Handle {
        self.alloc(self.classes.array, Kind::Array(elements.to_vec()))
    }

    fn ary_len(&self, array: Handle) -> usize {
        self.with_object(array, |object| match &object.kind {
            Kind::Array(items) => items.len(),
            _ => 0,
        })
        .unwrap_or(0)
    }

    fn ary_entry(&self, array: Handle, index: usize) -> Handle {
        self.with_object(array, |object| match &object.kind {
            Kind::Array(items) => items.get(index).copied(),
            _ => None,
        })
        .flatten()
        .unwrap_or(Handle::NIL)
    }

    fn ary_push(&self, array: Handle, value: Handle) {
        self.ensure_mutable(array);
        self.with_object_mut(array, |object| {
            if let Kind::Array(items) = &mut object.kind {
                items.push(value);
            }
        });
    }

    fn ary_pop(&self, array: Handle) -> Handle {
        self.ensure_mutable(array);
        self.with_object_mut(array, |object| match &mut object.kind {
            Kind::Array(items) => items.pop(),
            _ => None,
        })
        .flatten()
        .unwrap_or(Handle::NIL)
    }

    fn block_given(&self) -> bool {
        self.current_block().is_some()
    }

    fn block_proc(&self) -> Handle {
        match self.current_block() {
            Some(block) => block,
            None => self.argument_error("tried to create Proc object without a block"),
        }
    }

    fn proc_call(&self, proc: Handle, args: &[Handle]) -> Handle {
        self.call_proc(proc, args)
    }

    fn proc_is_lambda(&self, proc: Handle) -> bool {
        self.with_object(proc, |object| matches!(&object.kind, Kind::Proc(ProcData { lambda: true, .. })))
            .unwrap_or(false)
    }

    // ========================================================================
    // Typed data
    // ========================================================================

    fn bind_data_type(&self, class: Handle, descriptor: &'static DataTypeDescriptor) {
        if !self.is_class(class) {
            let message = format!("wrong argument type {} (expected Class)", self.class_name(class));
            self.type_error(&message)
        }
        self.with_module_mut(class, |m| m.data_type = Some(descriptor));
    }

    fn data_get(&self, object: Handle, descriptor: &'static DataTypeDescriptor) -> *mut c_void {
        let payload = self
            .with_object(object, |o| match &o.kind {
                Kind::Data(DataSlot {
                    descriptor: own,
                    payload,
                }) if ptr::eq(*own, descriptor) => Some(*payload),
                _ => None,
            })
            .flatten();
        match payload {
            Some(Some(payload)) => payload.as_ptr(),
            Some(None) => ptr::null_mut(),
            None => {
                let message = format!(
                    "wrong argument type {} (expected {})",
                    self.class_name(object),
                    descriptor.name()
                );
                self.type_error(&message)
            }
        }
    }

    fn data_set(&self, object: Handle, payload: NonNull<c_void>) {
        let attached = self.with_object_mut(object, |o| match &mut o.kind {
            Kind::Data(slot) => {
                slot.payload = Some(payload);
                true
            }
            _ => false,
        });
        if attached != Some(true) {
            log::error!("data_set on {object:?}, which is not a typed data shell");
        }
    }

    // ========================================================================
    // Collector
    // ========================================================================

    fn register_address(&self, slot: NonNull<Handle>) {
        self.roots.borrow_mut().push(slot);
    }

    fn unregister_address(&self, slot: NonNull<Handle>) {
        let mut roots = self.roots.borrow_mut();
        if let Some(position) = roots.iter().rposition(|root| *root == slot) {
            roots.swap_remove(position);
        }
    }

    // ========================================================================
    // Execution lock
    // ========================================================================

    fn without_lock(&self, body: &mut dyn FnMut(), unblock: Option<UnblockFn>) {
        self.lock.release(body, unblock);
    }
}

impl Sandbox {
    /// New proc running `body`.
    pub fn proc_new(&self, body: impl Fn(&Sandbox, &[Handle]) -> Handle + 'static) -> Handle {
        self.make_proc(body, false)
    }

    /// New lambda running `body`.
    pub fn lambda_new(&self, body: impl Fn(&Sandbox, &[Handle]) -> Handle + 'static) -> Handle {
        self.make_proc(body, true)
    }

    fn make_proc(&self, body: impl Fn(&Sandbox, &[Handle]) -> Handle + 'static, lambda: bool) -> Handle {
        self.alloc(
            self.classes.proc,
            Kind::Proc(ProcData {
                body: std::rc::Rc::new(body),
                lambda,
            }),
        )
    }

    /// Handle for interrupting sections that released the execution lock.
    pub fn interrupt_handle(&self) -> crate::InterruptHandle {
        self.lock.handle()
    }

    /// Whether the execution lock is currently released.
    pub fn is_lock_released(&self) -> bool {
        self.lock.is_released()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Caught;

    fn raised_class(sandbox: &Sandbox, caught: Result<Handle, Caught>) -> String {
        match caught {
            Err(Caught::Raised(exception)) => sandbox.class_name(exception),
            other => panic!("expected a raise, got {other:?}"),
        }
    }

    #[test]
    fn test_value_types() {
        let sandbox = Sandbox::new();
        assert_eq!(sandbox.value_type(Handle::NIL), ValueType::Nil);
        assert_eq!(sandbox.value_type(sandbox.int(7)), ValueType::Integer);
        assert_eq!(sandbox.value_type(sandbox.integer_new(i128::from(i64::MAX))), ValueType::Integer);
        assert_eq!(sandbox.value_type(sandbox.float(0.5)), ValueType::Float);
        assert_eq!(sandbox.value_type(sandbox.symbol("add")), ValueType::Symbol);
        assert_eq!(sandbox.value_type(sandbox.string("x")), ValueType::String);
        assert_eq!(sandbox.value_type(sandbox.array(&[])), ValueType::Array);
        assert_eq!(sandbox.value_type(sandbox.classes.object), ValueType::Class);
        assert_eq!(sandbox.value_type(sandbox.classes.gc), ValueType::Module);
        assert_eq!(sandbox.value_type(sandbox.lambda_new(|_, _| Handle::NIL)), ValueType::Proc);
    }

    #[test]
    fn test_integer_encoding_boundaries() {
        let sandbox = Sandbox::new();
        for value in [0, -1, i128::from(i64::MAX), i128::from(i64::MIN), i128::from(u64::MAX)] {
            let handle = sandbox.integer_new(value);
            assert_eq!(sandbox.integer_value(handle), value);
        }
        assert!(sandbox.is_frozen(sandbox.integer_new(i128::from(u64::MAX))));
    }

    #[test]
    fn test_class_reopening() {
        let sandbox = Sandbox::new();
        let object = sandbox.classes.object;
        let name = sandbox.intern("Widget");
        let widget = sandbox.define_class_under(object, name, object);
        assert_eq!(sandbox.define_class_under(object, name, object), widget);
        assert_eq!(sandbox.module_name(widget), "Widget");

        let nested = sandbox.define_module_under(widget, sandbox.intern("Parts"));
        assert_eq!(sandbox.module_name(nested), "Widget::Parts");

        let standard_error = sandbox.classes.standard_error;
        let caught = sandbox.capture(|| sandbox.define_class_under(object, name, standard_error));
        assert_eq!(raised_class(&sandbox, caught), "TypeError");

        let caught = sandbox.capture(|| sandbox.define_module_under(object, name));
        assert_eq!(raised_class(&sandbox, caught), "TypeError");
    }

    #[test]
    fn test_constants() {
        let sandbox = Sandbox::new();
        let object = sandbox.classes.object;
        let answer = sandbox.intern("Answer");
        sandbox.const_set(object, answer, sandbox.int(42));
        assert!(sandbox.const_defined(object, answer));
        assert_eq!(sandbox.const_get(object, answer), sandbox.int(42));

        let missing = sandbox.intern("Missing");
        let caught = sandbox.capture(|| sandbox.const_get(object, missing));
        assert_eq!(raised_class(&sandbox, caught), "NameError");

        let lowercase = sandbox.intern("lower");
        let caught = sandbox.capture(|| sandbox.const_set(object, lowercase, Handle::NIL));
        assert_eq!(raised_class(&sandbox, caught), "NameError");
    }

    #[test]
    fn test_interned_strings_are_shared_and_frozen() {
        let sandbox = Sandbox::new();
        let a = sandbox.str_intern("shared");
        let b = sandbox.str_intern("shared");
        assert_eq!(a, b);
        assert!(sandbox.is_frozen(a));
        assert_ne!(sandbox.str_new("shared"), a);
    }

    #[test]
    fn test_frozen_array_rejects_push() {
        let sandbox = Sandbox::new();
        let array = sandbox.array(&[sandbox.int(1)]);
        sandbox.freeze(array);
        let caught = sandbox.capture(|| sandbox.ary_push(array, sandbox.int(2)));
        match caught {
            Err(Caught::Raised(exception)) => {
                assert_eq!(sandbox.class_name(exception), "FrozenError");
                assert_eq!(sandbox.exception_message(exception), "can't modify frozen Array: [1]");
            }
            other => panic!("expected FrozenError, got {other:?}"),
        }
        assert_eq!(sandbox.ary_len(array), 1);
    }

    #[test]
    fn test_catch_and_throw() {
        let sandbox = Sandbox::new();
        let tag = sandbox.symbol("done");
        let value = sandbox.catch(tag, || sandbox.throw(tag, sandbox.int(42)));
        assert_eq!(value, sandbox.int(42));

        let caught = sandbox.capture(|| sandbox.throw(tag, Handle::NIL));
        assert_eq!(raised_class(&sandbox, caught), "UncaughtThrowError");
    }

    #[test]
    fn test_block_proc_requires_block() {
        let sandbox = Sandbox::new();
        assert!(!sandbox.block_given());
        let caught = sandbox.capture(|| sandbox.block_proc());
        assert_eq!(raised_class(&sandbox, caught), "ArgumentError");
    }

    #[test]
    fn test_singleton_methods_on_class_objects() {
        let sandbox = Sandbox::new();
        let gc = sandbox.class_named("GC");
        let before = sandbox.stats().collections;
        sandbox.call(gc, "start", &[]);
        assert_eq!(sandbox.stats().collections, before + 1);
        assert!(sandbox.respond_to(gc, sandbox.intern("compact")));
        assert!(!sandbox.respond_to(sandbox.classes.object, sandbox.intern("compact")));
    }

    #[test]
    fn test_collection_frees_unreachable_objects() {
        let sandbox = Sandbox::new();
        let garbage = sandbox.string("garbage");
        let kept = sandbox.string("kept");
        sandbox.set_global("kept", kept);
        sandbox.gc_start();
        assert!(!sandbox.is_live(garbage));
        assert!(sandbox.is_live(kept));
        assert_eq!(sandbox.read_string(sandbox.global("kept")), "kept");
    }

    #[test]
    fn test_compaction_moves_globals() {
        let sandbox = Sandbox::new();
        for _ in 0..16 {
            sandbox.string("junk");
        }
        let kept = sandbox.array(&[sandbox.int(1), sandbox.int(2)]);
        sandbox.set_global("kept", kept);
        let stats = sandbox.gc_compact();
        assert!(stats.moved >= 1);
        let moved = sandbox.global("kept");
        assert_ne!(moved, kept);
        assert_eq!(sandbox.ary_len(moved), 2);
        assert_eq!(sandbox.ary_entry(moved, 1), sandbox.int(2));
    }
}

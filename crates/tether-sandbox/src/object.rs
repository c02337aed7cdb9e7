//! Object model: classes, singletons, constants, allocation and copying

use tether::{Handle, RawId};

use crate::heap::{decode, DataSlot, Imm, InstanceKind, Kind, ModuleData, Object, ProcData};
use crate::Sandbox;

impl Sandbox {
    // ========================================================================
    // Heap access
    // ========================================================================

    pub(crate) fn alloc(&self, class: Handle, kind: Kind) -> Handle {
        self.heap.borrow_mut().alloc(Object::new(class, kind))
    }

    pub(crate) fn with_object<R>(&self, handle: Handle, f: impl FnOnce(&Object) -> R) -> Option<R> {
        self.heap.borrow().get(handle).map(f)
    }

    pub(crate) fn with_object_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut Object) -> R) -> Option<R> {
        self.heap.borrow_mut().get_mut(handle).map(f)
    }

    pub(crate) fn with_module<R>(&self, handle: Handle, f: impl FnOnce(&ModuleData) -> R) -> Option<R> {
        self.heap.borrow().get(handle).and_then(Object::module).map(f)
    }

    pub(crate) fn with_module_mut<R>(&self, handle: Handle, f: impl FnOnce(&mut ModuleData) -> R) -> Option<R> {
        self.heap
            .borrow_mut()
            .get_mut(handle)
            .and_then(Object::module_mut)
            .map(f)
    }

    pub(crate) fn id(&self, name: &str) -> RawId {
        self.symbols.borrow_mut().intern(name)
    }

    pub(crate) fn name_of(&self, id: RawId) -> String {
        self.symbols
            .borrow()
            .name(id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("<id {}>", id.get()))
    }

    // ========================================================================
    // Classes
    // ========================================================================

    pub(crate) fn is_module(&self, handle: Handle) -> bool {
        self.with_module(handle, |_| ()).is_some()
    }

    pub(crate) fn is_class(&self, handle: Handle) -> bool {
        self.with_module(handle, |m| m.is_class).unwrap_or(false)
    }

    /// Class used for method lookup, singleton included.
    pub(crate) fn dispatch_class(&self, value: Handle) -> Handle {
        match decode(value) {
            Imm::Nil => self.classes.nil_class,
            Imm::True => self.classes.true_class,
            Imm::False => self.classes.false_class,
            Imm::Fixnum(_) => self.classes.integer,
            Imm::Symbol(_) => self.classes.symbol,
            Imm::Undef => self.classes.object,
            Imm::Heap(_) => self
                .with_object(value, |object| object.class)
                .unwrap_or(self.classes.object),
        }
    }

    /// Class of `value`, skipping singleton classes.
    pub(crate) fn real_class(&self, value: Handle) -> Handle {
        let mut class = self.dispatch_class(value);
        while let Some(Some(superclass)) =
            self.with_module(class, |m| m.is_singleton().then_some(m.superclass).flatten())
        {
            class = superclass;
        }
        class
    }

    pub(crate) fn superclass_of(&self, class: Handle) -> Option<Handle> {
        self.with_module(class, |m| m.superclass).flatten()
    }

    /// Whether `class` appears in the lookup chain of `value`.
    pub(crate) fn kind_of(&self, value: Handle, class: Handle) -> bool {
        let mut current = Some(self.dispatch_class(value));
        while let Some(ancestor) = current {
            if ancestor == class {
                return true;
            }
            current = self.superclass_of(ancestor);
        }
        false
    }

    /// Whether `class` is `ancestor` or inherits from it.
    pub(crate) fn inherits(&self, class: Handle, ancestor: Handle) -> bool {
        let mut current = Some(class);
        while let Some(candidate) = current {
            if candidate == ancestor {
                return true;
            }
            current = self.superclass_of(candidate);
        }
        false
    }

    pub(crate) fn require_module(&self, handle: Handle) {
        if !self.is_module(handle) {
            self.type_error("class or module required")
        }
    }

    /// Name of a module, or a placeholder for anonymous ones.
    pub(crate) fn module_name(&self, module: Handle) -> String {
        let described = self.with_module(module, |m| (m.name.clone(), m.attached, m.is_class));
        match described {
            Some((Some(name), _, _)) => name,
            Some((None, Some(attached), _)) => {
                if self.is_module(attached) {
                    format!("#<Class:{}>", self.module_name(attached))
                } else {
                    format!("#<Class:{}>", self.default_inspect(attached))
                }
            }
            Some((None, None, true)) => format!("#<Class:{:#x}>", module.to_bits()),
            Some((None, None, false)) => format!("#<Module:{:#x}>", module.to_bits()),
            None => self.class_name(module),
        }
    }

    pub(crate) fn new_class(&self, name: Option<String>, superclass: Handle) -> Handle {
        match self.with_module(superclass, |m| (m.is_class, m.is_singleton())) {
            Some((true, false)) => {}
            Some((true, true)) => self.type_error("can't make subclass of singleton class"),
            _ => {
                let message = format!(
                    "superclass must be an instance of Class (given an instance of {})",
                    self.class_name(superclass)
                );
                self.type_error(&message)
            }
        }
        if superclass == self.classes.class {
            self.type_error("can't make subclass of Class")
        }
        let module = ModuleData::new(name, true, Some(superclass));
        self.alloc(self.classes.class, Kind::Module(Box::new(module)))
    }

    pub(crate) fn new_module(&self, name: Option<String>) -> Handle {
        let module = ModuleData::new(name, false, None);
        self.alloc(self.classes.module, Kind::Module(Box::new(module)))
    }

    /// The singleton class of `object`, if it already has one.
    pub(crate) fn own_singleton(&self, object: Handle) -> Option<Handle> {
        let class = self.with_object(object, |o| o.class)?;
        self.with_module(class, |m| m.attached == Some(object))
            .filter(|attached| *attached)
            .map(|_| class)
    }

    /// The singleton class of `object`, created on demand.
    pub(crate) fn singleton_of(&self, object: Handle) -> Handle {
        if let Some(singleton) = self.own_singleton(object) {
            return singleton;
        }
        let current = self
            .with_object(object, |o| match o.kind {
                Kind::Float(_) | Kind::Bignum(_) => None,
                _ => Some(o.class),
            })
            .flatten();
        let Some(current) = current else {
            self.type_error("can't define singleton")
        };
        let mut data = ModuleData::new(None, true, Some(current));
        data.attached = Some(object);
        let singleton = self.alloc(self.classes.class, Kind::Module(Box::new(data)));
        self.with_object_mut(object, |o| o.class = singleton);
        singleton
    }

    // ========================================================================
    // Constants
    // ========================================================================

    pub(crate) fn check_const_name(&self, id: RawId) {
        let name = self.name_of(id);
        if !name.starts_with(|c: char| c.is_ascii_uppercase()) {
            let message = format!("wrong constant name {name}");
            self.raise_new(self.classes.name_error, &message)
        }
    }

    /// Constant `id` in `module`, its ancestors, then `Object`.
    pub(crate) fn lookup_const(&self, module: Handle, id: RawId) -> Option<Handle> {
        let mut current = Some(module);
        while let Some(candidate) = current {
            let (found, superclass) =
                self.with_module(candidate, |m| (m.constants.get(&id).copied(), m.superclass))?;
            if found.is_some() {
                return found;
            }
            current = superclass;
        }
        if module == self.classes.object {
            return None;
        }
        self.with_module(self.classes.object, |m| m.constants.get(&id).copied())
            .flatten()
    }

    pub(crate) fn set_const(&self, module: Handle, id: RawId, value: Handle) {
        if !self.is_module(module) {
            let message = format!("{} is not a class/module", self.inspect_string(module));
            self.type_error(&message)
        }
        let path = self.child_path(module, id);
        self.with_module_mut(value, |m| {
            if m.name.is_none() && !m.is_singleton() {
                m.name = Some(path);
            }
        });
        self.with_module_mut(module, |m| m.constants.insert(id, value));
    }

    pub(crate) fn child_path(&self, outer: Handle, id: RawId) -> String {
        if outer == self.classes.object {
            self.name_of(id)
        } else {
            format!("{}::{}", self.module_name(outer), self.name_of(id))
        }
    }

    // ========================================================================
    // Allocation and copying
    // ========================================================================

    /// Uninitialized instance of `class`.
    pub(crate) fn allocate(&self, class: Handle) -> Handle {
        match self.with_module(class, |m| (m.is_class, m.is_singleton())) {
            Some((true, false)) => {}
            Some((true, true)) => self.type_error("can't create instance of singleton class"),
            _ => {
                let message = format!("wrong argument type {} (expected Class)", self.class_name(class));
                self.type_error(&message)
            }
        }
        let mut current = Some(class);
        let mut layout = (None, None);
        while let Some(candidate) = current {
            let (data_type, instance_kind, superclass) = self
                .with_module(candidate, |m| (m.data_type, m.instance_kind, m.superclass))
                .unwrap_or((None, None, None));
            if data_type.is_some() || instance_kind.is_some() {
                layout = (data_type, instance_kind);
                break;
            }
            current = superclass;
        }
        let kind = match layout {
            (Some(descriptor), _) => Kind::Data(DataSlot {
                descriptor,
                payload: None,
            }),
            (None, Some(InstanceKind::String)) => Kind::Str(String::new()),
            (None, Some(InstanceKind::Array)) => Kind::Array(Vec::new()),
            (None, Some(InstanceKind::Unallocatable)) => {
                let message = format!("allocator undefined for {}", self.module_name(class));
                self.type_error(&message)
            }
            (None, Some(InstanceKind::Plain)) | (None, None) => Kind::Plain,
        };
        self.alloc(class, kind)
    }

    /// `Class#new`: allocate and run `initialize`.
    pub(crate) fn new_object(&self, class: Handle, args: &[Handle], block: Option<Handle>) -> Handle {
        if class == self.classes.class {
            self.check_arity(args, 0, Some(1));
            let superclass = args.first().copied().unwrap_or(self.classes.object);
            return self.new_class(None, superclass);
        }
        if class == self.classes.module {
            self.check_arity(args, 0, Some(0));
            return self.new_module(None);
        }
        let object = self.allocate(class);
        self.call_method(object, self.ids.initialize, args, block);
        object
    }

    /// `dup` and `clone`: shallow copy, then `initialize_copy`.
    pub(crate) fn duplicate(&self, source: Handle, keep_frozen: bool) -> Handle {
        if !matches!(decode(source), Imm::Heap(_)) {
            return source;
        }
        if self.is_module(source) {
            let message = format!("can't copy {}", self.module_name(source));
            self.type_error(&message)
        }
        let class = self.real_class(source);
        let copied = self.with_object(source, |object| {
            let kind = match &object.kind {
                Kind::Plain => Some(Kind::Plain),
                Kind::Str(text) => Some(Kind::Str(text.clone())),
                Kind::Array(items) => Some(Kind::Array(items.clone())),
                Kind::Proc(data) => Some(Kind::Proc(ProcData {
                    body: data.body.clone(),
                    lambda: data.lambda,
                })),
                Kind::Data(slot) => Some(Kind::Data(DataSlot {
                    descriptor: slot.descriptor,
                    payload: None,
                })),
                Kind::Float(_) | Kind::Bignum(_) | Kind::Module(_) => None,
            };
            (kind, object.ivars.clone(), object.frozen)
        });
        let (kind, ivars, frozen) = match copied {
            Some((Some(kind), ivars, frozen)) => (kind, ivars, frozen),
            Some((None, _, _)) => return source,
            None => self.type_error("can't copy a collected object"),
        };
        let copy = self.alloc(class, kind);
        self.with_object_mut(copy, |object| object.ivars = ivars);
        self.call_method(copy, self.ids.initialize_copy, &[source], None);
        if keep_frozen && frozen {
            self.with_object_mut(copy, |object| object.frozen = true);
        }
        copy
    }

    // ========================================================================
    // Freezing
    // ========================================================================

    /// Immediates are always frozen.
    pub(crate) fn frozen(&self, value: Handle) -> bool {
        match decode(value) {
            Imm::Heap(_) => self.with_object(value, |object| object.frozen).unwrap_or(true),
            _ => true,
        }
    }

    pub(crate) fn ensure_mutable(&self, value: Handle) {
        if self.frozen(value) {
            let message = format!(
                "can't modify frozen {}: {}",
                self.class_name(value),
                self.inspect_string(value)
            );
            self.raise_new(self.classes.frozen_error, &message)
        }
    }

    // ========================================================================
    // Strings and display
    // ========================================================================

    pub(crate) fn string_contents(&self, value: Handle) -> Option<String> {
        self.with_object(value, |object| match &object.kind {
            Kind::Str(text) => Some(text.clone()),
            _ => None,
        })
        .flatten()
    }

    /// Short description used in conversion messages.
    pub(crate) fn describe(&self, value: Handle) -> String {
        match decode(value) {
            Imm::Nil => "nil".to_string(),
            Imm::True => "true".to_string(),
            Imm::False => "false".to_string(),
            _ => self.class_name(value),
        }
    }

    /// Contents of a string; `TypeError` for anything else.
    pub(crate) fn expect_string(&self, value: Handle) -> String {
        match self.string_contents(value) {
            Some(text) => text,
            None => {
                let message = format!("no implicit conversion of {} into String", self.describe(value));
                self.type_error(&message)
            }
        }
    }

    pub(crate) fn default_inspect(&self, value: Handle) -> String {
        format!("#<{}>", self.class_name(value))
    }

    /// Result of `inspect`, as a Rust string.
    pub fn inspect_string(&self, value: Handle) -> String {
        let repr = self.call_method(value, self.ids.inspect, &[], None);
        self.string_contents(repr)
            .unwrap_or_else(|| self.default_inspect(value))
    }

    /// Result of `to_s`, as a Rust string.
    pub(crate) fn display_string(&self, value: Handle) -> String {
        let repr = self.call_method(value, self.ids.to_s, &[], None);
        self.string_contents(repr)
            .unwrap_or_else(|| self.default_inspect(value))
    }
}

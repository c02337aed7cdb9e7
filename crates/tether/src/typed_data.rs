//! Native payloads attached to managed objects
//!
//! A native type `T` implementing [`TypedData`] is bound once per runtime to
//! a managed class ([`DataType::bind`]). From then on the runtime allocates
//! instances of that class as empty shells, and `initialize` attaches a boxed
//! `RefCell<T>` to the shell's data slot. The collector reaches the payload
//! through the type's [`DataTypeDescriptor`]:
//!
//! * mark: [`TypedData::mark`], with a [`Gc`] in marking or compaction phase
//! * free: drops the boxed payload, exactly once
//! * size: [`TypedData::size`]
//!
//! Native code gets at the payload through [`Obj`] (shared) and [`ObjMut`]
//! (exclusive, refused on frozen shells).
//!
//! Types that need to find their own managed object embed an
//! [`AssociatedValue`] and return it from [`TypedData::association`]; the
//! association is filled in when the payload is attached and kept current
//! across compaction by the default mark callback.

use std::any::{type_name, TypeId};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::args::{arg, receiver, ArgList, CallArgs};
use crate::convert::{FromHandle, IntoArgs, IntoHandle, ReturnValue};
use crate::error::{Error, Result};
use crate::gc::Gc;
use crate::handle::Handle;
use crate::protect::{protect, protect_with};
use crate::runtime::{with_runtime, Session};
use crate::trampoline;
use crate::value::{class_name, Class, Module, Value};

// ============================================================================
// TypedData
// ============================================================================

/// A native type that can live inside a managed object.
///
/// Dropping the value is the free callback.
pub trait TypedData: Sized + 'static {
    /// Back-reference to the owning object, for two-way types.
    fn association(&self) -> Option<&AssociatedValue> {
        None
    }

    /// Report embedded handles to the collector.
    ///
    /// Handles marked here must be stored in `Cell`s so the compaction phase
    /// can rewrite them. The default marks the association, if any.
    fn mark(&self, gc: &Gc<'_>) {
        if let Some(association) = self.association() {
            association.mark(gc);
        }
    }

    /// Approximate footprint reported to the collector.
    fn size(&self) -> usize {
        mem::size_of::<Self>()
    }
}

/// One-shot back-reference from a payload to its managed object.
///
/// Cloning yields an empty association: a copy belongs to a different object.
#[derive(Default)]
pub struct AssociatedValue {
    owner: Cell<Option<Handle>>,
}

impl AssociatedValue {
    /// Empty association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the owning object. Fails if already associated.
    pub fn associate(&self, owner: Value) -> Result<()> {
        if self.owner.get().is_some() {
            return Err(Error::Runtime("Already associated".to_string()));
        }
        self.owner.set(Some(owner.as_handle()));
        Ok(())
    }

    /// The owning object, if associated.
    pub fn get(&self) -> Option<Value> {
        self.owner.get().map(Value::from_handle)
    }

    /// Whether an owner was recorded.
    pub fn is_associated(&self) -> bool {
        self.owner.get().is_some()
    }

    /// Mark the owner movable, or follow it if it moved.
    pub fn mark(&self, gc: &Gc<'_>) {
        gc.mark_movable_opt(&self.owner);
    }
}

impl Clone for AssociatedValue {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl fmt::Debug for AssociatedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AssociatedValue").field(&self.owner.get()).finish()
    }
}

/// The managed object owning a two-way payload.
pub fn owner_of<T: TypedData>(payload: &T) -> Result<Value> {
    payload
        .association()
        .and_then(AssociatedValue::get)
        .ok_or_else(|| Error::Runtime("This object is not managed by the runtime".to_string()))
}

// ============================================================================
// Descriptor
// ============================================================================

/// Collector-facing description of a bound native type.
pub struct DataTypeDescriptor {
    name: &'static str,
    type_id: TypeId,
    class: Cell<Handle>,
    mark: unsafe fn(NonNull<c_void>, &Gc<'_>),
    free: unsafe fn(NonNull<c_void>),
    size: unsafe fn(NonNull<c_void>) -> usize,
}

impl DataTypeDescriptor {
    fn of<T: TypedData>(class: Handle) -> Self {
        DataTypeDescriptor {
            name: type_name::<T>(),
            type_id: TypeId::of::<T>(),
            class: Cell::new(class),
            mark: mark_payload::<T>,
            free: free_payload::<T>,
            size: payload_size::<T>,
        }
    }

    /// Native type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Native type id.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The bound class.
    pub fn class(&self) -> Handle {
        self.class.get()
    }

    /// Address of the class slot, registered as a collector root.
    pub fn class_slot(&self) -> NonNull<Handle> {
        NonNull::from(&self.class).cast()
    }

    /// Run the payload's mark callback; the phase comes from `gc`.
    ///
    /// # Safety
    ///
    /// `payload` must be a live payload of this descriptor's type.
    pub unsafe fn mark(&self, payload: NonNull<c_void>, gc: &Gc<'_>) {
        (self.mark)(payload, gc)
    }

    /// Drop the payload.
    ///
    /// # Safety
    ///
    /// `payload` must be a live payload of this descriptor's type and must not
    /// be used afterwards.
    pub unsafe fn free(&self, payload: NonNull<c_void>) {
        (self.free)(payload)
    }

    /// Payload footprint.
    ///
    /// # Safety
    ///
    /// `payload` must be a live payload of this descriptor's type.
    pub unsafe fn size(&self, payload: NonNull<c_void>) -> usize {
        (self.size)(payload)
    }
}

impl fmt::Debug for DataTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataTypeDescriptor")
            .field("name", &self.name)
            .field("class", &self.class.get())
            .finish()
    }
}

unsafe fn mark_payload<T: TypedData>(payload: NonNull<c_void>, gc: &Gc<'_>) {
    let cell = payload.cast::<RefCell<T>>().as_ref();
    // SAFETY: collections run between native statements, and mark callbacks
    // only touch Cell-held handles, so reading through a live borrow is sound.
    (*cell.as_ptr()).mark(gc);
}

unsafe fn free_payload<T: TypedData>(payload: NonNull<c_void>) {
    drop(Box::from_raw(payload.cast::<RefCell<T>>().as_ptr()));
}

unsafe fn payload_size<T: TypedData>(payload: NonNull<c_void>) -> usize {
    let cell = payload.cast::<RefCell<T>>().as_ref();
    (*cell.as_ptr()).size()
}

// ============================================================================
// Binding
// ============================================================================

/// Per-type binding operations.
pub struct DataType<T>(PhantomData<fn() -> T>);

impl<T: TypedData> DataType<T> {
    /// Bind `T` to `class`. A type binds at most once per runtime.
    pub fn bind(class: Class) -> Result<&'static DataTypeDescriptor> {
        let session = Session::current()?;
        if session.data_type(TypeId::of::<T>()).is_some() {
            return Err(Error::Definition(format!(
                "type '{}' is already bound to a managed class",
                type_name::<T>()
            )));
        }
        let descriptor: &'static DataTypeDescriptor =
            Box::leak(Box::new(DataTypeDescriptor::of::<T>(class.as_handle())));
        let rt = session.runtime();
        protect_with(rt, |rt| rt.bind_data_type(class.as_handle(), descriptor))?;
        rt.register_address(descriptor.class_slot());
        session.register_data_type(TypeId::of::<T>(), descriptor);
        log::debug!("bound {} to {}", descriptor.name(), class.name()?);
        Ok(descriptor)
    }

    /// The descriptor of a bound type.
    pub fn get() -> Result<&'static DataTypeDescriptor> {
        Session::current()?
            .data_type(TypeId::of::<T>())
            .ok_or_else(|| {
                Error::Definition(format!(
                    "Type '{}' is not yet bound to a managed class",
                    type_name::<T>()
                ))
            })
    }

    /// Whether `T` is bound in the attached runtime.
    pub fn is_bound() -> bool {
        Self::get().is_ok()
    }

    /// The bound class.
    pub fn class() -> Result<TypedClass<T>> {
        let class = Self::get()?.class();
        // SAFETY: descriptors are only created for classes.
        Ok(TypedClass::new(unsafe {
            <Class as crate::handle::ReprValue>::from_handle_unchecked(class)
        }))
    }

    /// Attach `value` to an allocated, uninitialized shell.
    pub fn initialize(object: Value, value: T) -> Result<()> {
        let descriptor = Self::get()?;
        let handle = object.as_handle();
        let existing = protect(|rt| rt.data_get(handle, descriptor))?;
        if !existing.is_null() {
            return Err(Error::Runtime(format!(
                "{} object is already initialized",
                descriptor.name()
            )));
        }
        let payload = NonNull::from(Box::leak(Box::new(RefCell::new(value))));
        with_runtime(|rt| rt.data_set(handle, payload.cast()))?;
        // SAFETY: the payload was attached above and the shell is reachable.
        let cell = unsafe { payload.as_ref() };
        if let Some(association) = cell.borrow().association() {
            association.associate(object)?;
        }
        Ok(())
    }

    /// Attach a copy of `source` to an allocated, uninitialized shell.
    pub fn initialize_copy(object: Value, source: &T) -> Result<()>
    where
        T: Clone,
    {
        Self::initialize(object, source.clone())
    }

    /// New instance of the bound class holding `value`.
    pub fn wrap(value: T) -> Result<Value> {
        let object = Self::class()?.allocate()?;
        Self::initialize(object, value)?;
        Ok(object)
    }
}

/// Payload cell of a `T` shell.
fn payload_cell<T: TypedData>(handle: Handle) -> Result<&'static RefCell<T>> {
    let descriptor = DataType::<T>::get()?;
    let payload = protect(|rt| rt.data_get(handle, descriptor))?;
    match NonNull::new(payload) {
        // SAFETY: the runtime only stores payloads created by `initialize`
        // for this descriptor, and they live until the shell is swept.
        Some(payload) => Ok(unsafe { payload.cast::<RefCell<T>>().as_ref() }),
        None => Err(Error::Uninitialized {
            type_name: descriptor.name().to_string(),
        }),
    }
}

pub(crate) fn define_data_class<T: TypedData>(
    outer: Module,
    name: &str,
    superclass: Class,
) -> Result<TypedClass<T>> {
    let session = Session::current()?;
    let mut ancestor = Some(superclass);
    while let Some(class) = ancestor {
        if let Some(descriptor) = session.data_type_for_class(class.as_handle()) {
            if descriptor.type_id() != TypeId::of::<T>() {
                return Err(Error::Definition(
                    "superclass has mismatching static type".to_string(),
                ));
            }
            // Instances inherit the ancestor's allocator and payload type.
            return Ok(TypedClass::new(outer.define_class(name, superclass)?));
        }
        ancestor = class.superclass()?;
    }
    let class = outer.define_class(name, superclass)?;
    DataType::<T>::bind(class)?;
    Ok(TypedClass::new(class))
}

// ============================================================================
// Object references
// ============================================================================

/// Shared access to the payload of a `T` shell.
pub struct Obj<T: TypedData> {
    value: Value,
    guard: Ref<'static, T>,
}

impl<T: TypedData> Obj<T> {
    /// The managed object.
    pub fn value(&self) -> Value {
        self.value
    }
}

impl<T: TypedData> FromHandle for Obj<T> {
    fn from_handle(handle: Handle) -> Result<Self> {
        let cell = payload_cell::<T>(handle)?;
        let guard = cell.try_borrow().map_err(|_| {
            Error::Borrow(format!("{} is already mutably borrowed", type_name::<T>()))
        })?;
        Ok(Obj {
            value: Value::from_handle(handle),
            guard,
        })
    }
}

impl<T: TypedData> Deref for Obj<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: TypedData> IntoHandle for Obj<T> {
    fn into_handle(self) -> Result<Handle> {
        Ok(self.value.as_handle())
    }
}

/// Exclusive access to the payload of a non-frozen `T` shell.
pub struct ObjMut<T: TypedData> {
    value: Value,
    guard: RefMut<'static, T>,
}

impl<T: TypedData> ObjMut<T> {
    /// The managed object.
    pub fn value(&self) -> Value {
        self.value
    }
}

impl<T: TypedData> FromHandle for ObjMut<T> {
    fn from_handle(handle: Handle) -> Result<Self> {
        let frozen = with_runtime(|rt| {
            rt.is_frozen(handle)
                .then(|| format!("can't modify frozen {}", class_name(rt, handle)))
        })?;
        if let Some(message) = frozen {
            return Err(Error::Frozen(message));
        }
        let cell = payload_cell::<T>(handle)?;
        let guard = cell
            .try_borrow_mut()
            .map_err(|_| Error::Borrow(format!("{} is already borrowed", type_name::<T>())))?;
        Ok(ObjMut {
            value: Value::from_handle(handle),
            guard,
        })
    }
}

impl<T: TypedData> Deref for ObjMut<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: TypedData> DerefMut for ObjMut<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: TypedData> IntoHandle for ObjMut<T> {
    fn into_handle(self) -> Result<Handle> {
        Ok(self.value.as_handle())
    }
}

// ============================================================================
// TypedClass
// ============================================================================

/// A class bound to the native type `T`.
pub struct TypedClass<T> {
    class: Class,
    _ty: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedClass<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypedClass<T> {}

impl<T> fmt::Debug for TypedClass<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypedClass").field(&self.class).finish()
    }
}

impl<T: TypedData> TypedClass<T> {
    fn new(class: Class) -> Self {
        TypedClass {
            class,
            _ty: PhantomData,
        }
    }

    /// The untyped class.
    pub fn class(self) -> Class {
        self.class
    }

    /// Register `initialize`: parse `specs`, build the payload with `f` and
    /// attach it to the receiver.
    pub fn define_constructor<S, F>(self, specs: S, f: F) -> Result<Self>
    where
        S: ArgList + 'static,
        F: Fn(S::Output) -> Result<T> + 'static,
    {
        specs.validate()?;
        let label = format!("{}#initialize", self.class.name()?);
        let entry = trampoline::alloc_callback(
            &label,
            Box::new(move |args, receiver| {
                let mut call = CallArgs::new(receiver, args);
                let parsed = specs.parse(&mut call)?;
                specs.finish(&call)?;
                DataType::<T>::initialize(Value::from_handle(receiver), f(parsed)?)?;
                Ok(receiver)
            }),
        )?;
        self.class.define_native("initialize", entry)?;
        Ok(self)
    }

    /// Register `initialize_copy`, so `dup` and `clone` copy the payload.
    pub fn define_copy_constructor(self) -> Result<Self>
    where
        T: Clone,
    {
        let label = format!("{}#initialize_copy", self.class.name()?);
        let entry = trampoline::method_callback(
            &label,
            (receiver::<Value>(), arg::<Obj<T>>("source")),
            |(this, source)| -> Result<Value> {
                DataType::<T>::initialize_copy(this, &source)?;
                Ok(this)
            },
        )?;
        self.class.define_native("initialize_copy", entry)?;
        Ok(self)
    }

    /// Register a method receiving the payload exclusively.
    ///
    /// Calls on a frozen receiver fail with `FrozenError`.
    pub fn define_method<S, F, R>(self, name: &str, specs: S, f: F) -> Result<Self>
    where
        S: ArgList + 'static,
        F: Fn(&mut T, S::Output) -> R + 'static,
        R: ReturnValue,
    {
        specs.validate()?;
        let label = format!("{}#{}", self.class.name()?, name);
        let entry = trampoline::alloc_callback(
            &label,
            Box::new(move |args, receiver| {
                let mut call = CallArgs::new(receiver, args);
                let mut this = ObjMut::<T>::from_handle(receiver)?;
                let parsed = specs.parse(&mut call)?;
                specs.finish(&call)?;
                f(&mut this, parsed).into_return()
            }),
        )?;
        self.class.define_native(name, entry)?;
        Ok(self)
    }

    /// Register a method receiving the payload shared.
    pub fn define_method_const<S, F, R>(self, name: &str, specs: S, f: F) -> Result<Self>
    where
        S: ArgList + 'static,
        F: Fn(&T, S::Output) -> R + 'static,
        R: ReturnValue,
    {
        specs.validate()?;
        let label = format!("{}#{}", self.class.name()?, name);
        let entry = trampoline::alloc_callback(
            &label,
            Box::new(move |args, receiver| {
                let mut call = CallArgs::new(receiver, args);
                let this = Obj::<T>::from_handle(receiver)?;
                let parsed = specs.parse(&mut call)?;
                specs.finish(&call)?;
                f(&this, parsed).into_return()
            }),
        )?;
        self.class.define_native(name, entry)?;
        Ok(self)
    }

    /// Register a method on the class object itself.
    pub fn define_singleton_method<S, F, R>(self, name: &str, specs: S, f: F) -> Result<Self>
    where
        S: ArgList + 'static,
        F: Fn(S::Output) -> R + 'static,
        R: ReturnValue,
    {
        self.class.as_value().define_singleton_method(name, specs, f)?;
        Ok(self)
    }

    /// Allocate and initialize an instance.
    pub fn new_instance(self, args: impl IntoArgs) -> Result<Value> {
        self.class.new_instance(args)
    }

    /// Allocate an uninitialized shell.
    pub fn allocate(self) -> Result<Value> {
        self.class.allocate()
    }
}

impl<T> From<TypedClass<T>> for Class {
    fn from(typed: TypedClass<T>) -> Class {
        typed.class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_association_is_one_shot() {
        let association = AssociatedValue::new();
        assert!(!association.is_associated());
        association.associate(Value::from_handle(Handle::from_bits(0x1000))).unwrap();
        let err = association
            .associate(Value::from_handle(Handle::from_bits(0x2000)))
            .unwrap_err();
        assert_eq!(err.to_string(), "Already associated");
        assert_eq!(association.get().map(Value::as_handle), Some(Handle::from_bits(0x1000)));
    }

    #[test]
    fn test_clone_drops_association() {
        let association = AssociatedValue::new();
        association.associate(Value::from_handle(Handle::from_bits(0x1000))).unwrap();
        assert!(!association.clone().is_associated());
    }

    #[derive(Default)]
    struct Plain;

    impl TypedData for Plain {}

    #[test]
    fn test_owner_of_unassociated_type() {
        let err = owner_of(&Plain).unwrap_err();
        assert_eq!(err.to_string(), "This object is not managed by the runtime");
    }

    #[test]
    fn test_descriptor_callbacks() {
        thread_local!(static DROPS: Cell<usize> = const { Cell::new(0) });

        struct Tracked;
        impl TypedData for Tracked {
            fn size(&self) -> usize {
                64
            }
        }
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.with(|d| d.set(d.get() + 1));
            }
        }

        let descriptor = DataTypeDescriptor::of::<Tracked>(Handle::NIL);
        let payload = NonNull::from(Box::leak(Box::new(RefCell::new(Tracked)))).cast::<c_void>();
        unsafe {
            assert_eq!(descriptor.size(payload), 64);
            descriptor.free(payload);
        }
        assert_eq!(DROPS.with(Cell::get), 1);
        assert!(descriptor.name().ends_with("Tracked"));
    }
}

//! Runtime capabilities consumed by the bridge
//!
//! The bridge never depends on a concrete runtime. Everything it needs is
//! expressed by [`Runtime`], which an embedding runtime implements once and
//! attaches to the current thread with [`attach`].
//!
//! Methods documented as *may transfer* are allowed to perform a non-local
//! control transfer (raise an exception, throw, ...) instead of returning.
//! The bridge only calls those inside [`protect`](crate::protect::protect).

use std::any::TypeId;
use std::cell::RefCell;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result, Tag, Transfer};
use crate::handle::{Handle, ValueType};
use crate::ident::RawId;
use crate::typed_data::DataTypeDescriptor;

/// The fixed call-in ABI every native method entry presents.
pub type NativeFn = unsafe extern "C" fn(argc: c_int, argv: *const Handle, receiver: Handle) -> Handle;

/// Unblocking callback handed to [`Runtime::without_lock`].
pub type UnblockFn = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Built-in classes
// ============================================================================

/// Classes every runtime provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    /// Root of the class hierarchy
    Object,
    /// Class of modules
    Module,
    /// Class of classes
    Class,
    /// Class of integers
    Integer,
    /// Class of floats
    Float,
    /// Class of strings
    String,
    /// Class of symbols
    Symbol,
    /// Class of arrays
    Array,
    /// Class of procs
    Proc,
    /// Root of the exception hierarchy
    Exception,
    /// Default base of rescuable exceptions
    StandardError,
    /// Wrong arguments
    ArgumentError,
    /// Wrong type
    TypeError,
    /// Value out of range
    RangeError,
    /// Generic failure
    RuntimeError,
    /// Modification of a frozen object
    FrozenError,
}

// ============================================================================
// Collector
// ============================================================================

/// Collector operations exposed to native mark callbacks.
///
/// Consumed through [`Gc`](crate::gc::Gc), which selects the right operation
/// for the current phase.
pub trait Collector {
    /// Mark `handle` reachable; the collector may move it.
    fn mark_movable(&self, handle: Handle);

    /// Mark `handle` reachable and keep it at its current address.
    fn mark_pinned(&self, handle: Handle);

    /// Current address of `handle` during compaction.
    fn location(&self, handle: Handle) -> Handle;
}

// ============================================================================
// Runtime
// ============================================================================

/// Abstract managed runtime.
///
/// This trait is the single entry point for every operation the bridge
/// performs on managed objects.
pub trait Runtime {
    // ========================================================================
    // Identifiers
    // ========================================================================

    /// Intern `name` as a static identifier. Never collected.
    fn intern(&self, name: &str) -> RawId;

    /// Identifier named by a symbol or string. *May transfer* (`TypeError`).
    fn id_from_symbol(&self, symbol: Handle) -> RawId;

    /// Symbol for an identifier.
    fn id_to_symbol(&self, id: RawId) -> Handle;

    /// Name of an identifier.
    fn id_name(&self, id: RawId) -> String;

    // ========================================================================
    // Object model
    // ========================================================================

    /// Coarse dynamic type of a handle.
    fn value_type(&self, value: Handle) -> ValueType;

    /// Class of a handle, skipping singleton classes.
    fn class_of(&self, value: Handle) -> Handle;

    /// Superclass of a class, or `nil` at the root.
    fn superclass(&self, class: Handle) -> Handle;

    /// Whether `value` is an instance of `class` or of a subclass.
    fn is_kind_of(&self, value: Handle, class: Handle) -> bool;

    /// Whether `value` is a direct instance of `class`.
    fn is_instance_of(&self, value: Handle, class: Handle) -> bool;

    /// Whether `value` is frozen.
    fn is_frozen(&self, value: Handle) -> bool;

    /// Freeze `value` in place and return it.
    fn freeze(&self, value: Handle) -> Handle;

    /// Raise `FrozenError` if `value` is frozen. *May transfer.*
    fn check_frozen(&self, value: Handle);

    /// Debug representation as a string. *May transfer.*
    fn inspect(&self, value: Handle) -> Handle;

    /// Display representation as a string. *May transfer.*
    fn to_s(&self, value: Handle) -> Handle;

    /// Fully qualified name of a module or class, as a string.
    fn class_path(&self, module: Handle) -> Handle;

    /// Send `method` to `receiver`. *May transfer.*
    fn funcall(&self, receiver: Handle, method: RawId, args: &[Handle], block: Option<Handle>) -> Handle;

    /// Whether `receiver` responds to `method`.
    fn respond_to(&self, receiver: Handle, method: RawId) -> bool;

    /// Read an instance variable; `nil` when unset.
    fn ivar_get(&self, object: Handle, name: RawId) -> Handle;

    /// Write an instance variable. *May transfer* (`FrozenError`).
    fn ivar_set(&self, object: Handle, name: RawId, value: Handle);

    /// Whether an instance variable is set.
    fn ivar_defined(&self, object: Handle, name: RawId) -> bool;

    // ========================================================================
    // Modules and classes
    // ========================================================================

    /// Handle of a built-in class.
    fn builtin(&self, which: Builtin) -> Handle;

    /// New anonymous module.
    fn module_new(&self) -> Handle;

    /// New anonymous class. *May transfer* (`TypeError`).
    fn class_new(&self, superclass: Handle) -> Handle;

    /// Define or reopen a module under `outer`. *May transfer.*
    fn define_module_under(&self, outer: Handle, name: RawId) -> Handle;

    /// Define or reopen a class under `outer`. *May transfer.*
    fn define_class_under(&self, outer: Handle, name: RawId, superclass: Handle) -> Handle;

    /// Register a native method entry. *May transfer.*
    fn define_method(&self, module: Handle, name: RawId, entry: NativeFn);

    /// Singleton class of an object. *May transfer* (`TypeError`).
    fn singleton_class(&self, object: Handle) -> Handle;

    /// Look up a constant. *May transfer* (`NameError`).
    fn const_get(&self, module: Handle, name: RawId) -> Handle;

    /// Set a constant. *May transfer.*
    fn const_set(&self, module: Handle, name: RawId, value: Handle);

    /// Whether a constant is defined.
    fn const_defined(&self, module: Handle, name: RawId) -> bool;

    /// Allocate an uninitialized instance. *May transfer.*
    fn obj_alloc(&self, class: Handle) -> Handle;

    /// Allocate and initialize an instance. *May transfer.*
    fn new_instance(&self, class: Handle, args: &[Handle]) -> Handle;

    // ========================================================================
    // Exceptions and non-local transfers
    // ========================================================================

    /// Run `body`, capturing any transfer it performs.
    ///
    /// Returns [`Tag::NONE`] when `body` returned normally. After
    /// [`Tag::RAISE`] the exception is available from
    /// [`take_errinfo`](Runtime::take_errinfo).
    fn protect(&self, body: &mut dyn FnMut()) -> Tag;

    /// Take and clear the pending exception.
    fn take_errinfo(&self) -> Handle;

    /// Arm a transfer to replay once the current native entry returns.
    fn arm_transfer(&self, transfer: Transfer);

    // ========================================================================
    // Numbers
    // ========================================================================

    /// Coerce to an integer value. *May transfer* (`TypeError`, `RangeError`).
    fn integer_value(&self, value: Handle) -> i128;

    /// Integer handle for `value`.
    fn integer_new(&self, value: i128) -> Handle;

    /// Coerce to a float value. *May transfer* (`TypeError`).
    fn float_value(&self, value: Handle) -> f64;

    /// Float handle for `value`.
    fn float_new(&self, value: f64) -> Handle;

    // ========================================================================
    // Strings, arrays and procs
    // ========================================================================

    /// New mutable string.
    fn str_new(&self, text: &str) -> Handle;

    /// Frozen, deduplicated string.
    fn str_intern(&self, text: &str) -> Handle;

    /// Contents of a string handle. The caller checks the type first.
    fn str_read(&self, string: Handle) -> String;

    /// New array.
    fn ary_new(&self, elements: &[Handle]) -> Handle;

    /// Array length.
    fn ary_len(&self, array: Handle) -> usize;

    /// Array element; `nil` when out of bounds.
    fn ary_entry(&self, array: Handle, index: usize) -> Handle;

    /// Append to an array. *May transfer* (`FrozenError`).
    fn ary_push(&self, array: Handle, value: Handle);

    /// Remove the last element; `nil` when empty. *May transfer.*
    fn ary_pop(&self, array: Handle) -> Handle;

    /// Whether the current call received a block.
    fn block_given(&self) -> bool;

    /// The current call's block as a proc. *May transfer* (`ArgumentError`).
    fn block_proc(&self) -> Handle;

    /// Call a proc. *May transfer.*
    fn proc_call(&self, proc: Handle, args: &[Handle]) -> Handle;

    /// Whether a proc has lambda semantics.
    fn proc_is_lambda(&self, proc: Handle) -> bool;

    // ========================================================================
    // Typed data
    // ========================================================================

    /// Install the allocator producing `descriptor`-typed shells for `class`.
    fn bind_data_type(&self, class: Handle, descriptor: &'static DataTypeDescriptor);

    /// Payload pointer of a typed shell; null when uninitialized.
    /// *May transfer* (`TypeError` when `object` is not a `descriptor` shell).
    fn data_get(&self, object: Handle, descriptor: &'static DataTypeDescriptor) -> *mut c_void;

    /// Attach a payload to a typed shell.
    fn data_set(&self, object: Handle, payload: NonNull<c_void>);

    // ========================================================================
    // Collector
    // ========================================================================

    /// Register a handle slot as a pinned root.
    fn register_address(&self, slot: NonNull<Handle>);

    /// Remove a previously registered root.
    fn unregister_address(&self, slot: NonNull<Handle>);

    // ========================================================================
    // Execution lock
    // ========================================================================

    /// Run `body` with the execution lock released.
    fn without_lock(&self, body: &mut dyn FnMut(), unblock: Option<UnblockFn>);
}

// ============================================================================
// Session
// ============================================================================

/// A runtime attached to the current thread plus its per-runtime registries.
pub struct Session {
    runtime: Rc<dyn Runtime>,
    data_types: RefCell<FxHashMap<TypeId, &'static DataTypeDescriptor>>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Session>>> = const { RefCell::new(None) };
}

/// Guard returned by [`attach`]; detaches the runtime on drop.
pub struct Attachment {
    _not_send: PhantomData<*const ()>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        CURRENT.with(|current| current.borrow_mut().take());
        log::trace!("runtime detached");
    }
}

/// Attach `runtime` to the current thread.
///
/// Fails if another runtime is already attached.
pub fn attach(runtime: Rc<dyn Runtime>) -> Result<Attachment> {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if current.is_some() {
            return Err(Error::Definition(
                "a runtime is already attached to this thread".to_string(),
            ));
        }
        *current = Some(Rc::new(Session {
            runtime,
            data_types: RefCell::new(FxHashMap::default()),
        }));
        log::trace!("runtime attached");
        Ok(Attachment {
            _not_send: PhantomData,
        })
    })
}

/// Whether a runtime is attached to the current thread.
pub fn is_attached() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

impl Session {
    /// The session attached to the current thread.
    pub fn current() -> Result<Rc<Session>> {
        CURRENT
            .with(|current| current.borrow().clone())
            .ok_or_else(|| Error::Runtime("no runtime is attached to this thread".to_string()))
    }

    /// The attached runtime.
    pub fn runtime(&self) -> &dyn Runtime {
        &*self.runtime
    }

    pub(crate) fn data_type(&self, type_id: TypeId) -> Option<&'static DataTypeDescriptor> {
        self.data_types.borrow().get(&type_id).copied()
    }

    pub(crate) fn data_type_for_class(&self, class: Handle) -> Option<&'static DataTypeDescriptor> {
        self.data_types
            .borrow()
            .values()
            .copied()
            .find(|descriptor| descriptor.class() == class)
    }

    pub(crate) fn register_data_type(&self, type_id: TypeId, descriptor: &'static DataTypeDescriptor) {
        self.data_types.borrow_mut().insert(type_id, descriptor);
    }
}

/// Run `f` against the attached runtime.
///
/// The session is cloned out of the thread-local first, so `f` may re-enter
/// the bridge freely.
pub fn with_runtime<R>(f: impl FnOnce(&dyn Runtime) -> R) -> Result<R> {
    let session = Session::current()?;
    Ok(f(session.runtime()))
}

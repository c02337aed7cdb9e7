//! Tether Sandbox - an in-process managed runtime for exercising the bridge
//!
//! [`Sandbox`] implements [`tether::Runtime`] with a small dynamically typed
//! object model:
//!
//! - tagged handles (fixnums, static symbols, `nil`/`true`/`false`) and a
//!   slot heap for everything else
//! - classes with single inheritance, singleton classes and constants
//! - exceptions and `catch`/`throw`, both carried by a [`tether::Jump`]
//!   unwind payload
//! - a mark/sweep collector with optional compaction that honours pinned
//!   roots and native mark callbacks
//! - an execution lock that native code can release, with interrupts
//!   delivered from other threads
//!
//! Native methods are called through the fixed entry ABI exactly as a real
//! runtime would, and transfers armed by the bridge are replayed when the
//! entry returns.
//!
//! # Example
//!
//! ```ignore
//! let sandbox = Sandbox::new();
//! let _attached = sandbox.attach()?;
//! let seven = sandbox.call(sandbox.int(3), "+", &[sandbox.int(4)]);
//! ```

#![warn(missing_docs)]

mod classes;
mod collect;
mod dispatch;
mod heap;
mod lock;
mod methods;
mod numeric;
mod object;
mod runtime;
mod symbols;

pub use collect::GcStats;
pub use lock::InterruptHandle;

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tether::{Attachment, Handle, Runtime, Transfer};

use crate::classes::{Classes, Ids};
use crate::dispatch::Frame;
use crate::heap::{Heap, Kind};
use crate::lock::ExecutionLock;
use crate::symbols::SymbolTable;

// ============================================================================
// Options
// ============================================================================

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Heap slots reserved up front
    pub initial_capacity: usize,
    /// Whether [`Sandbox::gc_start`] also compacts
    pub compact_on_collect: bool,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            compact_on_collect: false,
        }
    }
}

// ============================================================================
// Sandbox
// ============================================================================

/// A transfer observed by [`Sandbox::capture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caught {
    /// An exception was raised
    Raised(Handle),
    /// A non-raise transfer escaped
    Jumped(tether::Tag),
}

/// In-process managed runtime.
///
/// Always lives in an `Rc` so it can be attached to the current thread.
pub struct Sandbox {
    options: SandboxOptions,
    pub(crate) heap: RefCell<Heap>,
    pub(crate) symbols: RefCell<SymbolTable>,
    pub(crate) classes: Classes,
    pub(crate) ids: Ids,
    pub(crate) frames: RefCell<Vec<Frame>>,
    pub(crate) errinfo: Cell<Handle>,
    pub(crate) armed: Cell<Option<Transfer>>,
    pub(crate) catch_tags: RefCell<Vec<Handle>>,
    pub(crate) thrown: Cell<Option<(Handle, Handle)>>,
    pub(crate) roots: RefCell<Vec<NonNull<Handle>>>,
    pub(crate) globals: RefCell<FxHashMap<String, Handle>>,
    pub(crate) interned: RefCell<FxHashMap<String, Handle>>,
    pub(crate) lock: ExecutionLock,
    pub(crate) stats: Cell<GcStats>,
}

impl Sandbox {
    /// Sandbox with default options.
    pub fn new() -> Rc<Self> {
        Self::with_options(SandboxOptions::default())
    }

    /// Sandbox with the given options.
    pub fn with_options(options: SandboxOptions) -> Rc<Self> {
        let mut heap = Heap::with_capacity(options.initial_capacity);
        let mut symbols = SymbolTable::default();
        let (classes, ids) = classes::bootstrap(&mut heap, &mut symbols);
        log::debug!("sandbox booted with {} objects", heap.live_count());
        Rc::new(Sandbox {
            options,
            heap: RefCell::new(heap),
            symbols: RefCell::new(symbols),
            classes,
            ids,
            frames: RefCell::new(Vec::new()),
            errinfo: Cell::new(Handle::NIL),
            armed: Cell::new(None),
            catch_tags: RefCell::new(Vec::new()),
            thrown: Cell::new(None),
            roots: RefCell::new(Vec::new()),
            globals: RefCell::new(FxHashMap::default()),
            interned: RefCell::new(FxHashMap::default()),
            lock: ExecutionLock::default(),
            stats: Cell::new(GcStats::default()),
        })
    }

    /// Options this sandbox was created with.
    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    /// Attach to the current thread for the bridge to use.
    pub fn attach(self: &Rc<Self>) -> tether::Result<Attachment> {
        let runtime: Rc<dyn Runtime> = Rc::clone(self) as Rc<dyn Runtime>;
        tether::attach(runtime)
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Integer handle.
    pub fn int(&self, value: i64) -> Handle {
        self.integer_new(i128::from(value))
    }

    /// New string.
    pub fn string(&self, text: &str) -> Handle {
        self.str_new(text)
    }

    /// Symbol for `name`.
    pub fn symbol(&self, name: &str) -> Handle {
        let id = self.intern(name);
        self.id_to_symbol(id)
    }

    /// Float handle.
    pub fn float(&self, value: f64) -> Handle {
        self.float_new(value)
    }

    /// New array.
    pub fn array(&self, elements: &[Handle]) -> Handle {
        self.ary_new(elements)
    }

    /// Contents of a string, or its `to_s` for any other value.
    ///
    /// Transfers like a method call when `to_s` fails.
    pub fn read_string(&self, value: Handle) -> String {
        match self.string_contents(value) {
            Some(text) => text,
            None => self.display_string(value),
        }
    }

    /// The constant `name` on `Object`; `nil` when undefined.
    pub fn class_named(&self, name: &str) -> Handle {
        let id = self.intern(name);
        self.lookup_const(self.classes.object, id).unwrap_or(Handle::NIL)
    }

    /// Name of the class of `value`.
    pub fn class_name(&self, value: Handle) -> String {
        self.module_name(self.real_class(value))
    }

    /// Message of an exception object.
    pub fn exception_message(&self, exception: Handle) -> String {
        let message = self.ivar_get(exception, self.ids.message);
        self.string_contents(message)
            .unwrap_or_else(|| self.module_name(self.real_class(exception)))
    }

    // ========================================================================
    // Roots
    // ========================================================================

    /// Store `value` in a named global. Globals are movable roots.
    pub fn set_global(&self, name: &str, value: Handle) {
        self.globals.borrow_mut().insert(name.to_string(), value);
    }

    /// Read a named global; `nil` when unset.
    pub fn global(&self, name: &str) -> Handle {
        self.globals.borrow().get(name).copied().unwrap_or(Handle::NIL)
    }

    /// Whether `value` names an object that is still alive.
    ///
    /// Immediates are always alive.
    pub fn is_live(&self, value: Handle) -> bool {
        heap::heap_index(value).is_none() || self.heap.borrow().get(value).is_some()
    }

    /// Number of live heap objects.
    pub fn live_objects(&self) -> usize {
        self.heap.borrow().live_count()
    }

    /// Approximate footprint of an object, including a native payload.
    pub fn memsize_of(&self, value: Handle) -> usize {
        let payload = {
            let heap = self.heap.borrow();
            match heap.get(value).map(|object| &object.kind) {
                None => return 0,
                Some(Kind::Data(slot)) => slot.payload.map(|payload| (slot.descriptor, payload)),
                Some(_) => None,
            }
        };
        let base = std::mem::size_of::<heap::Object>();
        match payload {
            // SAFETY: live shells only carry payloads of their descriptor.
            Some((descriptor, payload)) => base + unsafe { descriptor.size(payload) },
            None => base,
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let objects = self.heap.get_mut().drain();
        let mut freed = 0;
        for object in objects {
            if let Kind::Data(slot) = object.kind {
                if let Some(payload) = slot.payload {
                    // SAFETY: each payload is freed here or by a sweep, never both.
                    unsafe { slot.descriptor.free(payload) };
                    freed += 1;
                }
            }
        }
        log::debug!("sandbox dropped, {freed} native payloads freed");
    }
}

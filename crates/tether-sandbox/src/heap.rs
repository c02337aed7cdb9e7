//! Object heap and handle encoding
//!
//! Handle layout (64-bit words):
//!
//! | pattern            | meaning                          |
//! |--------------------|----------------------------------|
//! | `xxxx_xxx1`        | fixnum, value in the upper bits  |
//! | `id << 8 \| 0x0c`  | static symbol                    |
//! | `0x00 0x08 0x14 0x34` | false, nil, true, undef      |
//! | `0x1000 + 16 * i`  | heap slot `i`                    |

use std::collections::BTreeSet;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tether::{DataTypeDescriptor, Handle, NativeFn, RawId};

use crate::Sandbox;

const HEAP_BASE: usize = 0x1000;
const SLOT_STRIDE: usize = 16;
const SYMBOL_TAG: usize = 0x0c;

pub(crate) const FIXNUM_MIN: i128 = -(1 << 61);
pub(crate) const FIXNUM_MAX: i128 = (1 << 61) - 1;

// ============================================================================
// Encoding
// ============================================================================

/// A decoded handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Imm {
    Nil,
    True,
    False,
    Undef,
    Fixnum(i64),
    Symbol(RawId),
    Heap(usize),
}

pub(crate) fn decode(handle: Handle) -> Imm {
    let bits = handle.to_bits();
    match handle {
        Handle::NIL => Imm::Nil,
        Handle::TRUE => Imm::True,
        Handle::FALSE => Imm::False,
        Handle::UNDEF => Imm::Undef,
        _ if bits & 1 == 1 => Imm::Fixnum((bits as i64) >> 1),
        _ if bits & 0xff == SYMBOL_TAG => Imm::Symbol(RawId::new(bits >> 8)),
        _ if bits >= HEAP_BASE && bits % SLOT_STRIDE == 0 => {
            Imm::Heap((bits - HEAP_BASE) / SLOT_STRIDE)
        }
        _ => Imm::Undef,
    }
}

pub(crate) fn fixnum(value: i64) -> Handle {
    Handle::from_bits(((value << 1) | 1) as usize)
}

pub(crate) fn symbol(id: RawId) -> Handle {
    Handle::from_bits((id.get() << 8) | SYMBOL_TAG)
}

pub(crate) fn heap_handle(index: usize) -> Handle {
    Handle::from_bits(HEAP_BASE + index * SLOT_STRIDE)
}

pub(crate) fn heap_index(handle: Handle) -> Option<usize> {
    match decode(handle) {
        Imm::Heap(index) => Some(index),
        _ => None,
    }
}

// ============================================================================
// Objects
// ============================================================================

/// Builtin method body: `(sandbox, receiver, args, block)`.
pub(crate) type BuiltinFn = fn(&Sandbox, Handle, &[Handle], Option<Handle>) -> Handle;

/// Body of a proc created from Rust.
pub(crate) type ProcBody = Rc<dyn Fn(&Sandbox, &[Handle]) -> Handle>;

#[derive(Clone, Copy)]
pub(crate) enum Method {
    Builtin(BuiltinFn),
    Native(NativeFn),
}

/// What `allocate` produces for instances of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstanceKind {
    Plain,
    String,
    Array,
    /// Integers, floats, symbols, nil, booleans, procs
    Unallocatable,
}

pub(crate) struct ModuleData {
    pub name: Option<String>,
    pub is_class: bool,
    pub superclass: Option<Handle>,
    pub attached: Option<Handle>,
    pub methods: FxHashMap<RawId, Method>,
    pub constants: FxHashMap<RawId, Handle>,
    pub instance_kind: Option<InstanceKind>,
    pub data_type: Option<&'static DataTypeDescriptor>,
}

impl ModuleData {
    pub fn new(name: Option<String>, is_class: bool, superclass: Option<Handle>) -> Self {
        ModuleData {
            name,
            is_class,
            superclass,
            attached: None,
            methods: FxHashMap::default(),
            constants: FxHashMap::default(),
            instance_kind: None,
            data_type: None,
        }
    }

    pub fn is_singleton(&self) -> bool {
        self.attached.is_some()
    }
}

pub(crate) struct ProcData {
    pub body: ProcBody,
    pub lambda: bool,
}

pub(crate) struct DataSlot {
    pub descriptor: &'static DataTypeDescriptor,
    pub payload: Option<NonNull<c_void>>,
}

pub(crate) enum Kind {
    Plain,
    Str(String),
    Array(Vec<Handle>),
    Float(f64),
    Bignum(i128),
    Module(Box<ModuleData>),
    Proc(ProcData),
    Data(DataSlot),
}

impl Kind {
    /// Modules and classes stay put for the lifetime of the sandbox.
    pub fn is_movable(&self) -> bool {
        !matches!(self, Kind::Module(_))
    }
}

pub(crate) struct Object {
    pub class: Handle,
    pub frozen: bool,
    pub ivars: Vec<(RawId, Handle)>,
    pub kind: Kind,
    pub marked: bool,
    pub pinned: bool,
}

impl Object {
    pub fn new(class: Handle, kind: Kind) -> Self {
        Object {
            class,
            frozen: false,
            ivars: Vec::new(),
            kind,
            marked: false,
            pinned: false,
        }
    }

    pub fn ivar(&self, name: RawId) -> Option<Handle> {
        self.ivars
            .iter()
            .find(|(id, _)| *id == name)
            .map(|(_, value)| *value)
    }

    pub fn set_ivar(&mut self, name: RawId, value: Handle) {
        match self.ivars.iter_mut().find(|(id, _)| *id == name) {
            Some(entry) => entry.1 = value,
            None => self.ivars.push((name, value)),
        }
    }

    pub fn module(&self) -> Option<&ModuleData> {
        match &self.kind {
            Kind::Module(module) => Some(module),
            _ => None,
        }
    }

    pub fn module_mut(&mut self) -> Option<&mut ModuleData> {
        match &mut self.kind {
            Kind::Module(module) => Some(module),
            _ => None,
        }
    }
}

// ============================================================================
// Heap
// ============================================================================

pub(crate) enum Slot {
    Free,
    Live(Object),
    Moved(Handle),
}

pub(crate) struct Heap {
    slots: Vec<Slot>,
    free: BTreeSet<usize>,
}

impl Heap {
    pub fn with_capacity(capacity: usize) -> Self {
        Heap {
            slots: Vec::with_capacity(capacity),
            free: BTreeSet::new(),
        }
    }

    /// Place `object` in the lowest free slot.
    pub fn alloc(&mut self, object: Object) -> Handle {
        match self.free.pop_first() {
            Some(index) => {
                self.slots[index] = Slot::Live(object);
                heap_handle(index)
            }
            None => {
                self.slots.push(Slot::Live(object));
                heap_handle(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&Object> {
        match self.slots.get(heap_index(handle)?)? {
            Slot::Live(object) => Some(object),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Object> {
        match self.slots.get_mut(heap_index(handle)?)? {
            Slot::Live(object) => Some(object),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut Object> {
        match self.slots.get_mut(index)? {
            Slot::Live(object) => Some(object),
            _ => None,
        }
    }

    pub fn live_mut(&mut self) -> impl Iterator<Item = &mut Object> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Live(object) => Some(object),
            _ => None,
        })
    }

    /// Free slot `index`, returning the object that lived there.
    pub fn release(&mut self, index: usize) -> Option<Object> {
        match std::mem::replace(&mut self.slots[index], Slot::Free) {
            Slot::Live(object) => {
                self.free.insert(index);
                Some(object)
            }
            other => {
                self.slots[index] = other;
                None
            }
        }
    }

    /// Move the object in slot `from` to the lowest free slot below it.
    pub fn relocate_down(&mut self, from: usize) -> Option<Handle> {
        let target = *self.free.first()?;
        if target >= from {
            return None;
        }
        self.free.remove(&target);
        let new_handle = heap_handle(target);
        match std::mem::replace(&mut self.slots[from], Slot::Moved(new_handle)) {
            Slot::Live(object) => {
                self.slots[target] = Slot::Live(object);
                Some(new_handle)
            }
            other => {
                self.slots[from] = other;
                self.free.insert(target);
                None
            }
        }
    }

    /// Turn forwarding entries left by compaction into free slots.
    pub fn clear_forwarding(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot, Slot::Moved(_)) {
                *slot = Slot::Free;
                self.free.insert(index);
            }
        }
    }

    /// Take every remaining object out of the heap.
    pub fn drain(&mut self) -> Vec<Object> {
        self.free.clear();
        std::mem::take(&mut self.slots)
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Live(object) => Some(object),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixnum_encoding() {
        for value in [0_i64, 1, -1, 42, -4096, (1 << 61) - 1, -(1 << 61)] {
            assert_eq!(decode(fixnum(value)), Imm::Fixnum(value));
        }
    }

    #[test]
    fn test_immediates_do_not_collide() {
        assert_eq!(decode(Handle::NIL), Imm::Nil);
        assert_eq!(decode(Handle::TRUE), Imm::True);
        assert_eq!(decode(Handle::FALSE), Imm::False);
        assert_eq!(decode(symbol(RawId::new(7))), Imm::Symbol(RawId::new(7)));
        assert_eq!(decode(heap_handle(3)), Imm::Heap(3));
    }

    #[test]
    fn test_alloc_reuses_lowest_slot() {
        let mut heap = Heap::with_capacity(4);
        let a = heap.alloc(Object::new(Handle::NIL, Kind::Plain));
        let b = heap.alloc(Object::new(Handle::NIL, Kind::Plain));
        let c = heap.alloc(Object::new(Handle::NIL, Kind::Plain));
        heap.release(heap_index(a).unwrap());
        heap.release(heap_index(b).unwrap());
        assert_eq!(heap.live_count(), 1);

        let moved = heap.relocate_down(heap_index(c).unwrap()).unwrap();
        assert_eq!(moved, a);
        assert!(heap.get(c).is_none());
        heap.clear_forwarding();
        assert_eq!(heap.alloc(Object::new(Handle::NIL, Kind::Plain)), b);
    }
}

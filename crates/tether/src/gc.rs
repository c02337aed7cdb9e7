//! Collector cooperation
//!
//! [`Gc`] is what a native payload's mark callback receives. The same
//! callback serves both collector phases: while marking it reports embedded
//! handles as reachable, while compacting it rewrites them to their new
//! location. Embedded handles therefore live in a `Cell` so they can be
//! updated through a shared reference.
//!
//! [`Pinned`] and [`PinnedOpt`] keep an object alive and in place from native
//! code that is not itself traced by the collector.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::Result;
use crate::handle::{Handle, ReprValue};
use crate::runtime::{with_runtime, Collector};

// ============================================================================
// Gc
// ============================================================================

/// Collector phase a mark callback runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reachability tracing
    Marking,
    /// Reference relocation after objects moved
    Compaction,
}

/// Handle to the collector during a mark callback.
pub struct Gc<'a> {
    phase: Phase,
    collector: &'a dyn Collector,
}

impl<'a> Gc<'a> {
    /// Gc for the marking phase.
    pub fn marking(collector: &'a dyn Collector) -> Self {
        Gc {
            phase: Phase::Marking,
            collector,
        }
    }

    /// Gc for the compaction phase.
    pub fn compaction(collector: &'a dyn Collector) -> Self {
        Gc {
            phase: Phase::Compaction,
            collector,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Mark a handle the collector may move, or update it if it moved.
    pub fn mark_movable<T: ReprValue>(&self, slot: &Cell<T>) {
        match self.phase {
            Phase::Marking => self.collector.mark_movable(slot.get().handle()),
            Phase::Compaction => {
                let moved = self.collector.location(slot.get().handle());
                // SAFETY: relocation keeps an object's dynamic type.
                slot.set(unsafe { T::from_handle_unchecked(moved) });
            }
        }
    }

    /// Like [`mark_movable`](Gc::mark_movable) for an optional slot.
    pub fn mark_movable_opt<T: ReprValue>(&self, slot: &Cell<Option<T>>) {
        if let Some(value) = slot.get() {
            let inner = Cell::new(value);
            self.mark_movable(&inner);
            slot.set(Some(inner.get()));
        }
    }

    /// Mark a handle that must stay where it is. No-op while compacting.
    pub fn mark_pinned<T: ReprValue>(&self, value: T) {
        if self.phase == Phase::Marking {
            self.collector.mark_pinned(value.handle());
        }
    }
}

// ============================================================================
// Pinning
// ============================================================================

/// Registered root slot shared by pin clones.
struct PinSlot {
    handle: Cell<Handle>,
}

impl PinSlot {
    fn new(handle: Handle) -> Result<Rc<Self>> {
        with_runtime(|rt| {
            let slot = Rc::new(PinSlot {
                handle: Cell::new(handle),
            });
            rt.register_address(slot.address());
            slot
        })
    }

    fn address(&self) -> NonNull<Handle> {
        NonNull::from(&self.handle).cast()
    }
}

impl Drop for PinSlot {
    fn drop(&mut self) {
        let address = self.address();
        if with_runtime(|rt| rt.unregister_address(address)).is_err() {
            log::warn!("pin dropped after its runtime was detached");
        }
    }
}

/// Keeps an object alive and unmoved while any clone exists.
pub struct Pinned<T: ReprValue> {
    slot: Rc<PinSlot>,
    _ty: std::marker::PhantomData<T>,
}

impl<T: ReprValue> Pinned<T> {
    /// Pin `value`.
    pub fn new(value: T) -> Result<Self> {
        Ok(Pinned {
            slot: PinSlot::new(value.handle())?,
            _ty: std::marker::PhantomData,
        })
    }

    /// The pinned value.
    pub fn get(&self) -> T {
        // SAFETY: only `T` handles are ever stored in this slot.
        unsafe { T::from_handle_unchecked(self.slot.handle.get()) }
    }

    /// Replace the pinned value for every clone.
    pub fn set(&self, value: T) {
        self.slot.handle.set(value.handle());
    }
}

impl<T: ReprValue> Clone for Pinned<T> {
    fn clone(&self) -> Self {
        Pinned {
            slot: Rc::clone(&self.slot),
            _ty: std::marker::PhantomData,
        }
    }
}

impl<T: ReprValue> fmt::Debug for Pinned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pinned({:?})", self.slot.handle.get())
    }
}

/// Optional [`Pinned`]; empty until a value is set.
pub struct PinnedOpt<T: ReprValue> {
    inner: Option<Pinned<T>>,
}

impl<T: ReprValue> PinnedOpt<T> {
    /// Empty pin; registers nothing.
    pub fn empty() -> Self {
        PinnedOpt { inner: None }
    }

    /// Pin `value`.
    pub fn new(value: T) -> Result<Self> {
        Ok(PinnedOpt {
            inner: Some(Pinned::new(value)?),
        })
    }

    /// The pinned value, if any.
    pub fn get(&self) -> Option<T> {
        self.inner.as_ref().map(Pinned::get)
    }

    /// Pin `value`, replacing any previous value for every clone.
    pub fn set(&mut self, value: T) -> Result<()> {
        match &self.inner {
            Some(pinned) => pinned.set(value),
            None => self.inner = Some(Pinned::new(value)?),
        }
        Ok(())
    }

    /// Drop this clone's pin.
    pub fn clear(&mut self) {
        self.inner = None;
    }

    /// Whether a value is pinned.
    pub fn is_some(&self) -> bool {
        self.inner.is_some()
    }
}

impl<T: ReprValue> Default for PinnedOpt<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ReprValue> Clone for PinnedOpt<T> {
    fn clone(&self) -> Self {
        PinnedOpt {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ReprValue> From<Pinned<T>> for PinnedOpt<T> {
    fn from(pinned: Pinned<T>) -> Self {
        PinnedOpt {
            inner: Some(pinned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        movable: RefCell<Vec<Handle>>,
        pinned: RefCell<Vec<Handle>>,
    }

    impl Collector for Recorder {
        fn mark_movable(&self, handle: Handle) {
            self.movable.borrow_mut().push(handle);
        }

        fn mark_pinned(&self, handle: Handle) {
            self.pinned.borrow_mut().push(handle);
        }

        fn location(&self, handle: Handle) -> Handle {
            Handle::from_bits(handle.to_bits() + 0x100)
        }
    }

    #[test]
    fn test_marking_reports_handles() {
        let recorder = Recorder::default();
        let gc = Gc::marking(&recorder);
        let slot = Cell::new(Handle::from_bits(0x1000));
        gc.mark_movable(&slot);
        gc.mark_pinned(Handle::from_bits(0x2000));
        assert_eq!(*recorder.movable.borrow(), vec![Handle::from_bits(0x1000)]);
        assert_eq!(*recorder.pinned.borrow(), vec![Handle::from_bits(0x2000)]);
        assert_eq!(slot.get(), Handle::from_bits(0x1000));
    }

    #[test]
    fn test_compaction_rewrites_slots() {
        let recorder = Recorder::default();
        let gc = Gc::compaction(&recorder);
        let slot = Cell::new(Handle::from_bits(0x1000));
        let optional = Cell::new(Some(Handle::from_bits(0x3000)));
        let empty: Cell<Option<Handle>> = Cell::new(None);
        gc.mark_movable(&slot);
        gc.mark_movable_opt(&optional);
        gc.mark_movable_opt(&empty);
        gc.mark_pinned(Handle::from_bits(0x2000));
        assert_eq!(slot.get(), Handle::from_bits(0x1100));
        assert_eq!(optional.get(), Some(Handle::from_bits(0x3100)));
        assert_eq!(empty.get(), None);
        assert!(recorder.pinned.borrow().is_empty());
    }

    #[test]
    fn test_pin_requires_runtime() {
        assert!(Pinned::new(Handle::NIL).is_err());
        let empty: PinnedOpt<Handle> = PinnedOpt::empty();
        assert!(!empty.is_some());
    }
}

//! Mark/sweep collector with sliding compaction
//!
//! Roots:
//!
//! | root                                  | kind     |
//! |---------------------------------------|----------|
//! | modules and classes                   | pinned   |
//! | call frames (receiver, args, block)   | pinned   |
//! | registered addresses                  | pinned   |
//! | pending exception, throw, armed raise | pinned   |
//! | interned strings                      | pinned   |
//! | globals                               | movable  |
//!
//! Native payloads are traced through their descriptor's mark callback, once
//! with a marking [`Gc`] and, after objects moved, once more with a
//! compaction [`Gc`] so embedded handles follow their objects.

use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr::NonNull;

use rustc_hash::FxHashMap;
use tether::{Collector, DataTypeDescriptor, Gc, Handle, Transfer};

use crate::heap::{heap_handle, heap_index, Kind};
use crate::Sandbox;

/// Cumulative collector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Collections run
    pub collections: usize,
    /// Objects swept
    pub freed: usize,
    /// Objects moved by compaction
    pub moved: usize,
    /// Live objects after the last collection
    pub live: usize,
}

type Payload = (&'static DataTypeDescriptor, NonNull<c_void>);

// ============================================================================
// Collector implementations
// ============================================================================

/// Marking-phase collector: queues reported handles.
#[derive(Default)]
struct Tracer {
    pending: RefCell<Vec<(Handle, bool)>>,
}

impl Tracer {
    fn push(&self, handle: Handle, pinned: bool) {
        if heap_index(handle).is_some() {
            self.pending.borrow_mut().push((handle, pinned));
        }
    }

    fn pop(&self) -> Option<(Handle, bool)> {
        self.pending.borrow_mut().pop()
    }
}

impl Collector for Tracer {
    fn mark_movable(&self, handle: Handle) {
        self.push(handle, false);
    }

    fn mark_pinned(&self, handle: Handle) {
        self.push(handle, true);
    }

    fn location(&self, handle: Handle) -> Handle {
        handle
    }
}

/// Compaction-phase collector: answers new locations.
struct Relocator<'a> {
    forwarding: &'a FxHashMap<Handle, Handle>,
}

impl Relocator<'_> {
    fn follow(&self, handle: Handle) -> Handle {
        self.forwarding.get(&handle).copied().unwrap_or(handle)
    }
}

impl Collector for Relocator<'_> {
    fn mark_movable(&self, _handle: Handle) {}

    fn mark_pinned(&self, _handle: Handle) {}

    fn location(&self, handle: Handle) -> Handle {
        self.follow(handle)
    }
}

// ============================================================================
// Collection
// ============================================================================

impl Sandbox {
    /// Full collection; compacts too when configured to.
    pub fn gc_start(&self) -> GcStats {
        self.collect(self.options().compact_on_collect)
    }

    /// Full collection followed by compaction.
    pub fn gc_compact(&self) -> GcStats {
        self.collect(true)
    }

    /// Statistics so far.
    pub fn stats(&self) -> GcStats {
        self.stats.get()
    }

    fn collect(&self, compact: bool) -> GcStats {
        let tracer = Tracer::default();
        self.push_roots(&tracer);
        self.mark(&tracer);
        let freed = self.sweep();
        let moved = if compact { self.compact() } else { 0 };

        let mut stats = self.stats.get();
        stats.collections += 1;
        stats.freed += freed;
        stats.moved += moved;
        stats.live = self.heap.borrow().live_count();
        self.stats.set(stats);
        log::debug!("gc: freed {freed}, moved {moved}, live {}", stats.live);
        stats
    }

    fn push_roots(&self, tracer: &Tracer) {
        for object in self.heap.borrow_mut().live_mut() {
            object.marked = false;
            object.pinned = false;
        }
        let modules: Vec<Handle> = {
            let heap = self.heap.borrow();
            (0..heap.len())
                .map(heap_handle)
                .filter(|handle| heap.get(*handle).is_some_and(|o| o.module().is_some()))
                .collect()
        };
        for module in modules {
            tracer.mark_pinned(module);
        }
        for frame in self.frames.borrow().iter() {
            tracer.mark_pinned(frame.receiver);
            for arg in &frame.args {
                tracer.mark_pinned(*arg);
            }
            if let Some(block) = frame.block {
                tracer.mark_pinned(block);
            }
        }
        for slot in self.roots.borrow().iter() {
            // SAFETY: registered slots stay valid until unregistered.
            tracer.mark_pinned(unsafe { slot.as_ptr().read() });
        }
        tracer.mark_pinned(self.errinfo.get());
        if let Some((tag, value)) = self.thrown.get() {
            tracer.mark_pinned(tag);
            tracer.mark_pinned(value);
        }
        if let Some(Transfer::Raise(exception)) = self.armed.get() {
            tracer.mark_pinned(exception);
        }
        for string in self.interned.borrow().values() {
            tracer.mark_pinned(*string);
        }
        for global in self.globals.borrow().values() {
            tracer.mark_movable(*global);
        }
    }

    fn mark(&self, tracer: &Tracer) {
        while let Some((handle, pinned)) = tracer.pop() {
            let payload = {
                let mut heap = self.heap.borrow_mut();
                let Some(object) = heap.get_mut(handle) else {
                    continue;
                };
                if pinned {
                    object.pinned = true;
                }
                if object.marked {
                    continue;
                }
                object.marked = true;
                tracer.mark_pinned(object.class);
                for (_, value) in &object.ivars {
                    tracer.mark_movable(*value);
                }
                match &object.kind {
                    Kind::Array(items) => {
                        for item in items {
                            tracer.mark_movable(*item);
                        }
                        None
                    }
                    Kind::Module(module) => {
                        for value in module.constants.values() {
                            tracer.mark_movable(*value);
                        }
                        if let Some(superclass) = module.superclass {
                            tracer.mark_pinned(superclass);
                        }
                        None
                    }
                    Kind::Data(slot) => slot.payload.map(|payload| (slot.descriptor, payload)),
                    _ => None,
                }
            };
            if let Some((descriptor, payload)) = payload {
                // SAFETY: the payload belongs to a live shell of this descriptor.
                unsafe { descriptor.mark(payload, &Gc::marking(tracer)) };
            }
        }
    }

    fn sweep(&self) -> usize {
        let mut dead: Vec<Payload> = Vec::new();
        let mut freed = 0;
        {
            let mut heap = self.heap.borrow_mut();
            for index in 0..heap.len() {
                let unmarked = heap.slot_mut(index).is_some_and(|object| !object.marked);
                if !unmarked {
                    continue;
                }
                if let Some(object) = heap.release(index) {
                    freed += 1;
                    if let Kind::Data(slot) = object.kind {
                        if let Some(payload) = slot.payload {
                            dead.push((slot.descriptor, payload));
                        }
                    }
                }
            }
        }
        // Payload destructors may call back into the sandbox.
        for (descriptor, payload) in dead {
            // SAFETY: the shell is gone, so this is the payload's only free.
            unsafe { descriptor.free(payload) };
        }
        freed
    }

    fn compact(&self) -> usize {
        let mut forwarding = FxHashMap::default();
        {
            let mut heap = self.heap.borrow_mut();
            for index in (0..heap.len()).rev() {
                let movable = heap
                    .slot_mut(index)
                    .is_some_and(|object| !object.pinned && object.kind.is_movable());
                if !movable {
                    continue;
                }
                match heap.relocate_down(index) {
                    Some(new) => {
                        forwarding.insert(heap_handle(index), new);
                    }
                    None => break,
                }
            }
        }
        if forwarding.is_empty() {
            return 0;
        }

        let relocator = Relocator {
            forwarding: &forwarding,
        };
        let mut payloads: Vec<Payload> = Vec::new();
        {
            let mut heap = self.heap.borrow_mut();
            for object in heap.live_mut() {
                object.class = relocator.follow(object.class);
                for (_, value) in object.ivars.iter_mut() {
                    *value = relocator.follow(*value);
                }
                match &mut object.kind {
                    Kind::Array(items) => {
                        for item in items.iter_mut() {
                            *item = relocator.follow(*item);
                        }
                    }
                    Kind::Module(module) => {
                        for value in module.constants.values_mut() {
                            *value = relocator.follow(*value);
                        }
                        module.attached = module.attached.map(|attached| relocator.follow(attached));
                    }
                    Kind::Data(slot) => {
                        if let Some(payload) = slot.payload {
                            payloads.push((slot.descriptor, payload));
                        }
                    }
                    _ => {}
                }
            }
            heap.clear_forwarding();
        }
        for (descriptor, payload) in payloads {
            // SAFETY: live payload of this descriptor.
            unsafe { descriptor.mark(payload, &Gc::compaction(&relocator)) };
        }
        for global in self.globals.borrow_mut().values_mut() {
            *global = relocator.follow(*global);
        }
        forwarding.len()
    }
}

//! Reference-counted object arena.
//!
//! Every runtime object lives in a slot of the [`Heap`]. A [`HeapId`] is a
//! plain index; ownership is expressed by reference counts that callers bump
//! with [`Heap::inc_ref`] and drop with [`Heap::dec_ref`]. When a count reaches
//! zero the object is torn down: its attribute bindings are released first,
//! then its interfaces, then whatever its payload owns, and the slot goes back
//! on the free list.
//!
//! Objects flagged [`ObjectFlags::STATIC`] (the `null`, `true` and `false`
//! singletons, builtin classes) are never released.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    object::{Object, ObjectFlags},
    resource::{ResourceError, ResourceTracker},
};

/// Snapshot of the heap's state at a point in time.
///
/// Obtained from [`Runner::run_with_stats`](crate::Runner::run_with_stats) or
/// compared with [`HeapStats::diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live objects.
    pub live_objects: usize,
    /// Number of released slots waiting for reuse.
    pub free_slots: usize,
    /// Total heap capacity (live + free).
    pub total_slots: usize,
    /// Live objects by payload kind, e.g. "List", "Numerical", "Attrib".
    pub objects_by_kind: BTreeMap<&'static str, usize>,
    /// Number of objects released since the heap was created.
    pub total_frees: usize,
    /// Resource tracker allocation count, if the tracker records it.
    pub tracker_allocations: Option<usize>,
    /// Resource tracker memory usage in bytes, if the tracker records it.
    pub tracker_memory_bytes: Option<usize>,
}

/// Difference between two heap snapshots (`after - before`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapDiff {
    pub live_objects_delta: isize,
    pub free_slots_delta: isize,
    pub total_slots_delta: isize,
    /// Per-kind deltas. Only includes kinds present in either snapshot.
    pub objects_by_kind_delta: BTreeMap<&'static str, isize>,
    /// Kinds that appeared in "after" but not "before".
    pub new_kinds: Vec<&'static str>,
    /// Kinds that appeared in "before" but not "after".
    pub removed_kinds: Vec<&'static str>,
    pub total_frees_delta: isize,
    /// Change in tracker allocations (only if both snapshots have the value).
    pub tracker_allocations_delta: Option<isize>,
    /// Change in tracker memory bytes (only if both snapshots have the value).
    pub tracker_memory_bytes_delta: Option<isize>,
}

impl HeapStats {
    /// Computes the difference between `self` ("before") and `other` ("after").
    ///
    /// ```
    /// # use std::collections::BTreeMap;
    /// # use saffire::HeapStats;
    /// let before = HeapStats {
    ///     live_objects: 2, free_slots: 0, total_slots: 2,
    ///     objects_by_kind: BTreeMap::new(), total_frees: 0,
    ///     tracker_allocations: None, tracker_memory_bytes: None,
    /// };
    /// let after = HeapStats {
    ///     live_objects: 5, free_slots: 1, total_slots: 6,
    ///     objects_by_kind: BTreeMap::new(), total_frees: 1,
    ///     tracker_allocations: None, tracker_memory_bytes: None,
    /// };
    /// let diff = before.diff(&after);
    /// assert_eq!(diff.live_objects_delta, 3);
    /// assert_eq!(diff.total_frees_delta, 1);
    /// ```
    #[must_use]
    pub fn diff(&self, other: &Self) -> HeapDiff {
        let (objects_by_kind_delta, new_kinds, removed_kinds) =
            compute_kind_deltas(&self.objects_by_kind, &other.objects_by_kind);

        HeapDiff {
            live_objects_delta: isize_delta(self.live_objects, other.live_objects),
            free_slots_delta: isize_delta(self.free_slots, other.free_slots),
            total_slots_delta: isize_delta(self.total_slots, other.total_slots),
            objects_by_kind_delta,
            new_kinds,
            removed_kinds,
            total_frees_delta: isize_delta(self.total_frees, other.total_frees),
            tracker_allocations_delta: optional_isize_delta(self.tracker_allocations, other.tracker_allocations),
            tracker_memory_bytes_delta: optional_isize_delta(self.tracker_memory_bytes, other.tracker_memory_bytes),
        }
    }
}

impl HeapDiff {
    /// Returns `true` when all deltas are zero and no kinds were added or removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_objects_delta == 0
            && self.free_slots_delta == 0
            && self.total_slots_delta == 0
            && self.total_frees_delta == 0
            && self.new_kinds.is_empty()
            && self.removed_kinds.is_empty()
            && self.objects_by_kind_delta.values().all(|&v| v == 0)
            && self.tracker_allocations_delta.is_none_or(|d| d == 0)
            && self.tracker_memory_bytes_delta.is_none_or(|d| d == 0)
    }
}

impl std::fmt::Display for HeapDiff {
    /// ```text
    /// HeapDiff: +3 live objects, +4 slots, +1 frees
    ///   List: +1
    ///   String: +2
    ///   New kinds: Hash
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "HeapDiff: no changes");
        }

        write!(
            f,
            "HeapDiff: {:+} live objects, {:+} slots, {:+} frees",
            self.live_objects_delta, self.total_slots_delta, self.total_frees_delta
        )?;

        for (&kind, &delta) in &self.objects_by_kind_delta {
            if delta != 0 {
                write!(f, "\n  {kind}: {delta:+}")?;
            }
        }
        if !self.new_kinds.is_empty() {
            write!(f, "\n  New kinds: {}", self.new_kinds.join(", "))?;
        }
        if !self.removed_kinds.is_empty() {
            write!(f, "\n  Removed kinds: {}", self.removed_kinds.join(", "))?;
        }
        if let Some(alloc_delta) = self.tracker_allocations_delta
            && alloc_delta != 0
        {
            write!(f, "\n  Tracker allocations: {alloc_delta:+}")?;
        }
        if let Some(mem_delta) = self.tracker_memory_bytes_delta
            && mem_delta != 0
        {
            write!(f, "\n  Tracker memory: {mem_delta:+} bytes")?;
        }
        Ok(())
    }
}

fn isize_delta(before: usize, after: usize) -> isize {
    (after as isize).wrapping_sub(before as isize)
}

fn optional_isize_delta(before: Option<usize>, after: Option<usize>) -> Option<isize> {
    match (before, after) {
        (Some(b), Some(a)) => Some(isize_delta(b, a)),
        _ => None,
    }
}

fn compute_kind_deltas(
    before: &BTreeMap<&'static str, usize>,
    after: &BTreeMap<&'static str, usize>,
) -> (BTreeMap<&'static str, isize>, Vec<&'static str>, Vec<&'static str>) {
    let mut deltas = BTreeMap::new();
    let mut new_kinds = Vec::new();
    let mut removed_kinds = Vec::new();

    for (&kind, &count) in before {
        let after_count = after.get(kind).copied().unwrap_or(0);
        deltas.insert(kind, isize_delta(count, after_count));
        if !after.contains_key(kind) {
            removed_kinds.push(kind);
        }
    }
    for (&kind, &count) in after {
        if !before.contains_key(kind) {
            deltas.insert(kind, count as isize);
            new_kinds.push(kind);
        }
    }
    (deltas, new_kinds, removed_kinds)
}

/// Unique identifier for objects stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(usize);

impl HeapId {
    #[cfg(test)]
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct HeapValue {
    refcount: AtomicUsize,
    data: Object,
}

/// The object arena.
#[derive(Debug)]
pub(crate) struct Heap<T: ResourceTracker> {
    entries: Vec<Option<HeapValue>>,
    free_list: Vec<HeapId>,
    tracker: T,
    total_frees: usize,
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(tracker: T) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            tracker,
            total_frees: 0,
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Moves `data` into the heap with a reference count of one.
    ///
    /// References held by `data` are transferred to the heap. If the tracker
    /// rejects the allocation they are released again before the error is
    /// returned.
    pub fn allocate(&mut self, data: Object) -> Result<HeapId, ResourceError> {
        if let Err(err) = self.tracker.on_allocate(|| data.estimate_size()) {
            let mut children = Vec::new();
            data.owned_refs(&mut children);
            for child in children {
                self.dec_ref(child);
            }
            return Err(err);
        }

        let entry = HeapValue {
            refcount: AtomicUsize::new(1),
            data,
        };
        let id = if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            self.entries.push(Some(entry));
            HeapId(self.entries.len() - 1)
        };
        Ok(id)
    }

    /// Increments the reference count for an existing heap entry.
    ///
    /// # Panics
    /// Panics if the ID is invalid or the object has already been freed.
    pub fn inc_ref(&self, id: HeapId) {
        let value = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        value.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the reference count and tears the object down once it hits zero.
    ///
    /// Static objects reach zero but are never torn down.
    ///
    /// # Panics
    /// Panics if the ID is invalid, the object has already been freed, or a
    /// static object is released more often than it was referenced.
    pub fn dec_ref(&mut self, id: HeapId) {
        let value = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
            let count = entry.refcount.load(Ordering::Relaxed);
            if entry.data.flags.contains(ObjectFlags::STATIC) {
                assert!(count > 0, "Heap::dec_ref: static object '{}' over-released", entry.data.name);
                entry.refcount.store(count - 1, Ordering::Relaxed);
                return;
            }
            if count > 1 {
                entry.refcount.store(count - 1, Ordering::Relaxed);
                return;
            }
            slot.take().expect("Heap::dec_ref: object already freed")
        };

        self.free_list.push(id);
        self.total_frees += 1;
        self.tracker.on_free(|| value.data.estimate_size());

        let mut children = Vec::new();
        value.data.owned_refs(&mut children);
        drop(value);
        for child in children {
            self.dec_ref(child);
        }
    }

    /// Returns the object stored at `id`.
    ///
    /// # Panics
    /// Panics if the ID is invalid or the object has already been freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &Object {
        &self
            .entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
    }

    /// Returns the object stored at `id` for mutation.
    ///
    /// # Panics
    /// Panics if the ID is invalid or the object has already been freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut Object {
        &mut self
            .entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
    }

    /// Returns true if `id` refers to a live object.
    #[must_use]
    pub fn is_live(&self, id: HeapId) -> bool {
        self.entries.get(id.index()).is_some_and(Option::is_some)
    }

    /// Returns the reference count of the object at `id`.
    ///
    /// # Panics
    /// Panics if the ID is invalid or the object has already been freed.
    #[must_use]
    pub fn get_refcount(&self, id: HeapId) -> usize {
        self.entries
            .get(id.index())
            .expect("Heap::get_refcount: slot missing")
            .as_ref()
            .expect("Heap::get_refcount: object already freed")
            .refcount
            .load(Ordering::Relaxed)
    }

    /// Returns a snapshot of the current heap state.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        let mut live_objects = 0;
        let mut objects_by_kind: BTreeMap<&'static str, usize> = BTreeMap::new();
        for entry in self.entries.iter().flatten() {
            live_objects += 1;
            *objects_by_kind.entry(entry.data.kind_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects,
            free_slots: self.entries.len() - live_objects,
            total_slots: self.entries.len(),
            objects_by_kind,
            total_frees: self.total_frees,
            tracker_allocations: self.tracker.allocation_count(),
            tracker_memory_bytes: self.tracker.current_memory_bytes(),
        }
    }
}

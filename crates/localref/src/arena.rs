use std::{cell::Cell, collections::BTreeMap, fmt};

use ahash::AHashSet;
use smallvec::SmallVec;

use crate::{
    limits::{LimitError, LimitTracker},
    scoped::ReleaseGuard,
};

/// Snapshot of arena state at a point in time.
///
/// Captures reference counts by payload type, slot usage, and release totals.
/// Used for monitoring arena growth and for asserting release behavior in
/// tests via diffs between snapshots.
///
/// The `objects_by_type` map uses `BTreeMap` for deterministic iteration
/// order, making snapshots suitable for display and comparison without sort
/// overhead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaStats {
    /// Total number of live objects in the arena.
    pub live_objects: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
    /// Breakdown of live objects by [`ObjectData`] variant name.
    pub objects_by_type: BTreeMap<&'static str, usize>,
    /// Number of handles currently promoted (pinned) beyond scope lifetime.
    pub pinned_refs: usize,
    /// Total number of objects released (reference count reached zero)
    /// since the arena was created or last reset.
    pub released_objects: usize,
    /// Live reference count from the tracker, if it records one.
    ///
    /// `None` when the arena uses [`NoLimitTracker`](crate::NoLimitTracker).
    pub tracker_live: Option<usize>,
    /// Approximate payload memory in bytes from the tracker, if recorded.
    pub tracker_memory_bytes: Option<usize>,
}

/// Difference between two arena snapshots.
///
/// Computed by comparing a "before" and "after" [`ArenaStats`] via
/// [`ArenaStats::diff`]. Positive deltas mean growth, negative means
/// shrinkage. Useful for understanding what a native section allocated,
/// released, or pinned while it ran.
///
/// Only types present in at least one of the two snapshots appear in
/// `objects_by_type_delta`. Types exclusive to the "after" snapshot are
/// listed in `new_types`; types exclusive to the "before" snapshot are in
/// `removed_types`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaDiff {
    /// Change in live object count (`after - before`).
    pub live_objects_delta: isize,
    /// Change in free slot count.
    pub free_slots_delta: isize,
    /// Change in total slot count.
    pub total_slots_delta: isize,
    /// Per-type deltas. Only includes types present in either snapshot.
    pub objects_by_type_delta: BTreeMap<&'static str, isize>,
    /// Types that appeared in "after" but not "before".
    pub new_types: Vec<&'static str>,
    /// Types that appeared in "before" but not "after".
    pub removed_types: Vec<&'static str>,
    /// Change in pinned handle count.
    pub pinned_refs_delta: isize,
    /// Change in total released object count.
    ///
    /// This is the number of release calls that freed an object between the
    /// two snapshots; it never decreases within one arena lifetime.
    pub released_objects_delta: isize,
    /// Change in tracker live count (only if both snapshots have the value).
    pub tracker_live_delta: Option<isize>,
    /// Change in tracker memory bytes (only if both snapshots have the value).
    pub tracker_memory_bytes_delta: Option<isize>,
}

impl ArenaStats {
    /// Computes the difference between `self` ("before") and `other` ("after").
    ///
    /// Returns an [`ArenaDiff`] where positive deltas indicate growth from
    /// `self` to `other`. For tracker fields, a delta is computed only when
    /// both snapshots contain `Some`.
    ///
    /// # Example
    ///
    /// ```
    /// # use std::collections::BTreeMap;
    /// # use localref::ArenaStats;
    /// let before = ArenaStats {
    ///     live_objects: 2, free_slots: 0, total_slots: 2,
    ///     objects_by_type: BTreeMap::new(), pinned_refs: 0, released_objects: 0,
    ///     tracker_live: None, tracker_memory_bytes: None,
    /// };
    /// let after = ArenaStats {
    ///     live_objects: 5, free_slots: 1, total_slots: 6,
    ///     objects_by_type: BTreeMap::new(), pinned_refs: 0, released_objects: 3,
    ///     tracker_live: None, tracker_memory_bytes: None,
    /// };
    /// let diff = before.diff(&after);
    /// assert_eq!(diff.live_objects_delta, 3);
    /// assert_eq!(diff.released_objects_delta, 3);
    /// ```
    #[must_use]
    pub fn diff(&self, other: &Self) -> ArenaDiff {
        let (objects_by_type_delta, new_types, removed_types) =
            type_deltas(&self.objects_by_type, &other.objects_by_type);

        ArenaDiff {
            live_objects_delta: delta(self.live_objects, other.live_objects),
            free_slots_delta: delta(self.free_slots, other.free_slots),
            total_slots_delta: delta(self.total_slots, other.total_slots),
            objects_by_type_delta,
            new_types,
            removed_types,
            pinned_refs_delta: delta(self.pinned_refs, other.pinned_refs),
            released_objects_delta: delta(self.released_objects, other.released_objects),
            tracker_live_delta: opt_delta(self.tracker_live, other.tracker_live),
            tracker_memory_bytes_delta: opt_delta(self.tracker_memory_bytes, other.tracker_memory_bytes),
        }
    }
}

impl ArenaDiff {
    /// Returns `true` when all deltas are zero and no types were added or removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_objects_delta == 0
            && self.free_slots_delta == 0
            && self.total_slots_delta == 0
            && self.pinned_refs_delta == 0
            && self.released_objects_delta == 0
            && self.new_types.is_empty()
            && self.removed_types.is_empty()
            && self.objects_by_type_delta.values().all(|&v| v == 0)
            && self.tracker_live_delta.is_none_or(|d| d == 0)
            && self.tracker_memory_bytes_delta.is_none_or(|d| d == 0)
    }
}

impl fmt::Display for ArenaDiff {
    /// Produces a human-readable summary of what changed between two arena
    /// snapshots. Example output:
    ///
    /// ```text
    /// ArenaDiff: +3 live objects, +4 slots
    ///   List: +1
    ///   Str: +2
    ///   Released: +1
    /// ```
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "ArenaDiff: no changes");
        }

        write!(
            f,
            "ArenaDiff: {:+} live objects, {:+} slots",
            self.live_objects_delta, self.total_slots_delta
        )?;

        // Per-type deltas (skip zero deltas for conciseness).
        for (&type_name, &d) in &self.objects_by_type_delta {
            if d != 0 {
                write!(f, "\n  {type_name}: {d:+}")?;
            }
        }

        if !self.new_types.is_empty() {
            write!(f, "\n  New types: {}", self.new_types.join(", "))?;
        }
        if !self.removed_types.is_empty() {
            write!(f, "\n  Removed types: {}", self.removed_types.join(", "))?;
        }

        if self.pinned_refs_delta != 0 {
            write!(f, "\n  Pinned: {:+}", self.pinned_refs_delta)?;
        }
        if self.released_objects_delta != 0 {
            write!(f, "\n  Released: {:+}", self.released_objects_delta)?;
        }

        if let Some(live_delta) = self.tracker_live_delta
            && live_delta != 0
        {
            write!(f, "\n  Tracker live: {live_delta:+}")?;
        }
        if let Some(mem_delta) = self.tracker_memory_bytes_delta
            && mem_delta != 0
        {
            write!(f, "\n  Tracker memory: {mem_delta:+} bytes")?;
        }

        Ok(())
    }
}

/// Computes `after - before` as `isize`, handling the `usize -> isize` conversion.
fn delta(before: usize, after: usize) -> isize {
    (after as isize).wrapping_sub(before as isize)
}

/// Computes the delta between two optional `usize` values.
///
/// Returns `Some(delta)` only when both values are `Some`.
fn opt_delta(before: Option<usize>, after: Option<usize>) -> Option<isize> {
    before.zip(after).map(|(b, a)| delta(b, a))
}

/// Computes per-type deltas, plus lists of new and removed types.
fn type_deltas(
    before: &BTreeMap<&'static str, usize>,
    after: &BTreeMap<&'static str, usize>,
) -> (BTreeMap<&'static str, isize>, Vec<&'static str>, Vec<&'static str>) {
    let mut deltas = BTreeMap::new();
    let mut new_types = Vec::new();
    let mut removed_types = Vec::new();

    for (&type_name, &count) in before {
        deltas.insert(type_name, delta(count, after.get(type_name).copied().unwrap_or(0)));
        if !after.contains_key(type_name) {
            removed_types.push(type_name);
        }
    }
    for (&type_name, &count) in after {
        if !before.contains_key(type_name) {
            deltas.insert(type_name, count as isize);
            new_types.push(type_name);
        }
    }

    (deltas, new_types, removed_types)
}

/// Opaque local reference to an object owned by the arena.
///
/// A `LocalRef` is valid from the allocation (or [`Arena::dup_ref`]) that
/// produced it until the matching release. The arena reuses freed slots, so
/// holding a `LocalRef` past its release is a programmer error: accessor
/// methods panic on freed slots, and a reused slot answers for a different
/// object (distinguishable via [`Arena::generation`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LocalRef(usize);

impl LocalRef {
    /// Returns the raw slot index.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Payload data for objects owned by the arena.
///
/// `List` owns one reference per child handle; releasing a list releases
/// its children recursively.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ObjectData {
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<LocalRef>),
}

impl ObjectData {
    /// Static variant name used as the key in [`ArenaStats::objects_by_type`].
    fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::Bytes(_) => "Bytes",
            Self::List(_) => "List",
        }
    }

    /// Approximate payload size in bytes, reported to the limit tracker.
    fn estimate_size(&self) -> usize {
        let payload = match self {
            Self::Str(s) => s.capacity(),
            Self::Bytes(b) => b.capacity(),
            Self::List(items) => items.capacity() * size_of::<LocalRef>(),
        };
        size_of::<Self>() + payload
    }

    /// Collects child handles whose owned references die with this object.
    fn collect_child_refs(&self, out: &mut SmallVec<[LocalRef; 8]>) {
        if let Self::List(items) = self {
            out.extend(items.iter().copied());
        }
    }
}

/// One occupied arena slot: a payload plus its reference count.
///
/// The reference count uses `Cell` so [`Arena::dup_ref`] can work through a
/// shared arena borrow; the arena is single-threaded by design and is not
/// `Sync`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Slot {
    refcount: Cell<usize>,
    data: ObjectData,
}

/// Reference-counted arena that owns managed objects and hands out
/// [`LocalRef`] handles to native host code.
///
/// Uses a free list to reuse slots from released objects, keeping memory
/// usage constant for hosts that repeatedly allocate and release. When an
/// object is released via [`release`](Self::release), its slot is added to
/// the free list; new allocations pop from the free list when available,
/// otherwise append.
///
/// Generic over `T: LimitTracker` to support different limit strategies.
/// When `T = NoLimitTracker` (the common case), all limit checks compile
/// away to no-ops.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Arena<T: LimitTracker> {
    entries: Vec<Option<Slot>>,
    /// Per-slot generation counters, bumped each time a slot is reused.
    ///
    /// Handles index slots directly for fast access; the generation lets
    /// hosts distinguish a reused slot from the object that previously
    /// occupied it.
    generations: Vec<u32>,
    /// Slots available for reuse. Populated by `release`, consumed by `alloc`.
    free_list: Vec<LocalRef>,
    /// Limit tracker consulted on every allocation and reclaim.
    tracker: T,
    /// Handles promoted beyond scope lifetime. Each entry holds one owned
    /// reference, released again by `demote`.
    pinned: AHashSet<LocalRef>,
    /// Total number of objects whose reference count reached zero.
    releases: usize,
}

impl<T: LimitTracker> Arena<T> {
    /// Creates a new arena with the given limit tracker.
    #[must_use]
    pub fn new(capacity: usize, tracker: T) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            tracker,
            pinned: AHashSet::new(),
            releases: 0,
        }
    }

    /// Allocates a new object and returns a handle owning one reference.
    ///
    /// Returns `Err(LimitError)` if the allocation would exceed configured
    /// limits. Reuses a free-list slot when one is available, bumping that
    /// slot's generation counter.
    pub fn alloc(&mut self, data: ObjectData) -> Result<LocalRef, LimitError> {
        self.tracker.on_alloc(|| data.estimate_size())?;
        Ok(self.insert_slot(data))
    }

    /// Allocates a list object that takes ownership of one reference per child.
    ///
    /// On the error path the child references are released, so the caller
    /// never needs to clean up after a failed call.
    pub fn alloc_list(&mut self, children: Vec<LocalRef>) -> Result<LocalRef, LimitError> {
        let mut guard = ReleaseGuard::new(children, self);
        let (children, arena) = guard.as_parts();
        let estimated = size_of::<ObjectData>() + children.capacity() * size_of::<LocalRef>();
        arena.tracker.on_alloc(|| estimated)?;
        let (children, arena) = guard.into_parts();
        Ok(arena.insert_slot(ObjectData::List(children)))
    }

    /// Stores a slot with an initial reference count of one.
    fn insert_slot(&mut self, data: ObjectData) -> LocalRef {
        let slot = Slot {
            refcount: Cell::new(1),
            data,
        };
        if let Some(handle) = self.free_list.pop() {
            // Reuse a freed slot
            let index = handle.index();
            self.generations[index] = self.generations[index].wrapping_add(1);
            self.entries[index] = Some(slot);
            handle
        } else {
            // No free slots, append a new entry
            let handle = LocalRef(self.entries.len());
            self.generations.push(0);
            self.entries.push(Some(slot));
            handle
        }
    }

    /// Duplicates a handle by incrementing its reference count.
    ///
    /// The returned handle is the same slot; the object now needs one more
    /// release before it is reclaimed. Uses interior mutability for the
    /// count, so only shared access to the arena is required.
    ///
    /// # Panics
    /// Panics if the handle is invalid or the object has already been freed.
    #[must_use = "ignoring the returned handle leaks the duplicated reference"]
    pub fn dup_ref(&self, handle: LocalRef) -> LocalRef {
        let slot = self
            .entries
            .get(handle.index())
            .expect("Arena::dup_ref: slot missing")
            .as_ref()
            .expect("Arena::dup_ref: object already freed");
        slot.refcount.set(slot.refcount.get() + 1);
        handle
    }

    /// Releases one reference; reclaims the object (plus owned children) once
    /// the count hits zero.
    ///
    /// When an object is reclaimed its slot is added to the free list for
    /// reuse. Child handles owned by a `List` are released recursively.
    ///
    /// # Panics
    /// Panics if the handle is invalid or the object has already been freed.
    pub fn release(&mut self, handle: LocalRef) {
        let slot = {
            let entry = self
                .entries
                .get_mut(handle.index())
                .expect("Arena::release: slot missing");
            let slot = entry.as_mut().expect("Arena::release: object already freed");
            let count = slot.refcount.get();
            if count > 1 {
                slot.refcount.set(count - 1);
                return;
            }
            entry.take().expect("Arena::release: object already freed")
        };

        // refcount == 1: reclaim the object and recycle its slot.
        self.pinned.remove(&handle);
        self.free_list.push(handle);
        self.releases += 1;
        self.tracker.on_free(|| slot.data.estimate_size());

        let mut children: SmallVec<[LocalRef; 8]> = SmallVec::new();
        slot.data.collect_child_refs(&mut children);
        for child in children {
            self.release(child);
        }
    }

    /// Returns the payload stored for the given handle.
    ///
    /// # Panics
    /// Panics if the handle is invalid or the object has already been freed.
    #[must_use]
    pub fn get(&self, handle: LocalRef) -> &ObjectData {
        &self
            .entries
            .get(handle.index())
            .expect("Arena::get: slot missing")
            .as_ref()
            .expect("Arena::get: object already freed")
            .data
    }

    /// Returns `true` if the handle's slot currently holds a live object.
    ///
    /// Note that a stale handle whose slot was reused answers `true` for the
    /// new occupant; compare [`generation`](Self::generation) values to
    /// detect reuse.
    #[must_use]
    pub fn is_live(&self, handle: LocalRef) -> bool {
        self.entries.get(handle.index()).is_some_and(Option::is_some)
    }

    /// Returns the current reference count for a live handle.
    ///
    /// # Panics
    /// Panics if the handle is invalid or the object has already been freed.
    #[must_use]
    pub fn refcount(&self, handle: LocalRef) -> usize {
        self.entries
            .get(handle.index())
            .expect("Arena::refcount: slot missing")
            .as_ref()
            .expect("Arena::refcount: object already freed")
            .refcount
            .get()
    }

    /// Returns the generation counter for the handle's slot.
    ///
    /// The counter is bumped each time the slot is reused, so a host can
    /// record `(handle, generation)` pairs to detect stale handles.
    ///
    /// # Panics
    /// Panics if the handle's slot index is out of range.
    #[must_use]
    pub fn generation(&self, handle: LocalRef) -> u32 {
        *self
            .generations
            .get(handle.index())
            .expect("Arena::generation: slot missing")
    }

    /// Promotes a handle beyond scope lifetime by pinning it.
    ///
    /// Pinning takes one additional owned reference, so the object survives
    /// even after every scoped handle to it is released. Promoting an
    /// already-pinned handle is a no-op. Returns the handle for chaining.
    ///
    /// # Panics
    /// Panics if the handle is invalid or the object has already been freed.
    pub fn promote(&mut self, handle: LocalRef) -> LocalRef {
        if self.pinned.insert(handle) {
            self.dup_ref(handle);
        }
        handle
    }

    /// Demotes a previously promoted handle, releasing the pinned reference.
    ///
    /// Does nothing if the handle is not currently pinned.
    pub fn demote(&mut self, handle: LocalRef) {
        if self.pinned.remove(&handle) {
            self.release(handle);
        }
    }

    /// Returns `true` if the handle is currently pinned.
    #[must_use]
    pub fn is_pinned(&self, handle: LocalRef) -> bool {
        self.pinned.contains(&handle)
    }

    /// Total number of objects released (reference count reached zero) since
    /// creation or the last [`reset`](Self::reset).
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.releases
    }

    /// Returns a snapshot of the current arena state.
    ///
    /// Iterates all slots to count live vs free entries and categorize live
    /// objects by payload variant. Tracker fields are populated only when
    /// the tracker records them; for [`NoLimitTracker`](crate::NoLimitTracker)
    /// both are `None`.
    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let mut live_objects: usize = 0;
        let mut free_slots: usize = 0;
        let mut objects_by_type: BTreeMap<&'static str, usize> = BTreeMap::new();

        for slot in &self.entries {
            match slot {
                Some(entry) => {
                    live_objects += 1;
                    *objects_by_type.entry(entry.data.variant_name()).or_insert(0) += 1;
                }
                None => {
                    free_slots += 1;
                }
            }
        }

        ArenaStats {
            live_objects,
            free_slots,
            total_slots: self.entries.len(),
            objects_by_type,
            pinned_refs: self.pinned.len(),
            released_objects: self.releases,
            tracker_live: self.tracker.live_count(),
            tracker_memory_bytes: self.tracker.current_memory_bytes(),
        }
    }

    /// Resets the arena for reuse without deallocating backing storage.
    ///
    /// Clears the contents while retaining allocated capacity, so hosts that
    /// run many short native sections avoid repeated Vec allocation. The
    /// caller must ensure all outstanding handles have been released (or are
    /// deliberately abandoned) before calling reset; handles from before the
    /// reset are invalid afterwards.
    pub fn reset(&mut self, tracker: T) {
        self.entries.clear();
        self.generations.clear();
        self.free_list.clear();
        self.pinned.clear();
        self.releases = 0;
        self.tracker = tracker;
    }

    /// Creates an independent deep copy of this arena via a serialization
    /// round-trip.
    ///
    /// The clone is a self-consistent snapshot: every slot, reference count,
    /// free-list entry, generation counter, and tracker state is duplicated.
    /// Handles remain valid in the clone because the slot layout is preserved
    /// byte-for-byte.
    ///
    /// # Panics
    ///
    /// Panics if serialization or deserialization fails, which should not
    /// happen for a well-formed arena.
    #[must_use]
    pub fn deep_clone(&self) -> Self
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
    {
        let bytes = postcard::to_allocvec(self).expect("arena serialization should not fail");
        postcard::from_bytes(&bytes).expect("arena deserialization should not fail")
    }
}

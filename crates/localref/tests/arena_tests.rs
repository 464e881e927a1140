//! Tests for the reference-counted arena.
//!
//! Covers allocation, reference duplication, recursive release of list
//! children, slot reuse through the free list, promotion (pinning), limits
//! enforcement, reset, and snapshot cloning.

use localref::{Arena, LimitError, LimitedTracker, LocalRef, NoLimitTracker, ObjectData, RefLimits};

fn str_object(text: &str) -> ObjectData {
    ObjectData::Str(text.to_owned())
}

// =============================================================================
// 1. Allocation and release
// =============================================================================

/// A released handle's slot is reclaimed and the handle is no longer live.
#[test]
fn release_reclaims_slot() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let handle = arena.alloc(str_object("gone")).unwrap();
    assert!(arena.is_live(handle));
    arena.release(handle);
    assert!(!arena.is_live(handle));
    assert_eq!(arena.release_count(), 1);
}

/// A duplicated handle needs one release per reference before the object dies.
#[test]
fn dup_ref_requires_matching_releases() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let handle = arena.alloc(ObjectData::Bytes(vec![0xAB; 16])).unwrap();
    let dup = arena.dup_ref(handle);
    assert_eq!(dup, handle);
    assert_eq!(arena.refcount(handle), 2);

    arena.release(handle);
    assert!(arena.is_live(handle));
    assert_eq!(arena.refcount(handle), 1);

    arena.release(dup);
    assert!(!arena.is_live(handle));
    assert_eq!(arena.release_count(), 1);
}

/// Freed slots are reused by later allocations with a bumped generation.
#[test]
fn freed_slots_are_reused_with_new_generation() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let first = arena.alloc(str_object("first occupant")).unwrap();
    let first_generation = arena.generation(first);
    arena.release(first);

    let second = arena.alloc(str_object("second occupant")).unwrap();
    assert_eq!(second.index(), first.index());
    assert_eq!(arena.generation(second), first_generation + 1);
    assert_eq!(arena.get(second), &str_object("second occupant"));
}

/// Releasing an already-freed handle is a programmer error and panics.
#[test]
#[should_panic(expected = "Arena::release: object already freed")]
fn double_release_panics() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let handle = arena.alloc(str_object("once")).unwrap();
    arena.release(handle);
    arena.release(handle);
}

/// Accessing a freed handle panics rather than answering with stale data.
#[test]
#[should_panic(expected = "Arena::get: object already freed")]
fn get_on_freed_handle_panics() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let handle = arena.alloc(str_object("stale")).unwrap();
    arena.release(handle);
    let _ = arena.get(handle);
}

// =============================================================================
// 2. Lists and recursive release
// =============================================================================

/// Releasing a list releases the references it owns to its children.
#[test]
fn list_release_cascades_to_children() {
    let mut arena = Arena::new(8, NoLimitTracker);
    let a = arena.alloc(str_object("a")).unwrap();
    let b = arena.alloc(str_object("b")).unwrap();
    let list = arena.alloc_list(vec![a, b]).unwrap();

    arena.release(list);
    assert!(!arena.is_live(a));
    assert!(!arena.is_live(b));
    assert_eq!(arena.release_count(), 3);
}

/// Nested lists release depth-first through each level.
#[test]
fn nested_list_release_cascades_through_levels() {
    let mut arena = Arena::new(8, NoLimitTracker);
    let leaf = arena.alloc(ObjectData::Bytes(vec![1, 2, 3])).unwrap();
    let inner = arena.alloc_list(vec![leaf]).unwrap();
    let outer = arena.alloc_list(vec![inner]).unwrap();

    arena.release(outer);
    assert!(!arena.is_live(leaf));
    assert!(!arena.is_live(inner));
    assert_eq!(arena.release_count(), 3);
}

/// A child that was duplicated before list construction survives the list.
#[test]
fn duplicated_child_survives_list_release() {
    let mut arena = Arena::new(8, NoLimitTracker);
    let child = arena.alloc(str_object("kept")).unwrap();
    let for_list = arena.dup_ref(child);
    let list = arena.alloc_list(vec![for_list]).unwrap();

    arena.release(list);
    assert!(arena.is_live(child));
    assert_eq!(arena.refcount(child), 1);
    arena.release(child);
}

/// When list allocation fails, the child references are released for the
/// caller.
#[test]
fn failed_list_allocation_releases_children() {
    // Capacity for the two children only; the list itself is rejected.
    let mut arena = Arena::new(4, LimitedTracker::new(RefLimits::new().max_live_refs(2)));
    let a = arena.alloc(str_object("a")).unwrap();
    let b = arena.alloc(str_object("b")).unwrap();

    let err = arena.alloc_list(vec![a, b]).unwrap_err();
    assert_eq!(err, LimitError::Capacity { limit: 2, live: 3 });
    assert!(!arena.is_live(a));
    assert!(!arena.is_live(b));
    assert_eq!(arena.release_count(), 2);
}

// =============================================================================
// 3. Promotion
// =============================================================================

/// A promoted handle survives release of the scope-local reference and dies
/// on demote.
#[test]
fn promoted_handle_outlives_local_reference() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let handle = arena.alloc(str_object("pinned")).unwrap();
    arena.promote(handle);
    assert!(arena.is_pinned(handle));

    arena.release(handle);
    assert!(arena.is_live(handle));

    arena.demote(handle);
    assert!(!arena.is_live(handle));
    assert!(!arena.is_pinned(handle));
}

/// Promoting twice pins only once; a single demote fully unpins.
#[test]
fn promote_is_idempotent() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let handle = arena.alloc(str_object("pin once")).unwrap();
    arena.promote(handle);
    arena.promote(handle);
    assert_eq!(arena.refcount(handle), 2);

    arena.demote(handle);
    assert!(!arena.is_pinned(handle));
    assert_eq!(arena.refcount(handle), 1);
    arena.release(handle);
}

/// Demoting an unpinned handle does nothing.
#[test]
fn demote_without_promote_is_noop() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let handle = arena.alloc(str_object("never pinned")).unwrap();
    arena.demote(handle);
    assert!(arena.is_live(handle));
    assert_eq!(arena.release_count(), 0);
    arena.release(handle);
}

// =============================================================================
// 4. Limits
// =============================================================================

/// The capacity limit rejects allocations beyond the configured bound.
#[test]
fn capacity_limit_enforced_on_alloc() {
    let mut arena = Arena::new(4, LimitedTracker::new(RefLimits::new().max_live_refs(1)));
    let first = arena.alloc(str_object("only one")).unwrap();
    let err = arena.alloc(str_object("rejected")).unwrap_err();
    assert_eq!(err, LimitError::Capacity { limit: 1, live: 2 });

    // Releasing frees up capacity again.
    arena.release(first);
    assert!(arena.alloc(str_object("fits now")).is_ok());
}

/// The memory limit counts payload bytes and recovers on release.
#[test]
fn memory_limit_enforced_on_alloc() {
    let mut arena = Arena::new(4, LimitedTracker::new(RefLimits::new().max_memory(256)));
    let big = arena.alloc(ObjectData::Bytes(vec![0; 200])).unwrap();
    let err = arena.alloc(ObjectData::Bytes(vec![0; 200])).unwrap_err();
    assert!(matches!(err, LimitError::Memory { limit: 256, .. }));

    arena.release(big);
    assert!(arena.alloc(ObjectData::Bytes(vec![0; 200])).is_ok());
}

// =============================================================================
// 5. Reset and snapshots
// =============================================================================

/// Reset clears all state so the arena behaves like a fresh one.
#[test]
fn reset_restores_fresh_state() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let keep = arena.alloc(str_object("pre-reset")).unwrap();
    arena.promote(keep);
    arena.release(arena.dup_ref(keep));

    arena.reset(NoLimitTracker);
    assert_eq!(arena.release_count(), 0);
    assert!(!arena.is_live(keep));

    let stats = arena.stats();
    assert_eq!(stats.live_objects, 0);
    assert_eq!(stats.total_slots, 0);
    assert_eq!(stats.pinned_refs, 0);
}

/// A deep clone is independent: releases in the clone do not affect the
/// original, and handles stay valid in both.
#[test]
fn deep_clone_is_independent() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let handle = arena.alloc(str_object("snapshotted")).unwrap();
    let dup = arena.dup_ref(handle);

    let mut clone = arena.deep_clone();
    assert!(clone.is_live(handle));
    assert_eq!(clone.get(handle), &str_object("snapshotted"));
    assert_eq!(clone.refcount(handle), 2);

    clone.release(handle);
    clone.release(dup);
    assert!(!clone.is_live(handle));

    // The original still owns both references.
    assert!(arena.is_live(handle));
    assert_eq!(arena.refcount(handle), 2);
    assert_eq!(arena.release_count(), 0);
}

/// Pinned handles and limit tracker state survive the snapshot round-trip.
#[test]
fn deep_clone_preserves_pins_and_tracker() {
    let mut arena = Arena::new(4, LimitedTracker::new(RefLimits::new().max_live_refs(8)));
    let handle = arena.alloc(str_object("pinned snapshot")).unwrap();
    arena.promote(handle);

    let clone = arena.deep_clone();
    assert!(clone.is_pinned(handle));
    let stats = clone.stats();
    assert_eq!(stats.pinned_refs, 1);
    assert_eq!(stats.tracker_live, Some(1));
}

// =============================================================================
// 6. Stale handle detection
// =============================================================================

/// A stale handle whose slot was reused reports live, but the generation
/// counter exposes the reuse.
#[test]
fn generation_detects_slot_reuse() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let stale = arena.alloc(str_object("original")).unwrap();
    let recorded_generation = arena.generation(stale);
    arena.release(stale);

    let replacement = arena.alloc(str_object("replacement")).unwrap();
    assert_eq!(replacement.index(), stale.index());
    assert!(arena.is_live(stale));
    assert_ne!(arena.generation(stale), recorded_generation);
}

/// Handles are plain data: comparable, hashable, and serializable.
#[test]
fn handles_are_plain_data() {
    let mut arena = Arena::new(4, NoLimitTracker);
    let handle = arena.alloc(str_object("plain")).unwrap();
    let copied: LocalRef = handle;
    assert_eq!(copied, handle);

    let bytes = postcard::to_allocvec(&handle).unwrap();
    let restored: LocalRef = postcard::from_bytes(&bytes).unwrap();
    assert_eq!(restored, handle);
    arena.release(handle);
}

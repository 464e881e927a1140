#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_wrap, reason = "usize -> isize stat deltas are intentional")]
// first to include the defer_release macros
mod scoped;

mod arena;
mod limits;

pub use crate::{
    arena::{Arena, ArenaDiff, ArenaStats, LocalRef, ObjectData},
    limits::{LimitError, LimitTracker, LimitedTracker, NoLimitTracker, RefLimits},
    scoped::{ReleaseContext, ReleaseGuard, ReleaseWith, ScopedRef},
};

use std::fmt;

/// Error returned when an arena limit is exceeded during allocation.
///
/// This allows embedding hosts to enforce strict bounds on how many local
/// references a native section may hold at once, and on the approximate
/// memory occupied by their payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// Maximum number of live references exceeded.
    Capacity { limit: usize, live: usize },
    /// Maximum payload memory exceeded.
    Memory { limit: usize, used: usize },
}

impl fmt::Display for LimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capacity { limit, live } => {
                write!(f, "local reference capacity exceeded: {live} > {limit}")
            }
            Self::Memory { limit, used } => {
                write!(f, "memory limit exceeded: {used} bytes > {limit} bytes")
            }
        }
    }
}

impl std::error::Error for LimitError {}

/// Trait for tracking arena resource usage.
///
/// Implementations can enforce limits on the number of live references and
/// on approximate payload memory. The arena calls [`Self::on_alloc`] before
/// each allocation and [`Self::on_free`] whenever a reference count reaches
/// zero and a slot is reclaimed.
pub trait LimitTracker: fmt::Debug {
    /// Called before each arena allocation.
    ///
    /// Returns `Ok(())` if the allocation should proceed, or `Err(LimitError)`
    /// if a limit would be exceeded. The size closure is only invoked when the
    /// tracker actually needs a memory estimate.
    fn on_alloc(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), LimitError>;

    /// Called when a slot is reclaimed (reference count reached zero).
    fn on_free(&mut self, get_size: impl FnOnce() -> usize);

    /// Returns the number of currently live references, if this tracker records it.
    ///
    /// [`LimitedTracker`] returns `Some(count)`; [`NoLimitTracker`] returns `None`.
    fn live_count(&self) -> Option<usize> {
        None
    }

    /// Returns the current approximate payload memory in bytes, if tracked.
    fn current_memory_bytes(&self) -> Option<usize> {
        None
    }
}

/// A tracker that performs no checks and keeps no counts.
///
/// All methods compile away to no-ops, so `Arena<NoLimitTracker>` pays
/// nothing for the limit machinery.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct NoLimitTracker;

impl LimitTracker for NoLimitTracker {
    #[inline]
    fn on_alloc(&mut self, _get_size: impl FnOnce() -> usize) -> Result<(), LimitError> {
        Ok(())
    }

    #[inline]
    fn on_free(&mut self, _get_size: impl FnOnce() -> usize) {}
}

/// Configuration for arena limits.
///
/// All limits are optional - set to `None` to disable a specific limit.
/// Use `RefLimits::default()` for no limits, or build custom limits with
/// the builder pattern.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RefLimits {
    /// Maximum number of simultaneously live references.
    pub max_live_refs: Option<usize>,
    /// Maximum payload memory in bytes (approximate).
    pub max_memory: Option<usize>,
}

impl RefLimits {
    /// Creates limits with every bound disabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of simultaneously live references.
    #[must_use]
    pub fn max_live_refs(mut self, limit: usize) -> Self {
        self.max_live_refs = Some(limit);
        self
    }

    /// Sets the maximum payload memory in bytes.
    #[must_use]
    pub fn max_memory(mut self, limit: usize) -> Self {
        self.max_memory = Some(limit);
        self
    }
}

/// A tracker that enforces configurable limits.
///
/// Tracks the live reference count and approximate payload memory, returning
/// errors when limits are exceeded. Hosts that hand arena access to untrusted
/// native sections use this to bound how much those sections can hold open.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LimitedTracker {
    limits: RefLimits,
    /// Number of currently live references (allocations minus frees).
    live: usize,
    /// Total number of allocations made over the tracker's lifetime.
    total_allocations: usize,
    /// Current approximate payload memory in bytes.
    current_memory: usize,
}

impl LimitedTracker {
    /// Creates a new tracker with the given limits.
    #[must_use]
    pub fn new(limits: RefLimits) -> Self {
        Self {
            limits,
            live: 0,
            total_allocations: 0,
            current_memory: 0,
        }
    }

    /// Returns the total allocation count over the tracker's lifetime.
    #[must_use]
    pub fn total_allocations(&self) -> usize {
        self.total_allocations
    }

    /// Returns the current approximate payload memory usage.
    #[must_use]
    pub fn current_memory(&self) -> usize {
        self.current_memory
    }
}

impl LimitTracker for LimitedTracker {
    fn on_alloc(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), LimitError> {
        if let Some(max) = self.limits.max_live_refs
            && self.live >= max
        {
            return Err(LimitError::Capacity {
                limit: max,
                live: self.live + 1,
            });
        }

        if let Some(max) = self.limits.max_memory {
            let new_memory = self.current_memory + get_size();
            if new_memory > max {
                return Err(LimitError::Memory {
                    limit: max,
                    used: new_memory,
                });
            }
            self.current_memory = new_memory;
        }

        self.live += 1;
        self.total_allocations += 1;
        Ok(())
    }

    fn on_free(&mut self, get_size: impl FnOnce() -> usize) {
        self.live = self.live.saturating_sub(1);
        if self.limits.max_memory.is_some() {
            self.current_memory = self.current_memory.saturating_sub(get_size());
        }
    }

    fn live_count(&self) -> Option<usize> {
        Some(self.live)
    }

    fn current_memory_bytes(&self) -> Option<usize> {
        Some(self.current_memory)
    }
}

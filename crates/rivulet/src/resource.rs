//! Resource accounting: allocation, memory, time and recursion limits plus GC scheduling.
//!
//! The heap reports every allocation and free to a [`ResourceTracker`]; the engine asks it
//! for permission to keep running at backward jumps and calls, and before pushing a frame.
//! A violated limit becomes an uncatchable exception that unwinds every frame.

use std::time::{Duration, Instant};

use crate::exception::ExcType;

/// Frame-stack depth allowed when no explicit limit is configured.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1000;

/// Allocations between collections when no interval is configured.
pub const DEFAULT_GC_INTERVAL: usize = 100_000;

/// A limit was exceeded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("allocation limit exceeded: {limit} allocations")]
    Allocation { limit: usize },
    #[error("memory limit exceeded: {used} bytes used, limit is {limit} bytes")]
    Memory { limit: usize, used: usize },
    #[error("time limit exceeded: {elapsed:?} elapsed, limit is {limit:?}")]
    Time { limit: Duration, elapsed: Duration },
    #[error("maximum recursion depth exceeded")]
    Recursion { limit: usize },
}

impl ResourceError {
    /// The language-level exception the violation surfaces as.
    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        match self {
            Self::Allocation { .. } | Self::Memory { .. } => ExcType::MemoryError,
            Self::Time { .. } => ExcType::TimeoutError,
            Self::Recursion { .. } => ExcType::RecursionError,
        }
    }
}

/// Policy hooks consulted by the heap and the engine.
pub trait ResourceTracker {
    /// Called before every heap allocation. `get_size` is only evaluated by trackers
    /// that account memory.
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called when the collector frees an entry.
    fn on_free(&mut self, get_size: impl FnOnce() -> usize);

    /// Called at every backward jump and every call.
    fn check_time(&mut self) -> Result<(), ResourceError>;

    /// Called before a frame is pushed; `depth` counts the frames already live.
    fn check_recursion_depth(&self, depth: usize) -> Result<(), ResourceError>;

    /// Whether enough has been allocated since the last collection to run another.
    fn should_gc(&self) -> bool;

    fn on_gc_complete(&mut self);
}

/// Tracker without allocation, memory or time limits.
///
/// Recursion is still capped at [`DEFAULT_MAX_RECURSION_DEPTH`], as native re-entry
/// (dunder methods called from builtins) consumes host stack.
#[derive(Debug, Clone, Default)]
pub struct NoLimitTracker {
    allocations_since_gc: usize,
}

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_allocate(&mut self, _get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        self.allocations_since_gc += 1;
        Ok(())
    }

    #[inline]
    fn on_free(&mut self, _get_size: impl FnOnce() -> usize) {}

    #[inline]
    fn check_time(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    fn check_recursion_depth(&self, depth: usize) -> Result<(), ResourceError> {
        if depth >= DEFAULT_MAX_RECURSION_DEPTH {
            Err(ResourceError::Recursion {
                limit: DEFAULT_MAX_RECURSION_DEPTH,
            })
        } else {
            Ok(())
        }
    }

    fn should_gc(&self) -> bool {
        self.allocations_since_gc >= DEFAULT_GC_INTERVAL
    }

    fn on_gc_complete(&mut self) {
        self.allocations_since_gc = 0;
    }
}

/// Limits applied by a [`LimitedTracker`]. Every limit is optional.
///
/// ```
/// use std::time::Duration;
/// use rivulet::ResourceLimits;
///
/// let limits = ResourceLimits::new()
///     .max_allocations(10_000)
///     .max_duration(Duration::from_millis(500))
///     .gc_interval(1_000);
/// assert_eq!(limits.get_max_allocations(), Some(10_000));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    max_allocations: Option<usize>,
    max_duration: Option<Duration>,
    max_memory: Option<usize>,
    gc_interval: Option<usize>,
    max_recursion_depth: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_allocations: None,
            max_duration: None,
            max_memory: None,
            gc_interval: None,
            max_recursion_depth: Some(DEFAULT_MAX_RECURSION_DEPTH),
        }
    }
}

impl ResourceLimits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of heap allocations over the whole run.
    #[must_use]
    pub fn max_allocations(mut self, limit: usize) -> Self {
        self.max_allocations = Some(limit);
        self
    }

    /// Wall-clock budget, checked at backward jumps and calls.
    #[must_use]
    pub fn max_duration(mut self, limit: Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    /// Approximate live heap size in bytes.
    #[must_use]
    pub fn max_memory(mut self, limit: usize) -> Self {
        self.max_memory = Some(limit);
        self
    }

    /// Run the collector every `interval` allocations.
    #[must_use]
    pub fn gc_interval(mut self, interval: usize) -> Self {
        self.gc_interval = Some(interval);
        self
    }

    /// `None` removes the cap entirely.
    #[must_use]
    pub fn max_recursion_depth(mut self, limit: Option<usize>) -> Self {
        self.max_recursion_depth = limit;
        self
    }

    #[must_use]
    pub fn get_max_allocations(&self) -> Option<usize> {
        self.max_allocations
    }

    #[must_use]
    pub fn get_max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    #[must_use]
    pub fn get_max_memory(&self) -> Option<usize> {
        self.max_memory
    }

    #[must_use]
    pub fn get_gc_interval(&self) -> Option<usize> {
        self.gc_interval
    }

    #[must_use]
    pub fn get_max_recursion_depth(&self) -> Option<usize> {
        self.max_recursion_depth
    }
}

/// Tracker enforcing a [`ResourceLimits`].
///
/// The clock starts when the tracker is created.
#[derive(Debug, Clone)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    start: Instant,
    allocations: usize,
    allocations_since_gc: usize,
    memory: usize,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            start: Instant::now(),
            allocations: 0,
            allocations_since_gc: 0,
            memory: 0,
        }
    }

    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Estimated bytes currently live on the heap.
    #[must_use]
    pub fn memory(&self) -> usize {
        self.memory
    }
}

impl From<ResourceLimits> for LimitedTracker {
    fn from(limits: ResourceLimits) -> Self {
        Self::new(limits)
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_allocate(&mut self, get_size: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.max_allocations
            && self.allocations >= limit
        {
            return Err(ResourceError::Allocation { limit });
        }
        if let Some(limit) = self.limits.max_memory {
            let used = self.memory + get_size();
            if used > limit {
                return Err(ResourceError::Memory { limit, used });
            }
            self.memory = used;
        }
        self.allocations += 1;
        self.allocations_since_gc += 1;
        Ok(())
    }

    fn on_free(&mut self, get_size: impl FnOnce() -> usize) {
        if self.limits.max_memory.is_some() {
            self.memory = self.memory.saturating_sub(get_size());
        }
    }

    fn check_time(&mut self) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.max_duration {
            let elapsed = self.start.elapsed();
            if elapsed > limit {
                return Err(ResourceError::Time { limit, elapsed });
            }
        }
        Ok(())
    }

    fn check_recursion_depth(&self, depth: usize) -> Result<(), ResourceError> {
        match self.limits.max_recursion_depth {
            Some(limit) if depth >= limit => Err(ResourceError::Recursion { limit }),
            _ => Ok(()),
        }
    }

    fn should_gc(&self) -> bool {
        self.allocations_since_gc >= self.limits.gc_interval.unwrap_or(DEFAULT_GC_INTERVAL)
    }

    fn on_gc_complete(&mut self) {
        self.allocations_since_gc = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_limit_is_inclusive() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_allocations(2));
        assert!(tracker.on_allocate(|| 8).is_ok());
        assert!(tracker.on_allocate(|| 8).is_ok());
        assert_eq!(tracker.on_allocate(|| 8), Err(ResourceError::Allocation { limit: 2 }));
    }

    #[test]
    fn memory_is_released_on_free() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_memory(100));
        tracker.on_allocate(|| 60).unwrap();
        assert!(tracker.on_allocate(|| 60).is_err());
        tracker.on_free(|| 60);
        assert_eq!(tracker.memory(), 0);
        assert!(tracker.on_allocate(|| 60).is_ok());
    }

    #[test]
    fn gc_interval_schedules_collection() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().gc_interval(3));
        for _ in 0..2 {
            tracker.on_allocate(|| 0).unwrap();
        }
        assert!(!tracker.should_gc());
        tracker.on_allocate(|| 0).unwrap();
        assert!(tracker.should_gc());
        tracker.on_gc_complete();
        assert!(!tracker.should_gc());
    }

    #[test]
    fn recursion_limit_can_be_lifted() {
        let capped = LimitedTracker::new(ResourceLimits::new());
        assert!(capped.check_recursion_depth(DEFAULT_MAX_RECURSION_DEPTH).is_err());
        let uncapped = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(None));
        assert!(uncapped.check_recursion_depth(DEFAULT_MAX_RECURSION_DEPTH * 10).is_ok());
    }

    #[test]
    fn errors_map_to_exception_types() {
        assert_eq!(ResourceError::Allocation { limit: 1 }.exc_type(), ExcType::MemoryError);
        assert_eq!(
            ResourceError::Time {
                limit: Duration::ZERO,
                elapsed: Duration::from_millis(1)
            }
            .exc_type(),
            ExcType::TimeoutError
        );
        assert_eq!(ResourceError::Recursion { limit: 1 }.exc_type(), ExcType::RecursionError);
    }
}

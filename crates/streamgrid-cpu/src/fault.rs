//! Fault injection for exercising failure paths.
//!
//! Counters are 1-based: `fail_allocation_at(2)` fails the second
//! allocation made on the device.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Which operations should fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultInjection {
    /// Fail the nth buffer allocation with out-of-memory.
    pub fail_allocation_at: Option<usize>,
    /// Fail the nth host registration.
    pub fail_registration_at: Option<usize>,
    /// Fail the nth stream creation.
    pub fail_stream_creation_at: Option<usize>,
    /// Reject the nth launch immediately.
    pub reject_launch_at: Option<usize>,
    /// Fail every launch executed on the stream with this index.
    /// The failure is reported when that stream is synchronized.
    ///
    /// Stream indices restart at 0 whenever the device has no live streams,
    /// so on a device running one execution at a time this is the engine's
    /// per-call stream index.
    pub fail_launches_on_stream: Option<usize>,
}

impl FaultInjection {
    /// No faults.
    pub fn none() -> Self {
        Self::default()
    }

    /// Fails the nth allocation.
    #[must_use]
    pub fn fail_allocation_at(mut self, nth: usize) -> Self {
        self.fail_allocation_at = Some(nth);
        self
    }

    /// Fails the nth host registration.
    #[must_use]
    pub fn fail_registration_at(mut self, nth: usize) -> Self {
        self.fail_registration_at = Some(nth);
        self
    }

    /// Fails the nth stream creation.
    #[must_use]
    pub fn fail_stream_creation_at(mut self, nth: usize) -> Self {
        self.fail_stream_creation_at = Some(nth);
        self
    }

    /// Rejects the nth launch at submission.
    #[must_use]
    pub fn reject_launch_at(mut self, nth: usize) -> Self {
        self.reject_launch_at = Some(nth);
        self
    }

    /// Fails launches on one stream asynchronously.
    #[must_use]
    pub fn fail_launches_on_stream(mut self, index: usize) -> Self {
        self.fail_launches_on_stream = Some(index);
        self
    }

    /// Whether any fault is configured.
    pub fn is_active(&self) -> bool {
        *self != Self::default()
    }
}

/// Per-device operation counters used to trigger faults.
#[derive(Debug, Default)]
pub(crate) struct FaultCounters {
    allocations: AtomicUsize,
    registrations: AtomicUsize,
    streams: AtomicUsize,
    launches: AtomicUsize,
}

impl FaultCounters {
    fn hit(counter: &AtomicUsize, target: Option<usize>) -> bool {
        let nth = counter.fetch_add(1, Ordering::Relaxed) + 1;
        target == Some(nth)
    }

    pub(crate) fn allocation(&self, faults: &FaultInjection) -> bool {
        Self::hit(&self.allocations, faults.fail_allocation_at)
    }

    pub(crate) fn registration(&self, faults: &FaultInjection) -> bool {
        Self::hit(&self.registrations, faults.fail_registration_at)
    }

    pub(crate) fn stream(&self, faults: &FaultInjection) -> bool {
        Self::hit(&self.streams, faults.fail_stream_creation_at)
    }

    pub(crate) fn launch(&self, faults: &FaultInjection) -> bool {
        Self::hit(&self.launches, faults.reject_launch_at)
    }
}

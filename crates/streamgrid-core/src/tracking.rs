//! Resource accounting with leak detection.
//!
//! Every acquisition made by a [`ResourceSet`](crate::resources::ResourceSet)
//! is recorded here and removed again on release, so a tracker shared by an
//! engine reports zero live resources between calls.
//!
//! ```
//! use streamgrid_core::tracking::{ResourceKind, ResourceTracker};
//!
//! let tracker = ResourceTracker::new();
//! tracker.track_acquire(ResourceKind::DeviceBuffer, 7, 4096, "y");
//! assert_eq!(tracker.current_bytes(), 4096);
//! tracker.track_release(ResourceKind::DeviceBuffer, 7);
//! assert!(tracker.detect_leaks().is_none());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

/// Kind of tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Device buffer.
    DeviceBuffer,
    /// Stream.
    Stream,
    /// Page-locked host registration.
    HostRegistration,
}

impl ResourceKind {
    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::DeviceBuffer => "device buffer",
            ResourceKind::Stream => "stream",
            ResourceKind::HostRegistration => "host registration",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A live tracked resource.
#[derive(Debug, Clone)]
pub struct TrackedResource {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Backend handle value.
    pub handle: u64,
    /// Size in bytes (0 for streams).
    pub size: usize,
    /// Label given at acquisition.
    pub label: String,
    /// When it was acquired.
    pub acquired_at: Instant,
}

impl TrackedResource {
    /// Age in seconds.
    pub fn age_secs(&self) -> f64 {
        self.acquired_at.elapsed().as_secs_f64()
    }
}

/// Snapshot of tracker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    /// Bytes currently held (buffers and registrations).
    pub current_bytes: u64,
    /// High-water mark of `current_bytes`.
    pub peak_bytes: u64,
    /// Acquisitions over the tracker's lifetime.
    pub total_acquisitions: u64,
    /// Releases over the tracker's lifetime.
    pub total_releases: u64,
    /// Live resources by kind.
    pub live_by_kind: HashMap<ResourceKind, usize>,
}

/// Thread-safe resource accounting.
#[derive(Debug)]
pub struct ResourceTracker {
    live: RwLock<HashMap<(ResourceKind, u64), TrackedResource>>,
    current_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    total_acquisitions: AtomicU64,
    total_releases: AtomicU64,
    enabled: AtomicBool,
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTracker {
    /// Create an enabled tracker.
    pub fn new() -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            current_bytes: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
            total_acquisitions: AtomicU64::new(0),
            total_releases: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable or disable tracking.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether tracking is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Record an acquisition.
    pub fn track_acquire(&self, kind: ResourceKind, handle: u64, size: usize, label: &str) {
        if !self.is_enabled() {
            return;
        }

        let new_bytes = self.current_bytes.fetch_add(size as u64, Ordering::Relaxed) + size as u64;
        self.peak_bytes.fetch_max(new_bytes, Ordering::Relaxed);
        self.total_acquisitions.fetch_add(1, Ordering::Relaxed);

        self.live.write().insert(
            (kind, handle),
            TrackedResource {
                kind,
                handle,
                size,
                label: label.to_string(),
                acquired_at: Instant::now(),
            },
        );
    }

    /// Record a release. Returns the resource if it was live.
    pub fn track_release(&self, kind: ResourceKind, handle: u64) -> Option<TrackedResource> {
        if !self.is_enabled() {
            return None;
        }

        let resource = self.live.write().remove(&(kind, handle));
        if let Some(ref r) = resource {
            self.current_bytes.fetch_sub(r.size as u64, Ordering::Relaxed);
            self.total_releases.fetch_add(1, Ordering::Relaxed);
        }
        resource
    }

    /// Bytes currently held.
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Peak bytes held.
    pub fn peak_bytes(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    /// Number of live resources of every kind.
    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    /// Number of live resources of one kind.
    pub fn live_count_of(&self, kind: ResourceKind) -> usize {
        self.live.read().keys().filter(|(k, _)| *k == kind).count()
    }

    /// Live resources, oldest first.
    pub fn live_resources(&self) -> Vec<TrackedResource> {
        let mut resources: Vec<_> = self.live.read().values().cloned().collect();
        resources.sort_by_key(|r| r.acquired_at);
        resources
    }

    /// Live resources, or `None` when nothing leaked.
    pub fn detect_leaks(&self) -> Option<Vec<TrackedResource>> {
        let leaks = self.live_resources();
        if leaks.is_empty() {
            None
        } else {
            Some(leaks)
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TrackerStats {
        let mut live_by_kind = HashMap::new();
        for (kind, _) in self.live.read().keys() {
            *live_by_kind.entry(*kind).or_insert(0) += 1;
        }
        TrackerStats {
            current_bytes: self.current_bytes(),
            peak_bytes: self.peak_bytes(),
            total_acquisitions: self.total_acquisitions.load(Ordering::Relaxed),
            total_releases: self.total_releases.load(Ordering::Relaxed),
            live_by_kind,
        }
    }

    /// Forget all live resources and zero the counters.
    pub fn reset(&self) {
        self.live.write().clear();
        self.current_bytes.store(0, Ordering::Relaxed);
        self.peak_bytes.store(0, Ordering::Relaxed);
        self.total_acquisitions.store(0, Ordering::Relaxed);
        self.total_releases.store(0, Ordering::Relaxed);
    }
}

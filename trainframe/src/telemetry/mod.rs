//! Pipeline telemetry for observability.
//!
//! Lock-free atomic counters recorded by the processor and frame computer,
//! with point-in-time snapshots for whatever surface wants to display or
//! export them. Exporters themselves are out of scope; the core only ever
//! increments and snapshots.
//!
//! ```text
//! Processor / FrameComputer ──► PipelineMetrics ──► MetricsSnapshot ──► views
//!                               (atomic counters)   (point-in-time copy)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters recorded across the event-processing pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    events_processed: AtomicU64,
    events_rejected: AtomicU64,
    frames_computed: AtomicU64,
    frame_errors: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// An envelope passed validation and was folded into city state.
    pub fn event_processed(&self) {
        self.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// An envelope failed validation and was dropped.
    pub fn event_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames successfully written during a recomputation pass.
    pub fn frames_computed(&self, count: u64) {
        self.frames_computed.fetch_add(count, Ordering::Relaxed);
    }

    /// Per-scope computation failures collected during a pass.
    pub fn frame_errors(&self, count: u64) {
        self.frame_errors.fetch_add(count, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            frames_computed: self.frames_computed.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub events_processed: u64,
    pub events_rejected: u64,
    pub frames_computed: u64,
    pub frame_errors: u64,
}

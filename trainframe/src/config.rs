//! Pipeline configuration.
//!
//! Plain config structs with documented defaults, composed into a
//! [`PipelineConfig`] that whoever bootstraps the process can build from its
//! own sources (flags, files, environment). The core only consumes the
//! structs.

use std::time::Duration;

use crate::bus::{GROUP_PROCESSOR, TOPIC_EVENTS_NORMALIZED};
use crate::scope::DEFAULT_SCOPE_PRECISION;

/// Default cap on retained entries per stream-bus topic.
pub const DEFAULT_STREAM_MAX_LEN: usize = 10_000;

/// Default bound on a blocking stream read.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum batch size per stream read.
pub const DEFAULT_READ_COUNT: usize = 100;

/// Default TTL for provisioned scopes.
///
/// Scopes live as long as clients keep re-provisioning the viewport; five
/// minutes lets an abandoned viewport age out without churn.
pub const DEFAULT_SCOPE_TTL: Duration = Duration::from_secs(300);

/// Default TTL for computed frames.
///
/// Frames go stale as soon as the next event lands, so they only need to
/// outlive the gap between recomputations.
pub const DEFAULT_FRAME_TTL: Duration = Duration::from_secs(30);

/// Durable transport options (`maxLen` / `blockMs` / `count` on the wire).
#[derive(Debug, Clone)]
pub struct StreamBusConfig {
    /// Cap on retained entries per topic; oldest are trimmed.
    pub max_len: usize,
    /// How long a read blocks waiting for new entries before retrying.
    pub block_timeout: Duration,
    /// Maximum entries claimed per read.
    pub count: usize,
}

impl Default for StreamBusConfig {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_STREAM_MAX_LEN,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            count: DEFAULT_READ_COUNT,
        }
    }
}

/// TTLs applied by the pipeline when writing to the store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// TTL for scope definitions.
    pub scope_ttl: Duration,
    /// TTL for computed frames.
    pub frame_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            scope_ttl: DEFAULT_SCOPE_TTL,
            frame_ttl: DEFAULT_FRAME_TTL,
        }
    }
}

/// Processor subscription and normalization settings.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Topic the processor consumes.
    pub topic: String,
    /// Consumer group name for the subscription.
    pub group: String,
    /// This consumer's identity within the group (logs only).
    pub consumer_id: String,
    /// Quantization precision used when provisioning scopes.
    pub scope_precision: f64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            topic: TOPIC_EVENTS_NORMALIZED.to_string(),
            group: GROUP_PROCESSOR.to_string(),
            consumer_id: "processor-1".to_string(),
            scope_precision: DEFAULT_SCOPE_PRECISION,
        }
    }
}

/// Top-level configuration for the event-processing pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub stream_bus: StreamBusConfig,
    pub store: StoreConfig,
    pub processor: ProcessorConfig,
}

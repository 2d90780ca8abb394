//! Trainframe - Real-time transit vehicle position pipeline
//!
//! This library provides the core functionality for ingesting normalized
//! vehicle position events, folding them into per-city state, and serving
//! viewport-scoped frames with TTL-based expiry.
//!
//! The pipeline is event-driven: events arrive on a bus topic, a processor
//! consumer group folds them into live state, and a frame computer rewrites
//! one frame per active scope after every fold. Geographic scopes are
//! identified deterministically so that jittered viewport requests converge
//! on the same scope.

pub mod bus;
pub mod config;
pub mod frame;
pub mod model;
pub mod processor;
pub mod resilience;
pub mod scope;
pub mod store;
pub mod telemetry;

pub use config::PipelineConfig;
pub use processor::Processor;

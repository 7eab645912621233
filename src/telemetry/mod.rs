//! Pipeline telemetry.
//!
//! Every recoverable failure in the pipeline (dropped payloads, skipped
//! ticks, fallback weather, failed alerts) is counted here so that nothing
//! is lost silently.

pub mod counters;

pub use counters::{create_shared_stats, PipelineStats, SharedStats, StatsSnapshot};

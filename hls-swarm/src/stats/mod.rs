//! Per-client atomic state, latency digests, and the throughput
//! histogram.

mod client;
mod digest;
mod throughput;

pub use client::{categorize_exit, ClientSnapshot, ClientStats, ExitCategory};
pub use digest::{merge_by_resampling, LatencyDigest, PERCENTILE_GRID};
pub use throughput::{merge_buckets, percentile_from_buckets, ThroughputHistogram};

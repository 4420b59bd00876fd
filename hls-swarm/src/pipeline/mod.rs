//! Bounded, drop-on-full line pipelines.

mod lossy;

pub use lossy::{Pipeline, PipelineHandle, PipelineStats};

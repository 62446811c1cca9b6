//! Receive-side sequence tracking and per-direction traffic counters

mod metric;
mod sequence;

pub use metric::Metric;
pub use sequence::{SeqResult, SequenceTracker};

//! Link-quality measurement.

pub mod probe;

pub use probe::{ByteErrorHistogram, LinkProbe, ProbeOutcome};

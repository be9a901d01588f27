//! Sample storage, persistence and summaries.
pub mod report;
pub mod sample_store;
pub mod table;

pub use sample_store::{Sample, SampleStore};

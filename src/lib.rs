//! # IR alignment rig
//!
//! Finds the region in which an infrared link between two transceivers works,
//! by moving one of them on a 3D printer's motion stage along a growing spiral,
//! layer by layer, and scoring the link at every stop.
//!
//! ## Crate Structure
//!
//! - **`config`**: `RigConfig`, layered from defaults, a TOML file and
//!   `IR_ALIGN_` environment variables.
//! - **`data`**: The per-speed sample store, CSV persistence and envelope summaries.
//! - **`error`**: The `IrAlignError` enum shared by the whole crate.
//! - **`experiment`**: The scan path generator, operator commands and the `ScanDriver` loop.
//! - **`geometry`**: `Position` and frame conversions.
//! - **`hardware`**: Capability traits with the Marlin stage, the serial IR link and mocks.
//! - **`measurement`**: The 256-byte link probe and its error histogram.
//! - **`tracing_init`**: Structured logging setup.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod geometry;
pub mod hardware;
pub mod measurement;
pub mod tracing_init;

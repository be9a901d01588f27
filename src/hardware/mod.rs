//! Rig hardware: capability traits, the Marlin stage driver, the serial IR link
//! and their simulated counterparts.

pub mod capabilities;
pub mod gcode;
#[cfg(feature = "tokio_serial")]
pub mod ir_link;
pub mod marlin;
pub mod mock;
pub mod serial;

pub use capabilities::{LinkTransport, MotionController, PositionReport};

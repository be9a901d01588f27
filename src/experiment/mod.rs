//! Alignment scan: the spiral path, operator commands and the driver loop
//! tying them to the hardware.

pub mod driver;
pub mod operator;
pub mod scan_path;

pub use driver::{DriverSettings, Flow, ScanDriver, ScanSession, ScanState};
pub use operator::{operator_channel, JogDirection, OperatorCommand, OperatorReceiver, OperatorSender};
pub use scan_path::{Advance, ScanCursor, ScanParams, ScanPathGenerator};

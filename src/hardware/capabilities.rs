//! Rig Hardware Capabilities
//!
//! The scan driver talks to two pieces of hardware, each behind a small
//! capability trait:
//!
//! - [`MotionController`]: the printer-style stage carrying the IR head
//! - [`LinkTransport`]: the byte link whose quality is being mapped
//!
//! Real devices ([`MarlinController`](crate::hardware::marlin::MarlinController),
//! [`SerialIrLink`](crate::hardware::ir_link::SerialIrLink)) and the simulated
//! ones in [`mock`](crate::hardware::mock) implement the same traits, so the
//! driver is tested without a serial port in sight.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn park<M: MotionController>(stage: &M, origin: Position) -> Result<()> {
//!     stage.disable_auto_reports().await?;
//!     stage.move_to(origin, 1200.0).await?;
//!     let report = stage.query_position().await?;
//!     println!("parked at {}", report.current);
//!     Ok(())
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

use crate::geometry::Position;

/// One position report from the motion controller, absolute frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionReport {
    /// Where the controller was last told to go.
    pub target: Position,
    /// Where the step counters say the head is now (already unit-scaled).
    pub current: Position,
}

/// Capability: a three-axis stage driven by text commands.
///
/// Every operation completes once the controller acknowledged it; a missing
/// acknowledgement surfaces as an error wrapping
/// [`IrAlignError::AckTimeout`](crate::error::IrAlignError::AckTimeout).
#[async_trait]
pub trait MotionController: Send + Sync {
    /// Home all axes. May block for tens of seconds.
    async fn home(&self) -> Result<()>;

    /// Release holding torque so the head can be moved by hand.
    async fn disable_motors(&self) -> Result<()>;

    /// Stop unsolicited position and temperature reports.
    async fn disable_auto_reports(&self) -> Result<()>;

    /// Ask for target and current position.
    async fn query_position(&self) -> Result<PositionReport>;

    /// Linear move to an absolute position. A non-positive feedrate keeps the
    /// controller's current feedrate.
    async fn move_to(&self, target: Position, feedrate: f64) -> Result<()>;
}

/// Capability: a byte-oriented link with a configurable speed.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Transmit one byte.
    async fn send_byte(&self, byte: u8) -> Result<()>;

    /// Receive one byte, or `None` if nothing arrived within the link's read
    /// timeout.
    async fn recv_byte(&self) -> Result<Option<u8>>;

    /// Read and return everything already waiting on the receive side.
    async fn discard_pending(&self) -> Result<Vec<u8>>;

    /// Reconfigure the link speed (baud). Read timeouts follow the new speed.
    async fn set_speed(&self, speed: u32) -> Result<()>;

    /// Current link speed.
    fn speed(&self) -> u32;
}

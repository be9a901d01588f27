//! Marlin-firmware 3D printer used as a three-axis stage.
//!
//! Protocol Overview:
//! - Format: G-code lines terminated by LF
//! - Baud: 250000 on the rig, 8N1, no flow control
//! - Every accepted command is answered with an `ok` line, possibly after
//!   payload lines (`M114`) or a long delay (`G28`)
//!
//! # Example Usage
//!
//! ```no_run
//! use ir_align::geometry::Position;
//! use ir_align::hardware::capabilities::MotionController;
//! use ir_align::hardware::marlin::{MarlinController, MarlinSettings};
//!
//! # #[cfg(feature = "tokio_serial")]
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let printer = MarlinController::open("/dev/ttyUSB0", 250_000, MarlinSettings::default()).await?;
//!     printer.disable_auto_reports().await?;
//!     printer.move_to(Position::new(116.5, 108.0, 11.25), 1200.0).await?;
//!     let report = printer.query_position().await?;
//!     println!("head at {}", report.current);
//!     Ok(())
//! }
//! # #[cfg(not(feature = "tokio_serial"))]
//! # fn main() {}
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::error::{AppResult, IrAlignError};
use crate::geometry::Position;
use crate::hardware::capabilities::{MotionController, PositionReport};
use crate::hardware::gcode::{self, ACK};
#[cfg(feature = "tokio_serial")]
use crate::hardware::serial::open_serial_async;
use crate::hardware::serial::{drain_serial_buffer, wrap_shared, DynSerial, SharedPort};

/// Timing and unit settings for a [`MarlinController`].
#[derive(Debug, Clone, PartialEq)]
pub struct MarlinSettings {
    /// Per-axis factor applied to the counter position of `M114`.
    pub count_scale: [f64; 3],
    /// Acknowledgement timeout for moves and queries.
    pub ack_timeout: Duration,
    /// Acknowledgement timeout for homing.
    pub home_timeout: Duration,
    /// Acknowledgement timeout for motor and report switches.
    pub short_timeout: Duration,
    /// Pause after each write before listening for the reply.
    pub write_settle: Duration,
    /// How long to collect stale input (late `ok`s, echo lines) before a write.
    pub stale_window: Duration,
}

impl Default for MarlinSettings {
    fn default() -> Self {
        Self {
            count_scale: [1.0, 1.0, 1.0],
            ack_timeout: Duration::from_millis(500),
            home_timeout: Duration::from_secs(30),
            short_timeout: Duration::from_millis(250),
            write_settle: Duration::from_millis(25),
            stale_window: Duration::from_millis(2),
        }
    }
}

/// Driver for a Marlin printer acting as the rig's motion stage.
pub struct MarlinController {
    port: SharedPort,
    settings: MarlinSettings,
}

impl MarlinController {
    /// Wrap an already opened port.
    pub fn new(port: DynSerial, settings: MarlinSettings) -> Self {
        Self {
            port: wrap_shared(port),
            settings,
        }
    }

    /// Open the printer's serial port and drop whatever the board printed
    /// while booting.
    #[cfg(feature = "tokio_serial")]
    pub async fn open(port_path: &str, baud_rate: u32, settings: MarlinSettings) -> Result<Self> {
        let port = open_serial_async(port_path, baud_rate, "Marlin printer").await?;
        let controller = Self::new(Box::new(port), settings);
        let discarded = {
            let mut guard = controller.port.lock().await;
            drain_serial_buffer(guard.get_mut(), 100).await
        };
        if discarded > 0 {
            debug!(discarded, "dropped stale printer output");
        }
        Ok(controller)
    }

    pub fn settings(&self) -> &MarlinSettings {
        &self.settings
    }

    /// Send one command and collect the lines preceding its `ok`.
    #[instrument(skip(self), err)]
    async fn exchange(&self, command: &str, timeout: Duration) -> Result<Vec<String>> {
        let mut port = self.port.lock().await;

        // A reply that missed its deadline must not answer this command.
        let buffered = port.buffer().len();
        port.consume(buffered);
        let window = self.settings.stale_window.as_millis() as u64;
        let stale = drain_serial_buffer(port.get_mut(), window).await;
        if buffered + stale > 0 {
            debug!(bytes = buffered + stale, "discarded stale printer output");
        }

        port.get_mut()
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .context("Marlin write failed")?;
        port.get_mut().flush().await.context("Marlin flush failed")?;
        tokio::time::sleep(self.settings.write_settle).await;

        let lines = wait_for_ok(&mut port, command, timeout).await?;
        trace!(?lines, "acknowledged");
        Ok(lines)
    }
}

/// Read lines until the acknowledgement or the deadline. The port is read at
/// least once even with a zero timeout.
async fn wait_for_ok(
    port: &mut BufReader<DynSerial>,
    command: &str,
    timeout: Duration,
) -> AppResult<Vec<String>> {
    let deadline = Instant::now() + timeout;
    let mut lines = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut line = String::new();
        match tokio::time::timeout(remaining, port.read_line(&mut line)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {
                let line = line.trim();
                if line == ACK {
                    return Ok(lines);
                }
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }

    Err(IrAlignError::AckTimeout {
        command: command.to_string(),
        received: lines.join("\n"),
    })
}

#[async_trait]
impl MotionController for MarlinController {
    async fn home(&self) -> Result<()> {
        self.exchange(gcode::HOME_ALL, self.settings.home_timeout)
            .await?;
        Ok(())
    }

    async fn disable_motors(&self) -> Result<()> {
        self.exchange(gcode::DISABLE_STEPPERS, self.settings.short_timeout)
            .await?;
        Ok(())
    }

    async fn disable_auto_reports(&self) -> Result<()> {
        // Try both even if the first is not acknowledged.
        let temperature = self
            .exchange(
                gcode::DISABLE_AUTO_TEMPERATURE_REPORT,
                self.settings.short_timeout,
            )
            .await;
        let position = self
            .exchange(
                gcode::DISABLE_AUTO_POSITION_REPORT,
                self.settings.short_timeout,
            )
            .await;
        if let Err(e) = &temperature {
            warn!(error = %e, "temperature auto-report not disabled");
        }
        temperature.and(position).map(|_| ())
    }

    async fn query_position(&self) -> Result<PositionReport> {
        let lines = self
            .exchange(gcode::REPORT_POSITION, self.settings.ack_timeout)
            .await?;
        let report = gcode::parse_position_report(&lines.join(" "), self.settings.count_scale)
            .map_err(IrAlignError::from)?;
        Ok(report)
    }

    async fn move_to(&self, target: Position, feedrate: f64) -> Result<()> {
        let command = gcode::linear_move(target, feedrate);
        self.exchange(&command, self.settings.ack_timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::sync::Mutex;

    fn fast_settings() -> MarlinSettings {
        MarlinSettings {
            ack_timeout: Duration::from_millis(200),
            home_timeout: Duration::from_millis(200),
            short_timeout: Duration::from_millis(100),
            write_settle: Duration::ZERO,
            ..MarlinSettings::default()
        }
    }

    /// Fake printer: records every command line and answers with `reply(command)`.
    fn spawn_printer(
        host: DuplexStream,
        reply: impl Fn(&str) -> Option<String> + Send + 'static,
    ) -> Arc<Mutex<Vec<String>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(host);
            let mut reader = BufReader::new(read_half);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let command = line.trim().to_string();
                log.lock().await.push(command.clone());
                if let Some(answer) = reply(&command) {
                    if write_half.write_all(answer.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        });
        received
    }

    #[tokio::test]
    async fn query_parses_report_and_scales_counters() {
        let (host, device) = tokio::io::duplex(1024);
        spawn_printer(host, |command| {
            (command == "M114").then(|| {
                "X:10.00Y:20.00Z:5.00E:0.00 Count X:801.20Y:1602.40Z:1998.90E:0.00\nok\n"
                    .to_string()
            })
        });
        let settings = MarlinSettings {
            count_scale: [1.0 / 80.12, 1.0 / 80.12, 1.0 / 399.78],
            ..fast_settings()
        };
        let printer = MarlinController::new(Box::new(device), settings);

        let report = printer.query_position().await.unwrap();

        assert_eq!(report.target, Position::new(10.0, 20.0, 5.0));
        assert!(report.current.matches(&Position::new(10.0, 20.0, 5.0), 1e-6));
    }

    #[tokio::test]
    async fn late_ack_does_not_answer_the_next_query() {
        let (mut host, device) = tokio::io::duplex(1024);
        // Acknowledgement of an earlier command that already timed out.
        host.write_all(b"ok\n").await.unwrap();
        let received = spawn_printer(host, |command| {
            (command == "M114").then(|| {
                "X:1.00Y:2.00Z:3.00E:0.00 Count X:1.00Y:2.00Z:3.00E:0.00\nok\n".to_string()
            })
        });
        let settings = MarlinSettings {
            stale_window: Duration::from_millis(20),
            ..fast_settings()
        };
        let printer = MarlinController::new(Box::new(device), settings);

        let report = printer.query_position().await.unwrap();

        assert_eq!(report.target, Position::new(1.0, 2.0, 3.0));
        assert_eq!(report.current, Position::new(1.0, 2.0, 3.0));
        assert_eq!(received.lock().await.as_slice(), ["M114"]);
    }

    #[tokio::test]
    async fn move_sends_rounded_g0() {
        let (host, device) = tokio::io::duplex(1024);
        let received = spawn_printer(host, |_| Some("ok\n".to_string()));
        let printer = MarlinController::new(Box::new(device), fast_settings());

        printer
            .move_to(Position::new(116.5, 108.0004, 11.25), 1200.0)
            .await
            .unwrap();

        assert_eq!(
            received.lock().await.as_slice(),
            ["G0 X116.5 Y108 Z11.25 F1200"]
        );
    }

    #[tokio::test]
    async fn silent_printer_times_out() {
        let (host, device) = tokio::io::duplex(1024);
        let received = spawn_printer(host, |_| Some("echo:busy processing\n".to_string()));
        let printer = MarlinController::new(Box::new(device), fast_settings());

        let err = printer.home().await.unwrap_err();

        match err.downcast_ref::<IrAlignError>() {
            Some(IrAlignError::AckTimeout { command, received }) => {
                assert_eq!(command, "G28");
                assert!(received.contains("busy"));
            }
            other => panic!("expected ack timeout, got {:?}", other),
        }
        assert!(err.downcast_ref::<IrAlignError>().unwrap().is_recoverable());
        assert_eq!(received.lock().await.as_slice(), ["G28"]);
    }

    #[tokio::test]
    async fn disable_auto_reports_sends_both_switches() {
        let (host, device) = tokio::io::duplex(1024);
        let received = spawn_printer(host, |_| Some("ok\n".to_string()));
        let printer = MarlinController::new(Box::new(device), fast_settings());

        printer.disable_auto_reports().await.unwrap();
        printer.disable_motors().await.unwrap();

        assert_eq!(
            received.lock().await.as_slice(),
            ["M155 S0", "M154 S0", "M18"]
        );
    }

    #[tokio::test]
    async fn unparseable_report_is_a_position_error() {
        let (host, device) = tokio::io::duplex(1024);
        spawn_printer(host, |_| Some("X:1.0Y:2.0Z:3.0\nok\n".to_string()));
        let printer = MarlinController::new(Box::new(device), fast_settings());

        let err = printer.query_position().await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<IrAlignError>(),
            Some(IrAlignError::PositionReport(_))
        ));
    }
}

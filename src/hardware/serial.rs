//! Serial port plumbing shared by the motion controller and the IR link.
//!
//! - [`SerialPortIO`]: anything that reads and writes asynchronously
//! - [`SharedPort`]: a locked, line-buffered port (the motion controller)
//! - [`open_serial_async`]: open a port without blocking the runtime
//! - [`drain_serial_buffer`]: drop stale input before talking to a device

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Trait alias for async serial port I/O.
///
/// Satisfied by `tokio_serial::SerialStream` on real hardware and by
/// `tokio::io::DuplexStream` in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Locked serial port with buffered line reading.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap a port for shared, line-oriented access.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Open a serial port (8N1, no flow control) on the blocking pool.
///
/// RTS and DTR are deasserted right after opening; many printer boards reset
/// when DTR toggles.
#[cfg(feature = "tokio_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::{SerialPort, SerialPortBuilderExt};

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        let mut port = tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| {
                format!(
                    "Failed to open {} serial port: {}",
                    device_name_owned, port_path_owned
                )
            })?;
        port.write_request_to_send(false)
            .context("Failed to deassert RTS")?;
        port.write_data_terminal_ready(false)
            .context("Failed to deassert DTR")?;
        Ok(port)
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Log the serial ports the OS knows about. Purely informational.
#[cfg(feature = "instrument_serial")]
pub fn log_available_ports() {
    match serialport::available_ports() {
        Ok(ports) => {
            for port in ports {
                debug!(port = %port.port_name, kind = ?port.port_type, "serial port available");
            }
        }
        Err(e) => debug!(error = %e, "could not enumerate serial ports"),
    }
}

/// Read and discard whatever arrives within `timeout_ms`. Returns the number of
/// bytes dropped.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

//! IR byte link over one or two serial ports.
//!
//! The IR transmitter and receiver hang off UART bridges. With a single
//! loop-back adapter both directions share one port; otherwise bytes go out on
//! the TX port and are read back on the RX port.
//!
//! Changing the baud rate of some USB-UART bridges emits a few garbage bytes,
//! so callers settle and flush after [`LinkTransport::set_speed`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};
use tracing::{debug, instrument};

use crate::hardware::capabilities::LinkTransport;
use crate::hardware::serial::open_serial_async;

const BASE_READ_TIMEOUT: Duration = Duration::from_millis(10);
const SLOW_LINK_EXTRA: Duration = Duration::from_millis(20);
const SLOW_LINK_BAUD: u32 = 9600;
/// Worst-case bits in flight for one echoed byte.
const BITS_PER_ECHO: f64 = 24.0;

/// Read timeout for one echoed byte at `baud`.
pub fn link_read_timeout(baud: u32) -> Duration {
    let mut timeout = BASE_READ_TIMEOUT + Duration::from_secs_f64(BITS_PER_ECHO / f64::from(baud.max(1)));
    if baud < SLOW_LINK_BAUD {
        timeout += SLOW_LINK_EXTRA;
    }
    timeout
}

/// IR link on real serial ports.
pub struct SerialIrLink {
    rx: Mutex<SerialStream>,
    /// `None` when transmitter and receiver share the RX port.
    tx: Option<Mutex<SerialStream>>,
    speed: AtomicU32,
}

impl SerialIrLink {
    /// Open the receive port, and the transmit port unless it is the same device.
    pub async fn open(rx_path: &str, tx_path: &str, speed: u32) -> Result<Self> {
        let rx = open_serial_async(rx_path, speed, "IR receiver").await?;
        let tx = if tx_path == rx_path {
            None
        } else {
            Some(Mutex::new(
                open_serial_async(tx_path, speed, "IR transmitter").await?,
            ))
        };
        debug!(rx_path, tx_path, speed, shared = tx.is_none(), "IR link open");
        Ok(Self {
            rx: Mutex::new(rx),
            tx,
            speed: AtomicU32::new(speed),
        })
    }

    fn read_timeout(&self) -> Duration {
        link_read_timeout(self.speed())
    }
}

#[async_trait]
impl LinkTransport for SerialIrLink {
    async fn send_byte(&self, byte: u8) -> Result<()> {
        let port = self.tx.as_ref().unwrap_or(&self.rx);
        let mut port = port.lock().await;
        port.write_all(&[byte]).await.context("IR write failed")?;
        Ok(())
    }

    async fn recv_byte(&self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        let mut port = self.rx.lock().await;
        match tokio::time::timeout(self.read_timeout(), port.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => Ok(None),
            Ok(Ok(_)) => Ok(Some(buf[0])),
            Ok(Err(e)) => Err(e).context("IR read failed"),
        }
    }

    async fn discard_pending(&self) -> Result<Vec<u8>> {
        let timeout = self.read_timeout();
        let mut port = self.rx.lock().await;
        let mut discarded = Vec::new();
        loop {
            let waiting = port.bytes_to_read().context("IR bytes_to_read failed")? as usize;
            if waiting == 0 {
                break;
            }
            let mut chunk = vec![0u8; waiting];
            let n = port.read(&mut chunk).await.context("IR read failed")?;
            discarded.extend_from_slice(&chunk[..n]);
            tokio::time::sleep(timeout).await;
        }
        Ok(discarded)
    }

    #[instrument(skip(self), err)]
    async fn set_speed(&self, speed: u32) -> Result<()> {
        {
            let mut rx = self.rx.lock().await;
            rx.set_baud_rate(speed).context("IR receiver baud change failed")?;
            rx.clear(ClearBuffer::Input).context("IR receiver clear failed")?;
        }
        if let Some(tx) = &self.tx {
            tx.lock()
                .await
                .set_baud_rate(speed)
                .context("IR transmitter baud change failed")?;
        }
        self.speed.store(speed, Ordering::Relaxed);
        Ok(())
    }

    fn speed(&self) -> u32 {
        self.speed.load(Ordering::Relaxed)
    }
}

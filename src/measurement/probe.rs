//! Link-quality probe.
//!
//! One pass sends every byte value 0..=255 once and expects each to come back
//! unchanged before the next one goes out. The score is the fraction that did.
//! Mismatches are bookkept per byte value in a [`ByteErrorHistogram`], which is
//! persisted next to the samples as a diagnostic.

use anyhow::Result;
use tracing::{debug, trace};

use crate::hardware::capabilities::LinkTransport;

/// Number of distinct byte values sent per pass.
pub const PATTERN_LEN: usize = 256;

/// Mismatch counter per byte value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteErrorHistogram {
    counts: [u64; PATTERN_LEN],
}

impl Default for ByteErrorHistogram {
    fn default() -> Self {
        Self {
            counts: [0; PATTERN_LEN],
        }
    }
}

impl ByteErrorHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, byte: u8) {
        self.counts[usize::from(byte)] += 1;
    }

    pub fn count(&self, byte: u8) -> u64 {
        self.counts[usize::from(byte)]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// `(byte, count)` for every byte value, in order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, u64)> + '_ {
        (0..=u8::MAX).map(move |byte| (byte, self.count(byte)))
    }

    /// Restore a counter loaded from disk.
    pub fn set(&mut self, byte: u8, count: u64) {
        self.counts[usize::from(byte)] = count;
    }
}

/// Tally of one probe pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Bytes echoed unchanged.
    pub good: u32,
    /// Wrong bytes that were numerically adjacent to the sent one.
    pub near_misses: u32,
    /// Bytes that got no answer before the read timeout.
    pub silent: u32,
    /// Extra bytes received after the expected echo.
    pub excess_bytes: usize,
}

impl ProbeOutcome {
    /// Fraction of the pattern that made it through, in `[0, 1]`.
    pub fn score(&self) -> f64 {
        f64::from(self.good) / PATTERN_LEN as f64
    }
}

/// Runs probe passes against a link and keeps the running mismatch histogram.
#[derive(Debug, Clone)]
pub struct LinkProbe {
    passes: u32,
    histogram: ByteErrorHistogram,
}

impl LinkProbe {
    /// `passes` is clamped to at least one.
    pub fn new(passes: u32) -> Self {
        Self {
            passes: passes.max(1),
            histogram: ByteErrorHistogram::new(),
        }
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn histogram(&self) -> &ByteErrorHistogram {
        &self.histogram
    }

    /// Mean score over the configured number of passes.
    pub async fn measure<L: LinkTransport + ?Sized>(&mut self, link: &L) -> Result<f64> {
        let mut total = 0.0;
        for _ in 0..self.passes {
            total += self.probe_once(link).await?.score();
        }
        Ok(total / f64::from(self.passes))
    }

    /// One full 256-byte pass.
    pub async fn probe_once<L: LinkTransport + ?Sized>(&mut self, link: &L) -> Result<ProbeOutcome> {
        let stale = link.discard_pending().await?;
        if !stale.is_empty() {
            debug!(count = stale.len(), "flushed stale link input");
        }

        let mut outcome = ProbeOutcome::default();
        for byte in 0..=u8::MAX {
            link.send_byte(byte).await?;
            let received = link.recv_byte().await?;
            match received {
                Some(echo) if echo == byte => outcome.good += 1,
                Some(echo) if echo.abs_diff(byte) < 2 => {
                    outcome.near_misses += 1;
                    debug!(sent = byte, received = echo, "bad echo, but numerically close");
                }
                Some(echo) => trace!(sent = byte, received = echo, "bad echo"),
                None => outcome.silent += 1,
            }

            let excess = link.discard_pending().await?;
            if !excess.is_empty() {
                debug!(sent = byte, ?excess, "discarding excess link data");
                outcome.excess_bytes += excess.len();
            }

            if received != Some(byte) {
                self.histogram.record(byte);
            }
        }

        trace!(?outcome, speed = link.speed(), "probe pass done");
        Ok(outcome)
    }
}

//! Per-link-speed sample storage.
//!
//! Samples are kept in insertion order. The scan-path generator relies on that
//! order: its termination checks walk backward from the newest sample.

use crate::geometry::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One accepted measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Fraction of probe bytes that came back intact, in `[0, 1]`.
    pub score: f64,
}

impl Sample {
    pub fn new(position: Position, score: f64) -> Self {
        Self {
            x: position.x,
            y: position.y,
            z: position.z,
            score,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y, self.z)
    }

    pub fn horizontal_radius(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Append-only samples keyed by link speed (baud rate).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleStore {
    samples: BTreeMap<u32, Vec<Sample>>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with an empty sequence for every speed, so speeds show up
    /// in persisted output even before their first sample.
    pub fn with_speeds(speeds: &[u32]) -> Self {
        let mut store = Self::new();
        for &speed in speeds {
            store.samples.entry(speed).or_default();
        }
        store
    }

    /// Append a sample for `speed`, creating the sequence if needed.
    pub fn append(&mut self, speed: u32, sample: Sample) {
        self.samples.entry(speed).or_default().push(sample);
    }

    /// Replace the sequence for `speed` wholesale. Used when loading from disk.
    pub(crate) fn insert_sequence(&mut self, speed: u32, samples: Vec<Sample>) {
        self.samples.insert(speed, samples);
    }

    pub fn samples(&self, speed: u32) -> &[Sample] {
        self.samples.get(&speed).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last(&self, speed: u32) -> Option<&Sample> {
        self.samples(speed).last()
    }

    pub fn len(&self, speed: u32) -> usize {
        self.samples(speed).len()
    }

    pub fn total_len(&self) -> usize {
        self.samples.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Speeds in ascending order.
    pub fn speeds(&self) -> impl Iterator<Item = u32> + '_ {
        self.samples.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[Sample])> + '_ {
        self.samples.iter().map(|(speed, s)| (*speed, s.as_slice()))
    }

    /// Trailing samples at height `z`, newest first.
    ///
    /// Stops at the first sample whose z differs from `z` by more than `tolerance`.
    pub fn last_samples_at_layer(
        &self,
        speed: u32,
        z: f64,
        tolerance: f64,
    ) -> impl Iterator<Item = &Sample> + '_ {
        self.samples(speed)
            .iter()
            .rev()
            .take_while(move |s| (s.z - z).abs() <= tolerance)
    }

    /// Highest score among the trailing samples down to (and including) the first
    /// one at or below `z_threshold`, newest first.
    ///
    /// Returns `None` when the history does not reach down to `z_threshold` yet,
    /// i.e. there have not been enough layers to judge.
    pub fn max_score_since_z_above(&self, speed: u32, z_threshold: f64) -> Option<f64> {
        let mut max_score = f64::NEG_INFINITY;
        for sample in self.samples(speed).iter().rev() {
            max_score = max_score.max(sample.score);
            if sample.z <= z_threshold {
                return Some(max_score);
            }
        }
        None
    }
}

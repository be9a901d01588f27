//! Spiral-and-layer scan path.
//!
//! At every layer the head follows an Archimedean spiral outward from the
//! alignment axis, taking one sample per constant arc-length step. A layer ends
//! once a full rotation produced nothing above the continuation threshold (or
//! the spiral hits the radius limit); the head then climbs one vertical step and
//! starts over at the center.
//!
//! ```text
//!            ┌──────────────┐  sample > T in the
//!            │ spiral (θ++) │◀─ last rotation
//!            └──────┬───────┘
//!                   │ rotation empty / r > Rmax
//!                   ▼
//!            ┌──────────────┐  ℓ·v > Zmax, or no sample > T
//!            │ next layer   │─ within Vstop below ──▶ speed exhausted
//!            │ (θ = 0, ℓ++) │
//!            └──────────────┘
//! ```
//!
//! The generator only reads the [`SampleStore`]; the scan driver owns it and
//! appends the measurement for the current position before calling
//! [`ScanPathGenerator::advance`].

use crate::data::sample_store::SampleStore;
use crate::geometry::{Position, LAYER_Z_TOLERANCE};
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use tracing::debug;

/// Angular step used while the spiral is still within one horizontal step of the
/// center, where `h / r` would blow up.
const NEAR_CENTER_STEP_DEG: f64 = 60.0;

/// Scan geometry and termination thresholds. Lengths in millimeters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanParams {
    /// Arc length between samples, and radial growth per rotation.
    pub horizontal_step: f64,
    /// Height gained per layer.
    pub vertical_step: f64,
    /// Hard limit on the spiral radius.
    pub max_radius: f64,
    /// Hard limit on the layer height.
    pub max_height: f64,
    /// Scores above this count as a viable link.
    pub continuation_threshold: f64,
    /// Stop once this much height passed without a viable link.
    pub vertical_stop: f64,
    /// Mirror the spiral (x = -sin θ · r).
    pub counter_clockwise: bool,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            horizontal_step: 0.5,
            vertical_step: 0.5,
            max_radius: 10.0,
            max_height: 10.0,
            continuation_threshold: 127.0 / 256.0,
            vertical_stop: 5.0,
            counter_clockwise: false,
        }
    }
}

/// Where the scan is: spiral angle, layer, and active link speed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Accumulated spiral angle in radians.
    pub theta: f64,
    /// Layer index; height is `layer · vertical_step`.
    pub layer: u32,
    /// Index into the configured link speeds.
    pub speed_index: usize,
}

/// Result of [`ScanPathGenerator::advance`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Advance {
    /// Move here and measure again.
    Next(Position),
    /// Nothing more worth measuring at this link speed.
    SpeedExhausted,
}

/// The scan-path state machine.
#[derive(Debug, Clone)]
pub struct ScanPathGenerator {
    params: ScanParams,
    cursor: ScanCursor,
}

impl ScanPathGenerator {
    pub fn new(params: ScanParams) -> Self {
        Self {
            params,
            cursor: ScanCursor::default(),
        }
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    pub fn cursor(&self) -> ScanCursor {
        self.cursor
    }

    /// Spiral radius at angle `theta`.
    pub fn radius_at(&self, theta: f64) -> f64 {
        (theta / TAU) * self.params.horizontal_step
    }

    /// Relative position for an arbitrary cursor.
    pub fn position_at(&self, theta: f64, layer: u32) -> Position {
        let radius = self.radius_at(theta);
        let chirality = if self.params.counter_clockwise { -1.0 } else { 1.0 };
        Position::new(
            chirality * theta.sin() * radius,
            theta.cos() * radius,
            f64::from(layer) * self.params.vertical_step,
        )
    }

    /// Position for the current cursor, without advancing.
    ///
    /// This is the resync used when scanning (re)starts.
    pub fn position(&self) -> Position {
        self.position_at(self.cursor.theta, self.cursor.layer)
    }

    /// Restart the path at the center of the first layer for another link speed.
    pub fn begin_speed(&mut self, speed_index: usize) -> Position {
        self.cursor = ScanCursor {
            theta: 0.0,
            layer: 0,
            speed_index,
        };
        self.position()
    }

    /// Rough completion estimate for the current speed, in `[0, 1]`-ish.
    pub fn progress(&self) -> f64 {
        let p = &self.params;
        (p.vertical_step / p.max_height)
            * (self.radius_at(self.cursor.theta) / p.max_radius + f64::from(self.cursor.layer))
    }

    /// Step the cursor after `sampled` has been measured and appended to `store`
    /// under `speed`.
    pub fn advance(&mut self, sampled: Position, store: &SampleStore, speed: u32) -> Advance {
        let p = &self.params;
        let last_radius = sampled.horizontal_radius();

        let mut keep_spiraling = self.layer_still_productive(sampled, last_radius, store, speed);

        if keep_spiraling {
            self.cursor.theta += if last_radius > p.horizontal_step {
                p.horizontal_step / last_radius
            } else {
                NEAR_CENTER_STEP_DEG.to_radians()
            };
            if self.radius_at(self.cursor.theta) > p.max_radius {
                debug!(layer = self.cursor.layer, "max horizontal radius reached");
                keep_spiraling = false;
            }
        }

        if !keep_spiraling {
            self.cursor.theta = 0.0;
            self.cursor.layer += 1;
            let height = f64::from(self.cursor.layer) * p.vertical_step;
            if height > p.max_height {
                debug!(layer = self.cursor.layer, "max vertical height reached");
                return Advance::SpeedExhausted;
            }

            let floor = sampled.z - p.vertical_stop;
            if let Some(best) = store.max_score_since_z_above(speed, floor) {
                if best <= p.continuation_threshold {
                    debug!(
                        layer = self.cursor.layer,
                        best, "no viable link in recent layers"
                    );
                    return Advance::SpeedExhausted;
                }
            }
            debug!(layer = self.cursor.layer, height, "moving to next layer");
        }

        Advance::Next(self.position())
    }

    /// Whether the current layer still deserves another spiral step.
    ///
    /// Walks the layer's samples newest first: a viable score keeps going, a full
    /// rotation (radius shrinking by more than one step) without one stops.
    fn layer_still_productive(
        &self,
        sampled: Position,
        last_radius: f64,
        store: &SampleStore,
        speed: u32,
    ) -> bool {
        let p = &self.params;
        for sample in store.last_samples_at_layer(speed, sampled.z, LAYER_Z_TOLERANCE) {
            if sample.score > p.continuation_threshold {
                return true;
            }
            if last_radius - sample.horizontal_radius() > p.horizontal_step {
                return false;
            }
        }
        true
    }
}

//! Scan summaries.
//!
//! [`EnvelopeReport`] condenses a sample store into the shape of the working
//! region: for every link speed and layer, how far out from the axis the link
//! still worked. A [`Reporter`] decides where such a summary goes.

use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

use crate::data::sample_store::SampleStore;
use crate::geometry::LAYER_Z_TOLERANCE;

/// Summary of one layer at one speed.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerEnvelope {
    pub z: f64,
    pub samples: usize,
    pub good_samples: usize,
    /// Largest horizontal radius of a sample scoring above the threshold.
    pub max_good_radius: Option<f64>,
}

/// Summary of one link speed.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedEnvelope {
    pub speed: u32,
    pub samples: usize,
    pub good_samples: usize,
    pub best_score: Option<f64>,
    pub layers: Vec<LayerEnvelope>,
}

/// Working-region summary of a whole store.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeReport {
    pub threshold: f64,
    pub speeds: Vec<SpeedEnvelope>,
}

impl EnvelopeReport {
    /// Summarize `store`; samples scoring above `threshold` count as good.
    pub fn from_store(store: &SampleStore, threshold: f64) -> Self {
        let speeds = store
            .iter()
            .map(|(speed, samples)| {
                let mut layers: BTreeMap<i64, LayerEnvelope> = BTreeMap::new();
                for sample in samples {
                    let key = (sample.z / LAYER_Z_TOLERANCE).round() as i64;
                    let layer = layers.entry(key).or_insert(LayerEnvelope {
                        z: sample.z,
                        samples: 0,
                        good_samples: 0,
                        max_good_radius: None,
                    });
                    layer.samples += 1;
                    if sample.score > threshold {
                        layer.good_samples += 1;
                        let radius = sample.horizontal_radius();
                        layer.max_good_radius =
                            Some(layer.max_good_radius.map_or(radius, |r| r.max(radius)));
                    }
                }
                let layers: Vec<LayerEnvelope> = layers.into_values().collect();
                SpeedEnvelope {
                    speed,
                    samples: samples.len(),
                    good_samples: layers.iter().map(|l| l.good_samples).sum(),
                    best_score: samples.iter().map(|s| s.score).reduce(f64::max),
                    layers,
                }
            })
            .collect();
        Self { threshold, speeds }
    }
}

impl fmt::Display for EnvelopeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for speed in &self.speeds {
            write!(
                f,
                "{} baud: {} samples, {} above {:.3}",
                speed.speed, speed.samples, speed.good_samples, self.threshold
            )?;
            match speed.best_score {
                Some(best) => writeln!(f, ", best {:.3}", best)?,
                None => writeln!(f)?,
            }
            for layer in &speed.layers {
                write!(
                    f,
                    "  z {:>7.2} mm  {:>4} samples  {:>4} good",
                    layer.z, layer.samples, layer.good_samples
                )?;
                match layer.max_good_radius {
                    Some(r) => writeln!(f, "  r <= {:.2} mm", r)?,
                    None => writeln!(f, "  no link")?,
                }
            }
        }
        Ok(())
    }
}

/// Destination for scan summaries.
pub trait Reporter: Send {
    fn report(&mut self, store: &SampleStore);
}

/// Logs the envelope through `tracing`.
#[derive(Debug, Clone)]
pub struct LogReporter {
    threshold: f64,
}

impl LogReporter {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Reporter for LogReporter {
    fn report(&mut self, store: &SampleStore) {
        let report = EnvelopeReport::from_store(store, self.threshold);
        for speed in &report.speeds {
            let reach = speed
                .layers
                .iter()
                .filter_map(|l| l.max_good_radius)
                .reduce(f64::max);
            info!(
                speed = speed.speed,
                samples = speed.samples,
                good = speed.good_samples,
                layers = speed.layers.len(),
                best = ?speed.best_score,
                reach_mm = ?reach,
                "scan envelope"
            );
        }
    }
}

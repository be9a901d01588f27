//! Sample table persistence.
//!
//! A saved scan is a directory:
//!
//! ```text
//! 2024-03-05_14-07-09_9600-115200/
//! ├── 9600.csv               x [mm],y [mm],z [mm],measurement (0~1)
//! ├── 115200.csv
//! └── bad_data_pattern.csv   data byte,bad data counter
//! ```
//!
//! Loading skips the diagnostics file and anything that does not parse, so a
//! partially written or hand-edited directory still opens.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::data::sample_store::{Sample, SampleStore};
use crate::error::{AppResult, IrAlignError};
use crate::measurement::probe::ByteErrorHistogram;

/// File stem of the per-byte mismatch table.
pub const DIAGNOSTICS_STEM: &str = "bad_data_pattern";
/// Table name used when no better name is available (shutdown saves).
pub const FALLBACK_NAME: &str = "output";

const EXTENSION: &str = "csv";

#[derive(Debug, Serialize, Deserialize)]
struct SampleRow {
    #[serde(rename = "x [mm]")]
    x: f64,
    #[serde(rename = "y [mm]")]
    y: f64,
    #[serde(rename = "z [mm]")]
    z: f64,
    #[serde(rename = "measurement (0~1)")]
    measurement: f64,
}

impl From<&Sample> for SampleRow {
    fn from(s: &Sample) -> Self {
        Self {
            x: s.x,
            y: s.y,
            z: s.z,
            measurement: s.score,
        }
    }
}

impl From<SampleRow> for Sample {
    fn from(row: SampleRow) -> Self {
        Sample {
            x: row.x,
            y: row.y,
            z: row.z,
            score: row.measurement,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DiagnosticRow {
    #[serde(rename = "data byte")]
    byte: u8,
    #[serde(rename = "bad data counter")]
    count: u64,
}

/// `YYYY-MM-DD_HH-MM-SS_<first speed>[-<last speed>]`.
pub fn generate_file_name(store: &SampleStore, now: NaiveDateTime) -> String {
    let mut name = now.format("%Y-%m-%d_%H-%M-%S").to_string();
    let mut speeds = store.speeds();
    if let Some(first) = speeds.next() {
        name.push_str(&format!("_{}", first));
        if let Some(last) = speeds.last() {
            name.push_str(&format!("-{}", last));
        }
    }
    name
}

/// A sample table directory on disk.
#[derive(Debug, Clone)]
pub struct SampleTable {
    dir: PathBuf,
}

impl SampleTable {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Table named `name` under `root`.
    pub fn named(root: &Path, name: &str) -> Self {
        Self::new(root.join(name))
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn sheet_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", stem, EXTENSION))
    }

    /// Write one file per speed, plus the mismatch histogram if given.
    pub fn save(
        &self,
        store: &SampleStore,
        histogram: Option<&ByteErrorHistogram>,
    ) -> AppResult<()> {
        fs::create_dir_all(&self.dir)?;

        for (speed, samples) in store.iter() {
            let mut writer = csv::Writer::from_path(self.sheet_path(&speed.to_string()))?;
            if samples.is_empty() {
                writer.write_record(["x [mm]", "y [mm]", "z [mm]", "measurement (0~1)"])?;
            }
            for sample in samples {
                writer.serialize(SampleRow::from(sample))?;
            }
            writer.flush()?;
        }

        if let Some(histogram) = histogram {
            let mut writer = csv::Writer::from_path(self.sheet_path(DIAGNOSTICS_STEM))?;
            for (byte, count) in histogram.iter() {
                writer.serialize(DiagnosticRow { byte, count })?;
            }
            writer.flush()?;
        }

        info!(
            path = %self.dir.display(),
            speeds = store.speeds().count(),
            samples = store.total_len(),
            "sample table saved"
        );
        Ok(())
    }

    /// Read the table back. Unreadable sheets are skipped with a warning.
    pub fn load(&self) -> AppResult<(SampleStore, Option<ByteErrorHistogram>)> {
        if !self.dir.is_dir() {
            return Err(IrAlignError::Persistence(format!(
                "'{}' is not a sample table directory",
                self.dir.display()
            )));
        }

        let mut store = SampleStore::new();
        let mut histogram = None;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            if stem.contains(DIAGNOSTICS_STEM) {
                match read_histogram(&path) {
                    Ok(h) => histogram = Some(h),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping diagnostics sheet"),
                }
                continue;
            }

            let Ok(speed) = stem.parse::<u32>() else {
                warn!(path = %path.display(), "skipping sheet without a speed name");
                continue;
            };
            match read_samples(&path) {
                Ok(samples) => store.insert_sequence(speed, samples),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable sheet"),
            }
        }

        info!(
            path = %self.dir.display(),
            samples = store.total_len(),
            "sample table loaded"
        );
        Ok((store, histogram))
    }
}

fn read_samples(path: &Path) -> AppResult<Vec<Sample>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut samples = Vec::new();
    for row in reader.deserialize::<SampleRow>() {
        samples.push(row?.into());
    }
    Ok(samples)
}

fn read_histogram(path: &Path) -> AppResult<ByteErrorHistogram> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut histogram = ByteErrorHistogram::new();
    for row in reader.deserialize::<DiagnosticRow>() {
        let row = row?;
        histogram.set(row.byte, row.count);
    }
    Ok(histogram)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Position;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn file_name_lists_first_and_last_speed() {
        let mut store = SampleStore::with_speeds(&[115_200, 9600, 57_600]);
        assert_eq!(
            generate_file_name(&store, at(14, 7, 9)),
            "2024-03-05_14-07-09_9600-115200"
        );

        store = SampleStore::with_speeds(&[9600]);
        assert_eq!(generate_file_name(&store, at(1, 2, 3)), "2024-03-05_01-02-03_9600");

        assert_eq!(
            generate_file_name(&SampleStore::new(), at(1, 2, 3)),
            "2024-03-05_01-02-03"
        );
    }

    #[test]
    fn empty_speed_still_gets_a_sheet() {
        let dir = tempdir().unwrap();
        let table = SampleTable::named(dir.path(), FALLBACK_NAME);

        table.save(&SampleStore::with_speeds(&[9600]), None).unwrap();
        let (loaded, histogram) = table.load().unwrap();

        assert_eq!(loaded.speeds().collect::<Vec<_>>(), vec![9600]);
        assert!(loaded.is_empty());
        assert!(histogram.is_none());
    }

    #[test]
    fn unreadable_sheets_are_skipped() {
        let dir = tempdir().unwrap();
        let table = SampleTable::new(dir.path());
        let mut store = SampleStore::new();
        store.append(9600, Sample::new(Position::new(0.5, 0.0, 0.0), 1.0));
        table.save(&store, None).unwrap();

        fs::write(dir.path().join("notes.csv"), "hello\n").unwrap();
        fs::write(
            dir.path().join("4800.csv"),
            "x [mm],y [mm],z [mm],measurement (0~1)\n1,2,three,0.5\n",
        )
        .unwrap();
        fs::write(dir.path().join("readme.txt"), "ignored").unwrap();

        let (loaded, _) = table.load().unwrap();
        assert_eq!(loaded, store);
    }

    #[test]
    fn missing_directory_is_a_persistence_error() {
        let dir = tempdir().unwrap();
        let err = SampleTable::new(dir.path().join("nope")).load().unwrap_err();
        assert!(matches!(err, IrAlignError::Persistence(_)));
    }
}

//! Marlin G-code vocabulary: the handful of commands the rig sends and the
//! `M114` position report it parses.
//!
//! A report looks like
//!
//! ```text
//! X:100.00Y:225.00Z:219.00E:0.00 Count X: 2.46Y:225.00Z:219.00E:0.00
//! ```
//!
//! The part before `Count` is the target of the last move, the part after it
//! the step-counter position. Some firmware builds report the counters in raw
//! steps, so the counter triple is multiplied by a per-axis scale.

use thiserror::Error;
use tracing::warn;

use crate::geometry::Position;
use crate::hardware::capabilities::PositionReport;

/// Home all axes.
pub const HOME_ALL: &str = "G28";
/// Disable stepper holding torque.
pub const DISABLE_STEPPERS: &str = "M18";
/// Stop periodic position reports.
pub const DISABLE_AUTO_POSITION_REPORT: &str = "M154 S0";
/// Stop periodic temperature reports.
pub const DISABLE_AUTO_TEMPERATURE_REPORT: &str = "M155 S0";
/// Report target and counter position.
pub const REPORT_POSITION: &str = "M114";
/// Acknowledgement line sent after every accepted command.
pub const ACK: &str = "ok";

const REPORT_SEPARATOR: &str = "Count";
const MOVE_DECIMALS: i32 = 3;

/// Failure to make sense of an `M114` reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReportParseError {
    #[error("expected exactly one 'Count' in {0:?}")]
    MissingSeparator(String),

    #[error("axis {axis} missing from {raw:?}")]
    MissingAxis { axis: char, raw: String },

    #[error("axis {axis} has unparseable value {value:?}")]
    InvalidValue { axis: char, value: String },

    #[error("value without axis letter in {0:?}")]
    MissingAxisLetter(String),
}

fn round_to_decimals(value: f64) -> f64 {
    let scale = 10f64.powi(MOVE_DECIMALS);
    (value * scale).round() / scale
}

/// `G0` linear move. Coordinates are rounded to 3 decimals; the feedrate
/// (mm/min) is only sent when positive.
pub fn linear_move(target: Position, feedrate: f64) -> String {
    let mut command = format!(
        "G0 X{} Y{} Z{}",
        round_to_decimals(target.x),
        round_to_decimals(target.y),
        round_to_decimals(target.z)
    );
    if feedrate > 0.0 {
        command.push_str(&format!(" F{}", round_to_decimals(feedrate)));
    }
    command
}

/// Parse an `M114` reply (acknowledgement already stripped).
///
/// `count_scale` converts the counter triple to millimeters.
pub fn parse_position_report(
    response: &str,
    count_scale: [f64; 3],
) -> Result<PositionReport, ReportParseError> {
    let parts: Vec<&str> = response.split(REPORT_SEPARATOR).collect();
    let [target, counters] = parts.as_slice() else {
        return Err(ReportParseError::MissingSeparator(response.to_string()));
    };

    let target = parse_axes(target)?;
    let current = parse_axes(counters)?.scaled(count_scale);
    Ok(PositionReport { target, current })
}

/// Parse one `X:..Y:..Z:..` run. Axis `E` is skipped quietly, any other
/// unknown letter is logged and skipped.
fn parse_axes(segment: &str) -> Result<Position, ReportParseError> {
    let mut values: [Option<f64>; 3] = [None; 3];
    let mut rest = segment;

    while let Some(colon) = rest.find(':') {
        let axis = rest[..colon].trim_end().chars().last();
        let after = rest[colon + 1..].trim_start();
        let end = after
            .find(|c: char| c.is_ascii_alphabetic() || c == ' ')
            .unwrap_or(after.len());
        let raw_value = &after[..end];
        rest = &after[end..];

        let index = match axis {
            Some('X') => 0,
            Some('Y') => 1,
            Some('Z') => 2,
            Some('E') => continue,
            Some(other) => {
                warn!(axis = %other, segment, "ignoring unknown axis in position report");
                continue;
            }
            None => return Err(ReportParseError::MissingAxisLetter(segment.to_string())),
        };
        let value = raw_value
            .parse::<f64>()
            .map_err(|_| ReportParseError::InvalidValue {
                axis: axis.unwrap_or('?'),
                value: raw_value.to_string(),
            })?;
        values[index] = Some(value);
    }

    let axis_value = |index: usize, axis: char| {
        values[index].ok_or_else(|| ReportParseError::MissingAxis {
            axis,
            raw: segment.to_string(),
        })
    };
    Ok(Position::new(
        axis_value(0, 'X')?,
        axis_value(1, 'Y')?,
        axis_value(2, 'Z')?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: [f64; 3] = [1.0, 1.0, 1.0];

    #[test]
    fn move_rounds_and_omits_non_positive_feedrate() {
        let target = Position::new(116.5, 108.123456, 11.25);
        assert_eq!(linear_move(target, 1200.0), "G0 X116.5 Y108.123 Z11.25 F1200");
        assert_eq!(linear_move(target, -1.0), "G0 X116.5 Y108.123 Z11.25");
        assert_eq!(linear_move(target, 0.0), "G0 X116.5 Y108.123 Z11.25");
    }

    #[test]
    fn parses_target_and_counters() {
        let report = parse_position_report(
            "X:100.00Y:225.00Z:219.00E:0.00 Count X: 2.46Y:225.00Z:219.00E:0.00",
            UNIT,
        )
        .unwrap();
        assert_eq!(report.target, Position::new(100.0, 225.0, 219.0));
        assert_eq!(report.current, Position::new(2.46, 225.0, 219.0));
    }

    #[test]
    fn counters_are_scaled() {
        let report = parse_position_report(
            "X:0.00Y:0.00Z:0.00E:0.00 Count X:160.0Y:80.0Z:400.0",
            [0.5, 1.0, 0.25],
        )
        .unwrap();
        assert_eq!(report.current, Position::new(80.0, 80.0, 100.0));
        assert_eq!(report.target, Position::ZERO);
    }

    #[test]
    fn negative_values_parse() {
        let report =
            parse_position_report("X:-1.50Y:2.00Z:-0.25 Count X:-1.50Y:2.00Z:-0.25", UNIT)
                .unwrap();
        assert_eq!(report.target, Position::new(-1.5, 2.0, -0.25));
    }

    #[test]
    fn separator_must_appear_once() {
        assert!(matches!(
            parse_position_report("X:0.00Y:0.00Z:0.00", UNIT),
            Err(ReportParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            parse_position_report("X:0 Count X:0 Count X:0", UNIT),
            Err(ReportParseError::MissingSeparator(_))
        ));
    }

    #[test]
    fn unknown_axis_is_ignored() {
        let report =
            parse_position_report("X:1.0Y:2.0Z:3.0B:9.0 Count X:1.0Y:2.0Q:7.0Z:3.0", UNIT).unwrap();
        assert_eq!(report.current, Position::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn missing_axis_is_an_error() {
        let err = parse_position_report("X:1.0Y:2.0 Count X:1.0Y:2.0Z:3.0", UNIT).unwrap_err();
        assert!(matches!(err, ReportParseError::MissingAxis { axis: 'Z', .. }));
    }

    #[test]
    fn garbage_value_is_an_error() {
        let err = parse_position_report("X:abc Count X:1.0Y:2.0Z:3.0", UNIT).unwrap_err();
        assert!(matches!(err, ReportParseError::InvalidValue { axis: 'X', .. }));
    }
}

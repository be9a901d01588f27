//! Operator commands.
//!
//! Key presses are translated into [`OperatorCommand`]s and queued on an
//! unbounded channel; the scan driver drains the queue once per loop
//! iteration.
//!
//! | key | command |
//! |---|---|
//! | space | start / pause scanning |
//! | `h` | home all axes |
//! | `l` | disable motors |
//! | `w` `s` | jog +y / -y |
//! | `d` `a` | jog +x / -x |
//! | `e` `q` | jog +z / -z |
//! | `r` | back to the relative origin |
//! | `k` | save a snapshot of the samples |
//! | `v` | print the envelope report |
//! | `x` | quit |

use std::fmt;
use tokio::sync::mpsc;

use crate::geometry::Position;

/// Manual jog direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogDirection {
    XPlus,
    XMinus,
    YPlus,
    YMinus,
    ZPlus,
    ZMinus,
}

impl JogDirection {
    /// Offset for one jog, given the per-axis step.
    pub fn delta(self, step: Position) -> Position {
        match self {
            JogDirection::XPlus => Position::new(step.x, 0.0, 0.0),
            JogDirection::XMinus => Position::new(-step.x, 0.0, 0.0),
            JogDirection::YPlus => Position::new(0.0, step.y, 0.0),
            JogDirection::YMinus => Position::new(0.0, -step.y, 0.0),
            JogDirection::ZPlus => Position::new(0.0, 0.0, step.z),
            JogDirection::ZMinus => Position::new(0.0, 0.0, -step.z),
        }
    }
}

/// Something the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    ToggleScan,
    Home,
    DisableMotors,
    Jog(JogDirection),
    ResetOrigin,
    Snapshot,
    ViewReport,
    Quit,
}

impl OperatorCommand {
    /// Map a key to its command.
    pub fn from_key(key: char) -> Option<Self> {
        let command = match key {
            ' ' => OperatorCommand::ToggleScan,
            'h' => OperatorCommand::Home,
            'l' => OperatorCommand::DisableMotors,
            'w' => OperatorCommand::Jog(JogDirection::YPlus),
            's' => OperatorCommand::Jog(JogDirection::YMinus),
            'd' => OperatorCommand::Jog(JogDirection::XPlus),
            'a' => OperatorCommand::Jog(JogDirection::XMinus),
            'e' => OperatorCommand::Jog(JogDirection::ZPlus),
            'q' => OperatorCommand::Jog(JogDirection::ZMinus),
            'r' => OperatorCommand::ResetOrigin,
            'k' => OperatorCommand::Snapshot,
            'v' => OperatorCommand::ViewReport,
            'x' => OperatorCommand::Quit,
            _ => return None,
        };
        Some(command)
    }

    /// Commands for every recognized key in a line of input. An empty line
    /// toggles scanning, since a terminal only delivers input on Enter.
    pub fn parse_line(line: &str) -> Vec<Self> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return vec![OperatorCommand::ToggleScan];
        }
        trimmed.chars().filter_map(Self::from_key).collect()
    }

    /// Whether the command must wait until scanning is paused.
    pub fn requires_idle(&self) -> bool {
        matches!(
            self,
            OperatorCommand::Home
                | OperatorCommand::DisableMotors
                | OperatorCommand::Jog(_)
                | OperatorCommand::ResetOrigin
                | OperatorCommand::ViewReport
        )
    }
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorCommand::ToggleScan => write!(f, "toggle scan"),
            OperatorCommand::Home => write!(f, "home"),
            OperatorCommand::DisableMotors => write!(f, "disable motors"),
            OperatorCommand::Jog(direction) => write!(f, "jog {:?}", direction),
            OperatorCommand::ResetOrigin => write!(f, "reset to origin"),
            OperatorCommand::Snapshot => write!(f, "snapshot"),
            OperatorCommand::ViewReport => write!(f, "view report"),
            OperatorCommand::Quit => write!(f, "quit"),
        }
    }
}

pub type OperatorSender = mpsc::UnboundedSender<OperatorCommand>;
pub type OperatorReceiver = mpsc::UnboundedReceiver<OperatorCommand>;

/// Queue between whoever reads the keyboard and the scan driver.
pub fn operator_channel() -> (OperatorSender, OperatorReceiver) {
    mpsc::unbounded_channel()
}

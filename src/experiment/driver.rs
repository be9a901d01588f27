//! Scan driver: the rig's control loop.
//!
//! Once per iteration the driver drains the operator queue, asks the stage
//! where it is and, while scanning and once the head has arrived, measures the
//! link, stores the sample and moves on to the next scan position.
//!
//! # State Machine
//!
//! ```text
//! Idle ──toggle──> Scanning ──last speed exhausted──> Completed
//!   ▲                 │                                  │
//!   └─────toggle──────┘                                  │
//!   └────────────────── saved + reported ────────────────┘
//! ```
//!
//! Manual operations (home, jog, ...) are only accepted while not scanning.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::RigConfig;
use crate::data::report::{LogReporter, Reporter};
use crate::data::sample_store::{Sample, SampleStore};
use crate::data::table::{generate_file_name, SampleTable, FALLBACK_NAME};
use crate::error::{AppResult, IrAlignError};
use crate::experiment::operator::{OperatorCommand, OperatorReceiver};
use crate::experiment::scan_path::{Advance, ScanParams, ScanPathGenerator};
use crate::geometry::{Position, LAYER_Z_TOLERANCE};
use crate::hardware::capabilities::{LinkTransport, MotionController, PositionReport};
use crate::measurement::probe::LinkProbe;

/// Scan driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Not scanning; manual operations allowed
    Idle,
    /// Measuring along the scan path
    Scanning,
    /// Every speed exhausted; persisting and reporting
    Completed,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "Idle"),
            ScanState::Scanning => write!(f, "Scanning"),
            ScanState::Completed => write!(f, "Completed"),
        }
    }
}

/// What the run loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Everything the driver knows about the ongoing session.
#[derive(Debug, Clone, Default)]
pub struct ScanSession {
    /// Collected samples per link speed.
    pub store: SampleStore,
    /// Commanded position, relative frame.
    pub desired: Position,
    /// Latest position feedback, absolute frame. `None` after a failed query.
    pub feedback: Option<PositionReport>,
    pub homed: bool,
    pub motors_disabled: bool,
    /// Set once a run completed; the next start begins a fresh store.
    pub finished: bool,
}

/// Driver settings, usually taken from [`RigConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    /// Absolute position of the relative origin.
    pub origin: Position,
    pub match_tolerance: f64,
    pub safe_feedrate: f64,
    pub jog_feedrate: f64,
    pub jog_step: Position,
    /// Link speeds, in scan order. Never empty.
    pub speeds: Vec<u32>,
    pub passes: u32,
    /// Pause between a speed change and the flush.
    pub settle: Duration,
    pub poll_interval: Duration,
    pub output_dir: PathBuf,
}

impl DriverSettings {
    pub fn from_config(config: &RigConfig) -> Self {
        Self {
            origin: config.origin(),
            match_tolerance: config.motion.match_tolerance,
            safe_feedrate: config.motion.safe_feedrate,
            jog_feedrate: config.motion.jog_feedrate,
            jog_step: config.jog_step(),
            speeds: config.link.speeds.clone(),
            passes: config.link.passes,
            settle: Duration::from_millis(config.link.settle_ms),
            poll_interval: config.poll_interval(),
            output_dir: config.storage.output_dir.clone(),
        }
    }
}

/// Whether the head counts as arrived: L1 distance within `tolerance`.
pub fn gate_passes(desired: Position, current: Position, tolerance: f64) -> bool {
    current.matches(&desired, tolerance)
}

/// The control loop over a stage `M` and a link `L`.
pub struct ScanDriver<M, L> {
    motion: M,
    link: L,
    settings: DriverSettings,
    params: ScanParams,
    generator: ScanPathGenerator,
    probe: LinkProbe,
    session: ScanSession,
    state: ScanState,
    reporter: Box<dyn Reporter>,
    /// Moves not yet acknowledged, sent in order before anything else.
    pending_moves: VecDeque<(Position, f64)>,
    last_saved: Option<PathBuf>,
}

impl<M: MotionController, L: LinkTransport> ScanDriver<M, L> {
    /// Fails with [`IrAlignError::Configuration`] when `settings` lists no
    /// link speed.
    pub fn new(
        motion: M,
        link: L,
        settings: DriverSettings,
        params: ScanParams,
    ) -> AppResult<Self> {
        if settings.speeds.is_empty() {
            return Err(IrAlignError::Configuration(
                "driver needs at least one link speed".to_string(),
            ));
        }
        if let Some(zero) = settings.speeds.iter().find(|&&s| s == 0) {
            return Err(IrAlignError::Configuration(format!(
                "invalid link speed {}",
                zero
            )));
        }
        let reporter = Box::new(LogReporter::new(params.continuation_threshold));
        Ok(Self {
            motion,
            link,
            generator: ScanPathGenerator::new(params.clone()),
            probe: LinkProbe::new(settings.passes),
            session: ScanSession {
                store: SampleStore::with_speeds(&settings.speeds),
                ..ScanSession::default()
            },
            state: ScanState::Idle,
            reporter,
            pending_moves: VecDeque::new(),
            last_saved: None,
            settings,
            params,
        })
    }

    pub fn from_config(motion: M, link: L, config: &RigConfig) -> AppResult<Self> {
        Self::new(
            motion,
            link,
            DriverSettings::from_config(config),
            config.scan_params(),
        )
    }

    /// Send summaries somewhere other than the log.
    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn session(&self) -> &ScanSession {
        &self.session
    }

    pub fn store(&self) -> &SampleStore {
        &self.session.store
    }

    pub fn generator(&self) -> &ScanPathGenerator {
        &self.generator
    }

    pub fn motion(&self) -> &M {
        &self.motion
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn probe(&self) -> &LinkProbe {
        &self.probe
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Directory of the most recent successful save.
    pub fn last_saved(&self) -> Option<&PathBuf> {
        self.last_saved.as_ref()
    }

    fn active_speed(&self) -> u32 {
        let index = self.generator.cursor().speed_index;
        self.settings.speeds[index.min(self.settings.speeds.len() - 1)]
    }

    /// Quiet the stage and bring the link to the first scan speed.
    pub async fn initialize(&mut self) -> AppResult<()> {
        if let Err(e) = self.motion.disable_auto_reports().await {
            warn!(error = %e, "could not disable auto reports");
        }
        let first = self.settings.speeds[0];
        if self.link.speed() != first {
            self.link
                .set_speed(first)
                .await
                .map_err(|e| IrAlignError::Link(format!("{:#}", e)))?;
        }
        Ok(())
    }

    /// Apply one operator command.
    ///
    /// Manual operations while scanning are rejected with
    /// [`IrAlignError::CommandRejected`].
    #[instrument(skip(self))]
    pub async fn handle(&mut self, command: OperatorCommand) -> AppResult<Flow> {
        if command.requires_idle() && self.state == ScanState::Scanning {
            return Err(IrAlignError::CommandRejected {
                command: command.to_string(),
                state: self.state.to_string(),
            });
        }

        match command {
            OperatorCommand::ToggleScan => match self.state {
                ScanState::Scanning => self.pause(),
                ScanState::Idle | ScanState::Completed => self.start().await,
            },
            OperatorCommand::Home => {
                let result = self.motion.home().await;
                self.session.homed = result.is_ok();
                self.session.motors_disabled = false;
                if let Err(e) = result {
                    warn!(error = %e, "homing failed");
                }
            }
            OperatorCommand::DisableMotors => {
                let result = self.motion.disable_motors().await;
                self.session.motors_disabled = result.is_ok();
                if let Err(e) = result {
                    warn!(error = %e, "disabling motors failed");
                }
            }
            OperatorCommand::Jog(direction) => {
                self.session.desired = self.session.desired + direction.delta(self.settings.jog_step);
                self.command_moves(&[(self.session.desired, self.settings.jog_feedrate)])
                    .await;
            }
            OperatorCommand::ResetOrigin => {
                self.session.desired = Position::ZERO;
                self.command_moves(&[(Position::ZERO, self.settings.safe_feedrate)])
                    .await;
            }
            OperatorCommand::Snapshot => {
                let name = generate_file_name(&self.session.store, Local::now().naive_local());
                if let Err(e) = self.save(&name) {
                    warn!(error = %e, "snapshot failed");
                }
            }
            OperatorCommand::ViewReport => self.reporter.report(&self.session.store),
            OperatorCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    /// Start (or resume) scanning at the generator's current position.
    pub async fn start(&mut self) {
        if self.session.finished {
            info!("starting a fresh run");
            self.session.store = SampleStore::with_speeds(&self.settings.speeds);
            self.session.finished = false;
            self.generator.begin_speed(0);
            self.switch_speed(self.settings.speeds[0]).await;
        }
        self.session.desired = self.generator.position();
        self.state = ScanState::Scanning;
        info!(desired = %self.session.desired, speed = self.active_speed(), "scanning");
        self.command_moves(&[(self.session.desired, self.settings.safe_feedrate)])
            .await;
    }

    pub fn pause(&mut self) {
        self.state = ScanState::Idle;
        info!(cursor = ?self.generator.cursor(), "scan paused");
    }

    /// One control-loop iteration. Recoverable problems are logged and left
    /// for the next iteration.
    pub async fn tick(&mut self) -> AppResult<()> {
        let report = match self.motion.query_position().await {
            Ok(report) => report,
            Err(e) => {
                debug!(error = %e, "no position feedback");
                self.session.feedback = None;
                return Ok(());
            }
        };
        self.session.feedback = Some(report);

        if !self.pending_moves.is_empty() {
            debug!(queued = self.pending_moves.len(), "retrying unacknowledged moves");
            self.flush_moves().await;
            return Ok(());
        }

        if self.state != ScanState::Scanning {
            return Ok(());
        }

        let current = report.current.to_relative(self.settings.origin);
        if !gate_passes(self.session.desired, current, self.settings.match_tolerance) {
            trace!(desired = %self.session.desired, %current, "waiting for arrival");
            return Ok(());
        }

        let speed = self.active_speed();
        let score = match self.probe.measure(&self.link).await {
            Ok(score) => score,
            Err(e) => {
                warn!(error = %e, speed, "link probe failed");
                return Ok(());
            }
        };

        let sampled = self.session.desired;
        self.session.store.append(speed, Sample::new(sampled, score));
        info!(
            position = %sampled,
            score = %format!("{:.3}", score),
            good_bytes = (score * 256.0).round() as u32,
            speed,
            "measurement"
        );

        match self.generator.advance(sampled, &self.session.store, speed) {
            Advance::Next(next) => self.session.desired = next,
            Advance::SpeedExhausted => {
                let next_index = self.generator.cursor().speed_index + 1;
                match self.settings.speeds.get(next_index).copied() {
                    Some(next_speed) => {
                        info!(from = speed, to = next_speed, "speed exhausted, switching");
                        self.switch_speed(next_speed).await;
                        self.session.desired = self.generator.begin_speed(next_index);
                    }
                    None => {
                        self.complete();
                        return Ok(());
                    }
                }
            }
        }

        let desired = self.session.desired;
        let mut moves = Vec::with_capacity(2);
        if (desired.z - sampled.z).abs() > LAYER_Z_TOLERANCE {
            // Change height first, at the x/y the stage was last told to hold.
            let hold = report.target.to_relative(self.settings.origin).with_z(desired.z);
            moves.push((hold, -1.0));
        }
        moves.push((desired, -1.0));
        self.command_moves(&moves).await;

        debug!(
            progress = %format!("{:.0}%", self.generator.progress() * 100.0),
            cursor = ?self.generator.cursor(),
            "scan progress"
        );
        Ok(())
    }

    /// Drive the loop until `Quit`, or until the queue is closed while idle.
    pub async fn run(&mut self, events: &mut OperatorReceiver) -> AppResult<()> {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let mut closed = false;
            loop {
                match events.try_recv() {
                    Ok(command) => match self.handle(command).await {
                        Ok(Flow::Quit) => {
                            info!("quit requested");
                            return Ok(());
                        }
                        Ok(Flow::Continue) => {}
                        Err(e) if e.is_recoverable() => warn!(error = %e, "command failed"),
                        Err(e) => return Err(e),
                    },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        closed = true;
                        break;
                    }
                }
            }
            if closed && self.state != ScanState::Scanning {
                info!("operator queue closed");
                return Ok(());
            }

            self.tick().await?;
        }
    }

    /// Persist the store as `<output_dir>/<name>`.
    pub fn save(&mut self, name: &str) -> AppResult<PathBuf> {
        let table = SampleTable::named(&self.settings.output_dir, name);
        table.save(&self.session.store, Some(self.probe.histogram()))?;
        let path = table.path().to_path_buf();
        self.last_saved = Some(path.clone());
        Ok(path)
    }

    /// Best-effort final save under the fallback name.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        if self.session.store.is_empty() {
            info!("nothing collected, skipping final save");
            return Ok(());
        }
        match self.save(FALLBACK_NAME) {
            Ok(path) => {
                info!(path = %path.display(), "final save done");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "final save failed");
                Err(IrAlignError::ShutdownFailed(vec![e]))
            }
        }
    }

    fn complete(&mut self) {
        self.state = ScanState::Completed;
        info!(samples = self.session.store.total_len(), "scan complete");

        let name = generate_file_name(&self.session.store, Local::now().naive_local());
        if let Err(e) = self.save(&name) {
            error!(error = %e, "saving completed scan failed");
        }
        self.reporter.report(&self.session.store);

        self.session.finished = true;
        self.state = ScanState::Idle;
    }

    /// Reconfigure the link, let it settle, drop whatever the change produced.
    async fn switch_speed(&mut self, speed: u32) {
        if self.link.speed() == speed {
            return;
        }
        if let Err(e) = self.link.set_speed(speed).await {
            warn!(error = %e, speed, "link speed change failed");
        }
        tokio::time::sleep(self.settings.settle).await;
        match self.link.discard_pending().await {
            Ok(garbage) if !garbage.is_empty() => {
                debug!(count = garbage.len(), "discarded bytes after speed change")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "flush after speed change failed"),
        }
    }

    /// Queue moves to relative positions and send as many as the stage
    /// acknowledges. Returns whether the queue is empty afterwards.
    async fn command_moves(&mut self, moves: &[(Position, f64)]) -> bool {
        self.pending_moves.extend(moves.iter().copied());
        self.flush_moves().await
    }

    /// Send queued moves in order, stopping at the first one not
    /// acknowledged. That move and everything after it stay queued.
    async fn flush_moves(&mut self) -> bool {
        while let Some(&(target, feedrate)) = self.pending_moves.front() {
            let absolute = target.to_absolute(self.settings.origin);
            if let Err(e) = self.motion.move_to(absolute, feedrate).await {
                warn!(
                    error = %e,
                    %target,
                    queued = self.pending_moves.len(),
                    "move not acknowledged"
                );
                return false;
            }
            self.pending_moves.pop_front();
        }
        true
    }

    pub fn scan_params(&self) -> &ScanParams {
        &self.params
    }
}

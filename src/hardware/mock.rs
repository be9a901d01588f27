//! Mock Hardware Implementations
//!
//! Simulated rig hardware for tests and `ir-align simulate`. Nothing here
//! sleeps for real; motion advances a fixed distance per position query.
//!
//! # Available Mocks
//!
//! - `MockMotionStage` - stage that creeps toward its target on every query
//! - `SimulatedIrLink` - link whose echo probability depends on where the head is
//! - `EchoLink` - deterministic link answering each byte through a function

use anyhow::Result;
use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::trace;

use crate::error::IrAlignError;
use crate::geometry::Position;
use crate::hardware::capabilities::{LinkTransport, MotionController, PositionReport};
use crate::hardware::gcode;

/// Head position shared between the mock stage and a simulated link.
pub type SharedHeadPosition = Arc<RwLock<Position>>;

// =============================================================================
// MockMotionStage
// =============================================================================

#[derive(Debug, Default)]
struct StageState {
    target: Position,
    moves: Vec<(Position, f64)>,
    homed: u32,
    motors_enabled: bool,
    auto_reports: bool,
}

/// Mock three-axis stage.
///
/// Each `query_position` moves the head up to `step_per_query` mm per axis
/// toward the last commanded target, like a printer reporting mid-move.
///
/// ```rust,ignore
/// let stage = MockMotionStage::new(f64::INFINITY);
/// stage.move_to(Position::new(1.0, 2.0, 3.0), 1200.0).await?;
/// assert_eq!(stage.query_position().await?.current, Position::new(1.0, 2.0, 3.0));
/// ```
pub struct MockMotionStage {
    state: RwLock<StageState>,
    head: SharedHeadPosition,
    step_per_query: f64,
    home_position: Position,
    feedback_error: RwLock<Position>,
    failing_queries: AtomicUsize,
    failing_moves: AtomicUsize,
}

impl MockMotionStage {
    /// Stage at the origin; `step_per_query` of infinity arrives on the first query.
    pub fn new(step_per_query: f64) -> Self {
        Self {
            state: RwLock::new(StageState {
                auto_reports: true,
                ..StageState::default()
            }),
            head: Arc::new(RwLock::new(Position::ZERO)),
            step_per_query,
            home_position: Position::ZERO,
            feedback_error: RwLock::new(Position::ZERO),
            failing_queries: AtomicUsize::new(0),
            failing_moves: AtomicUsize::new(0),
        }
    }

    /// Where homing parks the head.
    pub fn with_home_position(mut self, home: Position) -> Self {
        self.home_position = home;
        self
    }

    /// Handle for links that need to know where the head is.
    pub fn head(&self) -> SharedHeadPosition {
        self.head.clone()
    }

    /// Add a constant error to every reported counter position.
    pub async fn set_feedback_error(&self, error: Position) {
        *self.feedback_error.write().await = error;
    }

    /// Make the next `count` position queries time out.
    pub fn fail_next_queries(&self, count: usize) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` moves go unacknowledged. A failed move is
    /// neither recorded nor executed.
    pub fn fail_next_moves(&self, count: usize) {
        self.failing_moves.store(count, Ordering::SeqCst);
    }

    /// Every move so far, as (absolute target, feedrate).
    pub async fn moves(&self) -> Vec<(Position, f64)> {
        self.state.read().await.moves.clone()
    }

    pub async fn home_count(&self) -> u32 {
        self.state.read().await.homed
    }

    pub async fn motors_enabled(&self) -> bool {
        self.state.read().await.motors_enabled
    }

    pub async fn auto_reports_enabled(&self) -> bool {
        self.state.read().await.auto_reports
    }
}

impl Default for MockMotionStage {
    fn default() -> Self {
        Self::new(f64::INFINITY)
    }
}

fn approach(current: f64, target: f64, step: f64) -> f64 {
    let delta = target - current;
    if delta.abs() <= step {
        target
    } else {
        current + step.copysign(delta)
    }
}

#[async_trait]
impl MotionController for MockMotionStage {
    async fn home(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.homed += 1;
        state.motors_enabled = true;
        state.target = self.home_position;
        *self.head.write().await = self.home_position;
        Ok(())
    }

    async fn disable_motors(&self) -> Result<()> {
        self.state.write().await.motors_enabled = false;
        Ok(())
    }

    async fn disable_auto_reports(&self) -> Result<()> {
        self.state.write().await.auto_reports = false;
        Ok(())
    }

    async fn query_position(&self) -> Result<PositionReport> {
        let failing = self.failing_queries.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_queries.store(failing - 1, Ordering::SeqCst);
            return Err(IrAlignError::AckTimeout {
                command: gcode::REPORT_POSITION.to_string(),
                received: String::new(),
            }
            .into());
        }

        let target = self.state.read().await.target;
        let mut head = self.head.write().await;
        *head = Position::new(
            approach(head.x, target.x, self.step_per_query),
            approach(head.y, target.y, self.step_per_query),
            approach(head.z, target.z, self.step_per_query),
        );
        let current = *head + *self.feedback_error.read().await;
        trace!(%target, %current, "mock stage report");
        Ok(PositionReport { target, current })
    }

    async fn move_to(&self, target: Position, feedrate: f64) -> Result<()> {
        let failing = self.failing_moves.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_moves.store(failing - 1, Ordering::SeqCst);
            return Err(IrAlignError::AckTimeout {
                command: gcode::linear_move(target, feedrate),
                received: String::new(),
            }
            .into());
        }

        let mut state = self.state.write().await;
        state.motors_enabled = true;
        state.target = target;
        state.moves.push((target, feedrate));
        Ok(())
    }
}

// =============================================================================
// SimulatedIrLink
// =============================================================================

/// Cone-shaped region above an emitter where the link works.
///
/// At height `dz` above the apex the usable radius is
/// `base_radius + spread · dz`, shrinking with link speed as
/// `sqrt(reference_speed / speed)` (never growing past 1×). Above
/// `max_height` nothing gets through.
#[derive(Debug, Clone, PartialEq)]
pub struct ConeField {
    pub apex: Position,
    pub base_radius: f64,
    pub spread: f64,
    pub max_height: f64,
    pub reference_speed: u32,
}

impl ConeField {
    /// Cone standing on `apex` with the default rig-sized envelope.
    pub fn at(apex: Position) -> Self {
        Self {
            apex,
            base_radius: 1.0,
            spread: 0.4,
            max_height: 3.0,
            reference_speed: 9600,
        }
    }

    /// Probability that one byte is echoed intact at `head` and `speed`.
    pub fn success_probability(&self, head: Position, speed: u32) -> f64 {
        let offset = head - self.apex;
        if offset.z < -0.5 || offset.z > self.max_height {
            return 0.0;
        }
        let speed_factor =
            (f64::from(self.reference_speed) / f64::from(speed.max(1))).sqrt().min(1.0);
        let radius = (self.base_radius + self.spread * offset.z.max(0.0)) * speed_factor;
        let distance = offset.horizontal_radius();
        if distance <= radius {
            0.98
        } else if distance <= radius * 1.5 {
            0.5
        } else {
            0.0
        }
    }
}

/// Simulated IR link echoing bytes according to a [`ConeField`].
///
/// Lost bytes are either dropped or arrive with one bit flipped; seeded so a
/// simulated scan is reproducible.
pub struct SimulatedIrLink {
    field: ConeField,
    head: SharedHeadPosition,
    rng: Mutex<ChaCha8Rng>,
    pending: Mutex<VecDeque<u8>>,
    speed: AtomicU32,
}

impl SimulatedIrLink {
    pub fn new(field: ConeField, head: SharedHeadPosition, speed: u32, seed: u64) -> Self {
        Self {
            field,
            head,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            pending: Mutex::new(VecDeque::new()),
            speed: AtomicU32::new(speed),
        }
    }
}

#[async_trait]
impl LinkTransport for SimulatedIrLink {
    async fn send_byte(&self, byte: u8) -> Result<()> {
        let head = *self.head.read().await;
        let p = self
            .field
            .success_probability(head, self.speed())
            .clamp(0.0, 1.0);
        let mut rng = self.rng.lock().await;
        if rng.gen_bool(p) {
            self.pending.lock().await.push_back(byte);
        } else if rng.gen_bool(0.5) {
            let bit = rng.gen_range(0..8);
            self.pending.lock().await.push_back(byte ^ (1 << bit));
        }
        Ok(())
    }

    async fn recv_byte(&self) -> Result<Option<u8>> {
        Ok(self.pending.lock().await.pop_front())
    }

    async fn discard_pending(&self) -> Result<Vec<u8>> {
        Ok(self.pending.lock().await.drain(..).collect())
    }

    async fn set_speed(&self, speed: u32) -> Result<()> {
        self.speed.store(speed, Ordering::SeqCst);
        Ok(())
    }

    fn speed(&self) -> u32 {
        self.speed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// EchoLink
// =============================================================================

/// Deterministic link: every sent byte is answered with `respond(byte)`,
/// which may be several bytes or none.
pub struct EchoLink {
    respond: Box<dyn Fn(u8) -> Vec<u8> + Send + Sync>,
    pending: Mutex<VecDeque<u8>>,
    speed: AtomicU32,
    speed_changes: Mutex<Vec<u32>>,
}

impl EchoLink {
    pub fn new(speed: u32, respond: impl Fn(u8) -> Vec<u8> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            pending: Mutex::new(VecDeque::new()),
            speed: AtomicU32::new(speed),
            speed_changes: Mutex::new(Vec::new()),
        }
    }

    /// A link that echoes everything.
    pub fn perfect(speed: u32) -> Self {
        Self::new(speed, |byte| vec![byte])
    }

    /// Queue bytes as if they had arrived unsolicited.
    pub async fn inject(&self, bytes: &[u8]) {
        self.pending.lock().await.extend(bytes.iter().copied());
    }

    /// Every speed passed to `set_speed`, in order.
    pub async fn speed_changes(&self) -> Vec<u32> {
        self.speed_changes.lock().await.clone()
    }
}

#[async_trait]
impl LinkTransport for EchoLink {
    async fn send_byte(&self, byte: u8) -> Result<()> {
        let answer = (self.respond)(byte);
        self.pending.lock().await.extend(answer);
        Ok(())
    }

    async fn recv_byte(&self) -> Result<Option<u8>> {
        Ok(self.pending.lock().await.pop_front())
    }

    async fn discard_pending(&self) -> Result<Vec<u8>> {
        Ok(self.pending.lock().await.drain(..).collect())
    }

    async fn set_speed(&self, speed: u32) -> Result<()> {
        self.speed.store(speed, Ordering::SeqCst);
        self.speed_changes.lock().await.push(speed);
        Ok(())
    }

    fn speed(&self) -> u32 {
        self.speed.load(Ordering::SeqCst)
    }
}

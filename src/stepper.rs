//! Half-step motion engine and its command-channel controller.
//!
//! The engine drives a 4-phase unipolar stepper (28BYJ-48 class) through an
//! 8-row half-step sequence. Moves execute on a dedicated blocking worker;
//! HTTP handlers talk to it over a command channel and await a completion
//! reply, so the async runtime never stalls for the physical duration of a
//! move while the response still arrives after the motor finishes. `stop`
//! and status reads bypass the channel through shared atomics.

use axum::body::Body;
use axum::extract::Extension;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::StepperConfig;
use crate::error::ApiError;
use crate::frames::read_bounded_json;
use crate::gpio::OutputPin;
use crate::state::AppState;

pub const MIN_SPEED_RPM: u32 = 1;
pub const MAX_SPEED_RPM: u32 = 15;
pub const MIN_STEP_DELAY_US: u64 = 800;
/// Long moves hand the thread back to the scheduler this often.
pub const YIELD_INTERVAL_HALF_STEPS: u64 = 100;

/// Standard half-step drive sequence for a 4-phase unipolar stepper.
/// Eight rows, each energizing one or two adjacent coils, forming one
/// continuous rotation cycle.
pub const HALF_STEP_SEQUENCE: [[bool; 4]; 8] = [
    [true, false, false, false],
    [true, true, false, false],
    [false, true, false, false],
    [false, true, true, false],
    [false, false, true, false],
    [false, false, true, true],
    [false, false, false, true],
    [true, false, false, true],
];

pub fn clamp_speed(speed: u32) -> u32 {
    speed.clamp(MIN_SPEED_RPM, MAX_SPEED_RPM)
}

/// Pulse interval for the given speed. The divisor 4096 is the number of
/// half-step transitions per output revolution (8 half-steps per 4 full
/// steps across the gearbox), floored at the motor's minimum safe delay.
pub fn step_delay_us(speed_rpm: u32) -> u64 {
    if speed_rpm == 0 {
        return MIN_STEP_DELAY_US;
    }
    (60_000_000 / (speed_rpm as u64 * 4096)).max(MIN_STEP_DELAY_US)
}

/// Step count for a rotation by `degrees` at the configured resolution.
pub fn steps_for_degrees(degrees: f64, steps_per_rev: u32) -> i64 {
    (degrees * steps_per_rev as f64 / 360.0).round() as i64
}

pub fn steps_for_revolutions(revolutions: f64, steps_per_rev: u32) -> i64 {
    (revolutions * steps_per_rev as f64).round() as i64
}

fn advance_phase(phase: u8, direction: i8) -> u8 {
    (phase as i16 + direction as i16).rem_euclid(8) as u8
}

/// State shared between the worker and the controller. Position and phase
/// live here so status reads and `stop` act without going through the
/// command queue.
#[derive(Debug, Default)]
pub struct MotionShared {
    phase: AtomicU8,
    position: AtomicI64,
    moving: AtomicBool,
    stop: AtomicBool,
}

pub type PinArray = [Box<dyn OutputPin>; 4];
pub type PinFactory = dyn Fn(u8) -> Box<dyn OutputPin> + Send + Sync;

struct MotionEngine {
    pins: PinArray,
    step_delay_us: u64,
    enabled: bool,
    shared: Arc<MotionShared>,
}

impl MotionEngine {
    fn new(pins: PinArray, config: &StepperConfig, shared: Arc<MotionShared>) -> Self {
        let mut engine = Self {
            pins,
            step_delay_us: step_delay_us(clamp_speed(config.speed)),
            enabled: config.enabled,
            shared,
        };
        engine.release_coils();
        engine
    }

    fn apply_config(&mut self, config: &StepperConfig, pins: PinArray) {
        self.release_coils();
        self.pins = pins;
        self.step_delay_us = step_delay_us(clamp_speed(config.speed));
        self.enabled = config.enabled;
        self.release_coils();
    }

    /// Drives all coils inactive. Idle coils avoid motor heating.
    fn release_coils(&mut self) {
        for pin in &mut self.pins {
            pin.set_low();
        }
    }

    fn drive_phase(&mut self, phase: u8) {
        let pattern = HALF_STEP_SEQUENCE[phase as usize];
        for (pin, level) in self.pins.iter_mut().zip(pattern) {
            if level {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
    }

    /// Executes a move of `steps` full steps, returning the number of
    /// half-step transitions performed. The cancellation flag is observed at
    /// each half-step boundary; position advances once per two half-steps.
    fn step(&mut self, steps: i64) -> u64 {
        if !self.enabled || steps == 0 {
            return 0;
        }

        let direction: i8 = if steps > 0 { 1 } else { -1 };
        let half_steps = steps.unsigned_abs() * 2;
        let mut executed = 0u64;

        for i in 0..half_steps {
            if self.shared.stop.load(Ordering::SeqCst) {
                break;
            }

            let phase = advance_phase(self.shared.phase.load(Ordering::SeqCst), direction);
            self.shared.phase.store(phase, Ordering::SeqCst);
            self.drive_phase(phase);
            busy_wait_us(self.step_delay_us);

            if i % 2 == 1 {
                self.shared
                    .position
                    .fetch_add(direction as i64, Ordering::SeqCst);
            }
            if i % YIELD_INTERVAL_HALF_STEPS == 0 {
                std::thread::yield_now();
            }
            executed += 1;
        }

        self.release_coils();
        executed
    }
}

/// Pulse-to-pulse delay. Sleeps the bulk and spins the tail; pulse timing
/// for this motor family tolerates the residual jitter.
fn busy_wait_us(micros: u64) {
    if micros == 0 {
        return;
    }
    let deadline = Instant::now() + Duration::from_micros(micros);
    if micros > 2_000 {
        std::thread::sleep(Duration::from_micros(micros - 1_000));
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

enum MotionCommand {
    Step {
        steps: i64,
        reply: oneshot::Sender<u64>,
    },
    Configure {
        config: StepperConfig,
        pins: PinArray,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
pub enum MotionError {
    Disabled,
    Busy,
    WorkerGone,
}

impl From<MotionError> for ApiError {
    fn from(err: MotionError) -> Self {
        match err {
            MotionError::Disabled => ApiError::BadRequest("Stepper motor is disabled".into()),
            MotionError::Busy => ApiError::Conflict("a move is already in progress".into()),
            MotionError::WorkerGone => ApiError::Internal("motion worker unavailable".into()),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MotionStatus {
    pub enabled: bool,
    pub moving: bool,
    pub position: i64,
}

/// Handle to the motion worker. Moves are exclusive: a step or rotate while
/// one is in flight is rejected rather than queued or superseded.
pub struct MotionController {
    tx: mpsc::Sender<MotionCommand>,
    shared: Arc<MotionShared>,
    config: StdMutex<StepperConfig>,
    pin_factory: Arc<PinFactory>,
}

impl MotionController {
    /// Spawns the blocking worker and returns its handle.
    pub fn spawn(config: StepperConfig, pin_factory: Arc<PinFactory>) -> Self {
        let mut config = config;
        config.speed = clamp_speed(config.speed);

        let shared = Arc::new(MotionShared::default());
        let (tx, mut rx) = mpsc::channel::<MotionCommand>(8);
        let pins = make_pins(&pin_factory, &config);
        let worker_shared = shared.clone();
        let worker_config = config.clone();

        tokio::task::spawn_blocking(move || {
            let mut engine = MotionEngine::new(pins, &worker_config, worker_shared.clone());
            while let Some(command) = rx.blocking_recv() {
                match command {
                    MotionCommand::Step { steps, reply } => {
                        let executed = engine.step(steps);
                        worker_shared.moving.store(false, Ordering::SeqCst);
                        debug!(steps, executed, "move finished");
                        let _ = reply.send(executed);
                    }
                    MotionCommand::Configure {
                        config,
                        pins,
                        reply,
                    } => {
                        engine.apply_config(&config, pins);
                        let _ = reply.send(());
                    }
                }
            }
            engine.release_coils();
        });

        Self {
            tx,
            shared,
            config: StdMutex::new(config),
            pin_factory,
        }
    }

    pub fn config(&self) -> StepperConfig {
        self.config.lock().expect("stepper config lock").clone()
    }

    pub fn status(&self) -> MotionStatus {
        MotionStatus {
            enabled: self.config().enabled,
            moving: self.shared.moving.load(Ordering::SeqCst),
            position: self.shared.position.load(Ordering::SeqCst),
        }
    }

    /// Applies a new configuration. Speed is clamped; the worker picks the
    /// change up between moves.
    pub async fn configure(&self, config: StepperConfig) -> Result<StepperConfig, MotionError> {
        let mut config = config;
        config.speed = clamp_speed(config.speed);
        let pins = make_pins(&self.pin_factory, &config);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MotionCommand::Configure {
                config: config.clone(),
                pins,
                reply: reply_tx,
            })
            .await
            .map_err(|_| MotionError::WorkerGone)?;
        reply_rx.await.map_err(|_| MotionError::WorkerGone)?;

        *self.config.lock().expect("stepper config lock") = config.clone();
        info!(
            speed = config.speed,
            steps_per_rev = config.steps_per_rev,
            enabled = config.enabled,
            "stepper reconfigured"
        );
        Ok(config)
    }

    /// Moves by `steps` full steps and completes once the motor stops.
    pub async fn step(&self, steps: i64) -> Result<(), MotionError> {
        if !self.config().enabled {
            return Err(MotionError::Disabled);
        }
        if steps == 0 {
            return Ok(());
        }
        if self
            .shared
            .moving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MotionError::Busy);
        }
        self.shared.stop.store(false, Ordering::SeqCst);

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(MotionCommand::Step {
                steps,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            self.shared.moving.store(false, Ordering::SeqCst);
            return Err(MotionError::WorkerGone);
        }
        reply_rx.await.map(|_| ()).map_err(|_| MotionError::WorkerGone)
    }

    pub async fn rotate_degrees(&self, degrees: f64) -> Result<(), MotionError> {
        let steps_per_rev = self.config().steps_per_rev;
        self.step(steps_for_degrees(degrees, steps_per_rev)).await
    }

    pub async fn rotate_revolutions(&self, revolutions: f64) -> Result<(), MotionError> {
        let steps_per_rev = self.config().steps_per_rev;
        self.step(steps_for_revolutions(revolutions, steps_per_rev))
            .await
    }

    /// Requests cancellation; the worker observes the flag at the next
    /// half-step boundary and idles the coils.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub fn reset_position(&self) {
        self.shared.position.store(0, Ordering::SeqCst);
    }
}

fn make_pins(factory: &Arc<PinFactory>, config: &StepperConfig) -> PinArray {
    [
        factory(config.pin1),
        factory(config.pin2),
        factory(config.pin3),
        factory(config.pin4),
    ]
}

// HTTP surface.

pub async fn get_config(Extension(state): Extension<Arc<AppState>>) -> Response {
    JsonResponse(state.motion.config()).into_response()
}

pub async fn post_config(
    Extension(state): Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let config: StepperConfig = read_bounded_json(body).await?;
    if config.steps_per_rev == 0 {
        return Err(ApiError::BadRequest("steps_per_rev must be positive".into()));
    }

    let applied = state.motion.configure(config).await?;
    state
        .config
        .update(|doc| doc.stepper = applied.clone())
        .await?;

    Ok(JsonResponse(json!({
        "status": "ok",
        "message": "Configuration saved",
    }))
    .into_response())
}

pub async fn get_status(Extension(state): Extension<Arc<AppState>>) -> Response {
    JsonResponse(state.motion.status()).into_response()
}

#[derive(Deserialize)]
pub(crate) struct MoveRequest {
    #[serde(default)]
    degrees: f64,
}

pub async fn post_move(
    Extension(state): Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let request: MoveRequest = read_bounded_json(body).await?;
    state.motion.rotate_degrees(request.degrees).await?;
    Ok(ok_response())
}

#[derive(Deserialize)]
pub(crate) struct StepRequest {
    #[serde(default)]
    steps: i64,
}

pub async fn post_step(
    Extension(state): Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let request: StepRequest = read_bounded_json(body).await?;
    state.motion.step(request.steps).await?;
    Ok(ok_response())
}

pub async fn post_stop(Extension(state): Extension<Arc<AppState>>) -> Response {
    state.motion.stop();
    ok_response()
}

pub async fn post_reset(Extension(state): Extension<Arc<AppState>>) -> Response {
    state.motion.reset_position();
    ok_response()
}

fn ok_response() -> Response {
    JsonResponse(json!({ "status": "ok" })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{PinLog, RecordingPin};

    fn recording_factory(log: PinLog) -> Arc<PinFactory> {
        let next = std::sync::Mutex::new(0usize);
        Arc::new(move |_pin| {
            let mut next = next.lock().unwrap();
            let coil = *next % 4;
            *next += 1;
            Box::new(RecordingPin::new(coil, log.clone()))
        })
    }

    fn test_engine(log: PinLog, enabled: bool) -> MotionEngine {
        let config = StepperConfig {
            enabled,
            ..StepperConfig::default()
        };
        let factory = recording_factory(log);
        let pins = make_pins(&factory, &config);
        let mut engine = MotionEngine::new(pins, &config, Arc::new(MotionShared::default()));
        engine.step_delay_us = 0;
        engine
    }

    #[test]
    fn delay_formula_matches_motor_family() {
        assert_eq!(step_delay_us(10), 1464);
        assert_eq!(step_delay_us(15), 976);
        // Values that would fall below the floor clamp to it.
        assert_eq!(step_delay_us(100), 800);
        assert_eq!(clamp_speed(100), MAX_SPEED_RPM);
        assert_eq!(clamp_speed(0), MIN_SPEED_RPM);
    }

    #[test]
    fn rotation_conversions_round_to_steps() {
        assert_eq!(steps_for_degrees(90.0, 2048), 512);
        assert_eq!(steps_for_degrees(-90.0, 2048), -512);
        assert_eq!(steps_for_degrees(0.0, 2048), 0);
        assert_eq!(steps_for_revolutions(1.5, 2048), 3072);
    }

    #[test]
    fn phase_wraps_in_both_directions() {
        assert_eq!(advance_phase(7, 1), 0);
        assert_eq!(advance_phase(0, -1), 7);
        assert_eq!(advance_phase(3, 1), 4);
        assert_eq!(advance_phase(3, -1), 2);
    }

    #[test]
    fn half_step_table_is_a_continuous_cycle() {
        for (i, row) in HALF_STEP_SEQUENCE.iter().enumerate() {
            let active = row.iter().filter(|bit| **bit).count();
            assert!((1..=2).contains(&active), "row {i} energizes {active} coils");

            let next = HALF_STEP_SEQUENCE[(i + 1) % 8];
            let changed = row.iter().zip(next).filter(|(a, b)| **a != *b).count();
            assert_eq!(changed, 1, "rows {i} and {} differ by {changed} coils", (i + 1) % 8);
        }
    }

    #[test]
    fn step_five_executes_ten_half_steps() {
        let log: PinLog = Arc::default();
        let mut engine = test_engine(log.clone(), true);
        log.lock().unwrap().clear();

        let executed = engine.step(5);
        assert_eq!(executed, 10);
        assert_eq!(engine.shared.position.load(Ordering::SeqCst), 5);
        // 10 half-steps of 4 coil writes, plus the final release.
        assert_eq!(log.lock().unwrap().len(), 10 * 4 + 4);
    }

    #[test]
    fn negative_steps_move_backwards() {
        let log: PinLog = Arc::default();
        let mut engine = test_engine(log, true);
        engine.step(-3);
        assert_eq!(engine.shared.position.load(Ordering::SeqCst), -3);
        assert_eq!(engine.shared.phase.load(Ordering::SeqCst), advance_phase(0, -6));
    }

    #[test]
    fn ninety_degrees_at_2048_steps_lands_on_512() {
        let log: PinLog = Arc::default();
        let mut engine = test_engine(log, true);
        let executed = engine.step(steps_for_degrees(90.0, 2048));
        assert_eq!(executed, 1024);
        assert_eq!(engine.shared.position.load(Ordering::SeqCst), 512);
    }

    #[test]
    fn disabled_engine_never_pulses() {
        let log: PinLog = Arc::default();
        let mut engine = test_engine(log.clone(), false);
        log.lock().unwrap().clear();

        assert_eq!(engine.step(5), 0);
        assert_eq!(engine.shared.position.load(Ordering::SeqCst), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn stop_flag_halts_at_half_step_boundary() {
        let log: PinLog = Arc::default();
        let mut engine = test_engine(log, true);
        engine.shared.stop.store(true, Ordering::SeqCst);
        assert_eq!(engine.step(100), 0);
        assert_eq!(engine.shared.position.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn controller_step_completes_and_tracks_position() {
        let log: PinLog = Arc::default();
        let controller = MotionController::spawn(
            StepperConfig {
                speed: MAX_SPEED_RPM,
                ..StepperConfig::default()
            },
            recording_factory(log),
        );

        controller.step(2).await.expect("step");
        let status = controller.status();
        assert!(!status.moving);
        assert_eq!(status.position, 2);

        controller.reset_position();
        assert_eq!(controller.status().position, 0);
    }

    #[tokio::test]
    async fn controller_rotate_revolutions_converts_turns_to_steps() {
        let log: PinLog = Arc::default();
        let controller = MotionController::spawn(
            StepperConfig {
                speed: MAX_SPEED_RPM,
                steps_per_rev: 4,
                ..StepperConfig::default()
            },
            recording_factory(log),
        );

        controller
            .rotate_revolutions(2.0)
            .await
            .expect("rotate revolutions");
        assert_eq!(controller.status().position, 8);

        controller
            .rotate_degrees(-90.0)
            .await
            .expect("rotate degrees");
        assert_eq!(controller.status().position, 7);
    }

    #[tokio::test]
    async fn controller_rejects_moves_while_disabled() {
        let log: PinLog = Arc::default();
        let controller =
            MotionController::spawn(StepperConfig::default(), recording_factory(log));
        controller
            .configure(StepperConfig {
                enabled: false,
                ..StepperConfig::default()
            })
            .await
            .expect("configure");

        assert!(matches!(
            controller.step(3).await,
            Err(MotionError::Disabled)
        ));
        assert!(matches!(
            controller.rotate_degrees(90.0).await,
            Err(MotionError::Disabled)
        ));
    }

    #[tokio::test]
    async fn config_endpoint_persists_the_section() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = crate::state::testing::app_state(temp.path()).await;

        let body = Body::from(r#"{"speed": 12, "enabled": false}"#);
        post_config(Extension(state.clone()), body)
            .await
            .expect("configure");

        let doc = state.config.snapshot().await;
        assert_eq!(doc.stepper.speed, 12);
        assert!(!doc.stepper.enabled);
        // Missing fields keep their defaults.
        assert_eq!(doc.stepper.pin1, 25);
        assert_eq!(state.motion.config().speed, 12);
    }

    #[tokio::test]
    async fn config_endpoint_rejects_zero_resolution() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = crate::state::testing::app_state(temp.path()).await;

        let body = Body::from(r#"{"steps_per_rev": 0}"#);
        let result = post_config(Extension(state), body).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn configure_clamps_speed() {
        let log: PinLog = Arc::default();
        let controller =
            MotionController::spawn(StepperConfig::default(), recording_factory(log));
        let applied = controller
            .configure(StepperConfig {
                speed: 100,
                ..StepperConfig::default()
            })
            .await
            .expect("configure");
        assert_eq!(applied.speed, MAX_SPEED_RPM);
    }
}

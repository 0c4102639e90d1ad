//! Supervised observation runs.
//!
//! Entering OBSERVING with a bounded [`ObservationSpec`] spawns a supervisor
//! task that watches elapsed time and the backplane trigger counter. When a
//! bound is reached it asks its [`ObservationTarget`] to end the observation,
//! exactly once. An operator transition interrupts it instead, in which case
//! the supervisor issues nothing.
//!
//! ```text
//!            bound reached            end_observation() returns
//! Running ───────────────▶ Finishing ─────────────────────────▶ NaturallyEnded
//!    │
//!    │ interrupt()                    loop exits
//!    └───────────────────▶ Interrupting ──────────────────────▶ Interrupted
//! ```
//!
//! Leaving `Running` is an atomic claim, so a natural end and an interrupt
//! can never both win.

use crate::error::ControlError;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Capabilities a supervisor needs from whoever owns the camera.
#[async_trait]
pub trait ObservationTarget: Send + Sync + 'static {
    /// Current backplane trigger counter.
    async fn trigger_count(&self) -> Result<u64, ControlError>;

    /// Request the transition that ends the observation.
    async fn end_observation(&self) -> Result<(), ControlError>;
}

/// Bounds of an observation. Zero means "no bound".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObservationSpec {
    /// Wall-clock duration.
    pub duration: Duration,
    /// Number of backplane triggers.
    pub trigger_count: u64,
}

impl ObservationSpec {
    /// Whether a supervisor is needed at all.
    pub fn is_bounded(&self) -> bool {
        !self.duration.is_zero() || self.trigger_count > 0
    }
}

/// Lifecycle of a supervised run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ObservationPhase {
    /// Watching the bounds.
    Running = 0,
    /// A bound was reached and the end transition is being requested.
    Finishing = 1,
    /// Ended by reaching a bound.
    NaturallyEnded = 2,
    /// Interrupt requested, loop not yet exited.
    Interrupting = 3,
    /// Ended by an interrupt.
    Interrupted = 4,
}

impl ObservationPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ObservationPhase::Running,
            1 => ObservationPhase::Finishing,
            2 => ObservationPhase::NaturallyEnded,
            3 => ObservationPhase::Interrupting,
            _ => ObservationPhase::Interrupted,
        }
    }
}

#[derive(Debug)]
struct RunState {
    phase: AtomicU8,
    reached_natural_end: AtomicBool,
    started_at: OnceLock<DateTime<Local>>,
    start_count: OnceLock<u64>,
}

impl RunState {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(ObservationPhase::Running as u8),
            reached_natural_end: AtomicBool::new(false),
            started_at: OnceLock::new(),
            start_count: OnceLock::new(),
        }
    }

    fn phase(&self) -> ObservationPhase {
        ObservationPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn claim(&self, to: ObservationPhase) -> bool {
        self.phase
            .compare_exchange(
                ObservationPhase::Running as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn set(&self, phase: ObservationPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Handle to one supervised observation.
///
/// Dropping the handle does not stop the run; call [`ObservationHandle::interrupt`].
#[derive(Debug)]
pub struct ObservationHandle {
    spec: ObservationSpec,
    state: Arc<RunState>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl ObservationHandle {
    /// Start supervising `spec` against `target`, re-checking every `check_interval`.
    pub fn spawn(
        spec: ObservationSpec,
        target: Arc<dyn ObservationTarget>,
        check_interval: Duration,
    ) -> Self {
        let state = Arc::new(RunState::new());
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        info!(
            "Creating observation supervisor, duration = {}, triggers = {}",
            format_observation_time(spec.duration),
            spec.trigger_count
        );

        tokio::spawn(supervise(
            spec,
            target,
            check_interval,
            state.clone(),
            cancel.clone(),
            finished.clone(),
        ));

        Self {
            spec,
            state,
            cancel,
            finished,
        }
    }

    /// Bounds this run was started with.
    pub fn spec(&self) -> ObservationSpec {
        self.spec
    }

    /// Current phase.
    pub fn phase(&self) -> ObservationPhase {
        self.state.phase()
    }

    /// Whether a bound was reached.
    pub fn reached_natural_end(&self) -> bool {
        self.state.reached_natural_end.load(Ordering::Acquire)
    }

    /// Whether the supervisor task has exited.
    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Wall-clock start, once the supervisor has started.
    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.state.started_at.get().copied()
    }

    /// Trigger counter at start, once read.
    pub fn start_trigger_count(&self) -> Option<u64> {
        self.state.start_count.get().copied()
    }

    /// Stop the run and wait for the supervisor to exit.
    ///
    /// No-op once the run has finished or is already ending on its own.
    pub async fn interrupt(&self) {
        if self.state.claim(ObservationPhase::Interrupting) {
            warn!("Interrupting observation supervisor");
            self.cancel.cancel();
            self.finished.cancelled().await;
        }
    }

    /// Wait for the run to end without interrupting it.
    pub async fn wait_for_end(&self) {
        self.finished.cancelled().await;
    }
}

enum Outcome {
    Bound,
    Cancelled,
}

async fn supervise(
    spec: ObservationSpec,
    target: Arc<dyn ObservationTarget>,
    check_interval: Duration,
    state: Arc<RunState>,
    cancel: CancellationToken,
    finished: CancellationToken,
) {
    let _finished = finished.drop_guard();
    let started = Instant::now();
    let _ = state.started_at.set(Local::now());

    let start_count = if spec.trigger_count > 0 {
        tokio::select! {
            _ = cancel.cancelled() => {
                state.set(ObservationPhase::Interrupted);
                info!("Observation ended before start");
                return;
            }
            count = target.trigger_count() => count.unwrap_or_else(|e| {
                warn!("Could not read start trigger count: {}", e);
                0
            }),
        }
    } else {
        0
    };
    let _ = state.start_count.set(start_count);

    info!(
        "Starting observation supervisor, start time = {}, duration = {:?}, triggers = {}",
        Local::now().format("%a %b %e %H:%M:%S %Y"),
        spec.duration,
        spec.trigger_count
    );

    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut observed = 0;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Outcome::Cancelled,
            _ = ticker.tick() => {}
        }

        if !spec.duration.is_zero() && started.elapsed() >= spec.duration {
            break Outcome::Bound;
        }

        if spec.trigger_count > 0 {
            let count = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Outcome::Cancelled,
                count = target.trigger_count() => count,
            };
            match count {
                Ok(count) => {
                    observed = count.saturating_sub(start_count);
                    if observed >= spec.trigger_count {
                        break Outcome::Bound;
                    }
                }
                Err(e) => warn!("Trigger count unavailable: {}", e),
            }
        }
    };

    match outcome {
        Outcome::Bound if state.claim(ObservationPhase::Finishing) => {
            info!(
                "Observation complete, duration = {}, triggers = {}",
                format_observation_time(started.elapsed()),
                observed
            );
            state.reached_natural_end.store(true, Ordering::Release);
            if let Err(e) = target.end_observation().await {
                warn!("Failed to end observation: {}", e);
            }
            state.set(ObservationPhase::NaturallyEnded);
        }
        _ => state.set(ObservationPhase::Interrupted),
    }
    info!("Observation ended");
}

/// Parse an `hours:minutes:seconds` literal. Components may be fractional and
/// trailing ones may be omitted (`"2"` is two hours).
pub fn parse_observation_time(text: &str) -> Result<Duration, ControlError> {
    let invalid = || ControlError::InvalidObservationTime(text.to_string());
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.len() > 3 {
        return Err(invalid());
    }
    let mut seconds = 0.0;
    for (part, scale) in parts.iter().zip([3600.0, 60.0, 1.0]) {
        let value: f64 = part.trim().parse().map_err(|_| invalid())?;
        seconds += value * scale;
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}

/// Render a duration as `H:MM:SS`, with microseconds when present.
pub fn format_observation_time(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total / 60 % 60, total % 60);
    match duration.subsec_micros() {
        0 => format!("{}:{:02}:{:02}", hours, minutes, seconds),
        micros => format!("{}:{:02}:{:02}.{:06}", hours, minutes, seconds, micros),
    }
}

//! Escalation controller for the visual-detection tier.
//!
//! Screen capture + OCR + native clicking is slow, flaky, and takes over the
//! pointer, so it is never the first thing tried. The controller decides, for
//! each detected prompt, whether a visual pass is warranted right now, and
//! keeps the bookkeeping (attempt lock, rate limit, success cooldown, failure
//! ceiling and suppression window) that makes that decision stable.
//!
//! ## Decision table
//!
//! Rules are evaluated in order; the first one that fires wins.
//!
//! ```text
//!  1  attempt in progress             → skip
//!  2  now < suppressed_until          → skip (remaining seconds)
//!  3  since last attempt < min        → skip (too soon)
//!  4  since last success < cooldown   → skip (success cooldown)
//!  5  recent human input              → skip
//!  6  no text prompt                  → skip
//!  7  cheap probe has not failed      → skip
//!  8  host window not active          → skip
//!  9  failures >= ceiling             → arm suppression, skip
//! 10  otherwise                       → trigger
//! ```
//!
//! Suppression is armed once per failure streak. When the window expires one
//! probation attempt is allowed; if it fails, the next decision re-arms.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, Utc};
use tracing::{debug, info, warn};

/// Source of wall-clock time for the controller.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Thresholds for the decision table.
#[derive(Debug, Clone)]
pub struct EscalationConfig {
    /// Floor between two visual attempts.
    pub min_interval: Duration,
    /// Quiet period after an attempt that found and clicked its target.
    pub success_cooldown: Duration,
    /// Consecutive failed attempts before suppression.
    pub max_failures: u32,
    /// Length of the suppression window.
    pub suppression: Duration,
    /// Attempts further apart than this are reported as "long time since last attempt".
    pub long_idle: Duration,
    /// How many probe-failure labels are remembered.
    pub probe_failure_capacity: usize,
    /// Probe failures needed for a failure streak.
    pub streak_threshold: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            success_cooldown: Duration::from_secs(15),
            max_failures: 3,
            suppression: Duration::from_secs(30),
            long_idle: Duration::from_secs(30),
            probe_failure_capacity: 5,
            streak_threshold: 2,
        }
    }
}

/// Signals gathered by the caller for one decision.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TriggerConditions {
    /// A recognizer matched the current host text.
    pub prompt_text_detected: bool,
    /// The cheap probe ran and did not resolve the prompt.
    pub cheap_probe_failed: bool,
    /// Time since the last visual attempt began; `None` if there never was one.
    pub elapsed_since_last_attempt: Option<Duration>,
    /// The target application currently has focus.
    pub host_window_active: bool,
    /// Enough probe failures were recorded recently to count as a streak.
    pub recent_failure_streak: bool,
    /// A human interacted within the trailing window.
    pub recent_human_input: bool,
}

/// Why a visual attempt was authorized. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    FailingRepeatedly,
    LongIdle,
    Standard,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailingRepeatedly => write!(f, "UI detection failing repeatedly"),
            Self::LongIdle => write!(f, "long time since last attempt"),
            Self::Standard => write!(f, "standard trigger"),
        }
    }
}

/// Why a visual attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyInProgress,
    Suppressed { remaining_secs: u64 },
    TooSoon { wait_secs: u64 },
    SuccessCooldown { wait_secs: u64 },
    RecentUserInteraction,
    NoTextPrompt,
    CheapProbeNotFailed,
    WindowInactive,
    EnteringSuppression,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInProgress => write!(f, "visual detection already in progress"),
            Self::Suppressed { remaining_secs } => write!(
                f,
                "suppressed for {remaining_secs} more seconds after consecutive failures"
            ),
            Self::TooSoon { wait_secs } => write!(f, "too soon - wait {wait_secs} more seconds"),
            Self::SuccessCooldown { wait_secs } => write!(
                f,
                "recent success cooldown - wait {wait_secs} more seconds"
            ),
            Self::RecentUserInteraction => write!(f, "recent user interaction detected"),
            Self::NoTextPrompt => write!(f, "no text prompt detected"),
            Self::CheapProbeNotFailed => write!(f, "cheap method not attempted or succeeded"),
            Self::WindowInactive => write!(f, "target window not active"),
            Self::EnteringSuppression => write!(
                f,
                "too many consecutive failures - entering suppression period"
            ),
        }
    }
}

/// Outcome of [`EscalationController::should_trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Trigger(TriggerReason),
    Skip(SkipReason),
}

impl Decision {
    pub fn trigger(&self) -> bool {
        matches!(self, Decision::Trigger(_))
    }

    /// The trigger reason, or `"skip"` for a refusal.
    pub fn reason(&self) -> String {
        match self {
            Decision::Trigger(reason) => reason.to_string(),
            Decision::Skip(_) => "skip".to_string(),
        }
    }

    pub fn skip_reason(&self) -> Option<String> {
        match self {
            Decision::Trigger(_) => None,
            Decision::Skip(reason) => Some(reason.to_string()),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Trigger(reason) => write!(f, "trigger: {reason}"),
            Decision::Skip(reason) => write!(f, "skip: {reason}"),
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    last_attempt_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    recent_probe_failures: VecDeque<String>,
    attempt_in_progress: bool,
    suppressed_until: Option<DateTime<Utc>>,
}

/// Read-only snapshot of the controller for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStatus {
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub attempt_in_progress: bool,
    pub suppressed_until: Option<DateTime<Utc>>,
    pub recent_probe_failures: Vec<String>,
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(t) => t.with_timezone(&Local).format("%H:%M:%S").to_string(),
        None => "Never".to_string(),
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures = if self.recent_probe_failures.is_empty() {
            "(none)".to_string()
        } else {
            self.recent_probe_failures.join(", ")
        };
        writeln!(f, "  {:<22} {}", "last attempt", format_time(self.last_attempt_at))?;
        writeln!(f, "  {:<22} {}", "last success", format_time(self.last_success_at))?;
        writeln!(f, "  {:<22} {}", "consecutive failures", self.consecutive_failures)?;
        writeln!(f, "  {:<22} {}", "attempt in progress", self.attempt_in_progress)?;
        writeln!(f, "  {:<22} {}", "suppressed until", format_time(self.suppressed_until))?;
        writeln!(f, "  {:<22} {}", "recent probe failures", failures)
    }
}

fn elapsed(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}

fn add(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Decides when the visual tier may run.
///
/// One instance per watched host. All state changes go through its methods;
/// none of them can fail.
pub struct EscalationController<C: Clock = SystemClock> {
    config: EscalationConfig,
    clock: C,
    state: ControllerState,
}

impl<C: Clock> EscalationController<C> {
    pub fn with_clock(config: EscalationConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            state: ControllerState::default(),
        }
    }

    /// Evaluate the decision table against `conditions`.
    ///
    /// Rule 9 is the only rule with a side effect: it arms the suppression
    /// window.
    pub fn should_trigger(&mut self, conditions: &TriggerConditions) -> Decision {
        let decision = self.evaluate(conditions);
        match decision {
            Decision::Trigger(reason) => info!(reason = %reason, "visual detection authorized"),
            Decision::Skip(reason) => debug!(reason = %reason, "visual detection skipped"),
        }
        decision
    }

    fn evaluate(&mut self, c: &TriggerConditions) -> Decision {
        let now = self.clock.now();
        let state = &mut self.state;

        if state.attempt_in_progress {
            return Decision::Skip(SkipReason::AlreadyInProgress);
        }

        if let Some(until) = state.suppressed_until {
            if now < until {
                return Decision::Skip(SkipReason::Suppressed {
                    remaining_secs: ceil_secs(elapsed(until, now)),
                });
            }
        }

        if let Some(last) = state.last_attempt_at {
            let since = elapsed(now, last);
            if since < self.config.min_interval {
                return Decision::Skip(SkipReason::TooSoon {
                    wait_secs: ceil_secs(self.config.min_interval - since),
                });
            }
        }

        if let Some(last) = state.last_success_at {
            let since = elapsed(now, last);
            if since < self.config.success_cooldown {
                return Decision::Skip(SkipReason::SuccessCooldown {
                    wait_secs: ceil_secs(self.config.success_cooldown - since),
                });
            }
        }

        if c.recent_human_input {
            return Decision::Skip(SkipReason::RecentUserInteraction);
        }
        if !c.prompt_text_detected {
            return Decision::Skip(SkipReason::NoTextPrompt);
        }
        if !c.cheap_probe_failed {
            return Decision::Skip(SkipReason::CheapProbeNotFailed);
        }
        if !c.host_window_active {
            return Decision::Skip(SkipReason::WindowInactive);
        }

        // Re-armed on every pass while failures stay at the ceiling.
        if state.consecutive_failures >= self.config.max_failures {
            let until = add(now, self.config.suppression);
            state.suppressed_until = Some(until);
            warn!(
                failures = state.consecutive_failures,
                until = %until,
                "visual detection suppressed after consecutive failures"
            );
            return Decision::Skip(SkipReason::EnteringSuppression);
        }

        if c.recent_failure_streak {
            Decision::Trigger(TriggerReason::FailingRepeatedly)
        } else if c
            .elapsed_since_last_attempt
            .is_some_and(|e| e > self.config.long_idle)
        {
            Decision::Trigger(TriggerReason::LongIdle)
        } else {
            Decision::Trigger(TriggerReason::Standard)
        }
    }

    /// Mark a visual attempt as started. Call strictly before capture.
    pub fn on_attempt_start(&mut self) {
        self.state.attempt_in_progress = true;
        self.state.last_attempt_at = Some(self.clock.now());
    }

    /// Record the outcome of the attempt started by [`Self::on_attempt_start`].
    pub fn on_attempt_complete(&mut self, succeeded: bool, target_found: bool) {
        let state = &mut self.state;
        state.attempt_in_progress = false;

        if succeeded && target_found {
            state.last_success_at = Some(self.clock.now());
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }
        debug!(
            succeeded,
            target_found,
            failures = state.consecutive_failures,
            "visual attempt complete"
        );
    }

    /// Start an attempt and get a guard that reports its completion.
    ///
    /// If the guard is dropped without [`AttemptGuard::finish`], the attempt
    /// is recorded as a failure with no target found.
    pub fn begin_attempt(&mut self) -> AttemptGuard<'_, C> {
        self.on_attempt_start();
        AttemptGuard {
            controller: self,
            finished: false,
        }
    }

    /// Remember a cheap-probe failure, evicting the oldest past capacity.
    pub fn record_probe_failure(&mut self, label: &str) {
        let failures = &mut self.state.recent_probe_failures;
        failures.push_back(label.to_string());
        while failures.len() > self.config.probe_failure_capacity {
            failures.pop_front();
        }
    }

    pub fn has_recent_failure_streak(&self) -> bool {
        self.state.recent_probe_failures.len() >= self.config.streak_threshold
    }

    pub fn elapsed_since_last_attempt(&self) -> Option<Duration> {
        self.state
            .last_attempt_at
            .map(|last| elapsed(self.clock.now(), last))
    }

    /// Restore every field to its initial value.
    pub fn reset(&mut self) {
        self.state = ControllerState::default();
        info!("escalation controller reset");
    }

    /// Operator escape hatch: clears suppression, the failure count, and the
    /// attempt lock. Bypasses every safety rule that depends on them.
    pub fn force_enable(&mut self) {
        self.state.suppressed_until = None;
        self.state.consecutive_failures = 0;
        self.state.attempt_in_progress = false;
        warn!("visual detection force-enabled");
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            last_attempt_at: self.state.last_attempt_at,
            last_success_at: self.state.last_success_at,
            consecutive_failures: self.state.consecutive_failures,
            attempt_in_progress: self.state.attempt_in_progress,
            suppressed_until: self.state.suppressed_until,
            recent_probe_failures: self.state.recent_probe_failures.iter().cloned().collect(),
        }
    }
}

/// Holds the attempt lock for the duration of one visual attempt.
pub struct AttemptGuard<'a, C: Clock> {
    controller: &'a mut EscalationController<C>,
    finished: bool,
}

impl<C: Clock> AttemptGuard<'_, C> {
    pub fn finish(mut self, succeeded: bool, target_found: bool) {
        self.finished = true;
        self.controller.on_attempt_complete(succeeded, target_found);
    }
}

impl<C: Clock> Drop for AttemptGuard<'_, C> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("visual attempt ended without an outcome; recording failure");
            self.controller.on_attempt_complete(false, false);
        }
    }
}

/// Hand-advanced clock for tests.
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct ManualClock(std::rc::Rc<std::cell::Cell<DateTime<Utc>>>);

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Self {
        let start = DateTime::parse_from_rfc3339("2026-01-05T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Self(std::rc::Rc::new(std::cell::Cell::new(start)))
    }

    pub(crate) fn advance(&self, d: Duration) {
        self.0.set(add(self.0.get(), d));
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.0.get()
    }
}

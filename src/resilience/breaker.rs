use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::VecDeque,
    env,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, info, warn};

/// Tuning for one protected dependency.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub name: &'static str,
    /// Budget for a single call; exceeding it cancels the call and counts as a failure.
    pub timeout: Duration,
    pub error_threshold_percentage: u8,
    /// Trailing span over which outcomes are counted.
    pub rolling_window: Duration,
    /// Minimum calls in the window before the failure rate is evaluated.
    pub volume_threshold: u32,
    pub reset_timeout: Duration,
}

impl BreakerConfig {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            timeout: Duration::from_secs(10),
            error_threshold_percentage: 50,
            rolling_window: Duration::from_secs(10),
            volume_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }

    /// Reads `<PREFIX>_BREAKER_*` variables, falling back to `base` for anything unset.
    pub fn from_env(base: Self, prefix: &str) -> Self {
        let millis = |suffix: &str| {
            env::var(format!("{prefix}_BREAKER_{suffix}"))
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_millis)
        };
        let number = |suffix: &str| {
            env::var(format!("{prefix}_BREAKER_{suffix}"))
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
        };
        Self {
            name: base.name,
            timeout: millis("TIMEOUT_MS").unwrap_or(base.timeout),
            error_threshold_percentage: number("ERROR_THRESHOLD")
                .filter(|v| (1..=100).contains(v))
                .map(|v| v as u8)
                .unwrap_or(base.error_threshold_percentage),
            rolling_window: millis("WINDOW_MS").unwrap_or(base.rolling_window),
            volume_threshold: number("VOLUME_THRESHOLD").unwrap_or(base.volume_threshold),
            reset_timeout: millis("RESET_MS").unwrap_or(base.reset_timeout),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[cfg(test)]
    pub fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }

    #[cfg(test)]
    pub fn with_thresholds(mut self, volume: u32, error_percentage: u8) -> Self {
        self.volume_threshold = volume;
        self.error_threshold_percentage = error_percentage;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Lifecycle signal published on every state change and call outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerEvent {
    Open,
    HalfOpen,
    Close,
    Success,
    Failure,
    Reject,
    Timeout,
}

impl BreakerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerEvent::Open => "open",
            BreakerEvent::HalfOpen => "half_open",
            BreakerEvent::Close => "close",
            BreakerEvent::Success => "success",
            BreakerEvent::Failure => "failure",
            BreakerEvent::Reject => "reject",
            BreakerEvent::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: &'static str,
    pub state: BreakerState,
    pub failures: u32,
    pub total: u32,
    pub last_transition: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit `{name}` is open")]
    Open { name: &'static str },
    #[error("circuit `{name}` call timed out after {after:?}")]
    Timeout {
        name: &'static str,
        after: Duration,
    },
    #[error("{0}")]
    Inner(E),
}

struct Inner {
    state: BreakerState,
    // (finished at, failed)
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_transition: DateTime<Utc>,
}

#[derive(Clone, Copy)]
struct Admission {
    trial: bool,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                last_transition: Utc::now(),
            }),
            events,
        }
    }

    pub fn name(&self) -> &'static str {
        self.config.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    #[cfg(test)]
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        self.prune(&mut inner);
        let failures = inner.window.iter().filter(|(_, failed)| *failed).count() as u32;
        BreakerSnapshot {
            name: self.config.name,
            state: inner.state,
            failures,
            total: inner.window.len() as u32,
            last_transition: inner.last_transition,
        }
    }

    /// Runs `op` under the configured timeout. Every `Err` counts as a failure.
    pub async fn fire<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.fire_filtered(op, |_| true).await
    }

    /// Like [`fire`](Self::fire), but errors for which `is_failure` returns
    /// false are recorded as successful calls: the dependency answered.
    pub async fn fire_filtered<T, E, F, Fut, P>(
        &self,
        op: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let Some(admission) = self.admit() else {
            return Err(BreakerError::Open {
                name: self.config.name,
            });
        };

        let mut guard = TrialGuard {
            breaker: self,
            armed: admission.trial,
        };
        let outcome = tokio::time::timeout(self.config.timeout, op()).await;
        guard.armed = false;

        match outcome {
            Ok(Ok(value)) => {
                self.on_success(admission);
                Ok(value)
            }
            Ok(Err(err)) => {
                if is_failure(&err) {
                    self.on_failure(admission, BreakerEvent::Failure);
                } else {
                    self.on_success(admission);
                }
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                self.on_failure(admission, BreakerEvent::Timeout);
                Err(BreakerError::Timeout {
                    name: self.config.name,
                    after: self.config.timeout,
                })
            }
        }
    }

    /// Forces the breaker back to closed and forgets the rolling window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.window.clear();
        inner.opened_at = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, BreakerState::Closed);
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner);
        match inner.state {
            BreakerState::Closed => Some(Admission { trial: false }),
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Some(Admission { trial: true })
            }
            _ => {
                self.emit(BreakerEvent::Reject);
                None
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        self.emit(BreakerEvent::Success);
        if admission.trial {
            inner.trial_in_flight = false;
            if inner.state == BreakerState::HalfOpen {
                inner.window.clear();
                inner.opened_at = None;
                self.transition(&mut inner, BreakerState::Closed);
            }
            return;
        }
        self.record(&mut inner, false);
    }

    fn on_failure(&self, admission: Admission, event: BreakerEvent) {
        let mut inner = self.lock();
        self.emit(event);
        if admission.trial {
            inner.trial_in_flight = false;
            if inner.state == BreakerState::HalfOpen {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            return;
        }
        self.record(&mut inner, true);
        if inner.state == BreakerState::Closed && self.should_trip(&inner) {
            inner.opened_at = Some(Instant::now());
            self.transition(&mut inner, BreakerState::Open);
        }
    }

    fn should_trip(&self, inner: &Inner) -> bool {
        let total = inner.window.len() as u64;
        if total < u64::from(self.config.volume_threshold) || total == 0 {
            return false;
        }
        let failures = inner.window.iter().filter(|(_, failed)| *failed).count() as u64;
        failures * 100 >= u64::from(self.config.error_threshold_percentage) * total
    }

    fn record(&self, inner: &mut Inner, failed: bool) {
        inner.window.push_back((Instant::now(), failed));
        self.prune(inner);
    }

    fn prune(&self, inner: &mut Inner) {
        let now = Instant::now();
        while let Some((at, _)) = inner.window.front() {
            if now.duration_since(*at) > self.config.rolling_window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.reset_timeout
        {
            inner.trial_in_flight = false;
            self.transition(inner, BreakerState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Utc::now();
        let event = match to {
            BreakerState::Closed => BreakerEvent::Close,
            BreakerState::Open => BreakerEvent::Open,
            BreakerState::HalfOpen => BreakerEvent::HalfOpen,
        };
        match to {
            BreakerState::Open => warn!(
                target = "realty.breaker",
                breaker = self.config.name,
                from = ?from,
                "circuit_opened"
            ),
            _ => info!(
                target = "realty.breaker",
                breaker = self.config.name,
                from = ?from,
                to = ?to,
                "circuit_transition"
            ),
        }
        self.emit(event);
    }

    fn emit(&self, event: BreakerEvent) {
        if event == BreakerEvent::Reject {
            debug!(
                target = "realty.breaker",
                breaker = self.config.name,
                "call_rejected"
            );
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the half-open trial slot if the caller drops `fire` mid-flight.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

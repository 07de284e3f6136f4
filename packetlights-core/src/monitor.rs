//! Request-rate monitor
//!
//! Every handled request is recorded as an event in a bounded ring buffer.
//! When enough events land inside the trailing window the monitor enters the
//! alert phase and asks its [`AlertResponder`] to show the alert pattern; once
//! the cooldown has passed it returns to normal and asks for the normal
//! pattern again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use atomic_enum::atomic_enum;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::controller::AnimationController;
use crate::pattern::{PatternKind, PatternSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Trailing window in which requests are counted, in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Requests inside the window that trigger the alert
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    /// Seconds the alert lasts before returning to normal
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Ring buffer size
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Request paths that are never recorded
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
}

const fn default_window_secs() -> u64 {
    10
}

const fn default_threshold() -> usize {
    3
}

const fn default_cooldown_secs() -> u64 {
    30
}

const fn default_capacity() -> usize {
    64
}

fn default_ignore() -> Vec<String> {
    vec!["/status".to_string(), "/favicon.ico".to_string()]
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            threshold: default_threshold(),
            cooldown_secs: default_cooldown_secs(),
            capacity: default_capacity(),
            ignore: default_ignore(),
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[must_use]
    pub fn is_ignored(&self, endpoint: &str) -> bool {
        self.ignore.iter().any(|path| path == endpoint)
    }

    /// Clamp values that would make the alert unreachable
    pub fn validate(&mut self) {
        if self.threshold == 0 {
            warn!("monitor.threshold 0 is invalid, using 1");
            self.threshold = 1;
        }
        if self.capacity < self.threshold {
            warn!(
                "monitor.capacity {} is below threshold {}, raising it",
                self.capacity, self.threshold
            );
            self.capacity = self.threshold;
        }
    }
}

#[atomic_enum]
#[derive(PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackPhase {
    Normal,
    Alert,
}

#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub at: Instant,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttackState {
    pub is_alert: bool,
    pub alert_started_at: Option<Instant>,
}

/// Serializable view of the monitor for status reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttackStatus {
    pub alert: bool,
    /// Milliseconds since the alert started
    pub alert_age_ms: Option<u64>,
    /// Events currently inside the window
    pub recent_requests: usize,
    pub last_endpoint: Option<String>,
}

/// What the monitor asks for on a phase change
pub trait AlertResponder: Send + Sync {
    fn on_alert(&self);
    fn on_clear(&self);

    /// Something else may have taken the bank during an alert; put the alert
    /// response back
    fn reassert_alert(&self) {
        self.on_alert();
    }
}

/// Responder that switches the controller between alert and normal patterns
pub struct ControllerResponder {
    controller: Arc<AnimationController>,
    patterns: PatternSet,
}

impl ControllerResponder {
    #[must_use]
    pub const fn new(controller: Arc<AnimationController>, patterns: PatternSet) -> Self {
        Self {
            controller,
            patterns,
        }
    }
}

impl AlertResponder for ControllerResponder {
    fn on_alert(&self) {
        self.controller.start(self.patterns.alert());
    }

    fn on_clear(&self) {
        self.controller.start(self.patterns.normal());
    }

    fn reassert_alert(&self) {
        if self.controller.current() != Some(PatternKind::Alert) {
            debug!("Alert pattern was replaced, restarting it");
            self.controller.start(self.patterns.alert());
        }
    }
}

struct MonitorInner {
    events: VecDeque<RequestEvent>,
    state: AttackState,
}

pub struct AttackMonitor {
    config: MonitorConfig,
    phase: AtomicAttackPhase,
    inner: Mutex<MonitorInner>,
    responder: Arc<dyn AlertResponder>,
}

impl AttackMonitor {
    #[must_use]
    pub fn new(mut config: MonitorConfig, responder: Arc<dyn AlertResponder>) -> Self {
        config.validate();
        Self {
            inner: Mutex::new(MonitorInner {
                events: VecDeque::with_capacity(config.capacity),
                state: AttackState::default(),
            }),
            config,
            phase: AtomicAttackPhase::new(AttackPhase::Normal),
            responder,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current phase without taking the monitor lock
    #[must_use]
    pub fn phase(&self) -> AttackPhase {
        self.phase.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn record(&self, endpoint: &str) {
        self.record_at(endpoint, Instant::now());
    }

    pub fn record_at(&self, endpoint: &str, now: Instant) {
        let mut inner = self.lock();
        if inner.events.len() >= self.config.capacity {
            inner.events.pop_front();
        }
        inner.events.push_back(RequestEvent {
            at: now,
            endpoint: endpoint.to_string(),
        });
        debug!("Request recorded: {endpoint}");

        self.check_cooldown(&mut inner, now);

        if !inner.state.is_alert {
            let recent = self.count_recent(&inner.events, now);
            if recent >= self.config.threshold {
                info!(
                    "Attack detected: {recent} requests in {}s, entering alert",
                    self.config.window_secs
                );
                inner.state = AttackState {
                    is_alert: true,
                    alert_started_at: Some(now),
                };
                self.phase
                    .store(AttackPhase::Alert, std::sync::atomic::Ordering::SeqCst);
                self.responder.on_alert();
            }
        }
    }

    /// Keep the alert response in force while in alert.
    ///
    /// Returns `true` if the monitor is in alert. Runs under the monitor lock
    /// so it cannot race a cooldown transition.
    pub fn hold_alert(&self) -> bool {
        if self.phase() == AttackPhase::Normal {
            return false;
        }
        let inner = self.lock();
        if !inner.state.is_alert {
            return false;
        }
        self.responder.reassert_alert();
        true
    }

    /// Evaluate only the cooldown; called periodically so an alert ends
    /// without further requests
    pub fn poll(&self) {
        self.poll_at(Instant::now());
    }

    pub fn poll_at(&self, now: Instant) {
        let mut inner = self.lock();
        self.check_cooldown(&mut inner, now);
    }

    fn check_cooldown(&self, inner: &mut MonitorInner, now: Instant) {
        let Some(started) = inner.state.alert_started_at else {
            return;
        };
        if inner.state.is_alert && now.saturating_duration_since(started) >= self.config.cooldown()
        {
            info!("Alert cooled down, returning to normal");
            inner.state = AttackState::default();
            self.phase
                .store(AttackPhase::Normal, std::sync::atomic::Ordering::SeqCst);
            self.responder.on_clear();
        }
    }

    fn count_recent(&self, events: &VecDeque<RequestEvent>, now: Instant) -> usize {
        let window = self.config.window();
        events
            .iter()
            .filter(|e| now.saturating_duration_since(e.at) <= window)
            .count()
    }

    #[must_use]
    pub fn state(&self) -> AttackState {
        self.lock().state
    }

    /// Number of buffered events (inside the window or not)
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.lock().events.len()
    }

    #[must_use]
    pub fn status(&self) -> AttackStatus {
        self.status_at(Instant::now())
    }

    #[must_use]
    pub fn status_at(&self, now: Instant) -> AttackStatus {
        let inner = self.lock();
        AttackStatus {
            alert: inner.state.is_alert,
            alert_age_ms: inner.state.alert_started_at.map(|started| {
                u64::try_from(now.saturating_duration_since(started).as_millis())
                    .unwrap_or(u64::MAX)
            }),
            recent_requests: self.count_recent(&inner.events, now),
            last_endpoint: inner.events.back().map(|e| e.endpoint.clone()),
        }
    }
}

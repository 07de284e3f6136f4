//! Animation pattern tables
//!
//! A [`Pattern`] is plain data: an ordered list of frames, each with its own
//! hold time, plus a repeat mode. [`PatternSet`] builds every pattern the
//! demo uses from the bank size, the configured timing and the LED roles.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pin::Frame;

/// Slowest chase rate accepted from callers
pub const MIN_CHASE_HZ: f32 = 0.1;

/// Breathing brightness moves in steps of this many percent
const BREATH_STEP: u8 = 10;
/// Brightness at which the low breathing LED turns on
const BREATH_LOW_THRESHOLD: u8 = 34;
/// Brightness at which the high breathing LED turns on
const BREATH_HIGH_THRESHOLD: u8 = 67;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Wave,
    Roundtrip,
    Chase,
    Strobe,
    Breathing,
    Alert,
    PortDown,
    PortUp,
    Flash,
    SnmpSuccess,
}

impl PatternKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Wave => "wave",
            Self::Roundtrip => "roundtrip",
            Self::Chase => "chase",
            Self::Strobe => "strobe",
            Self::Breathing => "breathing",
            Self::Alert => "alert",
            Self::PortDown => "port_down",
            Self::PortUp => "port_up",
            Self::Flash => "flash",
            Self::SnmpSuccess => "snmp_success",
        }
    }
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Run the steps once, then blank
    Once,
    /// Run the steps until cancelled
    Loop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub frame: Frame,
    /// How long the frame stays up before the next step
    pub hold: Duration,
}

#[derive(Debug, Clone)]
pub struct Pattern {
    kind: PatternKind,
    steps: Vec<Step>,
    repeat: Repeat,
}

impl Pattern {
    #[must_use]
    pub const fn new(kind: PatternKind, steps: Vec<Step>, repeat: Repeat) -> Self {
        Self {
            kind,
            steps,
            repeat,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> PatternKind {
        self.kind
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[must_use]
    pub const fn repeat(&self) -> Repeat {
        self.repeat
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Total hold time of one pass over the steps
    #[must_use]
    pub fn cycle_duration(&self) -> Duration {
        self.steps.iter().map(|s| s.hold).sum()
    }
}

/// Step timings, all in milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationTiming {
    #[serde(default = "default_wave_step_ms")]
    pub wave_step_ms: u64,
    #[serde(default = "default_roundtrip_step_ms")]
    pub roundtrip_step_ms: u64,
    /// Rate of the normal chase, in steps per second
    #[serde(default = "default_chase_hz")]
    pub chase_hz: f32,
    #[serde(default = "default_strobe_blinks")]
    pub strobe_blinks: u32,
    #[serde(default = "default_strobe_on_ms")]
    pub strobe_on_ms: u64,
    #[serde(default = "default_strobe_off_ms")]
    pub strobe_off_ms: u64,
    #[serde(default = "default_breathing_step_ms")]
    pub breathing_step_ms: u64,
    #[serde(default = "default_alert_pulses")]
    pub alert_pulses: u32,
    #[serde(default = "default_alert_pulse_ms")]
    pub alert_pulse_ms: u64,
    #[serde(default = "default_alert_chase_step_ms")]
    pub alert_chase_step_ms: u64,
    /// How many LEDs the alert chase and the port sweeps cover
    #[serde(default = "default_sweep_len")]
    pub sweep_len: usize,
    #[serde(default = "default_sweep_step_ms")]
    pub sweep_step_ms: u64,
    #[serde(default = "default_flash_ms")]
    pub flash_ms: u64,
}

const fn default_wave_step_ms() -> u64 {
    160
}

const fn default_roundtrip_step_ms() -> u64 {
    140
}

const fn default_chase_hz() -> f32 {
    1.0
}

const fn default_strobe_blinks() -> u32 {
    3
}

const fn default_strobe_on_ms() -> u64 {
    120
}

const fn default_strobe_off_ms() -> u64 {
    120
}

const fn default_breathing_step_ms() -> u64 {
    40
}

const fn default_alert_pulses() -> u32 {
    4
}

const fn default_alert_pulse_ms() -> u64 {
    60
}

const fn default_alert_chase_step_ms() -> u64 {
    40
}

const fn default_sweep_len() -> usize {
    7
}

const fn default_sweep_step_ms() -> u64 {
    150
}

const fn default_flash_ms() -> u64 {
    200
}

impl Default for AnimationTiming {
    fn default() -> Self {
        Self {
            wave_step_ms: default_wave_step_ms(),
            roundtrip_step_ms: default_roundtrip_step_ms(),
            chase_hz: default_chase_hz(),
            strobe_blinks: default_strobe_blinks(),
            strobe_on_ms: default_strobe_on_ms(),
            strobe_off_ms: default_strobe_off_ms(),
            breathing_step_ms: default_breathing_step_ms(),
            alert_pulses: default_alert_pulses(),
            alert_pulse_ms: default_alert_pulse_ms(),
            alert_chase_step_ms: default_alert_chase_step_ms(),
            sweep_len: default_sweep_len(),
            sweep_step_ms: default_sweep_step_ms(),
            flash_ms: default_flash_ms(),
        }
    }
}

/// Which logical LEDs carry a meaning of their own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedRoles {
    #[serde(default = "default_error_led")]
    pub error: usize,
    #[serde(default = "default_success_led")]
    pub success: usize,
    #[serde(default = "default_interfaces_led")]
    pub interfaces: usize,
    /// Low and high LED of the breathing pattern
    #[serde(default = "default_breathing_leds")]
    pub breathing: [usize; 2],
    /// The pair pulsed at the start of the alert pattern
    #[serde(default = "default_alert_leds")]
    pub alert: [usize; 2],
}

const fn default_error_led() -> usize {
    0
}

const fn default_success_led() -> usize {
    2
}

const fn default_interfaces_led() -> usize {
    3
}

const fn default_breathing_leds() -> [usize; 2] {
    [1, 2]
}

const fn default_alert_leds() -> [usize; 2] {
    [0, 1]
}

impl Default for LedRoles {
    fn default() -> Self {
        Self {
            error: default_error_led(),
            success: default_success_led(),
            interfaces: default_interfaces_led(),
            breathing: default_breathing_leds(),
            alert: default_alert_leds(),
        }
    }
}

/// Step period for a chase at `hz` steps per second.
///
/// Rates below [`MIN_CHASE_HZ`] are clamped; non-finite rates fall back to 1 Hz.
#[must_use]
pub fn chase_period(hz: f32) -> Duration {
    let hz = if hz.is_finite() { hz.max(MIN_CHASE_HZ) } else { 1.0 };
    Duration::from_secs_f32(1.0 / hz)
}

/// Brightness levels for one breathing cycle: 0, 10, ..., 100, 90, ..., 10
fn breathing_levels() -> impl Iterator<Item = u8> {
    (0..=10u8).chain((1..10u8).rev()).map(|i| i * BREATH_STEP)
}

/// Builds the demo's patterns for a bank of a given size
#[derive(Debug, Clone)]
pub struct PatternSet {
    bank_len: usize,
    timing: AnimationTiming,
    roles: LedRoles,
}

impl PatternSet {
    #[must_use]
    pub const fn new(bank_len: usize, timing: AnimationTiming, roles: LedRoles) -> Self {
        Self {
            bank_len,
            timing,
            roles,
        }
    }

    #[must_use]
    pub const fn bank_len(&self) -> usize {
        self.bank_len
    }

    #[must_use]
    pub const fn timing(&self) -> &AnimationTiming {
        &self.timing
    }

    #[must_use]
    pub const fn roles(&self) -> &LedRoles {
        &self.roles
    }

    /// Frame with only the given LEDs lit; out-of-range indices are dropped
    #[must_use]
    pub fn lit(&self, indices: &[usize]) -> Frame {
        let mut frame: Frame = smallvec::smallvec![false; self.bank_len];
        for &i in indices {
            if let Some(slot) = frame.get_mut(i) {
                *slot = true;
            }
        }
        frame
    }

    fn blank(&self) -> Frame {
        self.lit(&[])
    }

    fn single_steps(&self, indices: impl Iterator<Item = usize>, hold: Duration) -> Vec<Step> {
        indices
            .map(|i| Step {
                frame: self.lit(&[i]),
                hold,
            })
            .collect()
    }

    fn sweep_len(&self) -> usize {
        self.timing.sweep_len.min(self.bank_len)
    }

    /// One LED at a time, left to right, once
    #[must_use]
    pub fn wave(&self) -> Pattern {
        let hold = Duration::from_millis(self.timing.wave_step_ms);
        Pattern::new(
            PatternKind::Wave,
            self.single_steps(0..self.bank_len, hold),
            Repeat::Once,
        )
    }

    /// Out to the last LED, hold there one extra step, back to the first
    #[must_use]
    pub fn roundtrip(&self) -> Pattern {
        if self.bank_len == 0 {
            return Pattern::new(PatternKind::Roundtrip, Vec::new(), Repeat::Once);
        }
        let hold = Duration::from_millis(self.timing.roundtrip_step_ms);
        let last = self.bank_len - 1;
        let indices = (0..self.bank_len)
            .chain(std::iter::once(last))
            .chain((0..last).rev());
        Pattern::new(
            PatternKind::Roundtrip,
            self.single_steps(indices, hold),
            Repeat::Once,
        )
    }

    /// Continuous chase at `hz` steps per second
    #[must_use]
    pub fn chase(&self, hz: f32) -> Pattern {
        Pattern::new(
            PatternKind::Chase,
            self.single_steps(0..self.bank_len, chase_period(hz)),
            Repeat::Loop,
        )
    }

    /// The idle-but-alive pattern: chase at the configured rate
    #[must_use]
    pub fn normal(&self) -> Pattern {
        self.chase(self.timing.chase_hz)
    }

    /// Blink the error LED
    #[must_use]
    pub fn strobe(&self) -> Pattern {
        let on = Duration::from_millis(self.timing.strobe_on_ms);
        let off = Duration::from_millis(self.timing.strobe_off_ms);
        let steps = if self.roles.error < self.bank_len {
            (0..self.timing.strobe_blinks)
                .flat_map(|_| {
                    [
                        Step {
                            frame: self.lit(&[self.roles.error]),
                            hold: on,
                        },
                        Step {
                            frame: self.blank(),
                            hold: off,
                        },
                    ]
                })
                .collect()
        } else {
            Vec::new()
        };
        Pattern::new(PatternKind::Strobe, steps, Repeat::Once)
    }

    /// Frame for one breathing brightness level (0..=100)
    #[must_use]
    pub fn breathing_frame(&self, level: u8) -> Frame {
        let [low, high] = self.roles.breathing;
        let mut lit = Vec::with_capacity(2);
        if level >= BREATH_LOW_THRESHOLD {
            lit.push(low);
        }
        if level >= BREATH_HIGH_THRESHOLD {
            lit.push(high);
        }
        self.lit(&lit)
    }

    #[must_use]
    pub fn breathing(&self) -> Pattern {
        if self.bank_len == 0 {
            return Pattern::new(PatternKind::Breathing, Vec::new(), Repeat::Loop);
        }
        let hold = Duration::from_millis(self.timing.breathing_step_ms);
        let steps = breathing_levels()
            .map(|level| Step {
                frame: self.breathing_frame(level),
                hold,
            })
            .collect();
        Pattern::new(PatternKind::Breathing, steps, Repeat::Loop)
    }

    /// Rapid pulses of the alert pair followed by a short chase, looped
    #[must_use]
    pub fn alert(&self) -> Pattern {
        if self.bank_len == 0 {
            return Pattern::new(PatternKind::Alert, Vec::new(), Repeat::Loop);
        }
        let pulse = Duration::from_millis(self.timing.alert_pulse_ms);
        let mut steps: Vec<Step> = (0..self.timing.alert_pulses)
            .flat_map(|_| {
                [
                    Step {
                        frame: self.lit(&self.roles.alert),
                        hold: pulse,
                    },
                    Step {
                        frame: self.blank(),
                        hold: pulse,
                    },
                ]
            })
            .collect();
        let chase = Duration::from_millis(self.timing.alert_chase_step_ms);
        steps.extend(self.single_steps(0..self.sweep_len(), chase));
        Pattern::new(PatternKind::Alert, steps, Repeat::Loop)
    }

    #[must_use]
    pub fn port_down(&self) -> Pattern {
        let hold = Duration::from_millis(self.timing.sweep_step_ms);
        Pattern::new(
            PatternKind::PortDown,
            self.single_steps(0..self.sweep_len(), hold),
            Repeat::Once,
        )
    }

    #[must_use]
    pub fn port_up(&self) -> Pattern {
        let hold = Duration::from_millis(self.timing.sweep_step_ms);
        Pattern::new(
            PatternKind::PortUp,
            self.single_steps((0..self.sweep_len()).rev(), hold),
            Repeat::Once,
        )
    }

    /// Light one LED briefly
    #[must_use]
    pub fn flash(&self, index: usize) -> Pattern {
        let steps = if index < self.bank_len {
            vec![Step {
                frame: self.lit(&[index]),
                hold: Duration::from_millis(self.timing.flash_ms),
            }]
        } else {
            Vec::new()
        };
        Pattern::new(PatternKind::Flash, steps, Repeat::Once)
    }

    /// Flash the success LED, then a wave
    #[must_use]
    pub fn snmp_success(&self) -> Pattern {
        let mut steps = self.flash(self.roles.success).steps;
        steps.extend(self.wave().steps);
        Pattern::new(PatternKind::SnmpSuccess, steps, Repeat::Once)
    }

    /// Flash the interfaces LED
    #[must_use]
    pub fn interfaces_flash(&self) -> Pattern {
        self.flash(self.roles.interfaces)
    }
}

//! LED bank animation core for packetlights
//!
//! This library holds everything that decides which LEDs are lit and when:
//! the pin driver, the pattern tables, the animation controller that keeps
//! exactly one pattern on the bank, and the request-rate monitor that flips
//! the bank into an alert pattern. It is hardware-agnostic; the server crate
//! plugs in a pigpiod backend, tests use [`MemoryBackend`].

pub mod controller;
pub mod monitor;
pub mod pattern;
pub mod pin;
pub mod status;

pub use controller::{AnimationController, CancelToken, DEFAULT_JOIN_TIMEOUT};
pub use monitor::{
    AlertResponder, AttackMonitor, AttackPhase, AttackState, AttackStatus, ControllerResponder,
    MonitorConfig,
};
pub use pattern::{
    chase_period, AnimationTiming, LedRoles, Pattern, PatternKind, PatternSet, Repeat, Step,
};
pub use pin::{
    BackendError, Frame, Level, MemoryBackend, OutputBackend, Pin, PinDriver, Polarity,
    MAX_INLINE_PINS,
};
pub use status::StatusSnapshot;

use indexmap::IndexMap;
use serde::Serialize;

use crate::controller::AnimationController;
use crate::monitor::{AttackMonitor, AttackStatus};
use crate::pattern::PatternKind;

/// Point-in-time view of the bank, the running animation and the monitor
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// BCM line → physical level (0/1), in bank order
    pub pins: IndexMap<String, u8>,
    /// Logical on/off per LED
    pub leds: Vec<bool>,
    pub animation: Option<PatternKind>,
    pub attack: AttackStatus,
}

impl StatusSnapshot {
    #[must_use]
    pub fn capture(controller: &AnimationController, monitor: &AttackMonitor) -> Self {
        let driver = controller.driver();
        let pins = driver
            .pins()
            .iter()
            .zip(driver.levels())
            .map(|(pin, level)| (pin.line.to_string(), level.as_u8()))
            .collect();
        Self {
            pins,
            leds: driver.snapshot().to_vec(),
            animation: controller.current(),
            attack: monitor.status(),
        }
    }

    /// No LED emits light
    #[must_use]
    pub fn is_dark(&self) -> bool {
        self.leds.iter().all(|on| !on)
    }
}

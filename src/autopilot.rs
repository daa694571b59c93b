//! One-shot launch sequence: hold the button at boot, release it to go.

use std::time::{Duration, Instant};

use crate::config::{AUTOPILOT_BASE_THROTTLE, AUTOPILOT_DURATION, AUTOPILOT_RAMP_PER_SEC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disabled,
    Ready,
    Going { since: Instant },
    Halted,
}

/// What the caller must do after an update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutopilotAction {
    None,
    /// Capture the current heading as anchor and start the controller.
    Engage,
    /// Command this throttle percentage.
    Throttle(f32),
    /// Zero the throttle, disengage and lock the control loop out for good.
    Halt,
}

#[derive(Debug)]
pub struct Autopilot {
    phase: Phase,
    max_speed: f32,
}

impl Autopilot {
    pub fn new(max_speed: f32) -> Self {
        Self {
            phase: Phase::Disabled,
            max_speed,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_max_speed(&mut self, max_speed: f32) {
        self.max_speed = max_speed;
    }

    /// Arm the sequence. Only meaningful once, at boot.
    pub fn arm(&mut self) {
        if self.phase == Phase::Disabled {
            log::info!("Autopilot armed, release the button to launch");
            self.phase = Phase::Ready;
        }
    }

    /// Throttle percentage `elapsed` after launch.
    pub fn throttle_at(&self, elapsed: Duration) -> f32 {
        if elapsed >= AUTOPILOT_DURATION {
            return 0.0;
        }
        let ramp = AUTOPILOT_BASE_THROTTLE + AUTOPILOT_RAMP_PER_SEC * elapsed.as_secs_f32();
        ramp.min(self.max_speed).max(0.0)
    }

    pub fn update(&mut self, button_held: bool, now: Instant) -> AutopilotAction {
        match self.phase {
            Phase::Disabled | Phase::Halted => AutopilotAction::None,
            Phase::Ready if button_held => AutopilotAction::None,
            Phase::Ready => {
                log::info!("Autopilot launch");
                self.phase = Phase::Going { since: now };
                AutopilotAction::Engage
            }
            Phase::Going { since } => {
                let elapsed = now.saturating_duration_since(since);
                if elapsed >= AUTOPILOT_DURATION {
                    log::warn!("Autopilot ran {:?}, halting", AUTOPILOT_DURATION);
                    self.phase = Phase::Halted;
                    AutopilotAction::Halt
                } else {
                    AutopilotAction::Throttle(self.throttle_at(elapsed))
                }
            }
        }
    }
}

//! Command dispatcher.
//!
//! Owns the heading controller and applies every decoded inbound message to
//! the profile, the controller, the calibration engine's mailbox and the
//! actuators. Runs on the non-real-time side: nothing here is on a sample
//! tick's critical path.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use crate::actuators::{Actuators, SharedActuators};
use crate::calibration::{CaptureMode, CaptureRequests};
use crate::config::LOCK_WAIT;
use crate::controller::{HeadingController, PidCoefficients};
use crate::error::{ActuatorError, ProtocolError, StorageError};
use crate::heading::normalize;
use crate::profile::{CalibrationProfile, SharedProfile};
use crate::protocol::{Command, Telemetry, TelemetrySink};
use crate::state::{AnchorState, AtomicF32, HeadingCell, lock_within};

pub struct Vessel {
    controller: HeadingController,
    profile: Arc<SharedProfile>,
    heading: Arc<HeadingCell>,
    anchor: AnchorState,
    captures: Arc<CaptureRequests>,
    actuators: SharedActuators,
    trim: Arc<AtomicF32>,
    sink: Arc<dyn TelemetrySink>,
}

impl Vessel {
    /// Wire the controller to the heading cell and the rudder, and load the
    /// stored PID gains.
    pub fn new(
        profile: Arc<SharedProfile>,
        heading: Arc<HeadingCell>,
        captures: Arc<CaptureRequests>,
        actuators: SharedActuators,
        sink: Arc<dyn TelemetrySink>,
        control_period: Duration,
    ) -> Self {
        let trim = Arc::new(AtomicF32::new(profile.snapshot().actuator_trim));

        let get_yaw = {
            let heading = Arc::clone(&heading);
            move || heading.read(LOCK_WAIT).value()
        };
        let on_output = {
            let actuators = Arc::clone(&actuators);
            let trim = Arc::clone(&trim);
            move |command: f32| match lock_within(&*actuators, LOCK_WAIT) {
                Some(mut actuators) => {
                    if let Err(e) = actuators.set_rudder(trim.load() + command) {
                        log::warn!("Rudder command failed: {}", e);
                    }
                }
                None => log::debug!("Actuators busy, rudder command dropped"),
            }
        };

        let controller = HeadingController::new(control_period, get_yaw, on_output);
        {
            let mut store = profile.store().lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = controller.load(&mut *store) {
                log::warn!("Failed to persist default PID coefficients: {}", e);
            }
        }

        Self {
            controller,
            profile,
            heading,
            anchor: AnchorState::new(),
            captures,
            actuators,
            trim,
            sink,
        }
    }

    pub fn is_anchoring(&self) -> bool {
        self.anchor.is_anchoring()
    }

    pub fn yaw_anchor(&self) -> f32 {
        self.anchor.yaw_anchor()
    }

    pub fn coefficients(&self) -> PidCoefficients {
        self.controller.coefficients()
    }

    pub fn profile(&self) -> CalibrationProfile {
        self.profile.snapshot()
    }

    pub fn controller_anchor(&self) -> Option<f32> {
        self.controller.anchor()
    }

    fn current_heading(&self) -> f32 {
        self.heading.read(LOCK_WAIT).value()
    }

    /// Decode one inbound message and apply it. A malformed message changes
    /// nothing.
    pub fn handle_packet(&mut self, message: &[u8]) -> Result<(), ProtocolError> {
        let command = Command::decode(message)?;
        log::debug!("<- {:?}", command);
        self.apply(command);
        Ok(())
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::RequestCoefficients => self.send_coefficients(),
            Command::SetCoefficients(coefficients) => self.set_coefficients(coefficients),
            Command::SetKp(kp) => self.set_coefficients(PidCoefficients {
                kp,
                ..self.coefficients()
            }),
            Command::SetKi(ki) => self.set_coefficients(PidCoefficients {
                ki,
                ..self.coefficients()
            }),
            Command::SetKd(kd) => self.set_coefficients(PidCoefficients {
                kd,
                ..self.coefficients()
            }),
            Command::SetAnchoring(true) => self.engage(),
            Command::SetAnchoring(false) => self.disengage(),
            Command::SetYawAnchor(anchor) => self.set_yaw_anchor(anchor),
            Command::Steer { angle, speed } => self.steer(angle, speed),
            Command::Ping => log::trace!("ping"),
            Command::MagCalibration { bias, scale } => {
                self.captures.cancel(CaptureMode::Mag);
                self.update_profile("magnetometer calibration", |p| {
                    p.mag_bias = bias;
                    p.mag_scale = scale;
                });
            }
            Command::StartGyroCapture => self.captures.post(CaptureMode::Gyro),
            Command::StartMagCapture => self.captures.post(CaptureMode::Mag),
            Command::AccelCapture(Some(axis)) => self.captures.post(CaptureMode::Accel(axis)),
            Command::AccelCapture(None) => self.captures.post(CaptureMode::Idle),
            Command::AccelBias(bias) => {
                self.update_profile("accelerometer bias", |p| p.accel_bias = bias);
            }
            Command::RequestProfile => self.send_profile(),
            Command::UploadProfile(profile) => {
                self.update_profile("profile upload", |p| *p = profile);
            }
            Command::SetNorth => {
                let heading = self.current_heading();
                self.update_profile("north reference", |p| {
                    p.heading_zero = normalize(p.heading_zero + heading);
                });
            }
        }
    }

    fn send_coefficients(&self) {
        self.sink.send(&Telemetry::Coefficients(self.coefficients()));
    }

    fn send_profile(&self) {
        self.sink.send(&Telemetry::Profile(self.profile.snapshot()));
    }

    fn send_anchor_state(&self) {
        self.sink.send(&Telemetry::Anchoring(self.is_anchoring()));
        self.sink.send(&Telemetry::YawAnchor(self.yaw_anchor()));
    }

    /// Periodic heading report.
    pub fn send_heading(&self) {
        self.sink.send(&Telemetry::Heading(self.current_heading()));
        if self.is_anchoring() {
            self.sink.send(&Telemetry::YawAnchor(self.yaw_anchor()));
        }
    }

    fn report_storage_error(&self, what: &str, e: &StorageError) {
        log::warn!("Failed to persist {}: {}", what, e);
        self.sink
            .send(&Telemetry::Message(format!("{what} not saved: {e}")));
    }

    fn set_coefficients(&mut self, coefficients: PidCoefficients) {
        self.controller.set_coefficients(coefficients);
        log::info!(
            "PID gains kp={} ki={} kd={}",
            coefficients.kp,
            coefficients.ki,
            coefficients.kd
        );

        let saved = {
            let mut store = self
                .profile
                .store()
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.controller.save(&mut *store)
        };
        if let Err(e) = saved {
            self.report_storage_error("PID coefficients", &e);
        }
        self.send_coefficients();
    }

    fn update_profile<F>(&mut self, what: &str, change: F)
    where
        F: FnOnce(&mut CalibrationProfile),
    {
        let profile = match self.profile.update(change) {
            Ok(profile) => {
                log::info!("Saved {}", what);
                profile
            }
            Err(e) => {
                self.report_storage_error(what, &e);
                self.profile.snapshot()
            }
        };

        self.trim.store(profile.actuator_trim);
        self.send_profile();
    }

    /// Hold the current heading.
    pub fn engage(&mut self) {
        let anchor = self.current_heading();
        self.anchor.set_yaw_anchor(anchor);
        self.anchor.set_anchoring(true);
        self.controller.start(anchor);
        self.send_anchor_state();
    }

    pub fn disengage(&mut self) {
        self.controller.stop();
        self.anchor.set_anchoring(false);
        self.with_actuators(|a, trim| a.set_rudder(trim));
        self.send_anchor_state();
    }

    fn set_yaw_anchor(&mut self, anchor: f32) {
        if !anchor.is_finite() {
            log::warn!("Ignoring non-finite yaw anchor");
            return;
        }

        let anchor = normalize(anchor);
        self.anchor.set_yaw_anchor(anchor);

        // the running task holds its anchor by value
        if self.is_anchoring() {
            self.controller.start(anchor);
        }
        self.send_anchor_state();
    }

    fn steer(&mut self, angle: f32, speed: f32) {
        let anchoring = self.is_anchoring();
        self.with_actuators(|a, trim| {
            if !anchoring {
                a.set_rudder(trim - angle)?;
            }
            a.set_throttle(speed)
        });
    }

    pub fn set_throttle(&mut self, percent: f32) {
        self.with_actuators(|a, _| a.set_throttle(percent));
    }

    /// Stop the controller, zero the throttle and center the rudder.
    pub fn halt(&mut self) {
        self.controller.stop();
        self.anchor.set_anchoring(false);
        self.with_actuators(|a, trim| a.neutral(trim));
        self.send_anchor_state();
    }

    fn with_actuators<F>(&self, command: F)
    where
        F: FnOnce(&mut dyn Actuators, f32) -> Result<(), ActuatorError>,
    {
        let mut actuators = self.actuators.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = command(&mut *actuators, self.trim.load()) {
            log::warn!("Actuator command failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuators::VirtualActuators;
    use crate::storage::{self, KeyValueStore, MemoryStore};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};
    use std::sync::Mutex;
    use std::thread;

    struct Rig {
        vessel: Vessel,
        heading: Arc<HeadingCell>,
        captures: Arc<CaptureRequests>,
        actuators: Arc<Mutex<VirtualActuators>>,
        sent: Arc<Mutex<Vec<Telemetry>>>,
    }

    fn rig() -> Rig {
        let profile = Arc::new(SharedProfile::load(storage::shared(MemoryStore::new())));
        let heading = Arc::new(HeadingCell::new());
        let captures = Arc::new(CaptureRequests::new());
        let actuators = Arc::new(Mutex::new(VirtualActuators::default()));
        let sent = Arc::new(Mutex::new(Vec::<Telemetry>::new()));
        let vessel = Vessel::new(
            profile,
            heading.clone(),
            captures.clone(),
            actuators.clone(),
            sent.clone(),
            Duration::from_millis(10),
        );
        Rig {
            vessel,
            heading,
            captures,
            actuators,
            sent,
        }
    }

    impl Rig {
        fn take_sent(&self) -> Vec<Telemetry> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[test]
    fn test_boot_persists_default_gains() {
        let rig = rig();
        assert_eq!(rig.vessel.coefficients(), PidCoefficients::new(1.0, 0.0, 0.0));
        let store = rig.vessel.profile.store().lock().unwrap();
        assert!(store.contains(crate::controller::KEY_PID_COEFFICIENTS));
    }

    #[test]
    fn test_engage_captures_heading_by_value() {
        let mut rig = rig();
        rig.heading.publish(123.0, LOCK_WAIT);

        rig.vessel.apply(Command::SetAnchoring(true));
        assert!(rig.vessel.is_anchoring());
        assert_eq!(rig.vessel.controller_anchor(), Some(123.0));

        // the published heading moves on, the anchor does not
        rig.heading.publish(150.0, LOCK_WAIT);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(rig.vessel.controller_anchor(), Some(123.0));

        let sent = rig.take_sent();
        assert_eq!(
            sent,
            vec![Telemetry::Anchoring(true), Telemetry::YawAnchor(123.0)]
        );

        // error +27° drives the rudder 27° to the reverse side of trim
        let rudder = rig.actuators.lock().unwrap().rudder.unwrap();
        assert_relative_eq!(rudder, 91.5 - 27.0, epsilon = 1e-3);

        rig.vessel.apply(Command::SetAnchoring(false));
        assert!(!rig.vessel.is_anchoring());
        assert_eq!(rig.vessel.controller_anchor(), None);
        assert_eq!(rig.actuators.lock().unwrap().rudder, Some(91.5));
    }

    #[test]
    fn test_yaw_anchor_restarts_running_controller() {
        let mut rig = rig();
        rig.vessel.apply(Command::SetAnchoring(true));
        rig.vessel.apply(Command::SetYawAnchor(-90.0));

        assert_eq!(rig.vessel.yaw_anchor(), 270.0);
        assert_eq!(rig.vessel.controller_anchor(), Some(270.0));
    }

    #[test]
    fn test_yaw_anchor_while_idle_does_not_start() {
        let mut rig = rig();
        rig.vessel.apply(Command::SetYawAnchor(45.0));
        assert_eq!(rig.vessel.yaw_anchor(), 45.0);
        assert_eq!(rig.vessel.controller_anchor(), None);

        rig.vessel.apply(Command::SetYawAnchor(f32::NAN));
        assert_eq!(rig.vessel.yaw_anchor(), 45.0);
    }

    #[test]
    fn test_steer_respects_anchoring() {
        let mut rig = rig();
        rig.vessel.apply(Command::Steer {
            angle: 10.0,
            speed: 40.0,
        });
        assert_eq!(
            *rig.actuators.lock().unwrap(),
            VirtualActuators {
                rudder: Some(81.5),
                throttle: Some(40.0),
            }
        );

        rig.vessel.apply(Command::SetAnchoring(true));
        rig.vessel.apply(Command::Steer {
            angle: -30.0,
            speed: 60.0,
        });
        assert_eq!(rig.actuators.lock().unwrap().throttle, Some(60.0));
        let rudder = rig.actuators.lock().unwrap().rudder.unwrap();
        assert!((rudder - 121.5).abs() > 1.0, "manual steer leaked: {rudder}");
    }

    #[test]
    fn test_gain_updates_persist_and_echo() {
        let mut rig = rig();
        rig.vessel.apply(Command::SetKp(2.5));
        rig.vessel.apply(Command::SetKd(0.25));

        let expected = PidCoefficients::new(2.5, 0.0, 0.25);
        assert_eq!(rig.vessel.coefficients(), expected);
        assert_eq!(rig.take_sent().last(), Some(&Telemetry::Coefficients(expected)));

        let store = rig.vessel.profile.store().lock().unwrap();
        let bytes = store.get_bytes(crate::controller::KEY_PID_COEFFICIENTS).unwrap();
        assert_eq!(PidCoefficients::from_bytes(&bytes), Some(expected));
    }

    #[test]
    fn test_capture_commands_post_modes() {
        let mut rig = rig();
        let mut engine = crate::calibration::CalibrationEngine::new(
            rig.vessel.profile.clone(),
            rig.captures.clone(),
            rig.sent.clone(),
        );
        let sample = crate::sensor::RawSample::level();

        rig.vessel.apply(Command::StartGyroCapture);
        engine.on_sample(&sample);
        assert_eq!(engine.mode(), CaptureMode::Gyro);

        rig.vessel.apply(Command::AccelCapture(Some(2)));
        engine.on_sample(&sample);
        assert_eq!(engine.mode(), CaptureMode::Accel(2));

        rig.vessel.apply(Command::AccelCapture(None));
        engine.on_sample(&sample);
        assert_eq!(engine.mode(), CaptureMode::Idle);

        rig.vessel.apply(Command::StartMagCapture);
        engine.on_sample(&sample);
        assert_eq!(engine.mode(), CaptureMode::Mag);

        rig.vessel.apply(Command::MagCalibration {
            bias: Vector3::new(1.0, 2.0, 3.0),
            scale: Matrix3::from_diagonal_element(1.5),
        });
        engine.on_sample(&sample);
        assert_eq!(engine.mode(), CaptureMode::Idle);

        let profile = rig.vessel.profile();
        assert_eq!(profile.mag_bias, Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(profile.mag_scale, Matrix3::from_diagonal_element(1.5));
    }

    #[test]
    fn test_mag_upload_cancels_queued_mag_capture() {
        let mut rig = rig();
        let mut engine = crate::calibration::CalibrationEngine::new(
            rig.vessel.profile.clone(),
            rig.captures.clone(),
            rig.sent.clone(),
        );

        rig.vessel.apply(Command::StartMagCapture);
        rig.vessel.apply(Command::MagCalibration {
            bias: Vector3::new(4.0, 5.0, 6.0),
            scale: Matrix3::identity(),
        });
        rig.take_sent();

        engine.on_sample(&crate::sensor::RawSample::level());
        assert_eq!(engine.mode(), CaptureMode::Idle);
        assert!(
            !rig.take_sent()
                .iter()
                .any(|t| matches!(t, Telemetry::MagPoint(_)))
        );
    }

    #[test]
    fn test_set_north_zeroes_current_heading() {
        let mut rig = rig();
        rig.vessel.apply(Command::UploadProfile(CalibrationProfile {
            heading_zero: 20.0,
            ..CalibrationProfile::default()
        }));
        // published heading is fused - zero, so fused is 60° here
        rig.heading.publish(40.0, LOCK_WAIT);

        rig.vessel.apply(Command::SetNorth);
        assert_relative_eq!(rig.vessel.profile().heading_zero, 60.0);

        rig.vessel.apply(Command::UploadProfile(CalibrationProfile {
            heading_zero: 350.0,
            ..CalibrationProfile::default()
        }));
        rig.heading.publish(30.0, LOCK_WAIT);
        rig.vessel.apply(Command::SetNorth);
        assert_relative_eq!(rig.vessel.profile().heading_zero, 20.0);
    }

    #[test]
    fn test_profile_upload_moves_trim() {
        let mut rig = rig();
        rig.vessel.apply(Command::UploadProfile(CalibrationProfile {
            actuator_trim: 85.0,
            ..CalibrationProfile::default()
        }));
        assert!(matches!(
            rig.take_sent().last(),
            Some(Telemetry::Profile(p)) if p.actuator_trim == 85.0
        ));

        rig.vessel.apply(Command::Steer {
            angle: 5.0,
            speed: 0.0,
        });
        assert_eq!(rig.actuators.lock().unwrap().rudder, Some(80.0));
    }

    #[test]
    fn test_malformed_packet_changes_nothing() {
        let mut rig = rig();
        let before = rig.vessel.coefficients();

        assert!(rig.vessel.handle_packet(&[b'p', 0, 0]).is_err());
        assert!(rig.vessel.handle_packet(&[0x0a, 1, 2]).is_err());
        assert!(rig.vessel.handle_packet(&[]).is_err());

        assert_eq!(rig.vessel.coefficients(), before);
        assert!(!rig.vessel.is_anchoring());
        assert!(rig.take_sent().is_empty());
    }

    #[test]
    fn test_halt_is_neutral() {
        let mut rig = rig();
        rig.vessel.apply(Command::SetAnchoring(true));
        rig.vessel.set_throttle(30.0);

        rig.vessel.halt();
        assert!(!rig.vessel.is_anchoring());
        assert_eq!(rig.vessel.controller_anchor(), None);
        assert_eq!(
            *rig.actuators.lock().unwrap(),
            VirtualActuators {
                rudder: Some(91.5),
                throttle: Some(0.0),
            }
        );
    }

    #[test]
    fn test_heading_report() {
        let rig = rig();
        rig.heading.publish(12.5, LOCK_WAIT);
        rig.vessel.send_heading();
        assert_eq!(rig.take_sent(), vec![Telemetry::Heading(12.5)]);
    }
}

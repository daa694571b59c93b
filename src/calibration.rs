//! Live calibration capture.
//!
//! The engine observes the estimator's per-sample stream from inside the
//! estimator task, so every capture window is exactly N consecutive samples.
//! Only one capture runs at a time: starting a capture cancels whatever was
//! running and discards its partial sums.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use nalgebra::Vector3;

use crate::config::{
    ACCEL_AXIS_COUNT, ACCEL_CAPTURE_SAMPLES, ACCEL_PROGRESS_EVERY, GYRO_CAPTURE_SAMPLES,
    GYRO_PROGRESS_EVERY,
};
use crate::profile::SharedProfile;
use crate::protocol::{Telemetry, TelemetrySink};
use crate::sensor::RawSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Idle,
    Gyro,
    Mag,
    /// Board resting on one of six faces (+X,-X,+Y,-Y,+Z,-Z)
    Accel(u8),
}

const NO_REQUEST: u8 = 0;
const REQUEST_IDLE: u8 = 1;
const REQUEST_GYRO: u8 = 2;
const REQUEST_MAG: u8 = 3;
const REQUEST_ACCEL_BASE: u8 = 16;

impl CaptureMode {
    fn to_request(self) -> u8 {
        match self {
            CaptureMode::Idle => REQUEST_IDLE,
            CaptureMode::Gyro => REQUEST_GYRO,
            CaptureMode::Mag => REQUEST_MAG,
            CaptureMode::Accel(axis) => REQUEST_ACCEL_BASE + axis.min(ACCEL_AXIS_COUNT - 1),
        }
    }

    fn from_request(request: u8) -> Option<Self> {
        match request {
            REQUEST_IDLE => Some(CaptureMode::Idle),
            REQUEST_GYRO => Some(CaptureMode::Gyro),
            REQUEST_MAG => Some(CaptureMode::Mag),
            r if (REQUEST_ACCEL_BASE..REQUEST_ACCEL_BASE + ACCEL_AXIS_COUNT).contains(&r) => {
                Some(CaptureMode::Accel(r - REQUEST_ACCEL_BASE))
            }
            _ => None,
        }
    }
}

/// Single-slot mailbox the command handler uses to switch capture modes.
/// The engine picks the request up on its next sample; a newer request
/// overwrites one not yet taken.
#[derive(Debug, Default)]
pub struct CaptureRequests {
    pending: AtomicU8,
    active: AtomicU8,
}

impl CaptureRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, mode: CaptureMode) {
        self.pending.store(mode.to_request(), Ordering::Release);
    }

    /// Stop `mode` whether it is still queued or already running. A queued
    /// request for another mode is left alone.
    pub fn cancel(&self, mode: CaptureMode) {
        let request = mode.to_request();
        let queued = self
            .pending
            .compare_exchange(request, REQUEST_IDLE, Ordering::AcqRel, Ordering::Acquire);
        if queued.is_err() && self.active() == mode {
            let _ = self.pending.compare_exchange(
                NO_REQUEST,
                REQUEST_IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn take(&self) -> Option<CaptureMode> {
        CaptureMode::from_request(self.pending.swap(NO_REQUEST, Ordering::AcqRel))
    }

    /// Mode the engine last reported, for status queries off the real-time side.
    pub fn active(&self) -> CaptureMode {
        CaptureMode::from_request(self.active.load(Ordering::Acquire)).unwrap_or(CaptureMode::Idle)
    }

    fn set_active(&self, mode: CaptureMode) {
        self.active.store(mode.to_request(), Ordering::Release);
    }
}

/// Running per-axis sum over a capture window.
#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    sum: Vector3<f64>,
    count: u32,
}

impl Accumulator {
    fn add(&mut self, v: &Vector3<f32>) {
        self.sum += v.cast::<f64>();
        self.count += 1;
    }

    fn mean(&self) -> Vector3<f32> {
        if self.count == 0 {
            return Vector3::zeros();
        }
        (self.sum / self.count as f64).cast::<f32>()
    }
}

pub struct CalibrationEngine {
    mode: CaptureMode,
    acc: Accumulator,
    profile: Arc<SharedProfile>,
    requests: Arc<CaptureRequests>,
    sink: Arc<dyn TelemetrySink>,
}

impl CalibrationEngine {
    pub fn new(
        profile: Arc<SharedProfile>,
        requests: Arc<CaptureRequests>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            mode: CaptureMode::Idle,
            acc: Accumulator::default(),
            profile,
            requests,
            sink,
        }
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Samples accumulated in the current window.
    pub fn count(&self) -> u32 {
        self.acc.count
    }

    /// Switch mode, abandoning any capture in progress.
    pub fn start(&mut self, mode: CaptureMode) {
        if self.mode != CaptureMode::Idle && self.mode != mode {
            log::info!("Calibration {:?} cancelled by {:?}", self.mode, mode);
        }
        self.mode = mode;
        self.acc = Accumulator::default();
        self.requests.set_active(mode);

        if mode != CaptureMode::Idle {
            log::info!("Calibration {:?} started", mode);
        }
    }

    /// Per-sample hook, called synchronously from the estimator tick.
    pub fn on_sample(&mut self, raw: &RawSample) {
        if let Some(mode) = self.requests.take() {
            self.start(mode);
        }

        match self.mode {
            CaptureMode::Idle => {}
            CaptureMode::Gyro => self.gyro_sample(raw),
            CaptureMode::Mag => self.sink.send(&Telemetry::MagPoint(raw.mag)),
            CaptureMode::Accel(axis) => self.accel_sample(axis, raw),
        }
    }

    fn gyro_sample(&mut self, raw: &RawSample) {
        self.acc.add(&raw.gyro);
        let count = self.acc.count;

        if count < GYRO_CAPTURE_SAMPLES {
            if count % GYRO_PROGRESS_EVERY == 0 {
                let percentage = count as f32 * 100.0 / GYRO_CAPTURE_SAMPLES as f32;
                self.sink.send(&Telemetry::GyroProgress(percentage));
            }
            return;
        }

        let bias = self.acc.mean();
        log::info!(
            "Gyro bias captured: ({:.4}, {:.4}, {:.4}) deg/s",
            bias.x,
            bias.y,
            bias.z
        );
        if let Err(e) = self.profile.update(|p| p.gyro_bias = bias) {
            log::warn!("Failed to persist gyro bias: {}", e);
            self.sink
                .send(&Telemetry::Message(format!("Gyro bias not saved: {e}")));
        }
        self.sink.send(&Telemetry::GyroProgress(100.0));
        self.start(CaptureMode::Idle);
    }

    fn accel_sample(&mut self, axis: u8, raw: &RawSample) {
        self.acc.add(&raw.accel);
        let count = self.acc.count;

        if count < ACCEL_CAPTURE_SAMPLES {
            if count % ACCEL_PROGRESS_EVERY == 0 {
                let percentage = count as f32 * 100.0 / ACCEL_CAPTURE_SAMPLES as f32;
                self.sink.send(&Telemetry::AccelProgress { percentage, axis });
            }
            return;
        }

        // the ellipsoid fit across all six faces happens on the client
        let mean = self.acc.mean();
        log::info!(
            "Accel axis {} captured: ({:.4}, {:.4}, {:.4}) g",
            axis,
            mean.x,
            mean.y,
            mean.z
        );
        self.sink.send(&Telemetry::AccelResult { axis, mean });
        self.start(CaptureMode::Idle);
    }
}

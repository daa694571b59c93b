//! Orientation estimator: the periodic producer task.
//!
//! Each tick reads one raw sample, corrects it with the calibration profile,
//! fuses it into a heading, publishes the heading and hands the raw sample to
//! the per-sample observer before sleeping until the next deadline.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahrs::{Ahrs, Madgwick};
use nalgebra::{UnitQuaternion, Vector3};

use crate::config::{FUSION_BETA, LOCK_WAIT};
use crate::heading::normalize;
use crate::periodic::{MissCounter, Pacer};
use crate::profile::{CalibrationProfile, SharedProfile};
use crate::protocol::{Telemetry, TelemetrySink};
use crate::sensor::{RawSample, SensorSource};
use crate::state::HeadingCell;

/// Attitude filter black box.
pub trait Fusion: Send {
    /// Feed one corrected sample (gyro in deg/s). Returns the fused heading
    /// in degrees, or `None` when the filter rejected the sample.
    fn update(&mut self, gyro: &Vector3<f32>, accel: &Vector3<f32>, mag: &Vector3<f32>)
    -> Option<f32>;
}

/// Madgwick MARG filter from the `ahrs` crate.
///
/// The body frame has z up, so filter yaw grows counter-clockwise while a
/// compass heading grows clockwise.
pub struct MadgwickFusion {
    filter: Madgwick<f32>,
}

impl MadgwickFusion {
    pub fn new(sample_rate_hz: u32) -> Self {
        let period = 1.0 / sample_rate_hz.max(1) as f32;
        Self {
            filter: Madgwick::new(period, FUSION_BETA),
        }
    }

    fn heading_of(quat: &UnitQuaternion<f32>) -> f32 {
        let (_roll, _pitch, yaw) = quat.euler_angles();
        normalize(-yaw.to_degrees())
    }
}

impl Fusion for MadgwickFusion {
    fn update(
        &mut self,
        gyro: &Vector3<f32>,
        accel: &Vector3<f32>,
        mag: &Vector3<f32>,
    ) -> Option<f32> {
        let previous = self.filter.quat;
        let gyro_rad = gyro.map(f32::to_radians);

        match self.filter.update(&gyro_rad, accel, mag).map(|quat| *quat) {
            Ok(quat) if quat.coords.iter().all(|c| c.is_finite()) => Some(Self::heading_of(&quat)),
            Ok(_) => {
                // a vanishing gradient normalizes to NaN
                self.filter.quat = previous;
                Some(Self::heading_of(&previous))
            }
            Err(e) => {
                log::trace!("Fusion rejected sample: {:?}", e);
                None
            }
        }
    }
}

pub type SampleObserver = Box<dyn FnMut(f32, &RawSample) + Send>;

pub struct Estimator {
    source: Box<dyn SensorSource>,
    fusion: Box<dyn Fusion>,
    profile: Arc<SharedProfile>,
    local: CalibrationProfile,
    generation: u32,
    heading: Arc<HeadingCell>,
    observer: Option<SampleObserver>,
    sink: Arc<dyn TelemetrySink>,
    last_heading: f32,
    read_failing: bool,
}

impl Estimator {
    pub fn new(
        source: Box<dyn SensorSource>,
        fusion: Box<dyn Fusion>,
        profile: Arc<SharedProfile>,
        heading: Arc<HeadingCell>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        let local = profile.snapshot();
        let generation = profile.generation();

        Self {
            source,
            fusion,
            profile,
            local,
            generation,
            heading,
            observer: None,
            sink,
            last_heading: 0.0,
            read_failing: false,
        }
    }

    /// Register the per-sample observer. Called synchronously on every
    /// successful sample, after the heading is published.
    pub fn on_sample<F>(mut self, observer: F) -> Self
    where
        F: FnMut(f32, &RawSample) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn last_heading(&self) -> f32 {
        self.last_heading
    }

    /// Pick up a newer profile if the writer is not holding it right now.
    fn refresh_profile(&mut self) {
        let generation = self.profile.generation();
        if generation == self.generation {
            return;
        }
        if let Some(profile) = self.profile.try_snapshot() {
            self.local = profile;
            self.generation = generation;
            log::debug!("Estimator picked up profile generation {}", generation);
        }
    }

    /// One estimator cycle, without the sleep.
    pub fn tick(&mut self) {
        let raw = match self.source.read() {
            Ok(raw) => {
                if self.read_failing {
                    log::info!("Sensor reads recovered");
                    self.read_failing = false;
                }
                raw
            }
            Err(e) => {
                if !self.read_failing {
                    log::warn!("Sensor read failed, skipping fusion: {}", e);
                    self.read_failing = true;
                }
                return;
            }
        };

        self.refresh_profile();
        let corrected = self.local.apply(&raw);

        if let Some(fused) = self
            .fusion
            .update(&corrected.gyro, &corrected.accel, &corrected.mag)
        {
            let heading = normalize(normalize(fused) - self.local.heading_zero);
            self.last_heading = heading;

            if !self.heading.publish(heading, LOCK_WAIT) {
                log::trace!("Heading lock busy, publish skipped");
            }
        }

        if let Some(observer) = self.observer.as_mut() {
            observer(self.last_heading, &raw);
        }
    }

    /// Run the estimator on its own thread for the life of the process.
    pub fn spawn(mut self, sample_rate_hz: u32) -> io::Result<JoinHandle<()>> {
        let rate = sample_rate_hz.max(1);
        let period = Duration::from_secs_f64(1.0 / rate as f64);

        thread::Builder::new()
            .name("estimator".into())
            .spawn(move || {
                let mut pacer = Pacer::new(period);
                let mut misses = MissCounter::new(rate);
                log::info!("Estimator running at {} Hz", rate);

                loop {
                    self.tick();
                    let on_time = pacer.wait();
                    self.record_deadline(&mut misses, on_time, rate);
                }
            })
    }

    /// Count one deadline; every `rate` misses raise one diagnostic.
    fn record_deadline(&self, misses: &mut MissCounter, on_time: bool, rate: u32) {
        if misses.record(on_time) {
            log::warn!("Estimator missed {} deadlines, sample rate too high", rate);
            self.sink
                .send(&Telemetry::Message(format!("Sample rate {rate} Hz is too high")));
        }
    }
}

//! Heading-hold controller.
//!
//! `start(anchor)` spawns one periodic task that holds `anchor` **by value**.
//! The anchor is frozen for the lifetime of that task: to steer to a new
//! anchor, `stop()` and `start()` again. Gains, on the other hand, are read
//! every tick, so tuning takes effect immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pid::Pid;

use crate::config::{DEFAULT_KD, DEFAULT_KI, DEFAULT_KP, RUDDER_MAX_DEFLECTION};
use crate::error::StorageError;
use crate::heading::rudder_error;
use crate::periodic::Pacer;
use crate::storage::{Entry, KeyValueStore};

pub const KEY_PID_COEFFICIENTS: &str = "pid.coefficients";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidCoefficients {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Default for PidCoefficients {
    fn default() -> Self {
        Self::new(DEFAULT_KP, DEFAULT_KI, DEFAULT_KD)
    }
}

impl PidCoefficients {
    pub fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self { kp, ki, kd }
    }

    /// Flat record: kp, ki, kd as little-endian `f32`.
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&self.kp.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.ki.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.kd.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 12 {
            return None;
        }
        let f = |at: usize| f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Some(Self::new(f(0), f(4), f(8)))
    }
}

/// One PID channel driving the rudder toward a fixed anchor.
pub struct ControlLoop {
    anchor: f32,
    pid: Pid<f32>,
}

impl ControlLoop {
    pub fn new(anchor: f32, coefficients: PidCoefficients) -> Self {
        // Setpoint 0 on the heading error: the output pushes against the
        // error, which is the rudder's reversed sense.
        let mut pid: Pid<f32> = Pid::new(0.0f32, RUDDER_MAX_DEFLECTION);
        pid.p(coefficients.kp, RUDDER_MAX_DEFLECTION)
            .i(coefficients.ki, RUDDER_MAX_DEFLECTION)
            .d(coefficients.kd, RUDDER_MAX_DEFLECTION);

        Self { anchor, pid }
    }

    pub fn anchor(&self) -> f32 {
        self.anchor
    }

    pub fn set_coefficients(&mut self, coefficients: PidCoefficients) {
        self.pid.kp = coefficients.kp;
        self.pid.ki = coefficients.ki;
        self.pid.kd = coefficients.kd;
    }

    /// Rudder command (degrees either side of trim) for the given heading.
    pub fn step(&mut self, heading: f32) -> f32 {
        let error = rudder_error(self.anchor, heading);
        let output = self.pid.next_control_output(error).output;
        output.clamp(-RUDDER_MAX_DEFLECTION, RUDDER_MAX_DEFLECTION)
    }
}

type YawSource = Arc<dyn Fn() -> f32 + Send + Sync>;
type OutputSink = Arc<dyn Fn(f32) + Send + Sync>;

struct ControlTask {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    anchor: f32,
}

pub struct HeadingController {
    period: Duration,
    get_yaw: YawSource,
    on_output: OutputSink,
    coefficients: Arc<Mutex<PidCoefficients>>,
    task: Option<ControlTask>,
}

impl HeadingController {
    pub fn new<Y, O>(period: Duration, get_yaw: Y, on_output: O) -> Self
    where
        Y: Fn() -> f32 + Send + Sync + 'static,
        O: Fn(f32) + Send + Sync + 'static,
    {
        Self {
            period,
            get_yaw: Arc::new(get_yaw),
            on_output: Arc::new(on_output),
            coefficients: Arc::new(Mutex::new(PidCoefficients::default())),
            task: None,
        }
    }

    /// Spawn the control task holding `anchor`. A task already running is
    /// stopped first.
    pub fn start(&mut self, anchor: f32) {
        self.stop();

        let stop = Arc::new(AtomicBool::new(false));
        let get_yaw = Arc::clone(&self.get_yaw);
        let on_output = Arc::clone(&self.on_output);
        let coefficients = Arc::clone(&self.coefficients);
        let period = self.period;
        let task_stop = Arc::clone(&stop);

        let initial = *coefficients.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = thread::Builder::new()
            .name("heading-control".into())
            .spawn(move || {
                let mut control = ControlLoop::new(anchor, initial);
                let mut pacer = Pacer::new(period);

                while !task_stop.load(Ordering::Acquire) {
                    if let Ok(c) = coefficients.try_lock() {
                        control.set_coefficients(*c);
                    }

                    let heading = get_yaw();
                    let command = control.step(heading);
                    log::trace!("heading {:.1}° anchor {:.1}° → rudder {:.1}°", heading, anchor, command);

                    // stop() may have landed while we computed
                    if task_stop.load(Ordering::Acquire) {
                        break;
                    }
                    on_output(command);

                    if !pacer.park() {
                        log::debug!("Control tick overran its period");
                    }
                }
            });

        match handle {
            Ok(handle) => {
                log::info!("Heading hold engaged at {:.1}°", anchor);
                self.task = Some(ControlTask { stop, handle, anchor });
            }
            Err(e) => log::error!("Failed to spawn control task: {}", e),
        }
    }

    /// Stop the control task. Does nothing if none is running. Once this
    /// returns no further output is emitted.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stop.store(true, Ordering::Release);
            task.handle.thread().unpark();
            if task.handle.join().is_err() {
                log::error!("Control task panicked");
            }
            log::info!("Heading hold released");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Anchor held by the running task, if any.
    pub fn anchor(&self) -> Option<f32> {
        self.task.as_ref().map(|task| task.anchor)
    }

    pub fn coefficients(&self) -> PidCoefficients {
        *self.coefficients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_coefficients(&self, coefficients: PidCoefficients) {
        *self.coefficients.lock().unwrap_or_else(PoisonError::into_inner) = coefficients;
    }

    pub fn save(&self, store: &mut dyn KeyValueStore) -> Result<(), StorageError> {
        store.put(
            KEY_PID_COEFFICIENTS,
            Entry::Bytes(self.coefficients().to_bytes().to_vec()),
        )
    }

    /// Load stored gains. With nothing (or garbage) stored, the defaults are
    /// installed and written back so the next load finds them.
    pub fn load(&self, store: &mut dyn KeyValueStore) -> Result<PidCoefficients, StorageError> {
        let stored = store
            .get_bytes(KEY_PID_COEFFICIENTS)
            .ok()
            .and_then(|bytes| PidCoefficients::from_bytes(&bytes));

        match stored {
            Some(coefficients) => {
                self.set_coefficients(coefficients);
                Ok(coefficients)
            }
            None => {
                log::warn!("No stored PID coefficients, using defaults");
                let defaults = PidCoefficients::default();
                self.set_coefficients(defaults);
                self.save(store)?;
                Ok(defaults)
            }
        }
    }
}

impl Drop for HeadingController {
    fn drop(&mut self) {
        self.stop();
    }
}

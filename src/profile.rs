//! Sensor calibration profile: biases, soft-iron matrix, heading zero and
//! actuator trim.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use nalgebra::{Matrix3, Vector3};

use crate::config::{DEFAULT_ACTUATOR_TRIM, DEFAULT_AUTOPILOT_MAX_SPEED};
use crate::error::StorageError;
use crate::legacy::LegacyBiasStore;
use crate::sensor::RawSample;
use crate::storage::{Entry, KeyValueStore, SharedStore};

/// Size of the profile on the wire: 21 little-endian `f32`.
pub const PROFILE_WIRE_LEN: usize = 21 * 4;

const KEY_GYRO: [&str; 3] = ["cal.gyro_x", "cal.gyro_y", "cal.gyro_z"];
const KEY_ACCEL: [&str; 3] = ["cal.accel_x", "cal.accel_y", "cal.accel_z"];
const KEY_MAG: [&str; 3] = ["cal.mag_x", "cal.mag_y", "cal.mag_z"];
const KEY_MAG_SCALE: [&str; 9] = [
    "cal.scale_00",
    "cal.scale_01",
    "cal.scale_02",
    "cal.scale_10",
    "cal.scale_11",
    "cal.scale_12",
    "cal.scale_20",
    "cal.scale_21",
    "cal.scale_22",
];
const KEY_HEADING_ZERO: &str = "cal.heading_zero";
const KEY_ACTUATOR_TRIM: &str = "cal.actuator_trim";
const KEY_AUTOPILOT_MAX_SPEED: &str = "cal.autopilot_max_speed";
pub const KEY_LEGACY_BIASES: &str = "cal.legacy_biases";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProfile {
    /// Gyro bias (deg/s), subtracted from raw rates
    pub gyro_bias: Vector3<f32>,
    /// Accelerometer bias (g)
    pub accel_bias: Vector3<f32>,
    /// Magnetometer hard-iron offset (µT)
    pub mag_bias: Vector3<f32>,
    /// Magnetometer soft-iron correction, applied after the offset
    pub mag_scale: Matrix3<f32>,
    /// Fused heading that reads as 0° (degrees)
    pub heading_zero: f32,
    /// Rudder servo position for straight ahead (servo degrees)
    pub actuator_trim: f32,
    /// Autopilot throttle cap (%)
    pub autopilot_max_speed: f32,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            mag_bias: Vector3::zeros(),
            mag_scale: Matrix3::identity(),
            heading_zero: 0.0,
            actuator_trim: DEFAULT_ACTUATOR_TRIM,
            autopilot_max_speed: DEFAULT_AUTOPILOT_MAX_SPEED,
        }
    }
}

/// Calibrated gyro/accel/mag vectors ready for fusion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corrected {
    pub gyro: Vector3<f32>,
    pub accel: Vector3<f32>,
    pub mag: Vector3<f32>,
}

impl CalibrationProfile {
    /// Subtract biases and apply the soft-iron matrix.
    pub fn apply(&self, raw: &RawSample) -> Corrected {
        Corrected {
            gyro: raw.gyro - self.gyro_bias,
            accel: raw.accel - self.accel_bias,
            mag: self.mag_scale * (raw.mag - self.mag_bias),
        }
    }

    /// Load from `store`. Missing keys fall back to defaults; biases with no
    /// named entry are recovered from a valid legacy block if there is one.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        Self::load_checked(store).0
    }

    /// Like `load`, also telling whether the store should be rewritten:
    /// an entry of the wrong kind, or a legacy block (corrupt or not) with
    /// no named biases next to it.
    pub fn load_checked(store: &dyn KeyValueStore) -> (Self, bool) {
        let defaults = Self::default();
        let stale = Cell::new(false);
        let float = |key: &str, default: f32| match store.get_f32(key) {
            Ok(value) => value,
            Err(StorageError::Missing(_)) => default,
            Err(e) => {
                log::warn!("{}, using default", e);
                stale.set(true);
                default
            }
        };
        let vector = |keys: &[&str; 3], default: &Vector3<f32>| {
            Vector3::new(
                float(keys[0], default.x),
                float(keys[1], default.y),
                float(keys[2], default.z),
            )
        };

        let mut profile = Self {
            gyro_bias: vector(&KEY_GYRO, &defaults.gyro_bias),
            accel_bias: vector(&KEY_ACCEL, &defaults.accel_bias),
            mag_bias: vector(&KEY_MAG, &defaults.mag_bias),
            mag_scale: Matrix3::from_fn(|r, c| {
                float(KEY_MAG_SCALE[r * 3 + c], defaults.mag_scale[(r, c)])
            }),
            heading_zero: float(KEY_HEADING_ZERO, defaults.heading_zero),
            actuator_trim: float(KEY_ACTUATOR_TRIM, defaults.actuator_trim),
            autopilot_max_speed: float(KEY_AUTOPILOT_MAX_SPEED, defaults.autopilot_max_speed),
        };

        let named_biases = KEY_GYRO
            .iter()
            .chain(&KEY_ACCEL)
            .chain(&KEY_MAG)
            .any(|key| store.contains(key));

        if !named_biases && store.contains(KEY_LEGACY_BIASES) {
            stale.set(true);
            match store
                .get_bytes(KEY_LEGACY_BIASES)
                .ok()
                .and_then(|bytes| LegacyBiasStore::from_bytes(&bytes))
            {
                Some(legacy) if legacy.is_valid() => {
                    log::info!("Biases restored from legacy block");
                    profile.gyro_bias = legacy.gyro_bias();
                    profile.accel_bias = legacy.accel_bias();
                    profile.mag_bias = legacy.mag_bias();
                }
                Some(_) => log::warn!("Legacy bias block failed validation, ignoring it"),
                None => log::warn!("Unreadable legacy bias block, ignoring it"),
            }
        }

        (profile, stale.get())
    }

    /// Persist every field in one write, plus a refreshed legacy block.
    pub fn save(&self, store: &mut dyn KeyValueStore) -> Result<(), StorageError> {
        let mut entries: Vec<(String, Entry)> = Vec::with_capacity(22);
        let mut push = |key: &str, value: f32| entries.push((key.to_string(), Entry::Float(value)));

        for (i, key) in KEY_GYRO.iter().enumerate() {
            push(key, self.gyro_bias[i]);
        }
        for (i, key) in KEY_ACCEL.iter().enumerate() {
            push(key, self.accel_bias[i]);
        }
        for (i, key) in KEY_MAG.iter().enumerate() {
            push(key, self.mag_bias[i]);
        }
        for (i, key) in KEY_MAG_SCALE.iter().enumerate() {
            push(key, self.mag_scale[(i / 3, i % 3)]);
        }
        push(KEY_HEADING_ZERO, self.heading_zero);
        push(KEY_ACTUATOR_TRIM, self.actuator_trim);
        push(KEY_AUTOPILOT_MAX_SPEED, self.autopilot_max_speed);

        let legacy = LegacyBiasStore::from_biases(&self.gyro_bias, &self.accel_bias, &self.mag_bias);
        entries.push((
            KEY_LEGACY_BIASES.to_string(),
            Entry::Bytes(legacy.to_bytes().to_vec()),
        ));

        store.put_all(entries)
    }

    /// The 21 profile values in wire order.
    pub fn to_values(&self) -> [f32; 21] {
        let mut values = [0.0f32; 21];
        values[0..3].copy_from_slice(self.gyro_bias.as_slice());
        values[3..6].copy_from_slice(self.accel_bias.as_slice());
        values[6..9].copy_from_slice(self.mag_bias.as_slice());
        // nalgebra is column-major; the wire is row-major
        values[9..18].copy_from_slice(self.mag_scale.transpose().as_slice());
        values[18] = self.heading_zero;
        values[19] = self.actuator_trim;
        values[20] = self.autopilot_max_speed;
        values
    }

    pub fn from_values(values: &[f32; 21]) -> Self {
        Self {
            gyro_bias: Vector3::from_column_slice(&values[0..3]),
            accel_bias: Vector3::from_column_slice(&values[3..6]),
            mag_bias: Vector3::from_column_slice(&values[6..9]),
            mag_scale: Matrix3::from_row_slice(&values[9..18]),
            heading_zero: values[18],
            actuator_trim: values[19],
            autopilot_max_speed: values[20],
        }
    }
}

/// The live profile shared by the estimator (reader) and the calibration
/// engine and command handler (writers).
///
/// Every change is persisted while the profile lock is held, so concurrent
/// writers can never leave an older snapshot in the store.
pub struct SharedProfile {
    profile: Mutex<CalibrationProfile>,
    generation: AtomicU32,
    store: SharedStore,
}

impl SharedProfile {
    /// Load the profile from `store` and keep `store` for later saves.
    pub fn load(store: SharedStore) -> Self {
        let profile = {
            let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
            let (profile, stale) = CalibrationProfile::load_checked(&*store);
            if stale {
                match profile.save(&mut *store) {
                    Ok(()) => log::info!("Rewrote stored calibration"),
                    Err(e) => log::warn!("Failed to rewrite stored calibration: {}", e),
                }
            }
            profile
        };

        Self {
            profile: Mutex::new(profile),
            generation: AtomicU32::new(0),
            store,
        }
    }

    pub fn snapshot(&self) -> CalibrationProfile {
        *self.profile.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking read for the real-time side.
    pub fn try_snapshot(&self) -> Option<CalibrationProfile> {
        self.profile.try_lock().ok().map(|profile| *profile)
    }

    /// Bumped on every update, saved or not.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Modify the profile and persist it immediately.
    ///
    /// The in-memory profile is updated even when the save fails, so the
    /// vessel keeps steering with the newest calibration.
    pub fn update<F>(&self, change: F) -> Result<CalibrationProfile, StorageError>
    where
        F: FnOnce(&mut CalibrationProfile),
    {
        let mut profile = self.profile.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut profile);
        self.generation.fetch_add(1, Ordering::AcqRel);

        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        profile.save(&mut *store)?;
        Ok(*profile)
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }
}

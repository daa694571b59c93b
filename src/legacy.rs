//! Checksummed fixed-size bias block.
//!
//! Eleven little-endian `i32`: a magic header, nine fixed-point biases
//! (gyro xyz, accel xyz, mag xyz) and the wrapping sum of the ten values
//! before it. A block is only trusted when both the header and the sum match.

use nalgebra::Vector3;

use crate::config::{LEGACY_BIAS_MAGIC, LEGACY_BIAS_SCALE};

pub const LEGACY_BIAS_LEN: usize = 11 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyBiasStore {
    pub header: i32,
    pub gyro: [i32; 3],
    pub accel: [i32; 3],
    pub mag: [i32; 3],
    pub sum: i32,
}

impl Default for LegacyBiasStore {
    fn default() -> Self {
        let mut store = Self {
            header: LEGACY_BIAS_MAGIC,
            gyro: [0; 3],
            accel: [0; 3],
            mag: [0; 3],
            sum: 0,
        };
        store.update_sum();
        store
    }
}

impl LegacyBiasStore {
    /// Build a valid block from floating point biases.
    pub fn from_biases(gyro: &Vector3<f32>, accel: &Vector3<f32>, mag: &Vector3<f32>) -> Self {
        let mut store = Self {
            gyro: to_fixed(gyro),
            accel: to_fixed(accel),
            mag: to_fixed(mag),
            ..Self::default()
        };
        store.update_sum();
        store
    }

    fn fields(&self) -> impl Iterator<Item = i32> + '_ {
        std::iter::once(self.header)
            .chain(self.gyro)
            .chain(self.accel)
            .chain(self.mag)
    }

    pub fn computed_sum(&self) -> i32 {
        self.fields().fold(0i32, i32::wrapping_add)
    }

    pub fn update_sum(&mut self) {
        self.sum = self.computed_sum();
    }

    pub fn is_valid(&self) -> bool {
        self.header == LEGACY_BIAS_MAGIC && self.sum == self.computed_sum()
    }

    pub fn gyro_bias(&self) -> Vector3<f32> {
        from_fixed(&self.gyro)
    }

    pub fn accel_bias(&self) -> Vector3<f32> {
        from_fixed(&self.accel)
    }

    pub fn mag_bias(&self) -> Vector3<f32> {
        from_fixed(&self.mag)
    }

    pub fn to_bytes(&self) -> [u8; LEGACY_BIAS_LEN] {
        let mut bytes = [0u8; LEGACY_BIAS_LEN];
        let values = self.fields().chain(std::iter::once(self.sum));
        for (chunk, value) in bytes.chunks_exact_mut(4).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Parse a stored block. Returns `None` for a wrong length; the caller
    /// still has to check `is_valid`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != LEGACY_BIAS_LEN {
            return None;
        }

        let mut values = [0i32; 11];
        for (value, chunk) in values.iter_mut().zip(bytes.chunks_exact(4)) {
            *value = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        Some(Self {
            header: values[0],
            gyro: [values[1], values[2], values[3]],
            accel: [values[4], values[5], values[6]],
            mag: [values[7], values[8], values[9]],
            sum: values[10],
        })
    }
}

fn to_fixed(v: &Vector3<f32>) -> [i32; 3] {
    // `as` saturates out-of-range and NaN values
    [
        (v.x * LEGACY_BIAS_SCALE).round() as i32,
        (v.y * LEGACY_BIAS_SCALE).round() as i32,
        (v.z * LEGACY_BIAS_SCALE).round() as i32,
    ]
}

fn from_fixed(v: &[i32; 3]) -> Vector3<f32> {
    Vector3::new(
        v[0] as f32 / LEGACY_BIAS_SCALE,
        v[1] as f32 / LEGACY_BIAS_SCALE,
        v[2] as f32 / LEGACY_BIAS_SCALE,
    )
}

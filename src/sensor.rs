use nalgebra::Vector3;
use rppal::i2c::I2c;

use crate::error::SensorError;

/// One raw reading of the inertial/magnetic package, before any calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// Acceleration (g)
    pub accel: Vector3<f32>,
    /// Angular rate (deg/s)
    pub gyro: Vector3<f32>,
    /// Magnetic field (µT)
    pub mag: Vector3<f32>,
}

impl RawSample {
    pub fn new(accel: Vector3<f32>, gyro: Vector3<f32>, mag: Vector3<f32>) -> Self {
        Self { accel, gyro, mag }
    }

    /// A board lying flat and still, pointing at magnetic north.
    pub fn level() -> Self {
        Self {
            accel: Vector3::new(0.0, 0.0, 1.0),
            gyro: Vector3::zeros(),
            mag: Vector3::new(20.0, 0.0, -40.0),
        }
    }
}

/// Raw-sample collaborator polled once per estimator tick.
///
/// Different hardware backends plug in here without touching the
/// calibration/fusion pipeline.
pub trait SensorSource: Send {
    fn read(&mut self) -> Result<RawSample, SensorError>;
}

impl<F> SensorSource for F
where
    F: FnMut() -> Result<RawSample, SensorError> + Send,
{
    fn read(&mut self) -> Result<RawSample, SensorError> {
        self()
    }
}

/// Replays the same sample forever. Used for bench runs without hardware.
pub struct StaticSource(pub RawSample);

impl SensorSource for StaticSource {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        Ok(self.0)
    }
}

/// Stand-in for a sensor that failed to initialize. Every read fails, so the
/// estimator keeps ticking without fusing anything.
pub struct Disconnected;

impl SensorSource for Disconnected {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        Err(SensorError::NotConnected)
    }
}

const LIS3MDL_ADDR: u16 = 0x1C;
const LIS3MDL_WHO_AM_I_VALUE: u8 = 0x3D;

// LIS3MDL Register addresses
const WHO_AM_I: u8 = 0x0F;
const CTRL_REG1: u8 = 0x20;
const CTRL_REG2: u8 = 0x21;
const CTRL_REG3: u8 = 0x22;
const CTRL_REG4: u8 = 0x23;
const CTRL_REG5: u8 = 0x24;
const STATUS_REG: u8 = 0x27;
const OUT_X_L: u8 = 0x28;

/// ±4 gauss full scale
const LSB_PER_GAUSS: f32 = 6842.0;
const MICROTESLA_PER_GAUSS: f32 = 100.0;

/// LIS3MDL magnetometer on the Pi's I2C bus.
///
/// This board carries no gyro or accelerometer, so those channels report a
/// level, motionless board and the fusion runs as a tilt-free compass.
pub struct Lis3mdlSource {
    i2c: I2c,
    last_mag: Option<Vector3<f32>>,
}

impl Lis3mdlSource {
    pub fn new() -> Result<Self, SensorError> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(LIS3MDL_ADDR)?;

        let who_am_i = i2c.smbus_read_byte(WHO_AM_I)?;
        if who_am_i != LIS3MDL_WHO_AM_I_VALUE {
            return Err(SensorError::WrongDevice {
                found: who_am_i,
                expected: LIS3MDL_WHO_AM_I_VALUE,
            });
        }

        // CTRL_REG1: Temperature enabled, Ultra-high performance mode (X,Y), ODR = 80 Hz
        i2c.smbus_write_byte(CTRL_REG1, 0xFC)?;

        // CTRL_REG2: Full scale ±4 gauss
        i2c.smbus_write_byte(CTRL_REG2, 0x00)?;

        // CTRL_REG3: Continuous conversion mode
        i2c.smbus_write_byte(CTRL_REG3, 0x00)?;

        // CTRL_REG4: Ultra-high performance mode (Z-axis), little endian
        i2c.smbus_write_byte(CTRL_REG4, 0x0C)?;

        // CTRL_REG5: Block data update enabled
        i2c.smbus_write_byte(CTRL_REG5, 0x40)?;

        std::thread::sleep(std::time::Duration::from_millis(100));

        log::info!("Magnetometer (LIS3MDL) initialized");
        Ok(Self {
            i2c,
            last_mag: None,
        })
    }

    /// Read the magnetic field in µT.
    pub fn read_magnetometer(&mut self) -> Result<Vector3<f32>, SensorError> {
        let status = self.i2c.smbus_read_byte(STATUS_REG)?;
        if status & 0x08 == 0 {
            return Err(SensorError::NotReady);
        }

        // Read 6 bytes starting from OUT_X_L (auto-increment enabled)
        let mut data = [0u8; 6];
        for (i, item) in data.iter_mut().enumerate() {
            *item = self.i2c.smbus_read_byte(OUT_X_L + i as u8)?;
        }

        Ok(raw_to_microtesla(data))
    }
}

impl SensorSource for Lis3mdlSource {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        // The magnetometer runs at 80 Hz; if a conversion is not ready yet
        // reuse the previous one rather than dropping the tick.
        let mag = match self.read_magnetometer() {
            Ok(mag) => {
                self.last_mag = Some(mag);
                mag
            }
            Err(SensorError::NotReady) => self.last_mag.ok_or(SensorError::NotReady)?,
            Err(e) => return Err(e),
        };

        Ok(RawSample {
            mag,
            ..RawSample::level()
        })
    }
}

/// Convert the six little-endian output registers to µT.
fn raw_to_microtesla(data: [u8; 6]) -> Vector3<f32> {
    let x = i16::from_le_bytes([data[0], data[1]]) as f32;
    let y = i16::from_le_bytes([data[2], data[3]]) as f32;
    let z = i16::from_le_bytes([data[4], data[5]]) as f32;

    Vector3::new(x, y, z) * (MICROTESLA_PER_GAUSS / LSB_PER_GAUSS)
}

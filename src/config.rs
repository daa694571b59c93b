use std::time::Duration;

// ** ESTIMATOR CONFIGURATION ** //

/// Orientation estimator sample rate (Hz)
pub const SAMPLE_RATE_HZ: u32 = 10;
/// Madgwick filter gain
pub const FUSION_BETA: f32 = 0.1;
/// Maximum wait for the heading lock before falling back to the cached value
pub const LOCK_WAIT: Duration = Duration::from_millis(10);

// ** CONTROLLER CONFIGURATION ** //

/// Heading controller period (milliseconds)
pub const CONTROL_PERIOD_MS: u64 = 100;
/// PID output saturation, degrees of rudder either side of trim
pub const RUDDER_MAX_DEFLECTION: f32 = 50.0;
/// PID gains used when no stored coefficients exist
pub const DEFAULT_KP: f32 = 1.0;
pub const DEFAULT_KI: f32 = 0.0;
pub const DEFAULT_KD: f32 = 0.0;

// ** CALIBRATION CONFIGURATION ** //

pub const GYRO_CAPTURE_SAMPLES: u32 = 1000;
pub const GYRO_PROGRESS_EVERY: u32 = 50;
pub const ACCEL_CAPTURE_SAMPLES: u32 = 500;
pub const ACCEL_PROGRESS_EVERY: u32 = 25;
/// Accel captures are taken with the board resting on each of +X,-X,+Y,-Y,+Z,-Z
pub const ACCEL_AXIS_COUNT: u8 = 6;
/// Wire value of the accel axis byte meaning "no axis"
pub const ACCEL_AXIS_NONE: u8 = 255;

/// Servo center used when the profile has never been saved (servo degrees)
pub const DEFAULT_ACTUATOR_TRIM: f32 = 91.5;
/// Autopilot throttle cap used when the profile has never been saved (%)
pub const DEFAULT_AUTOPILOT_MAX_SPEED: f32 = 25.0;

/// Magic constant at the head of the legacy bias block
pub const LEGACY_BIAS_MAGIC: i32 = 0x42;
/// Fixed-point scale of the legacy bias block (Q16.16)
pub const LEGACY_BIAS_SCALE: f32 = 65536.0;

// ** SERVO CONFIGURATION ** //

/// GPIO PWM channels
/// - GPIO 18 (PWM0) rudder servo
/// - GPIO 19 (PWM1) throttle ESC
pub const RUDDER_PWM_PIN: u8 = 18;
pub const THROTTLE_PWM_PIN: u8 = 19;
/// Standard servo pulse width range (microseconds)
/// Most servos use 1000-2000μs, with 1500μs as center
pub const SERVO_MIN_PULSE_US: f64 = 1000.0;
pub const SERVO_MAX_PULSE_US: f64 = 2000.0;
/// Standard servo PWM frequency (Hz)
pub const SERVO_FREQUENCY_HZ: f64 = 50.0;
/// Full servo travel in servo degrees (0 → min pulse, 180 → max pulse)
pub const SERVO_TRAVEL_DEGREES: f32 = 180.0;

// ** AUTOPILOT CONFIGURATION ** //

/// Arming button, active low with pull-up
pub const GPIO_AUTOPILOT_BUTTON: u8 = 23;
pub const AUTOPILOT_DURATION: Duration = Duration::from_secs(30);
/// Throttle at the instant the run starts (%)
pub const AUTOPILOT_BASE_THROTTLE: f32 = 5.0;
/// Throttle increase per second of run time (%)
pub const AUTOPILOT_RAMP_PER_SEC: f32 = 2.5;

// ** MAIN CONFIGURATION ** //

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:4210";
pub const DEFAULT_STORE_PATH: &str = "helm-store.json";
/// Heading telemetry interval
pub const TELEMETRY_INTERVAL: Duration = Duration::from_millis(200);
/// Main loop poll interval
pub const MAIN_LOOP_INTERVAL: Duration = Duration::from_millis(20);

/// Errors raised while decoding a received message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("unknown message id 0x{0:02x}")]
    UnknownId(u8),

    #[error("message 0x{id:02x} has {actual} payload bytes, expected {expected}")]
    BadLength {
        id: u8,
        expected: &'static str,
        actual: usize,
    },

    #[error("invalid accel axis {0}")]
    InvalidAxis(u8),
}

/// Errors from the persistent key-value store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("key not found: {0}")]
    Missing(String),

    #[error("entry {0} has the wrong kind")]
    WrongKind(String),
}

/// Errors from the raw sensor collaborator.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("I2C error: {0}")]
    I2c(#[from] rppal::i2c::Error),

    #[error("wrong device id: 0x{found:02X}, expected 0x{expected:02X}")]
    WrongDevice { found: u8, expected: u8 },

    #[error("sensor data not ready")]
    NotReady,

    #[error("sensor not connected")]
    NotConnected,
}

/// Errors from PWM outputs and GPIO inputs.
#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("PWM error: {0}")]
    Pwm(#[from] rppal::pwm::Error),

    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("GPIO {0} has no hardware PWM channel (use 12, 13, 18 or 19)")]
    NotPwmPin(u8),

    #[error("GPIO {0} does not exist")]
    InvalidPin(u8),
}

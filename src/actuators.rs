use std::sync::{Arc, Mutex};

use crate::config::{
    RUDDER_PWM_PIN, SERVO_FREQUENCY_HZ, SERVO_MAX_PULSE_US, SERVO_MIN_PULSE_US,
    SERVO_TRAVEL_DEGREES, THROTTLE_PWM_PIN,
};
use crate::error::ActuatorError;

// Use rppal in production
#[cfg(not(test))]
use rppal::pwm::{Channel, Polarity, Pwm};

// Mock PWM for testing
#[cfg(test)]
use crate::mocks::mock_pwm::Pwm;

/// Rudder servo and throttle ESC.
pub trait Actuators: Send {
    /// Rudder position in servo degrees (0..180, trim is straight ahead).
    fn set_rudder(&mut self, servo_degrees: f32) -> Result<(), ActuatorError>;

    /// Throttle in percent (0..100).
    fn set_throttle(&mut self, percent: f32) -> Result<(), ActuatorError>;

    /// Throttle off, rudder centered on `trim`.
    fn neutral(&mut self, trim: f32) -> Result<(), ActuatorError> {
        self.set_throttle(0.0)?;
        self.set_rudder(trim)
    }
}

pub type SharedActuators = Arc<Mutex<dyn Actuators>>;

pub fn shared<A: Actuators + 'static>(actuators: A) -> SharedActuators {
    Arc::new(Mutex::new(actuators))
}

/// Pulse width for a rudder position, clamped to the servo's travel.
pub fn rudder_pulse_us(servo_degrees: f32) -> f64 {
    let fraction = (servo_degrees / SERVO_TRAVEL_DEGREES).clamp(0.0, 1.0) as f64;
    SERVO_MIN_PULSE_US + fraction * (SERVO_MAX_PULSE_US - SERVO_MIN_PULSE_US)
}

/// Pulse width for a throttle percentage. The ESC reads 1000 µs as stopped.
pub fn throttle_pulse_us(percent: f32) -> f64 {
    let fraction = (percent / 100.0).clamp(0.0, 1.0) as f64;
    SERVO_MIN_PULSE_US + fraction * (SERVO_MAX_PULSE_US - SERVO_MIN_PULSE_US)
}

/// Duty cycle for a pulse width. Period = 1/50Hz = 20ms = 20000μs
fn duty_cycle(pulse_us: f64) -> f64 {
    let period_us = 1_000_000.0 / SERVO_FREQUENCY_HZ;
    pulse_us.clamp(SERVO_MIN_PULSE_US, SERVO_MAX_PULSE_US) / period_us
}

/// Hardware PWM is available on:
/// - GPIO 12 / 18 (PWM0)
/// - GPIO 13 / 19 (PWM1)
fn open_channel(pin: u8, pulse_us: f64) -> Result<Pwm, ActuatorError> {
    #[cfg(not(test))]
    {
        let channel = match pin {
            12 | 18 => Channel::Pwm0,
            13 | 19 => Channel::Pwm1,
            _ => return Err(ActuatorError::NotPwmPin(pin)),
        };

        Ok(Pwm::with_frequency(
            channel,
            SERVO_FREQUENCY_HZ,
            duty_cycle(pulse_us),
            Polarity::Normal,
            true,
        )?)
    }

    #[cfg(test)]
    {
        match pin {
            12 | 13 | 18 | 19 => Ok(Pwm::new(pin, duty_cycle(pulse_us))),
            _ => Err(ActuatorError::NotPwmPin(pin)),
        }
    }
}

/// Rudder servo on PWM0, throttle ESC on PWM1.
pub struct ServoActuators {
    rudder: Pwm,
    throttle: Pwm,
}

impl ServoActuators {
    /// Open both channels with the throttle stopped and the rudder at `trim`.
    pub fn new(trim: f32) -> Result<Self, ActuatorError> {
        Self::with_pins(RUDDER_PWM_PIN, THROTTLE_PWM_PIN, trim)
    }

    pub fn with_pins(rudder_pin: u8, throttle_pin: u8, trim: f32) -> Result<Self, ActuatorError> {
        let throttle = open_channel(throttle_pin, throttle_pulse_us(0.0))?;
        let rudder = open_channel(rudder_pin, rudder_pulse_us(trim))?;
        log::info!(
            "PWM ready: rudder GPIO {}, throttle GPIO {}",
            rudder_pin,
            throttle_pin
        );

        Ok(Self { rudder, throttle })
    }

    pub fn disable(&mut self) -> Result<(), ActuatorError> {
        #[cfg(not(test))]
        {
            self.throttle.disable()?;
            self.rudder.disable()?;
        }

        #[cfg(test)]
        {
            self.throttle.disable();
            self.rudder.disable();
        }

        Ok(())
    }
}

impl Actuators for ServoActuators {
    fn set_rudder(&mut self, servo_degrees: f32) -> Result<(), ActuatorError> {
        let duty = duty_cycle(rudder_pulse_us(servo_degrees));

        #[cfg(not(test))]
        self.rudder.set_duty_cycle(duty)?;

        #[cfg(test)]
        self.rudder.set_duty_cycle(duty);

        Ok(())
    }

    fn set_throttle(&mut self, percent: f32) -> Result<(), ActuatorError> {
        let duty = duty_cycle(throttle_pulse_us(percent));

        #[cfg(not(test))]
        self.throttle.set_duty_cycle(duty)?;

        #[cfg(test)]
        self.throttle.set_duty_cycle(duty);

        Ok(())
    }
}

impl Drop for ServoActuators {
    fn drop(&mut self) {
        // Ensure PWM is disabled when dropped
        let _ = self.disable();
    }
}

/// Remembers the last commands instead of driving hardware. Stands in when
/// the PWM channels cannot be opened.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct VirtualActuators {
    pub rudder: Option<f32>,
    pub throttle: Option<f32>,
}

impl Actuators for VirtualActuators {
    fn set_rudder(&mut self, servo_degrees: f32) -> Result<(), ActuatorError> {
        log::trace!("Rudder -> {:.1}", servo_degrees);
        self.rudder = Some(servo_degrees);
        Ok(())
    }

    fn set_throttle(&mut self, percent: f32) -> Result<(), ActuatorError> {
        log::trace!("Throttle -> {:.1}%", percent);
        self.throttle = Some(percent);
        Ok(())
    }
}

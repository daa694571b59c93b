use std::thread;
use std::time::Duration;

use crate::config::GPIO_AUTOPILOT_BUTTON;
use crate::error::ActuatorError;

// Use rppal in production
#[cfg(not(test))]
use rppal::gpio::{Gpio, InputPin, Level};

#[cfg(test)]
// This is only used in testing, not compiled in release.
use crate::mocks::mock_gpio::{Gpio, InputPin, Level};

/// Autopilot arming button, wired between the pin and ground.
pub struct AutopilotButton {
    pin: InputPin,
}

impl AutopilotButton {
    pub fn new() -> Result<Self, ActuatorError> {
        Self::with_pin(GPIO_AUTOPILOT_BUTTON)
    }

    pub fn with_pin(pin: u8) -> Result<Self, ActuatorError> {
        let gpio = Gpio::new()?;
        let pin = gpio.get(pin)?.into_input_pullup();

        // let the pull-up settle before the first read
        thread::sleep(Duration::from_millis(100));

        Ok(Self { pin })
    }

    /// Pressed pulls the line low.
    pub fn is_held(&self) -> bool {
        self.pin.read() == Level::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::mock_gpio;

    #[test]
    fn test_released_by_default() -> Result<(), ActuatorError> {
        mock_gpio::reset_mock_pins();

        let button = AutopilotButton::new()?;
        assert!(!button.is_held());

        Ok(())
    }

    #[test]
    fn test_active_low() -> Result<(), ActuatorError> {
        mock_gpio::reset_mock_pins();

        let button = AutopilotButton::new()?;
        mock_gpio::set_mock_pin_level(GPIO_AUTOPILOT_BUTTON, mock_gpio::Level::Low);
        assert!(button.is_held());

        mock_gpio::set_mock_pin_level(GPIO_AUTOPILOT_BUTTON, mock_gpio::Level::High);
        assert!(!button.is_held());

        Ok(())
    }

    #[test]
    fn test_custom_pin() -> Result<(), ActuatorError> {
        mock_gpio::reset_mock_pins();

        let button = AutopilotButton::with_pin(24)?;
        mock_gpio::set_mock_pin_level(GPIO_AUTOPILOT_BUTTON, mock_gpio::Level::Low);
        assert!(!button.is_held());
        mock_gpio::set_mock_pin_level(24, mock_gpio::Level::Low);
        assert!(button.is_held());

        Ok(())
    }

    #[test]
    fn test_nonexistent_pin() {
        let err = AutopilotButton::with_pin(40).err();
        assert!(matches!(err, Some(ActuatorError::InvalidPin(40))));
        assert_eq!(err.unwrap().to_string(), "GPIO 40 does not exist");
    }
}

// Stand-ins for rppal peripherals, swapped in under #[cfg(test)]
pub mod mock_gpio;
pub mod mock_pwm;

// This file is only compiled during tests

use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
    static MOCK_PWM_DUTY: RefCell<HashMap<u8, f64>> = RefCell::new(HashMap::new());
    static MOCK_PWM_ENABLED: RefCell<HashMap<u8, bool>> = RefCell::new(HashMap::new());
}

pub struct Pwm {
    pin: u8,
}

impl Pwm {
    pub fn new(pin: u8, duty_cycle: f64) -> Self {
        MOCK_PWM_DUTY.with(|duty| duty.borrow_mut().insert(pin, duty_cycle));
        MOCK_PWM_ENABLED.with(|enabled| enabled.borrow_mut().insert(pin, true));
        Pwm { pin }
    }

    pub fn set_duty_cycle(&mut self, duty_cycle: f64) {
        MOCK_PWM_DUTY.with(|duty| duty.borrow_mut().insert(self.pin, duty_cycle));
    }

    pub fn disable(&mut self) {
        MOCK_PWM_ENABLED.with(|enabled| enabled.borrow_mut().insert(self.pin, false));
    }
}

// Test helpers
pub fn get_mock_duty_cycle(pin: u8) -> Option<f64> {
    MOCK_PWM_DUTY.with(|duty| duty.borrow().get(&pin).copied())
}

pub fn is_mock_enabled(pin: u8) -> bool {
    MOCK_PWM_ENABLED.with(|enabled| enabled.borrow().get(&pin).copied().unwrap_or(false))
}

pub fn reset_mock_pwm() {
    MOCK_PWM_DUTY.with(|duty| duty.borrow_mut().clear());
    MOCK_PWM_ENABLED.with(|enabled| enabled.borrow_mut().clear());
}

pub mod actuators;
pub mod autopilot;
pub mod calibration;
pub mod config;
pub mod controller;
pub mod error;
pub mod estimator;
pub mod gpio_input;
pub mod heading;
pub mod legacy;
pub mod link;
pub mod periodic;
pub mod profile;
pub mod protocol;
pub mod sensor;
pub mod state;
pub mod storage;
pub mod vessel;

// Re-export commonly used types
pub use calibration::{CalibrationEngine, CaptureMode, CaptureRequests};
pub use controller::{HeadingController, PidCoefficients};
pub use estimator::Estimator;
pub use profile::{CalibrationProfile, SharedProfile};
pub use protocol::{Command, Telemetry, TelemetrySink};
pub use sensor::RawSample;
pub use vessel::Vessel;

#[cfg(test)]
pub(crate) mod mocks;

//! Binary message codec.
//!
//! Every message is a one-byte id followed by a fixed-layout payload of
//! little-endian `f32` and single-byte fields, with no padding and no length
//! prefix. The payload length implied by the id is checked on decode.

use std::sync::Mutex;

use nalgebra::{Matrix3, Vector3};

use crate::config::{ACCEL_AXIS_COUNT, ACCEL_AXIS_NONE};
use crate::controller::PidCoefficients;
use crate::error::ProtocolError;
use crate::profile::{CalibrationProfile, PROFILE_WIRE_LEN};

pub mod ids {
    pub const PID_COEFFICIENTS: u8 = 0x01;
    pub const ANCHORING: u8 = 0x0a;
    pub const STEER: u8 = 0x0c;
    pub const HEADING: u8 = 0x10;
    pub const YAW_ANCHOR: u8 = 0x11;
    pub const SET_KP: u8 = b'p';
    pub const SET_KI: u8 = b'i';
    pub const SET_KD: u8 = b'd';
    pub const PING: u8 = 0xff;
    pub const PROFILE: u8 = 0xa0;
    pub const UPLOAD_PROFILE: u8 = 0xa1;
    pub const SET_NORTH: u8 = 0xa2;
    pub const MESSAGE: u8 = 0xbb;
    pub const MAG_POINT: u8 = 0xc0;
    pub const MAG_CALIBRATION: u8 = 0xc1;
    /// Inbound: start gyro capture. Outbound: gyro capture progress.
    pub const GYRO_CAPTURE: u8 = 0xc2;
    pub const MAG_CAPTURE: u8 = 0xc3;
    pub const ACCEL_CAPTURE: u8 = 0xc4;
    pub const ACCEL_BIAS: u8 = 0xc5;
    pub const ACCEL_PROGRESS: u8 = 0xc6;
    pub const ACCEL_RESULT: u8 = 0xc7;
}

/// Messages received from the remote client.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Ask for a `Telemetry::Coefficients` snapshot
    RequestCoefficients,
    SetCoefficients(PidCoefficients),
    SetAnchoring(bool),
    SetYawAnchor(f32),
    Steer { angle: f32, speed: f32 },
    SetKp(f32),
    SetKi(f32),
    SetKd(f32),
    Ping,
    MagCalibration { bias: Vector3<f32>, scale: Matrix3<f32> },
    StartGyroCapture,
    StartMagCapture,
    /// `None` stops any capture in progress
    AccelCapture(Option<u8>),
    AccelBias(Vector3<f32>),
    RequestProfile,
    UploadProfile(CalibrationProfile),
    SetNorth,
}

/// Messages sent to the remote client.
#[derive(Debug, Clone, PartialEq)]
pub enum Telemetry {
    Coefficients(PidCoefficients),
    Anchoring(bool),
    Heading(f32),
    YawAnchor(f32),
    MagPoint(Vector3<f32>),
    GyroProgress(f32),
    AccelProgress { percentage: f32, axis: u8 },
    AccelResult { axis: u8, mean: Vector3<f32> },
    Profile(CalibrationProfile),
    Message(String),
}

/// Outbound side of the transport.
pub trait TelemetrySink: Send + Sync {
    fn send(&self, telemetry: &Telemetry);
}

/// Drops everything.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn send(&self, _telemetry: &Telemetry) {}
}

/// Collects everything sent. Handy for tests and replays.
impl TelemetrySink for Mutex<Vec<Telemetry>> {
    fn send(&self, telemetry: &Telemetry) {
        if let Ok(mut sent) = self.lock() {
            sent.push(telemetry.clone());
        }
    }
}

struct Payload<'a> {
    id: u8,
    bytes: &'a [u8],
}

impl<'a> Payload<'a> {
    fn split(message: &'a [u8]) -> Result<Self, ProtocolError> {
        let (&id, bytes) = message.split_first().ok_or(ProtocolError::Empty)?;
        Ok(Self { id, bytes })
    }

    fn expect_len(&self, len: usize, expected: &'static str) -> Result<(), ProtocolError> {
        if self.bytes.len() == len {
            Ok(())
        } else {
            Err(self.bad_length(expected))
        }
    }

    fn bad_length(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::BadLength {
            id: self.id,
            expected,
            actual: self.bytes.len(),
        }
    }

    fn f32_at(&self, index: usize) -> f32 {
        let at = index * 4;
        f32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ])
    }

    fn floats<const N: usize>(&self, offset: usize) -> [f32; N] {
        let mut values = [0.0f32; N];
        for (i, chunk) in self.bytes[offset..offset + N * 4].chunks_exact(4).enumerate() {
            values[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        values
    }

    fn vec3(&self, offset: usize) -> Vector3<f32> {
        Vector3::from(self.floats::<3>(offset))
    }
}

struct Writer(Vec<u8>);

impl Writer {
    fn new(id: u8, payload_len: usize) -> Self {
        let mut buf = Vec::with_capacity(1 + payload_len);
        buf.push(id);
        Self(buf)
    }

    fn f32(mut self, value: f32) -> Self {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u8(mut self, value: u8) -> Self {
        self.0.push(value);
        self
    }

    fn floats(self, values: &[f32]) -> Self {
        values.iter().fold(self, |w, &v| w.f32(v))
    }

    fn finish(self) -> Vec<u8> {
        self.0
    }
}

fn check_axis(axis: u8) -> Result<u8, ProtocolError> {
    if axis < ACCEL_AXIS_COUNT {
        Ok(axis)
    } else {
        Err(ProtocolError::InvalidAxis(axis))
    }
}

fn profile_from(payload: &Payload<'_>) -> CalibrationProfile {
    CalibrationProfile::from_values(&payload.floats::<21>(0))
}

impl Command {
    pub fn decode(message: &[u8]) -> Result<Self, ProtocolError> {
        let p = Payload::split(message)?;

        let command = match p.id {
            ids::PID_COEFFICIENTS => match p.bytes.len() {
                0 => Command::RequestCoefficients,
                12 => Command::SetCoefficients(PidCoefficients::new(
                    p.f32_at(0),
                    p.f32_at(1),
                    p.f32_at(2),
                )),
                _ => return Err(p.bad_length("0 or 12")),
            },
            ids::ANCHORING => match p.bytes.len() {
                1 => Command::SetAnchoring(p.bytes[0] != 0),
                4 => Command::SetYawAnchor(p.f32_at(0)),
                _ => return Err(p.bad_length("1 or 4")),
            },
            ids::STEER => {
                p.expect_len(8, "8")?;
                Command::Steer {
                    angle: p.f32_at(0),
                    speed: p.f32_at(1),
                }
            }
            ids::SET_KP | ids::SET_KI | ids::SET_KD => {
                p.expect_len(4, "4")?;
                let value = p.f32_at(0);
                match p.id {
                    ids::SET_KP => Command::SetKp(value),
                    ids::SET_KI => Command::SetKi(value),
                    _ => Command::SetKd(value),
                }
            }
            ids::PING => {
                p.expect_len(0, "0")?;
                Command::Ping
            }
            ids::MAG_CALIBRATION => {
                p.expect_len(48, "48")?;
                Command::MagCalibration {
                    bias: p.vec3(0),
                    scale: Matrix3::from_row_slice(&p.floats::<9>(12)),
                }
            }
            ids::GYRO_CAPTURE => {
                p.expect_len(0, "0")?;
                Command::StartGyroCapture
            }
            ids::MAG_CAPTURE => {
                p.expect_len(0, "0")?;
                Command::StartMagCapture
            }
            ids::ACCEL_CAPTURE => {
                p.expect_len(1, "1")?;
                match p.bytes[0] {
                    ACCEL_AXIS_NONE => Command::AccelCapture(None),
                    axis => Command::AccelCapture(Some(check_axis(axis)?)),
                }
            }
            ids::ACCEL_BIAS => {
                p.expect_len(12, "12")?;
                Command::AccelBias(p.vec3(0))
            }
            ids::PROFILE => {
                p.expect_len(0, "0")?;
                Command::RequestProfile
            }
            ids::UPLOAD_PROFILE => {
                p.expect_len(PROFILE_WIRE_LEN, "84")?;
                Command::UploadProfile(profile_from(&p))
            }
            ids::SET_NORTH => {
                p.expect_len(0, "0")?;
                Command::SetNorth
            }
            id => return Err(ProtocolError::UnknownId(id)),
        };

        Ok(command)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::RequestCoefficients => Writer::new(ids::PID_COEFFICIENTS, 0).finish(),
            Command::SetCoefficients(c) => Writer::new(ids::PID_COEFFICIENTS, 12)
                .floats(&[c.kp, c.ki, c.kd])
                .finish(),
            Command::SetAnchoring(on) => Writer::new(ids::ANCHORING, 1).u8(*on as u8).finish(),
            Command::SetYawAnchor(anchor) => Writer::new(ids::ANCHORING, 4).f32(*anchor).finish(),
            Command::Steer { angle, speed } => {
                Writer::new(ids::STEER, 8).f32(*angle).f32(*speed).finish()
            }
            Command::SetKp(v) => Writer::new(ids::SET_KP, 4).f32(*v).finish(),
            Command::SetKi(v) => Writer::new(ids::SET_KI, 4).f32(*v).finish(),
            Command::SetKd(v) => Writer::new(ids::SET_KD, 4).f32(*v).finish(),
            Command::Ping => Writer::new(ids::PING, 0).finish(),
            Command::MagCalibration { bias, scale } => Writer::new(ids::MAG_CALIBRATION, 48)
                .floats(bias.as_slice())
                .floats(scale.transpose().as_slice())
                .finish(),
            Command::StartGyroCapture => Writer::new(ids::GYRO_CAPTURE, 0).finish(),
            Command::StartMagCapture => Writer::new(ids::MAG_CAPTURE, 0).finish(),
            Command::AccelCapture(axis) => Writer::new(ids::ACCEL_CAPTURE, 1)
                .u8(axis.unwrap_or(ACCEL_AXIS_NONE))
                .finish(),
            Command::AccelBias(bias) => Writer::new(ids::ACCEL_BIAS, 12)
                .floats(bias.as_slice())
                .finish(),
            Command::RequestProfile => Writer::new(ids::PROFILE, 0).finish(),
            Command::UploadProfile(profile) => Writer::new(ids::UPLOAD_PROFILE, PROFILE_WIRE_LEN)
                .floats(&profile.to_values())
                .finish(),
            Command::SetNorth => Writer::new(ids::SET_NORTH, 0).finish(),
        }
    }
}

impl Telemetry {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Telemetry::Coefficients(c) => Writer::new(ids::PID_COEFFICIENTS, 12)
                .floats(&[c.kp, c.ki, c.kd])
                .finish(),
            Telemetry::Anchoring(on) => Writer::new(ids::ANCHORING, 1).u8(*on as u8).finish(),
            Telemetry::Heading(heading) => Writer::new(ids::HEADING, 4).f32(*heading).finish(),
            Telemetry::YawAnchor(anchor) => Writer::new(ids::YAW_ANCHOR, 4).f32(*anchor).finish(),
            Telemetry::MagPoint(mag) => Writer::new(ids::MAG_POINT, 12)
                .floats(mag.as_slice())
                .finish(),
            Telemetry::GyroProgress(percentage) => {
                Writer::new(ids::GYRO_CAPTURE, 4).f32(*percentage).finish()
            }
            Telemetry::AccelProgress { percentage, axis } => Writer::new(ids::ACCEL_PROGRESS, 5)
                .f32(*percentage)
                .u8(*axis)
                .finish(),
            Telemetry::AccelResult { axis, mean } => Writer::new(ids::ACCEL_RESULT, 13)
                .u8(*axis)
                .floats(mean.as_slice())
                .finish(),
            Telemetry::Profile(profile) => Writer::new(ids::PROFILE, PROFILE_WIRE_LEN)
                .floats(&profile.to_values())
                .finish(),
            Telemetry::Message(text) => {
                let mut buf = Writer::new(ids::MESSAGE, text.len()).finish();
                buf.extend_from_slice(text.as_bytes());
                buf
            }
        }
    }

    /// Decode an outbound message, as the remote client would.
    pub fn decode(message: &[u8]) -> Result<Self, ProtocolError> {
        let p = Payload::split(message)?;

        let telemetry = match p.id {
            ids::PID_COEFFICIENTS => {
                p.expect_len(12, "12")?;
                Telemetry::Coefficients(PidCoefficients::new(p.f32_at(0), p.f32_at(1), p.f32_at(2)))
            }
            ids::ANCHORING => {
                p.expect_len(1, "1")?;
                Telemetry::Anchoring(p.bytes[0] != 0)
            }
            ids::HEADING => {
                p.expect_len(4, "4")?;
                Telemetry::Heading(p.f32_at(0))
            }
            ids::YAW_ANCHOR => {
                p.expect_len(4, "4")?;
                Telemetry::YawAnchor(p.f32_at(0))
            }
            ids::MAG_POINT => {
                p.expect_len(12, "12")?;
                Telemetry::MagPoint(p.vec3(0))
            }
            ids::GYRO_CAPTURE => {
                p.expect_len(4, "4")?;
                Telemetry::GyroProgress(p.f32_at(0))
            }
            ids::ACCEL_PROGRESS => {
                p.expect_len(5, "5")?;
                Telemetry::AccelProgress {
                    percentage: p.f32_at(0),
                    axis: p.bytes[4],
                }
            }
            ids::ACCEL_RESULT => {
                p.expect_len(13, "13")?;
                Telemetry::AccelResult {
                    axis: p.bytes[0],
                    mean: p.vec3(1),
                }
            }
            ids::PROFILE => {
                p.expect_len(PROFILE_WIRE_LEN, "84")?;
                Telemetry::Profile(profile_from(&p))
            }
            ids::MESSAGE => Telemetry::Message(String::from_utf8_lossy(p.bytes).into_owned()),
            id => return Err(ProtocolError::UnknownId(id)),
        };

        Ok(telemetry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_commands() -> Vec<Command> {
        let profile = CalibrationProfile {
            mag_scale: Matrix3::new(1.1, 0.2, 0.3, 0.4, 1.5, 0.6, 0.7, 0.8, 1.9),
            heading_zero: -0.0,
            ..CalibrationProfile::default()
        };

        vec![
            Command::RequestCoefficients,
            Command::SetCoefficients(PidCoefficients::new(1.5, 0.01, -3.25)),
            Command::SetAnchoring(true),
            Command::SetAnchoring(false),
            Command::SetYawAnchor(271.125),
            Command::Steer { angle: -12.5, speed: 80.0 },
            Command::SetKp(2.0),
            Command::SetKi(f32::MIN_POSITIVE),
            Command::SetKd(-0.5),
            Command::Ping,
            Command::MagCalibration {
                bias: Vector3::new(1.0, -2.0, 3.5),
                scale: Matrix3::new(1.0, 0.1, 0.2, 0.3, 0.9, 0.4, 0.5, 0.6, 1.2),
            },
            Command::StartGyroCapture,
            Command::StartMagCapture,
            Command::AccelCapture(Some(5)),
            Command::AccelCapture(None),
            Command::AccelBias(Vector3::new(0.01, 0.02, -0.03)),
            Command::RequestProfile,
            Command::UploadProfile(profile),
            Command::SetNorth,
        ]
    }

    #[test]
    fn test_commands_round_trip_bit_for_bit() {
        for command in all_commands() {
            let bytes = command.encode();
            let decoded = Command::decode(&bytes).unwrap();
            assert_eq!(decoded.encode(), bytes, "{command:?}");
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn test_telemetry_round_trip() {
        let messages = vec![
            Telemetry::Coefficients(PidCoefficients::new(1.0, 0.0, 0.0)),
            Telemetry::Anchoring(true),
            Telemetry::Heading(359.75),
            Telemetry::YawAnchor(12.0),
            Telemetry::MagPoint(Vector3::new(20.5, -3.0, -41.0)),
            Telemetry::GyroProgress(45.0),
            Telemetry::AccelProgress { percentage: 10.0, axis: 3 },
            Telemetry::AccelResult { axis: 2, mean: Vector3::new(0.0, 1.0, 0.02) },
            Telemetry::Profile(CalibrationProfile::default()),
            Telemetry::Message("SAMPLE_RATE is too big".to_string()),
        ];

        for telemetry in messages {
            let bytes = telemetry.encode();
            assert_eq!(Telemetry::decode(&bytes).unwrap(), telemetry);
        }
    }

    #[test]
    fn test_layouts_match_the_client() {
        let bytes = Telemetry::AccelProgress { percentage: 5.0, axis: 4 }.encode();
        assert_eq!(bytes.len(), 6);
        assert_eq!(bytes[0], 0xc6);
        assert_eq!(&bytes[1..5], &5.0f32.to_le_bytes());
        assert_eq!(bytes[5], 4);

        let bytes = Telemetry::AccelResult { axis: 1, mean: Vector3::new(1.0, 2.0, 3.0) }.encode();
        assert_eq!(bytes.len(), 14);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..6], &1.0f32.to_le_bytes());

        let bytes = Command::Steer { angle: 10.0, speed: 1500.0 }.encode();
        assert_eq!(bytes, [&[0x0c][..], &10.0f32.to_le_bytes(), &1500.0f32.to_le_bytes()].concat());

        assert_eq!(Telemetry::Profile(CalibrationProfile::default()).encode().len(), 85);
        assert_eq!(Telemetry::Message("hi".into()).encode(), vec![0xbb, b'h', b'i']);
    }

    #[test]
    fn test_wrong_lengths_are_rejected() {
        assert_eq!(Command::decode(&[]), Err(ProtocolError::Empty));
        assert!(matches!(
            Command::decode(&[ids::STEER, 0, 0, 0, 0]),
            Err(ProtocolError::BadLength { id: ids::STEER, actual: 4, .. })
        ));
        assert!(matches!(
            Command::decode(&[ids::ANCHORING, 1, 0]),
            Err(ProtocolError::BadLength { id: ids::ANCHORING, actual: 2, .. })
        ));
        assert!(matches!(
            Command::decode(&[ids::PING, 0]),
            Err(ProtocolError::BadLength { .. })
        ));
        let mut short_profile = Command::UploadProfile(CalibrationProfile::default()).encode();
        short_profile.pop();
        assert!(Command::decode(&short_profile).is_err());
    }

    #[test]
    fn test_unknown_id_and_axis() {
        assert_eq!(Command::decode(&[0x42]), Err(ProtocolError::UnknownId(0x42)));
        assert_eq!(
            Command::decode(&[ids::ACCEL_CAPTURE, 6]),
            Err(ProtocolError::InvalidAxis(6))
        );
        assert_eq!(
            Command::decode(&[ids::ACCEL_CAPTURE, 255]),
            Ok(Command::AccelCapture(None))
        );
    }

    #[test]
    fn test_collecting_sink() {
        let sink = Mutex::new(Vec::<Telemetry>::new());
        sink.send(&Telemetry::Heading(1.0));
        assert_eq!(sink.lock().unwrap().as_slice(), &[Telemetry::Heading(1.0)]);
    }
}

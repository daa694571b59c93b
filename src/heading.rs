//! Angle helpers shared by the estimator, controller and telemetry.
//!
//! Headings are degrees in `[0, 360)`. Errors are degrees in `(-180, 180]`
//! before the rudder-authority fold.

/// Normalize any angle to the canonical `[0, 360)` range.
pub fn normalize(heading: f32) -> f32 {
    ((heading % 360.0) + 360.0) % 360.0
}

/// Shortest signed angle from `anchor` to `heading`, in `(-180, 180]`.
///
/// Positive means the vessel points clockwise of its anchor.
pub fn shortest_error(anchor: f32, heading: f32) -> f32 {
    let error = (heading - anchor + 540.0).rem_euclid(360.0) - 180.0;
    // an exact reversal lands on -180
    if error <= -180.0 { error + 360.0 } else { error }
}

/// Signed heading error fed to the rudder PID.
///
/// The rudder can only push the bow one way or the other, so an error past
/// ±90° is folded back by 180°.
pub fn rudder_error(anchor: f32, heading: f32) -> f32 {
    let error = shortest_error(anchor, heading);

    if error < -90.0 {
        error + 180.0
    } else if error > 90.0 {
        error - 180.0
    } else {
        error
    }
}

// Differential-drive kinematics
// Converts unicycle body velocities (linear, angular) to per-wheel velocities
// and back, plus heading normalization helpers used by the motion sequencer.

use std::f32::consts::{PI, TAU};

use crate::config::{COUNTS_PER_REV, TRACK_WIDTH_M, WHEEL_DIAMETER_M, WHEEL_RADIUS_M};

/// Per-wheel angular velocities in rad/s
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelVelocities {
    pub left: f32,
    pub right: f32,
}

impl WheelVelocities {
    pub fn zero() -> Self {
        Self::default()
    }
}

/// Convert unicycle (linear m/s, angular rad/s) to differential wheel rad/s
///
/// Vl = (2*V - W*L) / (2*R)
/// Vr = (2*V + W*L) / (2*R)
pub fn uni_to_diff(linear: f32, angular: f32) -> WheelVelocities {
    WheelVelocities {
        left: (2.0 * linear - angular * TRACK_WIDTH_M) / WHEEL_DIAMETER_M,
        right: (2.0 * linear + angular * TRACK_WIDTH_M) / WHEEL_DIAMETER_M,
    }
}

/// Convert differential wheel rad/s back to unicycle (linear m/s, angular rad/s)
pub fn diff_to_uni(wheels: WheelVelocities) -> (f32, f32) {
    let linear = WHEEL_RADIUS_M * (wheels.right + wheels.left) / 2.0;
    let angular = WHEEL_RADIUS_M * (wheels.right - wheels.left) / TRACK_WIDTH_M;
    (linear, angular)
}

/// Wheel angular velocity (rad/s) to encoder counts/sec
pub fn radps_to_cps(radps: f32) -> f32 {
    radps * COUNTS_PER_REV / TAU
}

/// Encoder counts/sec to wheel angular velocity (rad/s)
pub fn cps_to_radps(cps: f32) -> f32 {
    cps * TAU / COUNTS_PER_REV
}

/// Normalize a heading into [-pi, pi]
pub fn normalize_heading(mut heading: f32) -> f32 {
    while heading > PI {
        heading -= TAU;
    }
    while heading < -PI {
        heading += TAU;
    }
    heading
}

/// True when `a` and `b` are within `tolerance` of each other
pub fn approx_eq(a: f32, b: f32, tolerance: f32) -> bool {
    (a - b).abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_straight_line_equal_wheels() {
        let wheels = uni_to_diff(0.2, 0.0);
        assert!(approx_eq(wheels.left, wheels.right, 1e-6));
        assert!(wheels.left > 0.0);
    }

    #[test]
    fn test_pure_rotation_opposite_wheels() {
        let wheels = uni_to_diff(0.0, 1.0);
        assert!(approx_eq(wheels.left, -wheels.right, 1e-6));
        // Positive angular velocity (ccw) drives the right wheel forward
        assert!(wheels.right > 0.0);
    }

    #[test]
    fn test_uni_diff_roundtrip() {
        let (linear, angular) = diff_to_uni(uni_to_diff(0.15, 0.4));
        assert!(approx_eq(linear, 0.15, 1e-5));
        assert!(approx_eq(angular, 0.4, 1e-5));
    }

    #[test]
    fn test_cps_radps_roundtrip() {
        let cps = radps_to_cps(cps_to_radps(225.0));
        assert!(approx_eq(cps, 225.0, 1e-3));
    }

    #[test]
    fn test_normalize_heading_range() {
        assert!(approx_eq(normalize_heading(PI + FRAC_PI_2), -FRAC_PI_2, 1e-6));
        assert!(approx_eq(normalize_heading(-PI - FRAC_PI_2), FRAC_PI_2, 1e-6));
        assert!(approx_eq(normalize_heading(0.5), 0.5, 1e-6));
        assert!(approx_eq(normalize_heading(3.0 * TAU + 0.25), 0.25, 1e-4));
    }
}

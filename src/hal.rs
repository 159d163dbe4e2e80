// Narrow interface to the hardware collaborators: monotonic clock, PWM sink,
// encoder-derived wheel velocity, odometry snapshot, and non-volatile storage.
//
// Everything behind this trait runs outside the core: the encoder ISRs and
// odometry integration live on the MCU (or in `sim` for tests). The core only
// reads snapshots and writes commands; it never touches registers.

use crate::config::Pwm;
use crate::motor::bridge::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wheel {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// Direction implied by the sign of a counts/sec value. Zero is treated as
    /// forward, but callers short-circuit zero before any table lookup.
    pub fn of_cps(cps: f32) -> Self {
        if cps >= 0.0 {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("nvstore access out of range: offset {offset}, len {len}")]
    NvOutOfRange { offset: u16, len: usize },
}

/// External collaborator interface consumed by the calibration and motion core.
pub trait Board {
    /// Monotonic millisecond counter. Wraps; compare with [`elapsed_ms`].
    fn millis(&self) -> u32;

    /// Write both motor PWM duties in one update.
    fn set_pwm(&mut self, left: Pwm, right: Pwm) -> Result<(), BoardError>;

    /// Encoder-derived wheel velocity in counts/sec (signed).
    fn wheel_cps(&mut self, wheel: Wheel) -> Result<f32, BoardError>;

    /// Odometry position snapshot in meters.
    fn xy_position(&mut self) -> Result<(f32, f32), BoardError>;

    /// Odometry heading in radians, normalized to [-pi, pi].
    fn heading(&mut self) -> Result<f32, BoardError>;

    /// Zero the odometry accumulators.
    fn reset_odometry(&mut self) -> Result<(), BoardError>;

    fn nv_read(&mut self, offset: u16, buf: &mut [u8]) -> Result<(), BoardError>;

    fn nv_write(&mut self, offset: u16, bytes: &[u8]) -> Result<(), BoardError>;
}

/// Wraparound-safe elapsed time between two millisecond counter readings.
pub fn elapsed_ms(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_ms_wraparound() {
        assert_eq!(elapsed_ms(100, 50), 50);
        // Counter wrapped between readings
        assert_eq!(elapsed_ms(25, u32::MAX - 24), 50);
    }

    #[test]
    fn test_direction_of_cps() {
        assert_eq!(Direction::of_cps(10.0), Direction::Forward);
        assert_eq!(Direction::of_cps(0.0), Direction::Forward);
        assert_eq!(Direction::of_cps(-0.5), Direction::Backward);
    }
}

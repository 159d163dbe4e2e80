// Simulated board for tests and `--sim` mode.
//
// Models each motor as a first-order lag toward a steady-state counts/sec
// proportional to the PWM offset from `PWM_STOP`, integrates differential-drive
// odometry from the resulting wheel speeds, and backs the non-volatile store
// with a RAM buffer. The clock only advances when `advance` is called, so tests
// control time explicitly.

use crate::config::{COUNTS_PER_REV, PWM_STOP, Pwm, TRACK_WIDTH_M, WHEEL_DIAMETER_M};
use crate::hal::{Board, BoardError, Wheel};
use crate::motor::kinematics::normalize_heading;

// Steady-state counts/sec per microsecond of PWM offset
const PWM_GAIN: f32 = 8.0;
// First-order motor time constant
const MOTOR_TAU_MS: f32 = 200.0;
// RAM-backed non-volatile store size
const NV_SIZE: usize = 4096;

pub struct SimBoard {
    now_ms: u32,
    left_pwm: Pwm,
    right_pwm: Pwm,
    left_cps: f32,
    right_cps: f32,
    x: f32,
    y: f32,
    heading: f32,
    nv: Vec<u8>,
}

impl Default for SimBoard {
    fn default() -> Self {
        Self {
            now_ms: 0,
            left_pwm: PWM_STOP,
            right_pwm: PWM_STOP,
            left_cps: 0.0,
            right_cps: 0.0,
            x: 0.0,
            y: 0.0,
            heading: 0.0,
            nv: vec![0; NV_SIZE],
        }
    }
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steady-state wheel speed for a PWM duty. The right motor is mounted
    /// mirrored, so its forward speeds sit below `PWM_STOP`.
    fn steady_cps(wheel: Wheel, pwm: Pwm) -> f32 {
        let offset = pwm as f32 - PWM_STOP as f32;
        match wheel {
            Wheel::Left => PWM_GAIN * offset,
            Wheel::Right => -PWM_GAIN * offset,
        }
    }

    fn cps_to_mps(cps: f32) -> f32 {
        cps / COUNTS_PER_REV * (std::f32::consts::PI * WHEEL_DIAMETER_M)
    }

    /// Advance the simulation clock, stepping the motor lag and odometry in
    /// 1 ms increments.
    pub fn advance(&mut self, dt_ms: u32) {
        for _ in 0..dt_ms {
            let dt = 0.001f32;
            let alpha = (1.0 / MOTOR_TAU_MS).min(1.0);

            let left_ss = Self::steady_cps(Wheel::Left, self.left_pwm);
            let right_ss = Self::steady_cps(Wheel::Right, self.right_pwm);
            self.left_cps += (left_ss - self.left_cps) * alpha;
            self.right_cps += (right_ss - self.right_cps) * alpha;

            let left_mps = Self::cps_to_mps(self.left_cps);
            let right_mps = Self::cps_to_mps(self.right_cps);
            let linear = (left_mps + right_mps) / 2.0;
            let angular = (right_mps - left_mps) / TRACK_WIDTH_M;

            self.x += linear * self.heading.cos() * dt;
            self.y += linear * self.heading.sin() * dt;
            self.heading = normalize_heading(self.heading + angular * dt);

            self.now_ms = self.now_ms.wrapping_add(1);
        }
    }
}

impl Board for SimBoard {
    fn millis(&self) -> u32 {
        self.now_ms
    }

    fn set_pwm(&mut self, left: Pwm, right: Pwm) -> Result<(), BoardError> {
        self.left_pwm = left;
        self.right_pwm = right;
        Ok(())
    }

    fn wheel_cps(&mut self, wheel: Wheel) -> Result<f32, BoardError> {
        Ok(match wheel {
            Wheel::Left => self.left_cps,
            Wheel::Right => self.right_cps,
        })
    }

    fn xy_position(&mut self) -> Result<(f32, f32), BoardError> {
        Ok((self.x, self.y))
    }

    fn heading(&mut self) -> Result<f32, BoardError> {
        Ok(self.heading)
    }

    fn reset_odometry(&mut self) -> Result<(), BoardError> {
        self.x = 0.0;
        self.y = 0.0;
        self.heading = 0.0;
        Ok(())
    }

    fn nv_read(&mut self, offset: u16, buf: &mut [u8]) -> Result<(), BoardError> {
        let at = offset as usize;
        let end = at + buf.len();
        if end > self.nv.len() {
            return Err(BoardError::NvOutOfRange {
                offset,
                len: buf.len(),
            });
        }
        buf.copy_from_slice(&self.nv[at..end]);
        Ok(())
    }

    fn nv_write(&mut self, offset: u16, bytes: &[u8]) -> Result<(), BoardError> {
        let at = offset as usize;
        let end = at + bytes.len();
        if end > self.nv.len() {
            return Err(BoardError::NvOutOfRange {
                offset,
                len: bytes.len(),
            });
        }
        self.nv[at..end].copy_from_slice(bytes);
        Ok(())
    }
}

// `Board` implementation backed by the serial bridge.
//
// Thin adapter: every trait call maps to one bridge transaction. The millis
// counter is host-local; timeouts and settle delays only compare differences,
// so host time and MCU time never need to agree.

use std::time::Instant;

use tracing::{info, warn};

use crate::config::Pwm;
use crate::hal::{Board, BoardError, Wheel};

use super::bridge::Bridge;

pub struct SerialBoard {
    bridge: Bridge,
    started: Instant,
}

impl SerialBoard {
    /// Open the bridge on the given serial port and stop the motors.
    pub fn open(port: &str) -> Result<Self, BoardError> {
        info!("Opening motor bridge on {}", port);
        let bridge = Bridge::open(port)?;
        let mut board = Self {
            bridge,
            started: Instant::now(),
        };
        board.set_pwm(crate::config::PWM_STOP, crate::config::PWM_STOP)?;
        Ok(board)
    }

    fn wheel_index(wheel: Wheel) -> u8 {
        match wheel {
            Wheel::Left => 0,
            Wheel::Right => 1,
        }
    }
}

impl Board for SerialBoard {
    fn millis(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    fn set_pwm(&mut self, left: Pwm, right: Pwm) -> Result<(), BoardError> {
        Ok(self.bridge.set_pwm(left, right)?)
    }

    fn wheel_cps(&mut self, wheel: Wheel) -> Result<f32, BoardError> {
        Ok(self.bridge.get_cps(Self::wheel_index(wheel))?)
    }

    fn xy_position(&mut self) -> Result<(f32, f32), BoardError> {
        let (x, y, _) = self.bridge.get_pose()?;
        Ok((x, y))
    }

    fn heading(&mut self) -> Result<f32, BoardError> {
        let (_, _, heading) = self.bridge.get_pose()?;
        Ok(heading)
    }

    fn reset_odometry(&mut self) -> Result<(), BoardError> {
        Ok(self.bridge.reset_odom()?)
    }

    fn nv_read(&mut self, offset: u16, buf: &mut [u8]) -> Result<(), BoardError> {
        // The bridge caps one transfer at 255 bytes; chunk larger reads.
        let mut at = 0usize;
        while at < buf.len() {
            let chunk = (buf.len() - at).min(255);
            let bytes = self.bridge.nv_read(offset + at as u16, chunk as u8)?;
            buf[at..at + chunk].copy_from_slice(&bytes);
            at += chunk;
        }
        Ok(())
    }

    fn nv_write(&mut self, offset: u16, bytes: &[u8]) -> Result<(), BoardError> {
        for (ii, chunk) in bytes.chunks(128).enumerate() {
            self.bridge.nv_write(offset + (ii * 128) as u16, chunk)?;
        }
        Ok(())
    }
}

impl Drop for SerialBoard {
    fn drop(&mut self) {
        // Try to stop motors when the board handle is dropped
        if let Err(e) = self
            .bridge
            .set_pwm(crate::config::PWM_STOP, crate::config::PWM_STOP)
        {
            warn!("Failed to stop motors on drop: {}", e);
        }
    }
}

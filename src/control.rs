// Command arbitration and actuation.
//
// One tick: pick the command source, convert the unicycle command to per-wheel
// counts/sec, run it through the curve tables, and push PWM to the board.
// Source priority: an active calibration routine owns the actuator outright,
// then a running motion sequence, then the last manual command. Manual
// commands go stale after the watchdog timeout and decay to stop.

use tracing::debug;

use crate::cal::store::CalStore;
use crate::config::CMD_TIMEOUT;
use crate::hal::{Board, BoardError, Wheel, elapsed_ms};
use crate::messages::{VelocityCommand, WheelTargets};
use crate::motion::MotionSequencer;
use crate::motor::kinematics::{radps_to_cps, uni_to_diff};

#[derive(Default)]
pub struct Controller {
    manual: VelocityCommand,
    manual_at: Option<u32>,
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a manual velocity command, restarting the watchdog.
    pub fn set_command(&mut self, cmd: VelocityCommand, now_ms: u32) {
        debug!(
            "Manual command: linear {:.2} m/s, angular {:.2} rad/s",
            cmd.linear, cmd.angular
        );
        self.manual = cmd;
        self.manual_at = Some(now_ms);
    }

    fn manual_command(&mut self, now_ms: u32) -> VelocityCommand {
        match self.manual_at {
            Some(at) if elapsed_ms(now_ms, at) < CMD_TIMEOUT.as_millis() as u32 => self.manual,
            Some(_) => {
                debug!("Manual command stale, stopping");
                self.manual_at = None;
                self.manual = VelocityCommand::stop();
                self.manual
            }
            None => VelocityCommand::stop(),
        }
    }

    /// Run one actuation tick. Returns the wheel targets that were applied.
    pub fn tick<B: Board>(
        &mut self,
        board: &mut B,
        store: &CalStore,
        seq: &MotionSequencer,
        cal_active: bool,
    ) -> Result<WheelTargets, BoardError> {
        if cal_active {
            // Calibration routines drive the board themselves
            return Ok(WheelTargets::default());
        }

        let now = board.millis();
        let cmd = if seq.is_moving() {
            seq.command()
        } else {
            self.manual_command(now)
        };

        let wheels = uni_to_diff(
            cmd.linear * store.linear_bias(),
            cmd.angular * store.angular_bias(),
        );
        let targets = WheelTargets {
            left_cps: radps_to_cps(wheels.left),
            right_cps: radps_to_cps(wheels.right),
        };

        let left = store.cps_to_pwm(Wheel::Left, targets.left_cps);
        let right = store.cps_to_pwm(Wheel::Right, targets.right_cps);
        board.set_pwm(left, right)?;
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cal::curve::CurveTable;
    use crate::cal::store::STATUS_MOTOR;
    use crate::config::{CPS_SCALE, CURVE_POINTS, PWM_STOP, Pwm};
    use crate::motion::Move;
    use crate::sim::SimBoard;

    fn calibrated_store() -> CalStore {
        let mut store = CalStore::default();
        let table = |pwm_at: &dyn Fn(usize) -> Pwm, cps_at: &dyn Fn(usize) -> i32| {
            let mut cps = [0i32; CURVE_POINTS];
            let mut pwm = [PWM_STOP; CURVE_POINTS];
            for ii in 0..CURVE_POINTS {
                cps[ii] = cps_at(ii);
                pwm[ii] = pwm_at(ii);
            }
            CurveTable::from_samples(cps, pwm)
        };
        let scale = 80 * CPS_SCALE;

        store.curves.left_fwd = table(&|ii| 1500 + 10 * ii as Pwm, &|ii| scale * ii as i32);
        store.curves.left_bwd = table(&|ii| 1000 + 10 * ii as Pwm, &|ii| scale * (ii as i32 - 50));
        store.curves.right_fwd = table(&|ii| 1500 - 10 * ii as Pwm, &|ii| scale * ii as i32);
        store.curves.right_bwd = table(&|ii| 2000 - 10 * ii as Pwm, &|ii| scale * (ii as i32 - 50));
        store.set_status(STATUS_MOTOR);
        store
    }

    #[test]
    fn test_fresh_command_drives_wheels() {
        let mut board = SimBoard::new();
        let store = calibrated_store();
        let seq = MotionSequencer::new();
        let mut ctl = Controller::new();

        ctl.set_command(
            VelocityCommand {
                linear: 0.2,
                angular: 0.0,
            },
            board.millis(),
        );
        let targets = ctl.tick(&mut board, &store, &seq, false).unwrap();
        assert!(targets.left_cps > 0.0);
        assert!((targets.left_cps - targets.right_cps).abs() < 1e-3);

        board.advance(1000);
        assert!(board.wheel_cps(Wheel::Left).unwrap() > 50.0);
    }

    #[test]
    fn test_watchdog_stops_stale_command() {
        let mut board = SimBoard::new();
        let store = calibrated_store();
        let seq = MotionSequencer::new();
        let mut ctl = Controller::new();

        ctl.set_command(
            VelocityCommand {
                linear: 0.2,
                angular: 0.0,
            },
            board.millis(),
        );
        ctl.tick(&mut board, &store, &seq, false).unwrap();

        board.advance(CMD_TIMEOUT.as_millis() as u32);
        let targets = ctl.tick(&mut board, &store, &seq, false).unwrap();
        assert_eq!(targets, WheelTargets::default());

        board.advance(2000);
        assert!(board.wheel_cps(Wheel::Left).unwrap().abs() < 1.0);
    }

    #[test]
    fn test_uncalibrated_store_never_moves() {
        let mut board = SimBoard::new();
        let store = CalStore::default();
        let seq = MotionSequencer::new();
        let mut ctl = Controller::new();

        ctl.set_command(
            VelocityCommand {
                linear: 0.5,
                angular: 0.0,
            },
            board.millis(),
        );
        let targets = ctl.tick(&mut board, &store, &seq, false).unwrap();
        // Targets are computed but fail safe to stop at the curve lookup
        assert!(targets.left_cps > 0.0);

        board.advance(1000);
        assert_eq!(board.wheel_cps(Wheel::Left).unwrap(), 0.0);
    }

    #[test]
    fn test_sequencer_outranks_manual_command() {
        let mut board = SimBoard::new();
        let store = calibrated_store();
        let mut seq = MotionSequencer::new();
        let mut ctl = Controller::new();

        seq.add(Move::Linear {
            distance_m: -1.0,
            speed_mps: 0.2,
            timeout_ms: 5000,
        })
        .unwrap();
        seq.start().unwrap();
        seq.update(&mut board).unwrap();

        ctl.set_command(
            VelocityCommand {
                linear: 0.3,
                angular: 0.0,
            },
            board.millis(),
        );
        let targets = ctl.tick(&mut board, &store, &seq, false).unwrap();
        // The sequencer's backward drive wins over the forward manual command
        assert!(targets.left_cps < 0.0);
    }

    #[test]
    fn test_active_calibration_owns_the_actuator() {
        let mut board = SimBoard::new();
        let store = calibrated_store();
        let seq = MotionSequencer::new();
        let mut ctl = Controller::new();

        board.set_pwm(1700, 1300).unwrap();
        ctl.set_command(
            VelocityCommand {
                linear: -0.2,
                angular: 0.0,
            },
            board.millis(),
        );
        ctl.tick(&mut board, &store, &seq, true).unwrap();

        // The controller must not have overwritten the routine's PWM
        board.advance(1000);
        assert!(board.wheel_cps(Wheel::Left).unwrap() > 0.0);
    }
}

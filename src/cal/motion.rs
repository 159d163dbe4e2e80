// Composite motion validation.
//
// Programs the motion sequencer with a square pattern (drive, pause, rotate,
// four times over) and runs it through the calibrated curve tables. A perfect
// run returns the robot to its starting pose; the measured odometry drift is
// the validation result.

use std::f32::consts::FRAC_PI_2;

use tracing::info;

use crate::hal::Board;
use crate::motion::{MotionSequencer, Move};
use crate::motor::kinematics::{radps_to_cps, uni_to_diff};

use super::{CalContext, CalError, Routine, StepResult};

const SQUARE_SIDE_M: f32 = 0.5;
const SQUARE_SPEED_MPS: f32 = 0.2;
const SQUARE_TURN_RADPS: f32 = 0.7;
const SQUARE_PAUSE_MS: u32 = 500;
const SQUARE_MOVE_TIMEOUT_MS: u32 = 10_000;

#[derive(Default)]
pub struct MotionValidation {
    seq: MotionSequencer,
}

impl MotionValidation {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B: Board> Routine<B> for MotionValidation {
    fn init(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        self.seq.clear();
        ctx.board.reset_odometry()?;
        Ok(())
    }

    fn start(&mut self, _ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        for _ in 0..4 {
            self.seq.add(Move::Linear {
                distance_m: SQUARE_SIDE_M,
                speed_mps: SQUARE_SPEED_MPS,
                timeout_ms: SQUARE_MOVE_TIMEOUT_MS,
            })?;
            self.seq.add(Move::Pause {
                duration_ms: SQUARE_PAUSE_MS,
            })?;
            self.seq.add(Move::Rotate {
                angle_rad: FRAC_PI_2,
                speed_radps: SQUARE_TURN_RADPS,
                timeout_ms: SQUARE_MOVE_TIMEOUT_MS,
            })?;
        }
        self.seq.start()?;
        info!(
            "Motion validation: {:.2} m square at {:.2} m/s",
            SQUARE_SIDE_M, SQUARE_SPEED_MPS
        );
        Ok(())
    }

    fn update(&mut self, ctx: &mut CalContext<'_, B>) -> Result<StepResult, CalError> {
        self.seq.update(ctx.board)?;

        let cmd = self.seq.command();
        let wheels = uni_to_diff(
            cmd.linear * ctx.store.linear_bias(),
            cmd.angular * ctx.store.angular_bias(),
        );
        ctx.drive_cps(radps_to_cps(wheels.left), radps_to_cps(wheels.right))?;

        if self.seq.is_moving() {
            Ok(StepResult::Running)
        } else {
            Ok(StepResult::Complete)
        }
    }

    fn stop(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        self.seq.clear();
        ctx.drive_cps(0.0, 0.0)?;
        Ok(())
    }

    fn results(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        let (x, y) = ctx.board.xy_position()?;
        let heading = ctx.board.heading()?;
        let drift = (x * x + y * y).sqrt();
        info!(
            "Motion validation complete: drift {:.3} m, final heading {:.3} rad",
            drift, heading
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cal::curve::CurveTable;
    use crate::cal::store::{CalStore, STATUS_MOTOR};
    use crate::cal::{CalEngine, CalState, RoutineId, Stage};
    use crate::config::{CPS_SCALE, CURVE_POINTS, PWM_STOP, Pwm};
    use crate::messages::WheelTargets;
    use crate::sim::SimBoard;

    // Same exact-model tables as the PID tests
    fn synthetic_store() -> CalStore {
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
    fn test_square_drives_to_completion_with_bounded_drift() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        let mut store = synthetic_store();
        let mut target = WheelTargets::default();
        engine
            .activate(RoutineId::Motion, Stage::Validate, &store)
            .unwrap();

        let mut ticks = 0;
        while engine.is_active() && ticks < 3000 {
            let mut ctx = CalContext {
                board: &mut board,
                store: &mut store,
                target: &mut target,
            };
            engine.tick(&mut ctx).unwrap();
            board.advance(20);
            ticks += 1;
        }
        assert!(!engine.is_active(), "square did not finish");

        let (x, y) = board.xy_position().unwrap();
        let drift = (x * x + y * y).sqrt();
        assert!(drift < 0.5, "drift {} m", drift);
    }

    #[test]
    fn test_engine_stays_running_while_sequence_executes() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        let mut store = synthetic_store();
        let mut target = WheelTargets::default();
        engine
            .activate(RoutineId::Motion, Stage::Validate, &store)
            .unwrap();

        for _ in 0..10 {
            let mut ctx = CalContext {
                board: &mut board,
                store: &mut store,
                target: &mut target,
            };
            engine.tick(&mut ctx).unwrap();
            board.advance(20);
        }
        assert_eq!(engine.report().unwrap().state, CalState::Running);
    }
}

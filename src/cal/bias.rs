// Linear and angular bias calibration and validation.
//
// Calibration drives a fixed open-loop command for a fixed time, compares the
// odometry result against the dead-reckoned goal, and persists the ratio as a
// correction factor on the command path. The linear run measures straight-line
// distance from the starting pose; the angular run accumulates heading deltas
// tick by tick so a full turn survives the [-pi, pi] wrap. Validation repeats
// the run with the stored bias applied and logs the residual error.

use tracing::info;

use crate::config::{
    ANGULAR_BIAS_MAX, ANGULAR_BIAS_MIN, BIAS_ANGULAR_RADPS, BIAS_ANGULAR_RUN_MS, BIAS_LINEAR_MPS,
    BIAS_LINEAR_RUN_MS, LINEAR_BIAS_MAX, LINEAR_BIAS_MIN,
};
use crate::hal::{Board, elapsed_ms};
use crate::motor::kinematics::{normalize_heading, radps_to_cps, uni_to_diff};

use super::store::{CalStore, STATUS_ANGULAR, STATUS_LINEAR};
use super::{CalContext, CalError, Routine, StepResult};

// Below this, the run is treated as no motion (meters or radians)
const MIN_MEASURED: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasAxis {
    Linear,
    Angular,
}

pub struct BiasRoutine {
    axis: BiasAxis,
    corrected: bool,
    started: Option<u32>,
    last_heading: f32,
    turned_rad: f32,
}

impl BiasRoutine {
    pub fn calibrate(axis: BiasAxis) -> Self {
        Self::new(axis, false)
    }

    /// Validation drives the same run with the stored bias applied.
    pub fn validate(axis: BiasAxis) -> Self {
        Self::new(axis, true)
    }

    fn new(axis: BiasAxis, corrected: bool) -> Self {
        Self {
            axis,
            corrected,
            started: None,
            last_heading: 0.0,
            turned_rad: 0.0,
        }
    }

    fn run_ms(&self) -> u32 {
        match self.axis {
            BiasAxis::Linear => BIAS_LINEAR_RUN_MS,
            BiasAxis::Angular => BIAS_ANGULAR_RUN_MS,
        }
    }

    /// Dead-reckoned travel the run should produce (meters or radians).
    fn expected(&self) -> f32 {
        match self.axis {
            BiasAxis::Linear => BIAS_LINEAR_MPS * BIAS_LINEAR_RUN_MS as f32 / 1000.0,
            BiasAxis::Angular => BIAS_ANGULAR_RADPS * BIAS_ANGULAR_RUN_MS as f32 / 1000.0,
        }
    }

    fn command(&self, store: &CalStore) -> (f32, f32) {
        match (self.axis, self.corrected) {
            (BiasAxis::Linear, false) => (BIAS_LINEAR_MPS, 0.0),
            (BiasAxis::Linear, true) => (BIAS_LINEAR_MPS * store.linear_bias(), 0.0),
            (BiasAxis::Angular, false) => (0.0, BIAS_ANGULAR_RADPS),
            (BiasAxis::Angular, true) => (0.0, BIAS_ANGULAR_RADPS * store.angular_bias()),
        }
    }
}

impl<B: Board> Routine<B> for BiasRoutine {
    fn init(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        self.started = None;
        self.turned_rad = 0.0;
        ctx.board.reset_odometry()?;
        self.last_heading = ctx.board.heading()?;
        Ok(())
    }

    fn start(&mut self, _ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        info!(
            "{:?} bias {}: open-loop run for {} ms",
            self.axis,
            if self.corrected {
                "validation"
            } else {
                "calibration"
            },
            self.run_ms()
        );
        Ok(())
    }

    fn update(&mut self, ctx: &mut CalContext<'_, B>) -> Result<StepResult, CalError> {
        let now = ctx.board.millis();
        let started = *self.started.get_or_insert(now);

        let (linear, angular) = self.command(ctx.store);
        let wheels = uni_to_diff(linear, angular);
        ctx.drive_cps(radps_to_cps(wheels.left), radps_to_cps(wheels.right))?;

        let heading = ctx.board.heading()?;
        self.turned_rad += normalize_heading(heading - self.last_heading);
        self.last_heading = heading;

        if elapsed_ms(now, started) >= self.run_ms() {
            Ok(StepResult::Complete)
        } else {
            Ok(StepResult::Running)
        }
    }

    fn stop(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        ctx.drive_cps(0.0, 0.0)?;
        Ok(())
    }

    fn results(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        let measured = match self.axis {
            BiasAxis::Linear => {
                let (x, y) = ctx.board.xy_position()?;
                (x * x + y * y).sqrt()
            }
            BiasAxis::Angular => self.turned_rad.abs(),
        };
        if measured < MIN_MEASURED {
            return Err(CalError::NoMotion);
        }

        let expected = self.expected();
        if self.corrected {
            info!(
                "{:?} bias validation: expected {:.3}, measured {:.3} ({:+.1}% error)",
                self.axis,
                expected,
                measured,
                100.0 * (measured - expected) / expected
            );
            return Ok(());
        }

        let bias = match self.axis {
            BiasAxis::Linear => {
                let bias = (expected / measured).clamp(LINEAR_BIAS_MIN, LINEAR_BIAS_MAX);
                ctx.store.linear_bias = bias;
                ctx.store.set_status(STATUS_LINEAR);
                bias
            }
            BiasAxis::Angular => {
                let bias = (expected / measured).clamp(ANGULAR_BIAS_MIN, ANGULAR_BIAS_MAX);
                ctx.store.angular_bias = bias;
                ctx.store.set_status(STATUS_ANGULAR);
                bias
            }
        };
        ctx.store.save(ctx.board)?;
        info!(
            "{:?} bias calibration: expected {:.3}, measured {:.3}, bias {:.3}",
            self.axis, expected, measured, bias
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cal::curve::CurveTable;
    use crate::cal::store::STATUS_MOTOR;
    use crate::cal::{CalEngine, RoutineId, Stage};
    use crate::config::{CPS_SCALE, CURVE_POINTS, PWM_STOP, Pwm};
    use crate::messages::WheelTargets;
    use crate::sim::SimBoard;

    // Curve tables that match the sim's 8 cps per microsecond motor model
    // exactly, so commanded cps equals steady-state cps.
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

    fn run_to_completion(
        engine: &mut CalEngine,
        board: &mut SimBoard,
        store: &mut CalStore,
        max_ticks: usize,
    ) -> Result<(), CalError> {
        let mut target = WheelTargets::default();
        for _ in 0..max_ticks {
            let mut ctx = CalContext {
                board: &mut *board,
                store: &mut *store,
                target: &mut target,
            };
            engine.tick(&mut ctx)?;
            if !engine.is_active() {
                return Ok(());
            }
            board.advance(20);
        }
        panic!("routine did not complete within {} ticks", max_ticks);
    }

    #[test]
    fn test_linear_bias_calibration_persists_correction() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        let mut store = synthetic_store();
        engine
            .activate(RoutineId::BiasLinear, Stage::Calibrate, &store)
            .unwrap();
        run_to_completion(&mut engine, &mut board, &mut store, 1000).unwrap();

        assert!(store.has_status(STATUS_LINEAR));
        let bias = store.linear_bias();
        // The motor lag makes the robot under-travel, so the correction is a
        // modest boost
        assert!(bias > 1.0 && bias < 1.2, "bias {}", bias);

        let restored = CalStore::load(&mut board).unwrap();
        assert_eq!(restored.linear_bias(), bias);
    }

    #[test]
    fn test_angular_bias_calibration_tracks_a_full_turn() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        let mut store = synthetic_store();
        engine
            .activate(RoutineId::BiasAngular, Stage::Calibrate, &store)
            .unwrap();
        run_to_completion(&mut engine, &mut board, &mut store, 1000).unwrap();

        // The commanded turn exceeds pi, so the accumulated measurement must
        // survive the heading wrap
        assert!(store.has_status(STATUS_ANGULAR));
        let bias = store.angular_bias();
        assert!(bias > 1.0 && bias < 1.2, "bias {}", bias);
    }

    #[test]
    fn test_validation_requires_its_own_bias_bit() {
        let mut engine = CalEngine::new();
        let store = synthetic_store();
        for id in [RoutineId::BiasLinear, RoutineId::BiasAngular] {
            assert!(
                matches!(
                    engine.activate(id, Stage::Validate, &store),
                    Err(CalError::Prerequisite { .. })
                ),
                "{:?} validated without its bias calibrated",
                id
            );
        }
    }

    #[test]
    fn test_validation_leaves_stored_bias_untouched() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        let mut store = synthetic_store();
        store.linear_bias = 1.05;
        store.set_status(STATUS_LINEAR);
        engine
            .activate(RoutineId::BiasLinear, Stage::Validate, &store)
            .unwrap();
        run_to_completion(&mut engine, &mut board, &mut store, 1000).unwrap();

        assert!(!engine.is_active());
        assert_eq!(store.linear_bias(), 1.05);
    }

    #[test]
    fn test_stationary_robot_fails_the_run() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        // Motor bit set but default curves command PWM_STOP everywhere
        let mut store = CalStore::default();
        store.set_status(STATUS_MOTOR);
        engine
            .activate(RoutineId::BiasLinear, Stage::Calibrate, &store)
            .unwrap();

        let result = run_to_completion(&mut engine, &mut board, &mut store, 1000);
        assert!(matches!(result, Err(CalError::NoMotion)));
        assert!(!store.has_status(STATUS_LINEAR));
    }
}

// Motor curve calibration and validation.
//
// Calibration sweeps each (wheel, direction) PWM range across the fixed
// breakpoint count, one wheel at a time, letting the motor settle before
// averaging its measured counts/sec. Sweeps repeat for several runs and the
// runs are averaged. The finished tables are sorted by counts/sec and saved.
//
// Validation replays a triangular counts/sec profile through the calibrated
// tables and logs commanded versus measured speed at each dwell point.

use tracing::{debug, info};

use crate::config::{
    CPS_SCALE, CURVE_POINTS, LEFT_BWD_PWM_RANGE, LEFT_FWD_PWM_RANGE, MOTOR_CAL_AVG_TICKS,
    MOTOR_CAL_RUNS, MOTOR_CAL_SETTLE_TICKS, MOTOR_VAL_DWELL_MS, MOTOR_VAL_LOWER_PCT,
    MOTOR_VAL_UPPER_PCT, PWM_STOP, Pwm, RIGHT_BWD_PWM_RANGE, RIGHT_FWD_PWM_RANGE,
};
use crate::hal::{Board, Direction, Wheel, elapsed_ms};

use super::curve::{CurveSet, CurveTable, operating_range, triangular_profile};
use super::store::STATUS_MOTOR;
use super::{CalContext, CalError, Routine, StepResult};

const SWEEP_COMBOS: [(Wheel, Direction, (Pwm, Pwm)); 4] = [
    (Wheel::Left, Direction::Forward, LEFT_FWD_PWM_RANGE),
    (Wheel::Left, Direction::Backward, LEFT_BWD_PWM_RANGE),
    (Wheel::Right, Direction::Forward, RIGHT_FWD_PWM_RANGE),
    (Wheel::Right, Direction::Backward, RIGHT_BWD_PWM_RANGE),
];

pub enum MotorRoutine {
    Cal(MotorCalibration),
    Val(MotorValidation),
}

impl MotorRoutine {
    pub fn calibrate() -> Self {
        MotorRoutine::Cal(MotorCalibration::default())
    }

    pub fn validate(points: usize) -> Result<Self, CalError> {
        if points % 2 == 0 {
            return Err(CalError::EvenProfilePoints(points));
        }
        Ok(MotorRoutine::Val(MotorValidation::new(points)))
    }
}

impl<B: Board> Routine<B> for MotorRoutine {
    fn init(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        match self {
            MotorRoutine::Cal(r) => r.init(ctx),
            MotorRoutine::Val(r) => r.init(ctx),
        }
    }

    fn start(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        match self {
            MotorRoutine::Cal(r) => r.start(ctx),
            MotorRoutine::Val(r) => r.start(ctx),
        }
    }

    fn update(&mut self, ctx: &mut CalContext<'_, B>) -> Result<StepResult, CalError> {
        match self {
            MotorRoutine::Cal(r) => r.update(ctx),
            MotorRoutine::Val(r) => r.update(ctx),
        }
    }

    fn stop(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        ctx.board.set_pwm(PWM_STOP, PWM_STOP)?;
        Ok(())
    }

    fn results(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        match self {
            MotorRoutine::Cal(r) => r.results(ctx),
            MotorRoutine::Val(r) => r.results(ctx),
        }
    }
}

pub struct MotorCalibration {
    combo: usize,
    run: u32,
    sample: usize,
    tick: u32,
    acc: f32,
    sum_cps: [f32; CURVE_POINTS],
    curves: CurveSet,
}

impl Default for MotorCalibration {
    fn default() -> Self {
        Self {
            combo: 0,
            run: 0,
            sample: 0,
            tick: 0,
            acc: 0.0,
            sum_cps: [0.0; CURVE_POINTS],
            curves: CurveSet::default(),
        }
    }
}

impl MotorCalibration {
    fn init<B: Board>(&mut self, _ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        *self = Self::default();
        info!(
            "Motor calibration: {} sweeps x {} runs x {} points",
            SWEEP_COMBOS.len(),
            MOTOR_CAL_RUNS,
            CURVE_POINTS
        );
        Ok(())
    }

    fn start<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        ctx.board.set_pwm(PWM_STOP, PWM_STOP)?;
        Ok(())
    }

    fn update<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<StepResult, CalError> {
        let (wheel, dir, range) = SWEEP_COMBOS[self.combo];
        let pwm = sweep_pwm(range, self.sample);
        match wheel {
            Wheel::Left => ctx.board.set_pwm(pwm, PWM_STOP)?,
            Wheel::Right => ctx.board.set_pwm(PWM_STOP, pwm)?,
        }

        self.tick += 1;
        if self.tick <= MOTOR_CAL_SETTLE_TICKS {
            return Ok(StepResult::Running);
        }

        self.acc += ctx.board.wheel_cps(wheel)?;
        if self.tick < MOTOR_CAL_SETTLE_TICKS + MOTOR_CAL_AVG_TICKS {
            return Ok(StepResult::Running);
        }

        // Sample finished
        self.sum_cps[self.sample] += self.acc / MOTOR_CAL_AVG_TICKS as f32;
        self.tick = 0;
        self.acc = 0.0;
        self.sample += 1;
        if self.sample < CURVE_POINTS {
            return Ok(StepResult::Running);
        }

        // Run finished
        self.sample = 0;
        self.run += 1;
        debug!(
            "Sweep {:?} {:?}: run {}/{} complete",
            wheel, dir, self.run, MOTOR_CAL_RUNS
        );
        if self.run < MOTOR_CAL_RUNS {
            return Ok(StepResult::Running);
        }

        // Sweep finished: average the runs and build the sorted table
        *self.curves.table_mut(wheel, dir) = build_table(&self.sum_cps, range);
        ctx.board.set_pwm(PWM_STOP, PWM_STOP)?;
        self.run = 0;
        self.sum_cps = [0.0; CURVE_POINTS];
        self.combo += 1;
        if self.combo < SWEEP_COMBOS.len() {
            return Ok(StepResult::Running);
        }
        Ok(StepResult::Complete)
    }

    fn results<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        ctx.store.curves = self.curves.clone();
        ctx.store.set_status(STATUS_MOTOR);
        ctx.store.save(ctx.board)?;
        info!(
            "Motor calibration complete: forward domain {:.1} cps, backward domain {:.1} cps",
            ctx.store.curves.forward_domain(),
            ctx.store.curves.backward_domain()
        );
        Ok(())
    }
}

/// PWM duty for one sweep sample, spread evenly across the range.
fn sweep_pwm(range: (Pwm, Pwm), sample: usize) -> Pwm {
    let span = (range.1 - range.0) as usize;
    range.0 + (span * sample / (CURVE_POINTS - 1)) as Pwm
}

/// Average the accumulated runs, pair each measurement with its sweep PWM,
/// and sort the pairs by counts/sec so the table meets the lookup ordering.
fn build_table(sum_cps: &[f32; CURVE_POINTS], range: (Pwm, Pwm)) -> CurveTable {
    let mut pairs: Vec<(i32, Pwm)> = (0..CURVE_POINTS)
        .map(|ii| {
            let avg = sum_cps[ii] / MOTOR_CAL_RUNS as f32;
            ((avg * CPS_SCALE as f32).round() as i32, sweep_pwm(range, ii))
        })
        .collect();
    pairs.sort_by_key(|&(cps, _)| cps);

    let mut cps = [0i32; CURVE_POINTS];
    let mut pwm = [PWM_STOP; CURVE_POINTS];
    for (ii, &(c, p)) in pairs.iter().enumerate() {
        cps[ii] = c;
        pwm[ii] = p;
    }
    CurveTable::from_samples(cps, pwm)
}

pub struct MotorValidation {
    points: usize,
    profile: Vec<f32>,
    index: usize,
    dwell_start: Option<u32>,
}

impl MotorValidation {
    fn new(points: usize) -> Self {
        Self {
            points,
            profile: Vec::new(),
            index: 0,
            dwell_start: None,
        }
    }

    fn init<B: Board>(&mut self, _ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        self.profile.clear();
        self.index = 0;
        self.dwell_start = None;
        Ok(())
    }

    fn start<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        // Forward then backward triangular profile over the calibrated
        // operating range
        let (start, stop) = operating_range(
            MOTOR_VAL_LOWER_PCT,
            MOTOR_VAL_UPPER_PCT,
            ctx.store.curves.forward_domain(),
        );
        self.profile = triangular_profile(self.points, start, stop);

        let (start, stop) = operating_range(
            MOTOR_VAL_LOWER_PCT,
            MOTOR_VAL_UPPER_PCT,
            ctx.store.curves.backward_domain(),
        );
        self.profile
            .extend(triangular_profile(self.points, start, stop));

        info!(
            "Motor validation: {} profile points, {} ms dwell",
            self.profile.len(),
            MOTOR_VAL_DWELL_MS
        );
        Ok(())
    }

    fn update<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<StepResult, CalError> {
        let now = ctx.board.millis();
        let started = *self.dwell_start.get_or_insert(now);

        let cps = self.profile[self.index];
        ctx.drive_cps(cps, cps)?;

        if elapsed_ms(now, started) < MOTOR_VAL_DWELL_MS {
            return Ok(StepResult::Running);
        }

        let left = ctx.board.wheel_cps(Wheel::Left)?;
        let right = ctx.board.wheel_cps(Wheel::Right)?;
        info!(
            "Validation point {}: commanded {:.1} cps, measured left {:.1} right {:.1}",
            self.index, cps, left, right
        );

        self.index += 1;
        self.dwell_start = Some(now);
        if self.index < self.profile.len() {
            Ok(StepResult::Running)
        } else {
            Ok(StepResult::Complete)
        }
    }

    fn results<B: Board>(&mut self, _ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        info!("Motor validation complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cal::store::CalStore;
    use crate::cal::{CalEngine, RoutineId, Stage};
    use crate::messages::WheelTargets;
    use crate::sim::SimBoard;

    fn run_to_completion(
        engine: &mut CalEngine,
        board: &mut SimBoard,
        store: &mut CalStore,
        max_ticks: usize,
    ) {
        let mut target = WheelTargets::default();
        for _ in 0..max_ticks {
            let mut ctx = CalContext {
                board: &mut *board,
                store: &mut *store,
                target: &mut target,
            };
            engine.tick(&mut ctx).unwrap();
            if !engine.is_active() {
                return;
            }
            board.advance(20);
        }
        panic!("routine did not complete within {} ticks", max_ticks);
    }

    #[test]
    fn test_even_profile_rejected() {
        assert!(matches!(
            MotorRoutine::validate(10),
            Err(CalError::EvenProfilePoints(10))
        ));
        assert!(MotorRoutine::validate(11).is_ok());
    }

    #[test]
    fn test_sweep_pwm_spans_range() {
        assert_eq!(sweep_pwm((1500, 2000), 0), 1500);
        assert_eq!(sweep_pwm((1500, 2000), CURVE_POINTS - 1), 2000);
        assert_eq!(sweep_pwm((1000, 1500), 25), 1250);
    }

    #[test]
    fn test_build_table_sorts_by_cps() {
        let mut sums = [0.0f32; CURVE_POINTS];
        for ii in 0..CURVE_POINTS {
            // Descending measurements, as a mirrored wheel produces
            sums[ii] = (CURVE_POINTS - ii) as f32 * MOTOR_CAL_RUNS as f32;
        }
        let table = build_table(&sums, (1000, 1500));
        for w in table.cps.windows(2) {
            assert!(w[0] <= w[1]);
        }
        // Lowest cps came from the highest pwm in this sweep
        assert_eq!(table.pwm[0], 1500);
    }

    #[test]
    fn test_calibration_produces_sorted_tables_and_status() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        let mut store = CalStore::default();
        engine
            .activate(RoutineId::Motor, Stage::Calibrate, &store)
            .unwrap();
        run_to_completion(&mut engine, &mut board, &mut store, 12_000);

        assert!(store.motor_calibrated());
        for (wheel, dir, _) in SWEEP_COMBOS {
            let table = store.curves.table(wheel, dir);
            for w in table.cps.windows(2) {
                assert!(w[0] <= w[1], "{:?} {:?} table unsorted", wheel, dir);
            }
        }
        assert!(store.curves.forward_domain() > 10.0);
        assert!(store.curves.backward_domain() < -10.0);

        // The saved image survives a reload
        let restored = CalStore::load(&mut board).unwrap();
        assert_eq!(restored.curves, store.curves);
    }

    #[test]
    fn test_validation_runs_profile_to_completion() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        let mut store = CalStore::default();
        engine
            .activate(RoutineId::Motor, Stage::Calibrate, &store)
            .unwrap();
        run_to_completion(&mut engine, &mut board, &mut store, 12_000);

        engine
            .activate(RoutineId::Motor, Stage::Validate, &store)
            .unwrap();
        run_to_completion(&mut engine, &mut board, &mut store, 12_000);
        assert!(!engine.is_active());
    }
}

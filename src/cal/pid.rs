// PID calibration and validation, one wheel at a time.
//
// Calibration applies a counts/sec step through the curve tables and records
// the timestamped velocity response. The response is fitted as a first-order
// process with dead time and turned into gains with the open-loop
// Ziegler-Nichols rules. Validation replays a triangular profile on the
// calibrated wheel and logs tracking error at each dwell point.

use tracing::{debug, info};

use crate::config::{
    MOTOR_VAL_LOWER_PCT, MOTOR_VAL_UPPER_PCT, PID_CAL_RUN_MS, PID_SAMPLE_CAPACITY, PID_STEP_PCT,
    PID_VAL_DWELL_MS, PWM_STOP,
};
use crate::hal::{Board, Wheel, elapsed_ms};

use super::curve::{operating_range, triangular_profile};
use super::store::{PidGains, STATUS_PID};
use super::{CalContext, CalError, Routine, StepResult};

// Fit thresholds: dead time ends at 5% of steady state, the time constant
// is read at 63.2%
const DEAD_TIME_FRACTION: f32 = 0.05;
const TAU_FRACTION: f32 = 0.632;
const MIN_FIT_SECONDS: f32 = 0.02;
const MIN_RESPONSE_CPS: f32 = 1.0;

pub enum PidRoutine {
    Cal(PidCalibration),
    Val(PidValidation),
}

impl PidRoutine {
    pub fn calibrate(wheel: Wheel) -> Self {
        PidRoutine::Cal(PidCalibration::new(wheel))
    }

    pub fn validate(wheel: Wheel, points: usize) -> Result<Self, CalError> {
        if points % 2 == 0 {
            return Err(CalError::EvenProfilePoints(points));
        }
        Ok(PidRoutine::Val(PidValidation::new(wheel, points)))
    }
}

impl<B: Board> Routine<B> for PidRoutine {
    fn init(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        match self {
            PidRoutine::Cal(r) => r.init(ctx),
            PidRoutine::Val(r) => r.init(ctx),
        }
    }

    fn start(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        match self {
            PidRoutine::Cal(r) => r.start(ctx),
            PidRoutine::Val(r) => r.start(ctx),
        }
    }

    fn update(&mut self, ctx: &mut CalContext<'_, B>) -> Result<StepResult, CalError> {
        match self {
            PidRoutine::Cal(r) => r.update(ctx),
            PidRoutine::Val(r) => r.update(ctx),
        }
    }

    fn stop(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        ctx.board.set_pwm(PWM_STOP, PWM_STOP)?;
        Ok(())
    }

    fn results(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        match self {
            PidRoutine::Cal(r) => r.results(ctx),
            PidRoutine::Val(r) => r.results(ctx),
        }
    }
}

pub struct PidCalibration {
    wheel: Wheel,
    step_cps: f32,
    started: Option<u32>,
    samples: Vec<(u32, f32)>,
}

impl PidCalibration {
    fn new(wheel: Wheel) -> Self {
        Self {
            wheel,
            step_cps: 0.0,
            started: None,
            samples: Vec::with_capacity(PID_SAMPLE_CAPACITY),
        }
    }

    fn init<B: Board>(&mut self, _ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        self.started = None;
        self.samples.clear();
        Ok(())
    }

    fn start<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        self.step_cps = PID_STEP_PCT * ctx.store.curves.forward_domain();
        info!(
            "PID calibration {:?}: step input {:.1} cps for {} ms",
            self.wheel, self.step_cps, PID_CAL_RUN_MS
        );
        Ok(())
    }

    fn update<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<StepResult, CalError> {
        let now = ctx.board.millis();
        let started = *self.started.get_or_insert(now);

        match self.wheel {
            Wheel::Left => ctx.drive_cps(self.step_cps, 0.0)?,
            Wheel::Right => ctx.drive_cps(0.0, self.step_cps)?,
        }

        let elapsed = elapsed_ms(now, started);
        if self.samples.len() < PID_SAMPLE_CAPACITY {
            let cps = ctx.board.wheel_cps(self.wheel)?;
            self.samples.push((elapsed, cps));
        }

        if elapsed >= PID_CAL_RUN_MS {
            Ok(StepResult::Complete)
        } else {
            Ok(StepResult::Running)
        }
    }

    fn results<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        let gains = fit_gains(&self.samples, self.step_cps)?;
        info!(
            "PID calibration {:?}: kp {:.3} ki {:.3} kd {:.3}",
            self.wheel, gains.kp, gains.ki, gains.kd
        );
        ctx.store.set_gains(self.wheel, gains);
        ctx.store.set_status(STATUS_PID);
        ctx.store.save(ctx.board)?;
        Ok(())
    }
}

/// Open-loop Ziegler-Nichols fit of a step response.
fn fit_gains(samples: &[(u32, f32)], step_cps: f32) -> Result<PidGains, CalError> {
    if samples.is_empty() {
        return Err(CalError::FlatResponse);
    }
    // Steady state from the last quarter of the run
    let tail = &samples[samples.len() - samples.len() / 4 - 1..];
    let steady: f32 = tail.iter().map(|&(_, cps)| cps).sum::<f32>() / tail.len() as f32;
    if steady.abs() < MIN_RESPONSE_CPS || step_cps.abs() < MIN_RESPONSE_CPS {
        return Err(CalError::FlatResponse);
    }

    let time_to = |fraction: f32| -> f32 {
        samples
            .iter()
            .find(|&&(_, cps)| cps.abs() >= fraction * steady.abs())
            .map(|&(ms, _)| ms as f32 / 1000.0)
            .unwrap_or(MIN_FIT_SECONDS)
            .max(MIN_FIT_SECONDS)
    };

    let dead = time_to(DEAD_TIME_FRACTION);
    let tau = (time_to(TAU_FRACTION) - dead).max(MIN_FIT_SECONDS);
    let gain = steady / step_cps;
    debug!(
        "Step fit: steady {:.1} cps, dead {:.3} s, tau {:.3} s, gain {:.3}",
        steady, dead, tau, gain
    );

    let kp = 1.2 * tau / (gain * dead);
    Ok(PidGains {
        kp,
        ki: kp / (2.0 * dead),
        kd: kp * dead / 2.0,
    })
}

pub struct PidValidation {
    wheel: Wheel,
    points: usize,
    profile: Vec<f32>,
    index: usize,
    dwell_start: Option<u32>,
}

impl PidValidation {
    fn new(wheel: Wheel, points: usize) -> Self {
        Self {
            wheel,
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
            "PID validation {:?}: {} profile points",
            self.wheel,
            self.profile.len()
        );
        Ok(())
    }

    fn update<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<StepResult, CalError> {
        let now = ctx.board.millis();
        let started = *self.dwell_start.get_or_insert(now);

        let cps = self.profile[self.index];
        match self.wheel {
            Wheel::Left => ctx.drive_cps(cps, 0.0)?,
            Wheel::Right => ctx.drive_cps(0.0, cps)?,
        }

        if elapsed_ms(now, started) < PID_VAL_DWELL_MS {
            return Ok(StepResult::Running);
        }

        let measured = ctx.board.wheel_cps(self.wheel)?;
        info!(
            "PID validation {:?} point {}: commanded {:.1} cps, measured {:.1} cps",
            self.wheel, self.index, cps, measured
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
        info!("PID validation {:?} complete", self.wheel);
        Ok(())
    }
}

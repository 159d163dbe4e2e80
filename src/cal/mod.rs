// Calibration and validation engine.
//
// A routine is a state machine advanced one step per control tick:
// Init -> Start -> Running -> Stop -> Results -> Done. Every step is
// non-blocking; long operations spread across Running ticks. At most one
// routine is active at a time, and while one is active it owns the wheel
// targets fed to the control layer.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{MOTOR_VAL_POINTS, PID_VAL_POINTS, PWM_STOP};
use crate::hal::{Board, BoardError, Wheel};
use crate::messages::{EngineReport, WheelTargets};
use crate::motion::MotionError;

pub mod bias;
pub mod curve;
pub mod motion;
pub mod motor;
pub mod pid;
pub mod store;

use bias::{BiasAxis, BiasRoutine};
use motion::MotionValidation;
use motor::MotorRoutine;
use pid::PidRoutine;
use store::{CalStore, STATUS_ANGULAR, STATUS_LINEAR, STATUS_MOTOR, STATUS_PID, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CalError {
    #[error("a calibration routine is already active")]
    AlreadyActive,

    #[error("{routine:?} has no {stage:?} stage")]
    UnsupportedStage { routine: RoutineId, stage: Stage },

    #[error("{routine:?} {stage:?} requires {needs} calibration first")]
    Prerequisite {
        routine: RoutineId,
        stage: Stage,
        needs: &'static str,
    },

    #[error("validation profile needs an odd point count, got {0}")]
    EvenProfilePoints(usize),

    #[error("step response did not move the wheel")]
    FlatResponse,

    #[error("the robot did not move during the bias run")]
    NoMotion,

    #[error(transparent)]
    Board(#[from] BoardError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Motion(#[from] MotionError),
}

/// Engine states, entered in order. `Running` repeats until the routine
/// reports completion; the rest are single-shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalState {
    Init,
    Start,
    Running,
    Stop,
    Results,
    Done,
}

impl CalState {
    fn next(self) -> Self {
        match self {
            CalState::Init => CalState::Start,
            CalState::Start => CalState::Running,
            CalState::Running => CalState::Stop,
            CalState::Stop => CalState::Results,
            CalState::Results | CalState::Done => CalState::Done,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Calibrate,
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineId {
    Motor,
    PidLeft,
    PidRight,
    BiasLinear,
    BiasAngular,
    Motion,
}

/// Outcome of one `Running` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Running,
    Complete,
}

/// Everything a routine step may touch. Borrowed fresh each tick from the
/// runtime's owned state.
pub struct CalContext<'a, B: Board> {
    pub board: &'a mut B,
    pub store: &'a mut CalStore,
    pub target: &'a mut WheelTargets,
}

impl<B: Board> CalContext<'_, B> {
    /// Record per-wheel counts/sec targets and push them through the curve
    /// tables to the motors.
    pub fn drive_cps(&mut self, left_cps: f32, right_cps: f32) -> Result<(), BoardError> {
        self.target.left_cps = left_cps;
        self.target.right_cps = right_cps;
        let left = self.store.cps_to_pwm(Wheel::Left, left_cps);
        let right = self.store.cps_to_pwm(Wheel::Right, right_cps);
        self.board.set_pwm(left, right)
    }
}

/// The five-phase contract every routine implements. `update` runs once per
/// tick while the engine is in `Running`; the other phases are single-shot
/// and advance the engine state when they return Ok.
pub trait Routine<B: Board> {
    fn init(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError>;
    fn start(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError>;
    fn update(&mut self, ctx: &mut CalContext<'_, B>) -> Result<StepResult, CalError>;
    fn stop(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError>;
    fn results(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError>;
}

/// Closed set of routines the engine can run.
enum ActiveRoutine {
    Motor(MotorRoutine),
    Pid(PidRoutine),
    Bias(BiasRoutine),
    Motion(MotionValidation),
}

macro_rules! dispatch {
    ($self:expr, $ctx:expr, $phase:ident) => {
        match $self {
            ActiveRoutine::Motor(r) => r.$phase($ctx),
            ActiveRoutine::Pid(r) => r.$phase($ctx),
            ActiveRoutine::Bias(r) => r.$phase($ctx),
            ActiveRoutine::Motion(r) => r.$phase($ctx),
        }
    };
}

impl ActiveRoutine {
    fn init<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        dispatch!(self, ctx, init)
    }
    fn start<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        dispatch!(self, ctx, start)
    }
    fn update<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<StepResult, CalError> {
        dispatch!(self, ctx, update)
    }
    fn stop<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        dispatch!(self, ctx, stop)
    }
    fn results<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        dispatch!(self, ctx, results)
    }
}

struct ActiveSession {
    id: RoutineId,
    stage: Stage,
    state: CalState,
    routine: ActiveRoutine,
}

#[derive(Default)]
pub struct CalEngine {
    session: Option<ActiveSession>,
}

impl CalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn report(&self) -> Option<EngineReport> {
        self.session.as_ref().map(|s| EngineReport {
            routine: s.id,
            stage: s.stage,
            state: s.state,
        })
    }

    /// Select and arm a routine. Fails if one is already active, if the
    /// routine/stage pair does not exist, or if a prerequisite calibration
    /// is missing.
    pub fn activate(
        &mut self,
        id: RoutineId,
        stage: Stage,
        store: &CalStore,
    ) -> Result<(), CalError> {
        if self.session.is_some() {
            return Err(CalError::AlreadyActive);
        }

        let prerequisite = |bit: u16, needs: &'static str| {
            if store.has_status(bit) {
                Ok(())
            } else {
                Err(CalError::Prerequisite {
                    routine: id,
                    stage,
                    needs,
                })
            }
        };

        let routine = match (id, stage) {
            (RoutineId::Motor, Stage::Calibrate) => ActiveRoutine::Motor(MotorRoutine::calibrate()),
            (RoutineId::Motor, Stage::Validate) => {
                prerequisite(STATUS_MOTOR, "motor")?;
                ActiveRoutine::Motor(MotorRoutine::validate(MOTOR_VAL_POINTS)?)
            }
            (RoutineId::PidLeft, Stage::Calibrate) => {
                prerequisite(STATUS_MOTOR, "motor")?;
                ActiveRoutine::Pid(PidRoutine::calibrate(Wheel::Left))
            }
            (RoutineId::PidRight, Stage::Calibrate) => {
                prerequisite(STATUS_MOTOR, "motor")?;
                ActiveRoutine::Pid(PidRoutine::calibrate(Wheel::Right))
            }
            (RoutineId::PidLeft, Stage::Validate) => {
                prerequisite(STATUS_MOTOR, "motor")?;
                prerequisite(STATUS_PID, "pid")?;
                ActiveRoutine::Pid(PidRoutine::validate(Wheel::Left, PID_VAL_POINTS)?)
            }
            (RoutineId::PidRight, Stage::Validate) => {
                prerequisite(STATUS_MOTOR, "motor")?;
                prerequisite(STATUS_PID, "pid")?;
                ActiveRoutine::Pid(PidRoutine::validate(Wheel::Right, PID_VAL_POINTS)?)
            }
            (RoutineId::BiasLinear, Stage::Calibrate) => {
                prerequisite(STATUS_MOTOR, "motor")?;
                ActiveRoutine::Bias(BiasRoutine::calibrate(BiasAxis::Linear))
            }
            (RoutineId::BiasLinear, Stage::Validate) => {
                prerequisite(STATUS_MOTOR, "motor")?;
                prerequisite(STATUS_LINEAR, "linear bias")?;
                ActiveRoutine::Bias(BiasRoutine::validate(BiasAxis::Linear))
            }
            (RoutineId::BiasAngular, Stage::Calibrate) => {
                prerequisite(STATUS_MOTOR, "motor")?;
                ActiveRoutine::Bias(BiasRoutine::calibrate(BiasAxis::Angular))
            }
            (RoutineId::BiasAngular, Stage::Validate) => {
                prerequisite(STATUS_MOTOR, "motor")?;
                prerequisite(STATUS_ANGULAR, "angular bias")?;
                ActiveRoutine::Bias(BiasRoutine::validate(BiasAxis::Angular))
            }
            (RoutineId::Motion, Stage::Validate) => {
                prerequisite(STATUS_MOTOR, "motor")?;
                ActiveRoutine::Motion(MotionValidation::new())
            }
            (RoutineId::Motion, Stage::Calibrate) => {
                return Err(CalError::UnsupportedStage { routine: id, stage });
            }
        };

        info!("Activating {:?} {:?}", id, stage);
        self.session = Some(ActiveSession {
            id,
            stage,
            state: CalState::Init,
            routine,
        });
        Ok(())
    }

    /// Advance the active routine by at most one state transition.
    pub fn tick<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) -> Result<(), CalError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        if session.state == CalState::Done {
            info!("{:?} {:?} finished", session.id, session.stage);
            *ctx.target = WheelTargets::default();
            self.session = None;
            return Ok(());
        }

        let step = match session.state {
            CalState::Init => session.routine.init(ctx).map(|()| StepResult::Complete),
            CalState::Start => session.routine.start(ctx).map(|()| StepResult::Complete),
            CalState::Running => session.routine.update(ctx),
            CalState::Stop => session.routine.stop(ctx).map(|()| StepResult::Complete),
            CalState::Results => session.routine.results(ctx).map(|()| StepResult::Complete),
            CalState::Done => Ok(StepResult::Running),
        };

        match step {
            Ok(StepResult::Running) => Ok(()),
            Ok(StepResult::Complete) => {
                session.state = session.state.next();
                Ok(())
            }
            Err(e) => {
                error!(
                    "{:?} {:?} failed in {:?}: {}",
                    session.id, session.stage, session.state, e
                );
                self.session = None;
                self.fail_safe(ctx);
                Err(e)
            }
        }
    }

    /// Drop the active routine without running its stop/results phases and
    /// force the motors to stop.
    pub fn abort<B: Board>(&mut self, ctx: &mut CalContext<'_, B>) {
        if let Some(session) = self.session.take() {
            warn!(
                "Aborting {:?} {:?} in {:?}",
                session.id, session.stage, session.state
            );
            self.fail_safe(ctx);
        }
    }

    fn fail_safe<B: Board>(&self, ctx: &mut CalContext<'_, B>) {
        *ctx.target = WheelTargets::default();
        if let Err(e) = ctx.board.set_pwm(PWM_STOP, PWM_STOP) {
            warn!("Failed to stop motors: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBoard;

    fn ctx<'a>(
        board: &'a mut SimBoard,
        store: &'a mut CalStore,
        target: &'a mut WheelTargets,
    ) -> CalContext<'a, SimBoard> {
        CalContext {
            board,
            store,
            target,
        }
    }

    #[test]
    fn test_single_active_routine() {
        let mut engine = CalEngine::new();
        let store = CalStore::default();
        engine
            .activate(RoutineId::Motor, Stage::Calibrate, &store)
            .unwrap();
        assert!(matches!(
            engine.activate(RoutineId::Motor, Stage::Calibrate, &store),
            Err(CalError::AlreadyActive)
        ));
    }

    #[test]
    fn test_validate_requires_motor_calibration() {
        let mut engine = CalEngine::new();
        let store = CalStore::default();
        for (id, stage) in [
            (RoutineId::Motor, Stage::Validate),
            (RoutineId::PidLeft, Stage::Calibrate),
            (RoutineId::PidRight, Stage::Calibrate),
            (RoutineId::BiasLinear, Stage::Calibrate),
            (RoutineId::BiasAngular, Stage::Calibrate),
            (RoutineId::Motion, Stage::Validate),
        ] {
            assert!(
                matches!(
                    engine.activate(id, stage, &store),
                    Err(CalError::Prerequisite { .. })
                ),
                "{:?} {:?} activated without motor calibration",
                id,
                stage
            );
        }
        assert!(!engine.is_active());
    }

    #[test]
    fn test_pid_validate_requires_pid_calibration() {
        let mut engine = CalEngine::new();
        let mut store = CalStore::default();
        store.set_status(STATUS_MOTOR);
        assert!(matches!(
            engine.activate(RoutineId::PidLeft, Stage::Validate, &store),
            Err(CalError::Prerequisite { needs: "pid", .. })
        ));
    }

    #[test]
    fn test_motion_has_no_calibrate_stage() {
        let mut engine = CalEngine::new();
        let mut store = CalStore::default();
        store.set_status(STATUS_MOTOR);
        assert!(matches!(
            engine.activate(RoutineId::Motion, Stage::Calibrate, &store),
            Err(CalError::UnsupportedStage { .. })
        ));
    }

    #[test]
    fn test_one_transition_per_tick() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        let mut store = CalStore::default();
        let mut target = WheelTargets::default();
        engine
            .activate(RoutineId::Motor, Stage::Calibrate, &store)
            .unwrap();
        assert_eq!(engine.report().unwrap().state, CalState::Init);

        engine
            .tick(&mut ctx(&mut board, &mut store, &mut target))
            .unwrap();
        assert_eq!(engine.report().unwrap().state, CalState::Start);

        engine
            .tick(&mut ctx(&mut board, &mut store, &mut target))
            .unwrap();
        assert_eq!(engine.report().unwrap().state, CalState::Running);
    }

    #[test]
    fn test_abort_clears_session_and_stops() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        let mut store = CalStore::default();
        let mut target = WheelTargets {
            left_cps: 100.0,
            right_cps: 100.0,
        };
        engine
            .activate(RoutineId::Motor, Stage::Calibrate, &store)
            .unwrap();
        engine
            .tick(&mut ctx(&mut board, &mut store, &mut target))
            .unwrap();

        engine.abort(&mut ctx(&mut board, &mut store, &mut target));
        assert!(!engine.is_active());
        assert_eq!(target, WheelTargets::default());
    }

    #[test]
    fn test_abort_when_idle_is_a_no_op() {
        let mut engine = CalEngine::new();
        let mut board = SimBoard::new();
        let mut store = CalStore::default();
        let mut target = WheelTargets::default();
        engine.abort(&mut ctx(&mut board, &mut store, &mut target));
        assert!(!engine.is_active());
    }
}

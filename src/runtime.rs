// 50 Hz control loop with console command surface
//
// Each tick: drain pending key events, advance the motion sequencer, advance
// the calibration engine by one state transition, then let the controller
// arbitrate and actuate. Manual commands are watchdog-guarded; see control.rs.
//
// Console keys: W/S drive, A/D rotate, Space stop, 1-6 select routine,
// C calibrate, V validate, M square sequence, X abort, P status, Q quit.

use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::time::interval;
use tracing::{info, warn};

use crate::cal::store::CalStore;
use crate::cal::{CalContext, CalEngine, RoutineId, Stage};
use crate::config::{CMD_TIMEOUT, LOOP_HZ, MOVE_DONE_TIMEOUT_MS, PWM_STOP};
use crate::control::Controller;
use crate::hal::{Board, Wheel};
use crate::messages::{StatusReport, VelocityCommand, WheelTargets};
use crate::motion::{MotionSequencer, Move};

const MANUAL_LINEAR_MPS: f32 = 0.2;
const MANUAL_ANGULAR_RADPS: f32 = 0.7;

pub struct Runtime<B: Board> {
    board: B,
    store: CalStore,
    engine: CalEngine,
    seq: MotionSequencer,
    ctl: Controller,
    target: WheelTargets,
    selected: RoutineId,
}

impl<B: Board> Runtime<B> {
    pub fn new(mut board: B) -> Self {
        let store = match CalStore::load(&mut board) {
            Ok(store) => {
                info!("Calibration store loaded, status {:#06x}", store.status());
                store
            }
            Err(e) => {
                warn!("Calibration store unavailable ({}), using defaults", e);
                CalStore::default()
            }
        };

        Self {
            board,
            store,
            engine: CalEngine::new(),
            seq: MotionSequencer::new(),
            ctl: Controller::new(),
            target: WheelTargets::default(),
            selected: RoutineId::Motor,
        }
    }

    fn manual(&mut self, linear: f32, angular: f32) {
        let now = self.board.millis();
        self.ctl
            .set_command(VelocityCommand { linear, angular }, now);
    }

    fn activate(&mut self, stage: Stage) {
        if let Err(e) = self.engine.activate(self.selected, stage, &self.store) {
            warn!("Cannot activate {:?} {:?}: {}", self.selected, stage, e);
        }
    }

    fn abort(&mut self) {
        let mut ctx = CalContext {
            board: &mut self.board,
            store: &mut self.store,
            target: &mut self.target,
        };
        self.engine.abort(&mut ctx);
        self.seq.clear();
        if let Err(e) = self.board.set_pwm(PWM_STOP, PWM_STOP) {
            warn!("Failed to stop motors: {}", e);
        }
    }

    /// Queue a demonstration square and start it.
    fn start_square(&mut self) {
        if self.engine.is_active() || self.seq.is_moving() {
            warn!("Busy, not starting a sequence");
            return;
        }
        let moves = [
            Move::Linear {
                distance_m: 0.5,
                speed_mps: MANUAL_LINEAR_MPS,
                timeout_ms: MOVE_DONE_TIMEOUT_MS,
            },
            Move::Pause { duration_ms: 500 },
            Move::Rotate {
                angle_rad: std::f32::consts::FRAC_PI_2,
                speed_radps: MANUAL_ANGULAR_RADPS,
                timeout_ms: MOVE_DONE_TIMEOUT_MS,
            },
        ];
        let queued = (0..4).try_for_each(|_| moves.iter().try_for_each(|&mv| self.seq.add(mv)));
        match queued.and_then(|()| self.seq.start()) {
            Ok(()) => {}
            Err(e) => {
                warn!("Cannot start sequence: {}", e);
                self.seq.clear();
            }
        }
    }

    fn print_status(&mut self) {
        match self.status_report() {
            Ok(report) => match serde_json::to_string(&report) {
                Ok(json) => info!("Status: {}", json),
                Err(e) => warn!("Failed to encode status: {}", e),
            },
            Err(e) => warn!("Failed to read status: {}", e),
        }
    }

    fn status_report(&mut self) -> Result<StatusReport, crate::hal::BoardError> {
        let (x, y) = self.board.xy_position()?;
        Ok(StatusReport {
            cal_status: self.store.status(),
            engine: self.engine.report(),
            moving: self.seq.is_moving(),
            left_cps: self.board.wheel_cps(Wheel::Left)?,
            right_cps: self.board.wheel_cps(Wheel::Right)?,
            x,
            y,
            heading: self.board.heading()?,
        })
    }

    /// Returns false when the runtime should exit.
    fn handle_key(&mut self, code: KeyCode) -> bool {
        match code {
            KeyCode::Char('w') => self.manual(MANUAL_LINEAR_MPS, 0.0),
            KeyCode::Char('s') => self.manual(-MANUAL_LINEAR_MPS, 0.0),
            KeyCode::Char('a') => self.manual(0.0, MANUAL_ANGULAR_RADPS),
            KeyCode::Char('d') => self.manual(0.0, -MANUAL_ANGULAR_RADPS),
            KeyCode::Char(' ') => self.manual(0.0, 0.0),

            KeyCode::Char('1') => self.select(RoutineId::Motor),
            KeyCode::Char('2') => self.select(RoutineId::PidLeft),
            KeyCode::Char('3') => self.select(RoutineId::PidRight),
            KeyCode::Char('4') => self.select(RoutineId::BiasLinear),
            KeyCode::Char('5') => self.select(RoutineId::BiasAngular),
            KeyCode::Char('6') => self.select(RoutineId::Motion),
            KeyCode::Char('c') => self.activate(Stage::Calibrate),
            KeyCode::Char('v') => self.activate(Stage::Validate),

            KeyCode::Char('m') => self.start_square(),
            KeyCode::Char('x') => self.abort(),
            KeyCode::Char('p') => self.print_status(),
            KeyCode::Char('q') | KeyCode::Esc => return false,
            _ => {}
        }
        true
    }

    fn select(&mut self, id: RoutineId) {
        self.selected = id;
        info!("Selected routine {:?}", id);
    }

    fn tick(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !self.engine.is_active() {
            self.seq.update(&mut self.board)?;
        }

        let mut ctx = CalContext {
            board: &mut self.board,
            store: &mut self.store,
            target: &mut self.target,
        };
        if let Err(e) = self.engine.tick(&mut ctx) {
            // The engine already failed safe; keep the runtime alive
            warn!("Calibration routine abandoned: {}", e);
        }

        self.ctl.tick(
            &mut self.board,
            &self.store,
            &self.seq,
            self.engine.is_active(),
        )?;
        Ok(())
    }
}

pub async fn run<B: Board>(board: B) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut runtime = Runtime::new(board);
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );
    info!("Keys: W/S drive, A/D rotate, Space stop, 1-6 routine, C/V run, M square, X abort, P status, Q quit");

    enable_raw_mode()?;
    let result = run_loop(&mut runtime, &mut tick).await;
    disable_raw_mode()?;

    // Leave the motors stopped regardless of how the loop ended
    runtime.abort();
    result
}

async fn run_loop<B: Board>(
    runtime: &mut Runtime<B>,
    tick: &mut tokio::time::Interval,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        tick.tick().await;

        // Drain all pending key events (non-blocking)
        while event::poll(Duration::ZERO)? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                if pressed && !runtime.handle_key(code) {
                    info!("Exiting");
                    return Ok(());
                }
            }
        }

        runtime.tick()?;
    }
}

// Queued motion primitives: linear drives, in-place rotations, pauses.
//
// The sequencer is programmed move by move, started once, then polled every
// control tick. While a sequence runs it owns the command velocity; when the
// last move completes it hands authority back by reporting not-moving and a
// stop command.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{HEADING_TOLERANCE_RAD, LINEAR_TOLERANCE_M, MAX_MOVES, ROTATE_SETTLE_MS};
use crate::hal::{Board, BoardError, elapsed_ms};
use crate::messages::VelocityCommand;
use crate::motor::kinematics::normalize_heading;

#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("move queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("sequence already running")]
    AlreadyMoving,

    #[error("no moves queued")]
    NothingQueued,

    #[error(transparent)]
    Board(#[from] BoardError),
}

/// One motion primitive. Signed distances and angles encode direction; speeds
/// are magnitudes. Linear and rotate moves carry a timeout that forces
/// completion if the goal is never reached.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Move {
    Linear {
        distance_m: f32,
        speed_mps: f32,
        timeout_ms: u32,
    },
    Rotate {
        angle_rad: f32,
        speed_radps: f32,
        timeout_ms: u32,
    },
    Pause {
        duration_ms: u32,
    },
}

/// Goal bookkeeping captured when a move begins.
#[derive(Debug, Clone, Copy)]
enum Progress {
    Linear { start_x: f32, start_y: f32, started_ms: u32 },
    Rotate { target_rad: f32, started_ms: u32 },
    Pause { started_ms: u32 },
}

#[derive(Debug, Default)]
pub struct MotionSequencer {
    moves: Vec<Move>,
    next: usize,
    progress: Option<Progress>,
    active: bool,
    command: VelocityCommand,
}

impl MotionSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a move to the pending sequence.
    pub fn add(&mut self, mv: Move) -> Result<(), MotionError> {
        if self.moves.len() >= MAX_MOVES {
            return Err(MotionError::QueueFull {
                capacity: MAX_MOVES,
            });
        }
        self.moves.push(mv);
        Ok(())
    }

    /// Drop all queued moves and any in-flight progress.
    pub fn clear(&mut self) {
        self.moves.clear();
        self.next = 0;
        self.progress = None;
        self.active = false;
        self.command = VelocityCommand::stop();
    }

    /// Begin executing the queued sequence. May only be called when idle.
    pub fn start(&mut self) -> Result<(), MotionError> {
        if self.active {
            return Err(MotionError::AlreadyMoving);
        }
        if self.moves.is_empty() {
            return Err(MotionError::NothingQueued);
        }
        self.next = 0;
        self.progress = None;
        self.active = true;
        info!("Starting motion sequence of {} moves", self.moves.len());
        Ok(())
    }

    pub fn is_moving(&self) -> bool {
        self.active
    }

    /// Velocity the sequencer wants this tick. Zero whenever idle.
    pub fn command(&self) -> VelocityCommand {
        self.command
    }

    /// Advance the sequence by at most one move transition.
    pub fn update<B: Board>(&mut self, board: &mut B) -> Result<(), MotionError> {
        if !self.active {
            return Ok(());
        }

        let mv = self.moves[self.next];
        let progress = match self.progress {
            Some(progress) => progress,
            None => {
                let progress = self.begin(mv, board)?;
                self.progress = Some(progress);
                progress
            }
        };

        if self.at_goal(mv, progress, board)? {
            self.progress = None;
            self.command = VelocityCommand::stop();
            self.next += 1;
            if self.next >= self.moves.len() {
                info!("Motion sequence complete");
                self.clear();
            }
        }
        Ok(())
    }

    fn begin<B: Board>(&mut self, mv: Move, board: &mut B) -> Result<Progress, MotionError> {
        let started_ms = board.millis();
        Ok(match mv {
            Move::Linear {
                distance_m,
                speed_mps,
                ..
            } => {
                let (start_x, start_y) = board.xy_position()?;
                self.command = VelocityCommand {
                    linear: speed_mps.abs() * distance_m.signum(),
                    angular: 0.0,
                };
                Progress::Linear {
                    start_x,
                    start_y,
                    started_ms,
                }
            }
            Move::Rotate {
                angle_rad,
                speed_radps,
                ..
            } => {
                let heading = board.heading()?;
                self.command = VelocityCommand {
                    linear: 0.0,
                    angular: speed_radps.abs() * angle_rad.signum(),
                };
                Progress::Rotate {
                    target_rad: normalize_heading(heading + angle_rad),
                    started_ms,
                }
            }
            Move::Pause { .. } => {
                self.command = VelocityCommand::stop();
                Progress::Pause { started_ms }
            }
        })
    }

    fn at_goal<B: Board>(
        &self,
        mv: Move,
        progress: Progress,
        board: &mut B,
    ) -> Result<bool, MotionError> {
        let now = board.millis();
        match (mv, progress) {
            (
                Move::Linear {
                    distance_m,
                    timeout_ms,
                    ..
                },
                Progress::Linear {
                    start_x,
                    start_y,
                    started_ms,
                },
            ) => {
                let (x, y) = board.xy_position()?;
                let traveled = ((x - start_x).powi(2) + (y - start_y).powi(2)).sqrt();
                let done = traveled >= distance_m.abs() - LINEAR_TOLERANCE_M;
                Ok(done || self.timed_out(now, started_ms, timeout_ms))
            }
            (
                Move::Rotate { timeout_ms, .. },
                Progress::Rotate {
                    target_rad,
                    started_ms,
                },
            ) => {
                // Ignore the heading until the settle window passes so a stale
                // snapshot cannot complete the move immediately
                if elapsed_ms(now, started_ms) < ROTATE_SETTLE_MS {
                    return Ok(false);
                }
                let error = normalize_heading(board.heading()? - target_rad);
                let done = error.abs() <= HEADING_TOLERANCE_RAD;
                Ok(done || self.timed_out(now, started_ms, timeout_ms))
            }
            (Move::Pause { duration_ms }, Progress::Pause { started_ms }) => {
                Ok(elapsed_ms(now, started_ms) >= duration_ms)
            }
            // begin() always pairs progress with its own move
            _ => Ok(true),
        }
    }

    fn timed_out(&self, now: u32, started_ms: u32, timeout_ms: u32) -> bool {
        let timed_out = elapsed_ms(now, started_ms) >= timeout_ms;
        if timed_out {
            warn!("Move {} timed out before reaching its goal", self.next);
        }
        timed_out
    }
}

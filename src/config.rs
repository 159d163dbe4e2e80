// Loop rate, PWM ranges, wheel geometry, calibration tuning constants
use std::time::Duration;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Serial bridge to the motor-controller MCU
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

/// Motor PWM duty in microseconds of pulse width (servo-style driver range).
pub type Pwm = u16;

pub const PWM_MIN: Pwm = 1000;
pub const PWM_STOP: Pwm = 1500;
pub const PWM_MAX: Pwm = 2000;

// Per-wheel sweep ranges used during motor calibration. The right wheel is
// mounted mirrored, so its forward range runs below PWM_STOP.
pub const LEFT_FWD_PWM_RANGE: (Pwm, Pwm) = (PWM_STOP, PWM_MAX);
pub const LEFT_BWD_PWM_RANGE: (Pwm, Pwm) = (PWM_MIN, PWM_STOP);
pub const RIGHT_FWD_PWM_RANGE: (Pwm, Pwm) = (PWM_MIN, PWM_STOP);
pub const RIGHT_BWD_PWM_RANGE: (Pwm, Pwm) = (PWM_STOP, PWM_MAX);

// Calibration curve tables: 51 breakpoints per (wheel, direction)
pub const CURVE_POINTS: usize = 51;

// Fixed-point scale applied to counts/sec before table storage and lookup.
// Spreads samples across the representable range and reduces duplicate buckets.
pub const CPS_SCALE: i32 = 100;

// Wheel geometry
pub const WHEEL_RADIUS_M: f32 = 0.0775;
pub const WHEEL_DIAMETER_M: f32 = 2.0 * WHEEL_RADIUS_M;
pub const TRACK_WIDTH_M: f32 = 0.403;
pub const COUNTS_PER_REV: f32 = 500.0;

// Motion sequencer
pub const MAX_MOVES: usize = 16;
pub const LINEAR_TOLERANCE_M: f32 = 0.0001;
pub const HEADING_TOLERANCE_RAD: f32 = 0.01;
// Minimum elapsed time before a rotate move first checks its goal, so a stale
// heading snapshot cannot complete the move on the tick after the command.
pub const ROTATE_SETTLE_MS: u32 = 500;
pub const MOVE_DONE_TIMEOUT_MS: u32 = 5000;

// Motor calibration: averaging runs per table and ticks averaged per PWM sample
pub const MOTOR_CAL_RUNS: u32 = 3;
pub const MOTOR_CAL_SETTLE_TICKS: u32 = 5;
pub const MOTOR_CAL_AVG_TICKS: u32 = 10;

// Motor validation triangular profile (odd point count, percentage bounds of
// the calibrated cps domain)
pub const MOTOR_VAL_POINTS: usize = 11;
pub const MOTOR_VAL_LOWER_PCT: f32 = 0.2;
pub const MOTOR_VAL_UPPER_PCT: f32 = 0.8;
pub const MOTOR_VAL_DWELL_MS: u32 = 2000;

// PID step-response calibration
pub const PID_STEP_PCT: f32 = 0.5;
pub const PID_CAL_RUN_MS: u32 = 3000;
pub const PID_VAL_POINTS: usize = 7;
pub const PID_VAL_DWELL_MS: u32 = 2000;
pub const PID_SAMPLE_CAPACITY: usize = 256;

// Linear/angular bias runs: open-loop speed and duration. The linear run
// covers 1 m of dead-reckoned travel; the angular run covers one full turn.
pub const BIAS_LINEAR_MPS: f32 = 0.2;
pub const BIAS_LINEAR_RUN_MS: u32 = 5000;
pub const BIAS_ANGULAR_RADPS: f32 = 0.7;
pub const BIAS_ANGULAR_RUN_MS: u32 = 9000;

// Linear/angular bias bounds (dimensionless correction factors)
pub const LINEAR_BIAS_DEFAULT: f32 = 1.0;
pub const LINEAR_BIAS_MIN: f32 = 0.5;
pub const LINEAR_BIAS_MAX: f32 = 1.5;
pub const ANGULAR_BIAS_DEFAULT: f32 = 1.0;
pub const ANGULAR_BIAS_MIN: f32 = 0.5;
pub const ANGULAR_BIAS_MAX: f32 = 1.5;

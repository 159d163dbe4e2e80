// Counts/sec <-> PWM curve tables
//
// One table per (wheel, direction), 51 breakpoints each. `cps` is stored
// scaled by `cps_scale` and sorted ascending; `pwm` is monotonic in the same
// sense for a calibrated motor. Lookup is a binary range search followed by
// linear interpolation between the bracketing breakpoints.

use crate::config::{CPS_SCALE, CURVE_POINTS, PWM_MAX, PWM_MIN, PWM_STOP, Pwm};
use crate::hal::{Direction, Wheel};

#[derive(Debug, Clone, PartialEq)]
pub struct CurveTable {
    pub cps_min: i32,
    pub cps_max: i32,
    pub cps_scale: i32,
    pub cps: [i32; CURVE_POINTS],
    pub pwm: [Pwm; CURVE_POINTS],
}

impl Default for CurveTable {
    fn default() -> Self {
        Self {
            cps_min: 0,
            cps_max: 0,
            cps_scale: CPS_SCALE,
            cps: [0; CURVE_POINTS],
            pwm: [PWM_STOP; CURVE_POINTS],
        }
    }
}

impl CurveTable {
    /// Build a table from measured samples. `cps` must already be scaled and
    /// sorted ascending; min/max bounds are derived from the samples.
    pub fn from_samples(cps: [i32; CURVE_POINTS], pwm: [Pwm; CURVE_POINTS]) -> Self {
        let cps_min = cps.iter().copied().min().unwrap_or(0);
        let cps_max = cps.iter().copied().max().unwrap_or(0);
        Self {
            cps_min,
            cps_max,
            cps_scale: CPS_SCALE,
            cps,
            pwm,
        }
    }

    /// Find the adjacent breakpoint indices bracketing `search`, which must
    /// already be clamped into `[cps_min, cps_max]`. An exact hit resolves to
    /// the first matching breakpoint with `lower == upper`.
    fn range_search(&self, search: i32) -> (usize, usize) {
        // First index with cps[idx] >= search
        let idx = self.cps.partition_point(|&v| v < search);

        if idx == 0 {
            return (0, 0);
        }
        if idx >= CURVE_POINTS {
            return (CURVE_POINTS - 1, CURVE_POINTS - 1);
        }
        if self.cps[idx] == search {
            (idx, idx)
        } else {
            (idx - 1, idx)
        }
    }

    /// Linear interpolation between two breakpoints. Duplicate cps entries are
    /// possible in measured data; the degenerate pair returns the lower pwm
    /// value rather than dividing by zero.
    fn interpolate(x: i32, x1: i32, x2: i32, y1: Pwm, y2: Pwm) -> i32 {
        if x1 == x2 {
            return y1 as i32;
        }
        let span = (x - x1) as i64 * (y2 as i64 - y1 as i64) / (x2 - x1) as i64;
        span as i32 + y1 as i32
    }

    /// Look up the PWM for an already-scaled counts/sec value.
    pub fn pwm_for_scaled(&self, scaled: i32) -> Pwm {
        let scaled = scaled.clamp(self.cps_min, self.cps_max);
        let (lower, upper) = self.range_search(scaled);
        let pwm = Self::interpolate(
            scaled,
            self.cps[lower],
            self.cps[upper],
            self.pwm[lower],
            self.pwm[upper],
        );
        pwm.clamp(PWM_MIN as i32, PWM_MAX as i32) as Pwm
    }
}

/// The four calibration tables: (left, right) x (forward, backward).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurveSet {
    pub left_fwd: CurveTable,
    pub left_bwd: CurveTable,
    pub right_fwd: CurveTable,
    pub right_bwd: CurveTable,
}

impl CurveSet {
    pub fn table(&self, wheel: Wheel, dir: Direction) -> &CurveTable {
        match (wheel, dir) {
            (Wheel::Left, Direction::Forward) => &self.left_fwd,
            (Wheel::Left, Direction::Backward) => &self.left_bwd,
            (Wheel::Right, Direction::Forward) => &self.right_fwd,
            (Wheel::Right, Direction::Backward) => &self.right_bwd,
        }
    }

    pub fn table_mut(&mut self, wheel: Wheel, dir: Direction) -> &mut CurveTable {
        match (wheel, dir) {
            (Wheel::Left, Direction::Forward) => &mut self.left_fwd,
            (Wheel::Left, Direction::Backward) => &mut self.left_bwd,
            (Wheel::Right, Direction::Forward) => &mut self.right_fwd,
            (Wheel::Right, Direction::Backward) => &mut self.right_bwd,
        }
    }

    /// Convert a signed counts/sec command to a PWM duty.
    ///
    /// Zero always maps to `PWM_STOP` without a table lookup, and an
    /// uncalibrated table set fails safe to `PWM_STOP` instead of
    /// extrapolating from default contents.
    pub fn cps_to_pwm(&self, wheel: Wheel, cps: f32, calibrated: bool) -> Pwm {
        if cps == 0.0 || !calibrated {
            return PWM_STOP;
        }

        let table = self.table(wheel, Direction::of_cps(cps));
        let scaled = (cps * table.cps_scale as f32) as i32;
        table.pwm_for_scaled(scaled)
    }

    /// Largest forward counts/sec both wheels can reach (unscaled).
    pub fn forward_domain(&self) -> f32 {
        let left = self.left_fwd.cps_max as f32 / self.left_fwd.cps_scale as f32;
        let right = self.right_fwd.cps_max as f32 / self.right_fwd.cps_scale as f32;
        left.min(right)
    }

    /// Most-negative backward counts/sec both wheels can reach (unscaled).
    pub fn backward_domain(&self) -> f32 {
        let left = self.left_bwd.cps_min as f32 / self.left_bwd.cps_scale as f32;
        let right = self.right_bwd.cps_min as f32 / self.right_bwd.cps_scale as f32;
        // Backward values are negative; the shared domain is the larger one
        left.max(right)
    }
}

/// Scale a domain down to a percentage-bounded operating range.
pub fn operating_range(low_pct: f32, high_pct: f32, domain: f32) -> (f32, f32) {
    (low_pct * domain, high_pct * domain)
}

/// Velocity profile that ramps `start -> stop -> start` (slow, fast, slow).
/// Used by motor and PID validation. `num_points` must be odd so the peak sits
/// on the middle sample; validated at routine activation.
pub fn triangular_profile(num_points: usize, start: f32, stop: f32) -> Vec<f32> {
    debug_assert!(num_points % 2 == 1);

    let mid = num_points / 2;
    let delta = (stop - start) / mid as f32;

    let mut profile = vec![0.0; num_points];
    profile[mid] = stop;
    for ii in 0..mid {
        let value = start + delta * ii as f32;
        profile[ii] = value;
        profile[num_points - 1 - ii] = value;
    }
    profile
}

// Persisted calibration data and its packed byte layout.
//
// Layout (little-endian, 1328 bytes total):
//   0x0000  status      u16   calibrated-feature bitmask
//   0x0002  checksum    u16   wrapping u16 sum of every byte outside this field
//   0x0004  reserved    [u8; 4]
//   0x0008  left gains  kp f32, ki f32, kd f32, 4 pad bytes (16-byte row)
//   0x0018  right gains same shape
//   0x0028  linear bias f32
//   0x002C  angular bias f32
//   0x0030  curve records x4: left-fwd, left-bwd, right-fwd, right-bwd
//
// Curve record (320 bytes):
//   cps_min i32, cps_max i32, cps_scale i32, cps [i32; 51], pwm [u16; 51],
//   2 pad bytes

use tracing::info;

use crate::config::{
    ANGULAR_BIAS_DEFAULT, ANGULAR_BIAS_MAX, ANGULAR_BIAS_MIN, CURVE_POINTS, LINEAR_BIAS_DEFAULT,
    LINEAR_BIAS_MAX, LINEAR_BIAS_MIN, Pwm,
};
use crate::hal::{Board, BoardError, Direction, Wheel};

use super::curve::{CurveSet, CurveTable};

// Calibrated-feature status bits
pub const STATUS_MOTOR: u16 = 0x0001;
pub const STATUS_PID: u16 = 0x0002;
pub const STATUS_LINEAR: u16 = 0x0004;
pub const STATUS_ANGULAR: u16 = 0x0008;

const GAINS_ROW_SIZE: usize = 16;
const CURVE_RECORD_SIZE: usize = 12 + CURVE_POINTS * 4 + CURVE_POINTS * 2 + 2;
const CURVES_OFFSET: usize = 0x30;
pub const STORE_SIZE: usize = CURVES_OFFSET + 4 * CURVE_RECORD_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("calibration image has wrong length: expected {STORE_SIZE}, got {0}")]
    BadLength(usize),

    #[error("calibration image checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { stored: u16, computed: u16 },

    #[error(transparent)]
    Board(#[from] BoardError),
}

/// PID gain triple for one wheel's velocity controller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

/// In-memory copy of the persisted calibration data. Loaded at boot, queried
/// read-only during normal operation, mutated only by calibration routines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalStore {
    status: u16,
    pub left_gains: PidGains,
    pub right_gains: PidGains,
    pub linear_bias: f32,
    pub angular_bias: f32,
    pub curves: CurveSet,
}

impl CalStore {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn has_status(&self, bit: u16) -> bool {
        self.status & bit != 0
    }

    pub fn set_status(&mut self, bit: u16) {
        self.status |= bit;
    }

    pub fn clear_status(&mut self, bit: u16) {
        self.status &= !bit;
    }

    pub fn motor_calibrated(&self) -> bool {
        self.has_status(STATUS_MOTOR)
    }

    /// Curve lookup guarded by the motor-calibrated status bit.
    pub fn cps_to_pwm(&self, wheel: Wheel, cps: f32) -> Pwm {
        self.curves.cps_to_pwm(wheel, cps, self.motor_calibrated())
    }

    pub fn gains(&self, wheel: Wheel) -> PidGains {
        match wheel {
            Wheel::Left => self.left_gains,
            Wheel::Right => self.right_gains,
        }
    }

    pub fn set_gains(&mut self, wheel: Wheel, gains: PidGains) {
        match wheel {
            Wheel::Left => self.left_gains = gains,
            Wheel::Right => self.right_gains = gains,
        }
    }

    /// Linear bias, defaulted and clamped when uncalibrated or out of range.
    pub fn linear_bias(&self) -> f32 {
        if self.has_status(STATUS_LINEAR) {
            self.linear_bias.clamp(LINEAR_BIAS_MIN, LINEAR_BIAS_MAX)
        } else {
            LINEAR_BIAS_DEFAULT
        }
    }

    pub fn angular_bias(&self) -> f32 {
        if self.has_status(STATUS_ANGULAR) {
            self.angular_bias.clamp(ANGULAR_BIAS_MIN, ANGULAR_BIAS_MAX)
        } else {
            ANGULAR_BIAS_DEFAULT
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; STORE_SIZE];

        bytes[0..2].copy_from_slice(&self.status.to_le_bytes());
        // checksum written last
        put_gains(&mut bytes[0x08..0x08 + GAINS_ROW_SIZE], self.left_gains);
        put_gains(&mut bytes[0x18..0x18 + GAINS_ROW_SIZE], self.right_gains);
        bytes[0x28..0x2C].copy_from_slice(&self.linear_bias.to_le_bytes());
        bytes[0x2C..0x30].copy_from_slice(&self.angular_bias.to_le_bytes());

        for (ii, (wheel, dir)) in record_order().iter().enumerate() {
            let at = CURVES_OFFSET + ii * CURVE_RECORD_SIZE;
            put_curve(
                &mut bytes[at..at + CURVE_RECORD_SIZE],
                self.curves.table(*wheel, *dir),
            );
        }

        let checksum = image_checksum(&bytes);
        bytes[2..4].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != STORE_SIZE {
            return Err(StoreError::BadLength(bytes.len()));
        }

        let stored = u16::from_le_bytes([bytes[2], bytes[3]]);
        let computed = image_checksum(bytes);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch { stored, computed });
        }

        let mut store = CalStore {
            status: u16::from_le_bytes([bytes[0], bytes[1]]),
            left_gains: get_gains(&bytes[0x08..0x08 + GAINS_ROW_SIZE]),
            right_gains: get_gains(&bytes[0x18..0x18 + GAINS_ROW_SIZE]),
            linear_bias: get_f32(&bytes[0x28..0x2C]),
            angular_bias: get_f32(&bytes[0x2C..0x30]),
            curves: CurveSet::default(),
        };

        for (ii, (wheel, dir)) in record_order().iter().enumerate() {
            let at = CURVES_OFFSET + ii * CURVE_RECORD_SIZE;
            *store.curves.table_mut(*wheel, *dir) = get_curve(&bytes[at..at + CURVE_RECORD_SIZE]);
        }

        Ok(store)
    }

    /// Flush the whole image to the board's non-volatile store.
    pub fn save<B: Board>(&self, board: &mut B) -> Result<(), StoreError> {
        board.nv_write(0, &self.to_bytes())?;
        info!("Calibration store saved ({} bytes)", STORE_SIZE);
        Ok(())
    }

    /// Load the image from the board's non-volatile store.
    pub fn load<B: Board>(board: &mut B) -> Result<Self, StoreError> {
        let mut bytes = vec![0u8; STORE_SIZE];
        board.nv_read(0, &mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

fn record_order() -> [(Wheel, Direction); 4] {
    [
        (Wheel::Left, Direction::Forward),
        (Wheel::Left, Direction::Backward),
        (Wheel::Right, Direction::Forward),
        (Wheel::Right, Direction::Backward),
    ]
}

/// Wrapping u16 sum of every byte outside the checksum field.
fn image_checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .enumerate()
        .filter(|(ii, _)| !(2..4).contains(ii))
        .fold(0u16, |sum, (_, &b)| sum.wrapping_add(b as u16))
}

fn put_gains(row: &mut [u8], gains: PidGains) {
    row[0..4].copy_from_slice(&gains.kp.to_le_bytes());
    row[4..8].copy_from_slice(&gains.ki.to_le_bytes());
    row[8..12].copy_from_slice(&gains.kd.to_le_bytes());
}

fn get_gains(row: &[u8]) -> PidGains {
    PidGains {
        kp: get_f32(&row[0..4]),
        ki: get_f32(&row[4..8]),
        kd: get_f32(&row[8..12]),
    }
}

fn get_f32(bytes: &[u8]) -> f32 {
    f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn get_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn put_curve(record: &mut [u8], table: &CurveTable) {
    record[0..4].copy_from_slice(&table.cps_min.to_le_bytes());
    record[4..8].copy_from_slice(&table.cps_max.to_le_bytes());
    record[8..12].copy_from_slice(&table.cps_scale.to_le_bytes());

    let mut at = 12;
    for value in &table.cps {
        record[at..at + 4].copy_from_slice(&value.to_le_bytes());
        at += 4;
    }
    for value in &table.pwm {
        record[at..at + 2].copy_from_slice(&value.to_le_bytes());
        at += 2;
    }
}

fn get_curve(record: &[u8]) -> CurveTable {
    let mut table = CurveTable {
        cps_min: get_i32(&record[0..4]),
        cps_max: get_i32(&record[4..8]),
        cps_scale: get_i32(&record[8..12]),
        ..CurveTable::default()
    };

    let mut at = 12;
    for value in table.cps.iter_mut() {
        *value = get_i32(&record[at..at + 4]);
        at += 4;
    }
    for value in table.pwm.iter_mut() {
        *value = u16::from_le_bytes([record[at], record[at + 1]]);
        at += 2;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CPS_SCALE, PWM_STOP};

    fn populated_store() -> CalStore {
        let mut store = CalStore::default();
        store.set_status(STATUS_MOTOR | STATUS_PID);
        store.left_gains = PidGains {
            kp: 1.5,
            ki: 0.25,
            kd: 0.05,
        };
        store.right_gains = PidGains {
            kp: 1.4,
            ki: 0.3,
            kd: 0.04,
        };
        store.linear_bias = 1.02;
        store.angular_bias = 0.98;

        let mut cps = [0i32; CURVE_POINTS];
        let mut pwm = [PWM_STOP; CURVE_POINTS];
        for ii in 0..CURVE_POINTS {
            cps[ii] = (ii as i32) * 40 * CPS_SCALE / 10;
            pwm[ii] = PWM_STOP + (ii as Pwm) * 10;
        }
        *store.curves.table_mut(Wheel::Left, Direction::Forward) =
            CurveTable::from_samples(cps, pwm);
        store
    }

    #[test]
    fn test_image_size() {
        assert_eq!(STORE_SIZE, 0x30 + 4 * 320);
        assert_eq!(populated_store().to_bytes().len(), STORE_SIZE);
    }

    #[test]
    fn test_serialize_deserialize() {
        let store = populated_store();
        let restored = CalStore::from_bytes(&store.to_bytes()).unwrap();
        assert_eq!(store, restored);
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut bytes = populated_store().to_bytes();
        bytes[0x08] ^= 0xFF; // flip a gain byte
        match CalStore::from_bytes(&bytes) {
            Err(StoreError::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_length_rejected() {
        assert!(matches!(
            CalStore::from_bytes(&[0u8; 16]),
            Err(StoreError::BadLength(16))
        ));
    }

    #[test]
    fn test_field_offsets() {
        let store = populated_store();
        let bytes = store.to_bytes();
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), store.status());
        assert_eq!(get_f32(&bytes[0x08..0x0C]), 1.5); // left kp
        assert_eq!(get_f32(&bytes[0x28..0x2C]), 1.02); // linear bias
        // First curve record starts with left-fwd cps_min
        assert_eq!(
            i32::from_le_bytes(bytes[0x30..0x34].try_into().unwrap()),
            store.curves.left_fwd.cps_min
        );
    }

    #[test]
    fn test_bias_defaults_when_uncalibrated() {
        let mut store = populated_store();
        assert_eq!(store.linear_bias(), LINEAR_BIAS_DEFAULT);
        store.set_status(STATUS_LINEAR);
        assert_eq!(store.linear_bias(), 1.02);
        // Out-of-range persisted bias is clamped
        store.linear_bias = 9.0;
        assert_eq!(store.linear_bias(), LINEAR_BIAS_MAX);
    }

    #[test]
    fn test_status_bit_roundtrip() {
        let mut store = CalStore::default();
        assert!(!store.motor_calibrated());
        store.set_status(STATUS_MOTOR);
        assert!(store.motor_calibrated());
        store.clear_status(STATUS_MOTOR);
        assert!(!store.motor_calibrated());
    }
}

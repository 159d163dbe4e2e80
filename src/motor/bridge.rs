// Serial protocol to the motor-controller MCU
//
// The MCU owns the PWM timers, encoder ISRs, odometry integration, and the
// EEPROM. This side speaks a small register-style request/response protocol:
// Packet format: [0xAA, 0x55, Opcode, Length, Params..., Checksum]

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Default serial configuration for the bridge
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Packet header bytes
const HEADER: [u8; 2] = [0xAA, 0x55];

/// Request opcodes understood by the MCU
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Opcode {
    SetPwm = 0x01,    // left u16 le, right u16 le
    GetCps = 0x02,    // wheel u8 -> f32 le counts/sec
    GetPose = 0x03,   // -> x f32, y f32, heading f32 (le)
    ResetOdom = 0x04, // no payload
    NvRead = 0x05,    // offset u16 le, len u8 -> bytes
    NvWrite = 0x06,   // offset u16 le, bytes
}

/// Error types for bridge communication
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Checksum mismatch in response")]
    ChecksumMismatch,

    #[error("MCU returned error status: 0x{status:02X}")]
    DeviceError { status: u8 },

    #[error("Timeout waiting for response")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Serial connection to the motor-controller MCU
pub struct Bridge {
    port: Box<dyn SerialPort>,
}

impl Bridge {
    /// Open a new connection to the MCU
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }

    /// Calculate checksum over a packet body (excluding header)
    fn checksum(data: &[u8]) -> u8 {
        let sum: u16 = data.iter().map(|&b| b as u16).sum();
        (!sum & 0xFF) as u8
    }

    /// Build a packet with header and checksum
    fn build_packet(opcode: Opcode, params: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(5 + params.len());

        packet.extend_from_slice(&HEADER);
        packet.push(opcode as u8);
        packet.push(params.len() as u8);
        packet.extend_from_slice(params);

        // Checksum over opcode, length, params
        let checksum_body = &packet[2..];
        packet.push(Self::checksum(checksum_body));

        packet
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read a response packet: [0xAA, 0x55, Status, Length, Params..., Checksum]
    fn read_response(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 2];
        self.port.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                BridgeError::Timeout
            } else {
                BridgeError::Io(e)
            }
        })?;

        if header != HEADER {
            return Err(BridgeError::InvalidResponse {
                reason: format!("Invalid header: {:02X?}", header),
            });
        }

        let mut status_length = [0u8; 2];
        self.port.read_exact(&mut status_length)?;
        let status = status_length[0];
        let length = status_length[1] as usize;

        let mut remaining = vec![0u8; length + 1]; // params + checksum
        self.port.read_exact(&mut remaining)?;

        let mut checksum_body = vec![status, length as u8];
        checksum_body.extend_from_slice(&remaining[..length]);
        if Self::checksum(&checksum_body) != remaining[length] {
            return Err(BridgeError::ChecksumMismatch);
        }

        if status != 0 {
            return Err(BridgeError::DeviceError { status });
        }

        Ok(remaining[..length].to_vec())
    }

    fn transact(&mut self, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>> {
        let packet = Self::build_packet(opcode, params);
        debug!("Bridge request: op={:?}, len={}", opcode, params.len());
        self.send_packet(&packet)?;
        self.read_response()
    }

    /// Set both motor PWM duties
    pub fn set_pwm(&mut self, left: u16, right: u16) -> Result<()> {
        let mut params = [0u8; 4];
        params[..2].copy_from_slice(&left.to_le_bytes());
        params[2..].copy_from_slice(&right.to_le_bytes());
        self.transact(Opcode::SetPwm, &params)?;
        Ok(())
    }

    /// Read encoder-derived counts/sec for one wheel (0 = left, 1 = right)
    pub fn get_cps(&mut self, wheel: u8) -> Result<f32> {
        let response = self.transact(Opcode::GetCps, &[wheel])?;
        Ok(f32::from_le_bytes(take4(&response, 0)?))
    }

    /// Read the odometry pose snapshot (x m, y m, heading rad)
    pub fn get_pose(&mut self) -> Result<(f32, f32, f32)> {
        let response = self.transact(Opcode::GetPose, &[])?;
        let x = f32::from_le_bytes(take4(&response, 0)?);
        let y = f32::from_le_bytes(take4(&response, 4)?);
        let heading = f32::from_le_bytes(take4(&response, 8)?);
        Ok((x, y, heading))
    }

    /// Zero the odometry accumulators
    pub fn reset_odom(&mut self) -> Result<()> {
        self.transact(Opcode::ResetOdom, &[])?;
        Ok(())
    }

    /// Read bytes from the MCU's non-volatile store
    pub fn nv_read(&mut self, offset: u16, len: u8) -> Result<Vec<u8>> {
        let mut params = [0u8; 3];
        params[..2].copy_from_slice(&offset.to_le_bytes());
        params[2] = len;
        let response = self.transact(Opcode::NvRead, &params)?;
        if response.len() != len as usize {
            return Err(BridgeError::InvalidResponse {
                reason: format!("Expected {} bytes, got {}", len, response.len()),
            });
        }
        Ok(response)
    }

    /// Write bytes to the MCU's non-volatile store
    pub fn nv_write(&mut self, offset: u16, bytes: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(2 + bytes.len());
        params.extend_from_slice(&offset.to_le_bytes());
        params.extend_from_slice(bytes);
        self.transact(Opcode::NvWrite, &params)?;
        Ok(())
    }
}

fn take4(bytes: &[u8], at: usize) -> Result<[u8; 4]> {
    bytes
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| BridgeError::InvalidResponse {
            reason: format!("Response too short for field at offset {at}"),
        })
}

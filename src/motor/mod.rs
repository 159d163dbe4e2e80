// Motor-side modules for the differential-drive base
//
// Provides:
// - Differential-drive kinematics (unicycle <-> wheel velocities)
// - Serial bridge protocol to the motor-controller MCU
// - `SerialBoard`, the hardware-backed `Board` implementation

pub mod bridge;
mod driver;
pub mod kinematics;

pub use bridge::{Bridge, BridgeError};
pub use driver::SerialBoard;
pub use kinematics::{WheelVelocities, diff_to_uni, uni_to_diff};

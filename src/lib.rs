pub mod cal;
pub mod config;
pub mod control;
pub mod hal;
pub mod messages;
pub mod motion;
pub mod motor;
pub mod runtime;
pub mod sim;

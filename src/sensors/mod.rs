//! Host telemetry sensors.

pub mod games;
pub mod idle;

pub use games::GameScanner;

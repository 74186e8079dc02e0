//! ECG-Core: Foundation types for the ECG acquisition pipeline
//!
//! Samples, wire packets, analysis windows and the device text protocol
//! shared by every stage.

pub mod error;
pub mod packet;
pub mod protocol;
pub mod window;

pub use error::{EcgError, EcgResult};
pub use packet::*;
pub use protocol::{DeviceCommand, DeviceReply};
pub use window::*;

/// Device sampling rate in Hz.
pub const SAMPLE_RATE_HZ: f64 = 360.0;

/// Nominal spacing between consecutive device timestamps.
pub const SAMPLE_INTERVAL_MS: f64 = 1000.0 / SAMPLE_RATE_HZ;

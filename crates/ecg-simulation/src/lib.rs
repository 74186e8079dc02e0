//! ECG-Simulation: synthetic ECG and a simulated acquisition device
//!
//! Generates reproducible ECG samples and serves them over an in-memory
//! transport with the same framing and text commands as the hardware.

pub mod device;
pub mod ecg_simulator;
pub mod signal_patterns;

pub use device::{DeviceConfig, DeviceStats, Pacing, SimulatedDevice};
pub use ecg_simulator::{EcgConfig, EcgSimulator, NoiseConfig, PowerlineConfig};
pub use signal_patterns::SignalPattern;

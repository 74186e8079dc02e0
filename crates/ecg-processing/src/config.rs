//! Configuration for windowing and the filter cascade

use ecg_core::{config_error, EcgError, EcgResult, CORE_LEN, OVERLAP_LEN, SAMPLES_PER_PACKET, SAMPLE_RATE_HZ};
use serde::{Deserialize, Serialize};

/// Notch stage parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotchConfig {
    pub frequency_hz: f64,
    pub quality: f64,
}

/// Band edges and tolerances shared by the lowpass and highpass stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandEdges {
    pub passband_hz: f64,
    pub stopband_hz: f64,
    pub ripple_db: f64,
    pub attenuation_db: f64,
}

/// Filter cascade design parameters, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub sample_rate: f64,
    pub notch: NotchConfig,
    pub lowpass: BandEdges,
    pub highpass: BandEdges,
    /// Guard added to the min-max range
    pub normalization_epsilon: f64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self::ecg_360hz()
    }
}

impl CascadeConfig {
    /// Mains notch, equiripple lowpass and baseline-wander highpass at 360 Hz
    pub fn ecg_360hz() -> Self {
        CascadeConfig {
            sample_rate: SAMPLE_RATE_HZ,
            notch: NotchConfig {
                frequency_hz: 61.0,
                quality: 10.0,
            },
            lowpass: BandEdges {
                passband_hz: 150.0,
                stopband_hz: 180.0,
                ripple_db: 0.5,
                attenuation_db: 40.0,
            },
            highpass: BandEdges {
                passband_hz: 1.0,
                stopband_hz: 0.05,
                ripple_db: 0.5,
                attenuation_db: 40.0,
            },
            normalization_epsilon: 1e-8,
        }
    }

    pub fn nyquist(&self) -> f64 {
        self.sample_rate / 2.0
    }

    pub fn validate(&self) -> EcgResult<()> {
        if !(self.sample_rate > 0.0 && self.sample_rate.is_finite()) {
            return Err(config_error!("sample rate must be positive, got {}", self.sample_rate));
        }
        let nyquist = self.nyquist();

        if !(self.notch.frequency_hz > 0.0 && self.notch.frequency_hz < nyquist) {
            return Err(config_error!(
                "notch frequency {} Hz must lie below Nyquist ({} Hz)",
                self.notch.frequency_hz,
                nyquist
            ));
        }
        if self.notch.quality <= 0.0 {
            return Err(config_error!("notch quality factor must be positive"));
        }

        let lp = &self.lowpass;
        if !(lp.passband_hz > 0.0 && lp.passband_hz < lp.stopband_hz && lp.stopband_hz <= nyquist) {
            return Err(config_error!(
                "lowpass edges must satisfy 0 < passband ({}) < stopband ({}) <= Nyquist",
                lp.passband_hz,
                lp.stopband_hz
            ));
        }

        let hp = &self.highpass;
        if !(hp.stopband_hz > 0.0 && hp.stopband_hz < hp.passband_hz && hp.passband_hz < nyquist) {
            return Err(config_error!(
                "highpass edges must satisfy 0 < stopband ({}) < passband ({}) < Nyquist",
                hp.stopband_hz,
                hp.passband_hz
            ));
        }

        for (name, edges) in [("lowpass", lp), ("highpass", hp)] {
            if edges.ripple_db <= 0.0 || edges.attenuation_db <= edges.ripple_db {
                return Err(config_error!(
                    "{} needs 0 < ripple < attenuation, got {} dB / {} dB",
                    name,
                    edges.ripple_db,
                    edges.attenuation_db
                ));
            }
        }

        if self.normalization_epsilon <= 0.0 {
            return Err(config_error!("normalization epsilon must be positive"));
        }
        Ok(())
    }

    pub fn to_json(&self) -> EcgResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| EcgError::Serialization {
            reason: format!("failed to serialize cascade configuration: {}", e),
        })
    }

    pub fn from_json(json: &str) -> EcgResult<Self> {
        serde_json::from_str(json).map_err(|e| EcgError::Serialization {
            reason: format!("failed to deserialize cascade configuration: {}", e),
        })
    }
}

/// Window geometry used by the segmentation windower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowingConfig {
    pub core_len: usize,
    pub overlap_len: usize,
    pub samples_per_packet: usize,
}

impl Default for WindowingConfig {
    fn default() -> Self {
        WindowingConfig {
            core_len: CORE_LEN,
            overlap_len: OVERLAP_LEN,
            samples_per_packet: SAMPLES_PER_PACKET,
        }
    }
}

impl WindowingConfig {
    /// Longest window handed to the cascade
    pub fn extended_len(&self) -> usize {
        self.core_len + 2 * self.overlap_len
    }

    /// Samples needed before a window can be cut
    pub fn cut_len(&self) -> usize {
        self.core_len + self.overlap_len
    }

    pub fn validate(&self) -> EcgResult<()> {
        if self.core_len == 0 || self.samples_per_packet == 0 {
            return Err(config_error!("core length and packet size must be non-zero"));
        }
        if self.overlap_len > self.core_len {
            return Err(config_error!(
                "overlap ({}) must not exceed the core length ({})",
                self.overlap_len,
                self.core_len
            ));
        }
        Ok(())
    }
}

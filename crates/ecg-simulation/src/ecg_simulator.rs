//! ECG sample generator with noise, baseline wander and mains pickup

use crate::signal_patterns::SignalPattern;
use ecg_core::{config_error, EcgResult, Packet, Sample, SAMPLES_PER_PACKET, SAMPLE_RATE_HZ};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Noise configuration for realistic ECG simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Gaussian noise standard deviation in ADC counts (0.0 = no noise)
    pub gaussian_std: f64,
    /// Respiration-like baseline drift amplitude in ADC counts
    pub baseline_wander_amplitude: f64,
    pub baseline_wander_hz: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            gaussian_std: 4.0,
            baseline_wander_amplitude: 60.0,
            baseline_wander_hz: 0.25,
        }
    }
}

impl NoiseConfig {
    pub fn silent() -> Self {
        Self {
            gaussian_std: 0.0,
            baseline_wander_amplitude: 0.0,
            baseline_wander_hz: 0.0,
        }
    }

    /// Every noise term must be finite and non-negative
    pub fn validate(&self) -> EcgResult<()> {
        let terms = [
            ("gaussian_std", self.gaussian_std),
            ("baseline_wander_amplitude", self.baseline_wander_amplitude),
            ("baseline_wander_hz", self.baseline_wander_hz),
        ];
        for (name, value) in terms {
            if !(value.is_finite() && value >= 0.0) {
                return Err(config_error!("noise {} must be finite and non-negative, got {}", name, value));
            }
        }
        Ok(())
    }
}

/// Mains interference picked up by the electrode leads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerlineConfig {
    pub frequency_hz: f64,
    pub amplitude: f64,
}

/// Configuration for ECG simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcgConfig {
    pub sample_rate: f64,
    /// ADC reading of a flat lead
    pub adc_baseline: f64,
    pub pattern: SignalPattern,
    pub noise: NoiseConfig,
    pub powerline: Option<PowerlineConfig>,
    /// Random seed for reproducibility
    pub seed: Option<u64>,
}

impl Default for EcgConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE_HZ,
            adc_baseline: 32768.0,
            pattern: SignalPattern::HeartBeat {
                rate_bpm: 72.0,
                amplitude: 800.0,
            },
            noise: NoiseConfig::default(),
            powerline: Some(PowerlineConfig {
                frequency_hz: 60.0,
                amplitude: 40.0,
            }),
            seed: None,
        }
    }
}

/// ECG signal simulator stamping samples with a device clock
pub struct EcgSimulator {
    config: EcgConfig,
    rng: StdRng,
    noise: Normal<f64>,
    start_ms: u32,
    sample_index: u64,
}

impl EcgSimulator {
    pub fn new(config: EcgConfig) -> EcgResult<Self> {
        if !(config.sample_rate > 0.0 && config.sample_rate.is_finite()) {
            return Err(config_error!("sample rate must be positive, got {}", config.sample_rate));
        }
        if !(0.0..=f64::from(u16::MAX)).contains(&config.adc_baseline) {
            return Err(config_error!("ADC baseline {} outside the u16 range", config.adc_baseline));
        }
        config.noise.validate()?;
        let noise = Normal::new(0.0, config.noise.gaussian_std)
            .map_err(|e| config_error!("failed to create normal distribution: {}", e))?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(EcgSimulator {
            config,
            rng,
            noise,
            start_ms: 0,
            sample_index: 0,
        })
    }

    pub fn config(&self) -> &EcgConfig {
        &self.config
    }

    /// Begin a new recording whose first sample is stamped `start_ms`
    pub fn restart(&mut self, start_ms: u32) {
        self.start_ms = start_ms;
        self.sample_index = 0;
    }

    /// Samples generated since the last restart
    pub fn sample_index(&self) -> u64 {
        self.sample_index
    }

    /// Noise-free analog value, before quantization
    pub fn clean_value_at(&self, t: f64) -> f64 {
        let mut value = self.config.adc_baseline + self.config.pattern.value_at(t);
        let noise = &self.config.noise;
        if noise.baseline_wander_amplitude != 0.0 {
            value += noise.baseline_wander_amplitude * (2.0 * PI * noise.baseline_wander_hz * t).sin();
        }
        if let Some(powerline) = &self.config.powerline {
            value += powerline.amplitude * (2.0 * PI * powerline.frequency_hz * t).sin();
        }
        value
    }

    pub fn next_sample(&mut self) -> Sample {
        let n = self.sample_index;
        let t = n as f64 / self.config.sample_rate;
        let mut value = self.clean_value_at(t);
        if self.config.noise.gaussian_std > 0.0 {
            value += self.noise.sample(&mut self.rng);
        }

        let offset_ms = (n as f64 * 1000.0 / self.config.sample_rate).floor() as u64;
        let timestamp_ms = self.start_ms.wrapping_add(offset_ms as u32);
        let adc_value = value.round().clamp(0.0, f64::from(u16::MAX)) as u16;

        self.sample_index += 1;
        Sample::new(timestamp_ms, adc_value)
    }

    pub fn generate(&mut self, count: usize) -> Vec<Sample> {
        (0..count).map(|_| self.next_sample()).collect()
    }

    /// One full packet of samples
    pub fn next_packet(&mut self, session: u64, sequence: u64) -> EcgResult<Packet> {
        let samples = self.generate(SAMPLES_PER_PACKET);
        Packet::from_samples(session, sequence, &samples)
    }
}

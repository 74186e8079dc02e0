//! The filter cascade: notch, equiripple lowpass and elliptic highpass
//! applied zero-phase to an extended window, then core extraction and
//! min-max normalization.

use crate::config::CascadeConfig;
use crate::filters::{FilterKind, FilterStage};
use ecg_core::{EcgError, EcgResult, ExtendedWindow, ProcessedWindow};
use tracing::debug;

/// Designed cascade, immutable once built and shared read-only across windows
#[derive(Debug, Clone)]
pub struct FilterCascade {
    stages: Vec<FilterStage>,
    epsilon: f64,
}

/// Builder for cascades that differ from the default design
pub struct CascadeBuilder {
    sample_rate: f64,
    stages: Vec<FilterStage>,
    epsilon: f64,
}

impl CascadeBuilder {
    pub fn new(sample_rate: f64) -> Self {
        CascadeBuilder {
            sample_rate,
            stages: Vec::new(),
            epsilon: 1e-8,
        }
    }

    /// Add mains notch
    pub fn add_notch(&mut self, frequency_hz: f64, quality: f64) -> EcgResult<&mut Self> {
        let stage = FilterStage::notch(self.sample_rate, frequency_hz, quality)?;
        self.stages.push(stage);
        Ok(self)
    }

    /// Add equiripple lowpass
    pub fn add_equiripple_lowpass(
        &mut self,
        passband_hz: f64,
        stopband_hz: f64,
        ripple_db: f64,
        attenuation_db: f64,
    ) -> EcgResult<&mut Self> {
        let stage =
            FilterStage::equiripple_lowpass(self.sample_rate, passband_hz, stopband_hz, ripple_db, attenuation_db)?;
        self.stages.push(stage);
        Ok(self)
    }

    /// Add elliptic highpass
    pub fn add_elliptic_highpass(
        &mut self,
        passband_hz: f64,
        stopband_hz: f64,
        ripple_db: f64,
        attenuation_db: f64,
    ) -> EcgResult<&mut Self> {
        let stage =
            FilterStage::elliptic_highpass(self.sample_rate, passband_hz, stopband_hz, ripple_db, attenuation_db)?;
        self.stages.push(stage);
        Ok(self)
    }

    pub fn normalization_epsilon(&mut self, epsilon: f64) -> &mut Self {
        self.epsilon = epsilon;
        self
    }

    pub fn build(self) -> FilterCascade {
        FilterCascade {
            stages: self.stages,
            epsilon: self.epsilon,
        }
    }
}

impl FilterCascade {
    /// Design every stage from `config`, in cascade order
    pub fn design(config: &CascadeConfig) -> EcgResult<Self> {
        config.validate()?;

        let mut builder = CascadeBuilder::new(config.sample_rate);
        builder
            .add_notch(config.notch.frequency_hz, config.notch.quality)?
            .add_equiripple_lowpass(
                config.lowpass.passband_hz,
                config.lowpass.stopband_hz,
                config.lowpass.ripple_db,
                config.lowpass.attenuation_db,
            )?
            .add_elliptic_highpass(
                config.highpass.passband_hz,
                config.highpass.stopband_hz,
                config.highpass.ripple_db,
                config.highpass.attenuation_db,
            )?
            .normalization_epsilon(config.normalization_epsilon);
        Ok(builder.build())
    }

    pub fn stages(&self) -> &[FilterStage] {
        &self.stages
    }

    pub fn stage(&self, kind: FilterKind) -> Option<&FilterStage> {
        self.stages.iter().find(|s| s.kind() == kind)
    }

    /// Shortest input every stage can filter zero-phase
    pub fn min_input_len(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.transfer_function().pad_len() + 1)
            .max()
            .unwrap_or(0)
    }

    /// Run every stage over `signal` in order
    pub fn filter(&self, signal: &[f64]) -> EcgResult<Vec<f64>> {
        let mut output = signal.to_vec();
        for stage in &self.stages {
            output = stage.apply(&output)?;
            if let Some(index) = output.iter().position(|v| !v.is_finite()) {
                return Err(EcgError::NonFiniteOutput {
                    stage: stage.name(),
                    index,
                });
            }
        }
        Ok(output)
    }

    /// Filter the whole extended window, then cut and normalize its core
    pub fn process(&self, window: &ExtendedWindow) -> EcgResult<ProcessedWindow> {
        let core = window.core();
        if core.is_empty() || core.len() != window.core_len {
            return Err(EcgError::WindowLength {
                expected: window.core_len,
                actual: core.len(),
            });
        }

        let filtered = self.filter(&window.adc_values())?;
        let range = window.core_start..window.core_start + window.core_len;
        let filtered_core = filtered[range].to_vec();
        let normalized = normalize_min_max(&filtered_core, self.epsilon);

        let timestamps: Vec<u32> = core.iter().map(|s| s.timestamp_ms).collect();
        let raw: Vec<u16> = core.iter().map(|s| s.adc_value).collect();

        debug!(
            session = window.session,
            segment_id = window.segment_id,
            extended_len = window.len(),
            "filtered window"
        );

        Ok(ProcessedWindow {
            session: window.session,
            segment_id: window.segment_id,
            start_time: timestamps[0],
            end_time: timestamps[timestamps.len() - 1],
            timestamps,
            raw,
            filtered: filtered_core,
            normalized,
        })
    }
}

/// `(x - min) / (max - min + epsilon)`, computed in f64 and narrowed to f32
pub fn normalize_min_max(values: &[f64], epsilon: f64) -> Vec<f32> {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min + epsilon;
    values.iter().map(|v| ((v - min) / span) as f32).collect()
}

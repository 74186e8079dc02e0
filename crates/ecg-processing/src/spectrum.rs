//! Amplitude spectrum used to verify the cascade on real windows

use ecg_core::{EcgError, EcgResult};
use realfft::RealFftPlanner;
use std::f64::consts::PI;

/// Zero-padding factor applied on top of the next power of two
const PADDING: usize = 4;
/// Bins searched either side of the requested frequency
const PEAK_SEARCH_BINS: usize = 2;

/// One-sided, Hann-windowed amplitude spectrum
#[derive(Debug, Clone)]
pub struct Spectrum {
    amplitudes: Vec<f64>,
    resolution_hz: f64,
}

fn hann(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let t = PI * i as f64 / n as f64;
            t.sin() * t.sin()
        })
        .collect()
}

impl Spectrum {
    /// Analyze `signal` after removing its mean.
    ///
    /// Amplitudes are scaled so a pure tone reads back its peak amplitude.
    pub fn analyze(signal: &[f64], sample_rate: f64) -> EcgResult<Self> {
        if signal.len() < 4 {
            return Err(EcgError::WindowLength {
                expected: 4,
                actual: signal.len(),
            });
        }

        let n = signal.len();
        let fft_len = n.next_power_of_two() * PADDING;
        let mean = signal.iter().sum::<f64>() / n as f64;
        let window = hann(n);
        let coherent_gain: f64 = window.iter().sum();

        let mut planner = RealFftPlanner::<f64>::new();
        let r2c = planner.plan_fft_forward(fft_len);
        let mut input = r2c.make_input_vec();
        for (slot, (&x, &w)) in input.iter_mut().zip(signal.iter().zip(&window)) {
            *slot = (x - mean) * w;
        }
        let mut output = r2c.make_output_vec();
        r2c.process(&mut input, &mut output).map_err(|e| EcgError::FilterApply {
            filter: "spectrum",
            reason: e.to_string(),
        })?;

        let amplitudes = output.iter().map(|c| 2.0 * c.norm() / coherent_gain).collect();
        Ok(Spectrum {
            amplitudes,
            resolution_hz: sample_rate / fft_len as f64,
        })
    }

    pub fn resolution_hz(&self) -> f64 {
        self.resolution_hz
    }

    pub fn amplitudes(&self) -> &[f64] {
        &self.amplitudes
    }

    fn bin(&self, frequency_hz: f64) -> usize {
        ((frequency_hz / self.resolution_hz).round().max(0.0) as usize).min(self.amplitudes.len() - 1)
    }

    /// Peak amplitude near `frequency_hz`
    pub fn amplitude_at(&self, frequency_hz: f64) -> f64 {
        let centre = self.bin(frequency_hz);
        let low = centre.saturating_sub(PEAK_SEARCH_BINS);
        let high = (centre + PEAK_SEARCH_BINS).min(self.amplitudes.len() - 1);
        self.amplitudes[low..=high].iter().cloned().fold(0.0, f64::max)
    }

    /// Mean-square power between `low_hz` and `high_hz` inclusive
    pub fn band_power(&self, low_hz: f64, high_hz: f64) -> f64 {
        let (low, high) = (self.bin(low_hz), self.bin(high_hz));
        if high < low {
            return 0.0;
        }
        self.amplitudes[low..=high].iter().map(|a| a * a / 2.0).sum::<f64>() / PADDING as f64
    }

    /// Frequency of the strongest bin
    pub fn peak_frequency(&self) -> f64 {
        self.amplitudes
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i as f64 * self.resolution_hz)
            .unwrap_or(0.0)
    }
}

/// Reduction in dB of the component at `frequency_hz` from `before` to `after`
pub fn attenuation_db(before: &Spectrum, after: &Spectrum, frequency_hz: f64) -> f64 {
    let input = before.amplitude_at(frequency_hz);
    let output = after.amplitude_at(frequency_hz).max(f64::MIN_POSITIVE);
    20.0 * (input / output).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f64, amplitude: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 2048.0 + amplitude * (2.0 * PI * freq * i as f64 / 360.0).sin())
            .collect()
    }

    #[test]
    fn test_tone_amplitude_and_peak() {
        let spectrum = Spectrum::analyze(&tone(10.0, 300.0, 1024), 360.0).unwrap();
        let amplitude = spectrum.amplitude_at(10.0);
        assert!((amplitude - 300.0).abs() / 300.0 < 0.02, "amplitude {}", amplitude);
        assert!((spectrum.peak_frequency() - 10.0).abs() < 2.0 * spectrum.resolution_hz());
        assert!(spectrum.amplitude_at(90.0) < 1.0);
    }

    #[test]
    fn test_band_power_concentrates_on_tone() {
        let spectrum = Spectrum::analyze(&tone(40.0, 100.0, 1024), 360.0).unwrap();
        let in_band = spectrum.band_power(35.0, 45.0);
        let out_band = spectrum.band_power(100.0, 150.0);
        assert!(in_band > 1000.0 * out_band);
    }

    #[test]
    fn test_attenuation_between_spectra() {
        let before = Spectrum::analyze(&tone(20.0, 100.0, 1024), 360.0).unwrap();
        let after = Spectrum::analyze(&tone(20.0, 1.0, 1024), 360.0).unwrap();
        let reduction = attenuation_db(&before, &after, 20.0);
        assert!((reduction - 40.0).abs() < 0.1, "reduction {}", reduction);
    }

    #[test]
    fn test_short_signal_rejected() {
        assert!(Spectrum::analyze(&[1.0, 2.0], 360.0).is_err());
    }
}

//! Pre-defined ECG waveforms for simulation

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// One Gaussian component of the beat template: offset from the R peak
/// in seconds, amplitude relative to R, and width in seconds.
const PQRST: [(f64, f64, f64); 5] = [
    (-0.20, 0.15, 0.025), // P
    (-0.03, -0.15, 0.010), // Q
    (0.00, 1.00, 0.012),  // R
    (0.03, -0.25, 0.010), // S
    (0.25, 0.35, 0.050),  // T
];

/// Waveform shapes in ADC counts around the baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalPattern {
    /// Baseline only
    Flat,
    /// Pure tone
    Sinusoid { frequency_hz: f64, amplitude: f64 },
    /// Gaussian-sum PQRST beat repeating at `rate_bpm`
    HeartBeat { rate_bpm: f64, amplitude: f64 },
    /// Sum of the contained patterns
    Composite(Vec<SignalPattern>),
}

impl SignalPattern {
    /// Deviation from the baseline at time `t` seconds
    pub fn value_at(&self, t: f64) -> f64 {
        match self {
            SignalPattern::Flat => 0.0,
            SignalPattern::Sinusoid { frequency_hz, amplitude } => {
                amplitude * (2.0 * PI * frequency_hz * t).sin()
            }
            SignalPattern::HeartBeat { rate_bpm, amplitude } => {
                if *rate_bpm <= 0.0 {
                    return 0.0;
                }
                let period = 60.0 / rate_bpm;
                // R peak sits at 40% of the beat so P and T fit either side
                let phase = t.rem_euclid(period) - 0.4 * period;
                PQRST
                    .iter()
                    .map(|&(offset, relative, width)| {
                        let d = (phase - offset + period / 2.0).rem_euclid(period) - period / 2.0;
                        relative * (-(d * d) / (2.0 * width * width)).exp()
                    })
                    .sum::<f64>()
                    * amplitude
            }
            SignalPattern::Composite(parts) => parts.iter().map(|p| p.value_at(t)).sum(),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SignalPattern::Flat => "Flat baseline",
            SignalPattern::Sinusoid { .. } => "Sinusoid",
            SignalPattern::HeartBeat { .. } => "Normal sinus beats",
            SignalPattern::Composite(_) => "Composite",
        }
    }

    /// Common preset patterns
    pub fn presets() -> Vec<(&'static str, SignalPattern)> {
        vec![
            ("Rest", SignalPattern::HeartBeat { rate_bpm: 60.0, amplitude: 800.0 }),
            ("Normal", SignalPattern::HeartBeat { rate_bpm: 72.0, amplitude: 800.0 }),
            ("Tachycardia", SignalPattern::HeartBeat { rate_bpm: 130.0, amplitude: 700.0 }),
            (
                "Test Tone",
                SignalPattern::Sinusoid {
                    frequency_hz: 10.0,
                    amplitude: 500.0,
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_peaks_at_r_wave() {
        let pattern = SignalPattern::HeartBeat { rate_bpm: 60.0, amplitude: 1000.0 };
        let r_time = 0.4;
        let r = pattern.value_at(r_time);
        assert!(r > 950.0 && r < 1050.0, "R = {}", r);
        assert!(pattern.value_at(r_time + 0.03) < 0.0);
        // One period later the waveform repeats
        assert!((pattern.value_at(r_time + 1.0) - r).abs() < 1e-9);
    }

    #[test]
    fn test_composite_sums_parts() {
        let tone = SignalPattern::Sinusoid { frequency_hz: 10.0, amplitude: 2.0 };
        let composite = SignalPattern::Composite(vec![tone.clone(), tone.clone()]);
        let t = 0.013;
        assert!((composite.value_at(t) - 2.0 * tone.value_at(t)).abs() < 1e-12);
        assert_eq!(SignalPattern::Flat.value_at(t), 0.0);
    }

    #[test]
    fn test_presets_are_named() {
        let presets = SignalPattern::presets();
        assert!(presets.len() >= 3);
        assert!(presets.iter().all(|(name, _)| !name.is_empty()));
    }
}

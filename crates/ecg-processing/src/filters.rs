//! Digital filters for the ECG cascade
//!
//! Coefficients are designed once and applied forward-backward so the
//! cascade introduces no phase distortion.

use crate::design::{elliptic, notch, remez};
use ecg_core::{EcgError, EcgResult};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{info, warn};

/// Filter types supported by the cascade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    /// Second-order notch for mains interference
    Notch,
    /// Linear-phase equiripple FIR lowpass
    EquirippleLowpass,
    /// Elliptic IIR highpass for baseline wander
    EllipticHighpass,
}

impl FilterKind {
    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::Notch => "notch",
            FilterKind::EquirippleLowpass => "equiripple_lowpass",
            FilterKind::EllipticHighpass => "elliptic_highpass",
        }
    }
}

/// Rational transfer function `B(z) / A(z)` with `a[0] == 1`.
///
/// Numerator and denominator are zero-padded to the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferFunction {
    b: Vec<f64>,
    a: Vec<f64>,
}

impl TransferFunction {
    pub fn new(b: Vec<f64>, a: Vec<f64>) -> EcgResult<Self> {
        let a0 = a.first().copied().unwrap_or(0.0);
        if b.is_empty() || a0 == 0.0 {
            return Err(EcgError::FilterDesign {
                filter: "transfer_function",
                reason: "empty numerator or zero leading denominator coefficient".to_string(),
            });
        }
        if b.iter().chain(a.iter()).any(|c| !c.is_finite()) {
            return Err(EcgError::FilterDesign {
                filter: "transfer_function",
                reason: "non-finite coefficient".to_string(),
            });
        }

        let len = b.len().max(a.len());
        let mut b: Vec<f64> = b.iter().map(|c| c / a0).collect();
        let mut a: Vec<f64> = a.iter().map(|c| c / a0).collect();
        b.resize(len, 0.0);
        a.resize(len, 0.0);
        Ok(TransferFunction { b, a })
    }

    /// Finite impulse response with the given taps
    pub fn fir(taps: Vec<f64>) -> EcgResult<Self> {
        TransferFunction::new(taps, vec![1.0])
    }

    pub fn numerator(&self) -> &[f64] {
        &self.b
    }

    pub fn denominator(&self) -> &[f64] {
        &self.a
    }

    /// Number of delay elements
    pub fn order(&self) -> usize {
        let trailing_a = self.a.iter().rev().take_while(|c| **c == 0.0).count();
        let trailing_b = self.b.iter().rev().take_while(|c| **c == 0.0).count();
        let len = self.b.len() - trailing_a.min(trailing_b);
        len.saturating_sub(1)
    }

    /// Complex response at `frequency` for sampling rate `sample_rate`
    pub fn frequency_response(&self, frequency: f64, sample_rate: f64) -> Complex64 {
        let w = 2.0 * PI * frequency / sample_rate;
        let evaluate = |coeffs: &[f64]| {
            coeffs
                .iter()
                .enumerate()
                .fold(Complex64::new(0.0, 0.0), |acc, (k, &c)| {
                    acc + Complex64::from_polar(c, -w * k as f64)
                })
        };
        evaluate(&self.b) / evaluate(&self.a)
    }

    pub fn magnitude(&self, frequency: f64, sample_rate: f64) -> f64 {
        self.frequency_response(frequency, sample_rate).norm()
    }

    pub fn magnitude_db(&self, frequency: f64, sample_rate: f64) -> f64 {
        20.0 * self.magnitude(frequency, sample_rate).log10()
    }

    /// Filter state that yields a steady-state response to a unit step
    pub fn step_initial_conditions(&self) -> Vec<f64> {
        let n = self.b.len();
        if n < 2 {
            return Vec::new();
        }
        let (b, a) = (&self.b, &self.a);
        let mut zi = vec![0.0; n - 1];

        let a_sum: f64 = a.iter().sum();
        let c_sum: f64 = (1..n).map(|k| b[k] - a[k] * b[0]).sum();
        zi[0] = c_sum / a_sum;

        let mut a_acc = 1.0;
        let mut c_acc = 0.0;
        for k in 1..n - 1 {
            a_acc += a[k];
            c_acc += b[k] - a[k] * b[0];
            zi[k] = a_acc * zi[0] - c_acc;
        }
        zi
    }

    /// Direct form II transposed filtering; returns the output and the final state
    pub fn lfilter(&self, input: &[f64], initial: Option<&[f64]>) -> (Vec<f64>, Vec<f64>) {
        let n = self.b.len();
        let mut state = match initial {
            Some(zi) => zi.to_vec(),
            None => vec![0.0; n - 1],
        };
        state.resize(n - 1, 0.0);

        let mut output = Vec::with_capacity(input.len());
        for &x in input {
            let y = self.b[0] * x + state.first().copied().unwrap_or(0.0);
            for i in 0..n - 1 {
                let carried = if i + 2 < n { state[i + 1] } else { 0.0 };
                state[i] = self.b[i + 1] * x + carried - self.a[i + 1] * y;
            }
            output.push(y);
        }
        (output, state)
    }

    /// Number of samples reflected at each edge before zero-phase filtering
    pub fn pad_len(&self) -> usize {
        3 * self.b.len()
    }

    /// Forward-backward filtering with odd-extension padding.
    ///
    /// Each pass starts from the step steady state scaled by its first
    /// input sample, so a constant signal passes without an edge transient.
    /// Errors are reported against `filter`.
    pub fn filtfilt(&self, filter: &'static str, input: &[f64]) -> EcgResult<Vec<f64>> {
        let edge = self.pad_len();
        let len = input.len();
        if len <= edge {
            return Err(EcgError::FilterApply {
                filter,
                reason: format!("input of {} samples must be longer than the pad length {}", len, edge),
            });
        }

        let first = input[0];
        let last = input[len - 1];
        let mut extended = Vec::with_capacity(len + 2 * edge);
        extended.extend((1..=edge).rev().map(|i| 2.0 * first - input[i]));
        extended.extend_from_slice(input);
        extended.extend((1..=edge).map(|i| 2.0 * last - input[len - 1 - i]));

        let zi = self.step_initial_conditions();
        let scaled = |x0: f64| zi.iter().map(|z| z * x0).collect::<Vec<_>>();

        let (forward, _) = self.lfilter(&extended, Some(&scaled(extended[0])));
        let reversed: Vec<f64> = forward.into_iter().rev().collect();
        let (backward, _) = self.lfilter(&reversed, Some(&scaled(reversed[0])));

        Ok(backward.into_iter().rev().skip(edge).take(len).collect())
    }
}

/// A designed cascade stage
#[derive(Debug, Clone)]
pub struct FilterStage {
    kind: FilterKind,
    transfer: TransferFunction,
    sample_rate: f64,
}

impl FilterStage {
    pub fn new(kind: FilterKind, transfer: TransferFunction, sample_rate: f64) -> Self {
        FilterStage {
            kind,
            transfer,
            sample_rate,
        }
    }

    /// Mains notch at `frequency_hz`
    pub fn notch(sample_rate: f64, frequency_hz: f64, quality: f64) -> EcgResult<Self> {
        let transfer = notch::iir_notch(frequency_hz, quality, sample_rate)?;
        info!(frequency_hz, quality, "designed notch stage");
        Ok(FilterStage::new(FilterKind::Notch, transfer, sample_rate))
    }

    /// Equiripple lowpass; the tap count follows from the attenuation and transition width
    pub fn equiripple_lowpass(
        sample_rate: f64,
        passband_hz: f64,
        stopband_hz: f64,
        ripple_db: f64,
        attenuation_db: f64,
    ) -> EcgResult<Self> {
        let taps = remez::estimate_taps(passband_hz, stopband_hz, attenuation_db, sample_rate)?;
        let stopband_weight = 10f64.powf(attenuation_db / 20.0);
        let design = remez::remez(
            taps,
            &[
                remez::Band {
                    low: 0.0,
                    high: passband_hz / sample_rate,
                    desired: 1.0,
                    weight: 1.0,
                },
                remez::Band {
                    low: stopband_hz / sample_rate,
                    high: 0.5,
                    desired: 0.0,
                    weight: stopband_weight,
                },
            ],
        )?;
        if !design.converged {
            warn!(iterations = design.iterations, "equiripple exchange did not converge, using last iterate");
        }

        let transfer = TransferFunction::fir(design.taps)?;
        let stage = FilterStage::new(FilterKind::EquirippleLowpass, transfer, sample_rate);

        let passband_error_db = stage.magnitude_db(0.0).abs().max(stage.magnitude_db(passband_hz).abs());
        if passband_error_db > ripple_db {
            warn!(passband_error_db, ripple_db, "equiripple lowpass exceeds passband ripple target");
        }
        let stopband_db = stage.magnitude_db(stopband_hz);
        if stopband_db > -attenuation_db {
            warn!(stopband_db, attenuation_db, "equiripple lowpass misses stopband attenuation target");
        }

        info!(taps, passband_hz, stopband_hz, deviation = design.deviation, "designed equiripple lowpass stage");
        Ok(stage)
    }

    /// Minimum-order elliptic highpass
    pub fn elliptic_highpass(
        sample_rate: f64,
        passband_hz: f64,
        stopband_hz: f64,
        ripple_db: f64,
        attenuation_db: f64,
    ) -> EcgResult<Self> {
        let nyquist = sample_rate / 2.0;
        let (order, wn) = elliptic::min_order(passband_hz / nyquist, stopband_hz / nyquist, ripple_db, attenuation_db)?;
        let transfer = elliptic::highpass(order, ripple_db, attenuation_db, wn)?;
        info!(order, passband_hz, stopband_hz, "designed elliptic highpass stage");
        Ok(FilterStage::new(FilterKind::EllipticHighpass, transfer, sample_rate))
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn transfer_function(&self) -> &TransferFunction {
        &self.transfer
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn frequency_response(&self, frequency_hz: f64) -> Complex64 {
        self.transfer.frequency_response(frequency_hz, self.sample_rate)
    }

    /// Stage magnitude in dB at `frequency_hz`
    pub fn magnitude_db(&self, frequency_hz: f64) -> f64 {
        self.transfer.magnitude_db(frequency_hz, self.sample_rate)
    }

    /// Zero-phase application to a whole window
    pub fn apply(&self, signal: &[f64]) -> EcgResult<Vec<f64>> {
        self.transfer.filtfilt(self.name(), signal)
    }
}

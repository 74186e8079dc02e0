//! Second-order IIR notch

use crate::filters::TransferFunction;
use ecg_core::{EcgError, EcgResult};
use std::f64::consts::PI;

/// Notch at `frequency_hz` with quality factor `quality` (centre / -3 dB bandwidth)
pub fn iir_notch(frequency_hz: f64, quality: f64, sample_rate: f64) -> EcgResult<TransferFunction> {
    let nyquist = sample_rate / 2.0;
    if !(frequency_hz > 0.0 && frequency_hz < nyquist) {
        return Err(EcgError::FilterDesign {
            filter: "notch",
            reason: format!("centre {} Hz must lie in (0, {}) Hz", frequency_hz, nyquist),
        });
    }
    if quality <= 0.0 || !quality.is_finite() {
        return Err(EcgError::FilterDesign {
            filter: "notch",
            reason: format!("quality factor must be positive, got {}", quality),
        });
    }

    let w0 = 2.0 * PI * frequency_hz / sample_rate;
    let bandwidth = w0 / quality;
    // -3 dB bandwidth edges: gb = 1/sqrt(2) makes the tan() prefactor 1.
    let beta = (bandwidth / 2.0).tan();
    let gain = 1.0 / (1.0 + beta);
    let cos_w0 = w0.cos();

    TransferFunction::new(
        vec![gain, -2.0 * gain * cos_w0, gain],
        vec![1.0, -2.0 * gain * cos_w0, 2.0 * gain - 1.0],
    )
}

//! Elliptic (Cauer) IIR design: minimum order, analog prototype and digital high-pass.

use super::special::{arc_jac_sc1, ellipdeg, ellipj, ellipk, ellipk_complement};
use crate::filters::TransferFunction;
use ecg_core::{EcgError, EcgResult};
use num_complex::Complex64;
use std::f64::consts::{LN_10, PI};

const FILTER: &str = "elliptic";
const ROOT_EPSILON: f64 = 2.220_446_049_250_313e-16;

/// `10^x - 1` without cancellation for small `x`
fn pow10_minus_one(x: f64) -> f64 {
    (x * LN_10).exp_m1()
}

fn design_error(reason: impl Into<String>) -> EcgError {
    EcgError::FilterDesign {
        filter: FILTER,
        reason: reason.into(),
    }
}

/// Zeros, poles and gain of a continuous or discrete-time filter
#[derive(Debug, Clone, PartialEq)]
pub struct Zpk {
    pub zeros: Vec<Complex64>,
    pub poles: Vec<Complex64>,
    pub gain: f64,
}

impl Zpk {
    fn relative_degree(&self) -> usize {
        self.poles.len().saturating_sub(self.zeros.len())
    }

    /// Analog low-pass to high-pass substitution `s -> wo / s`
    pub fn lowpass_to_highpass(&self, wo: f64) -> Zpk {
        let degree = self.relative_degree();
        let mut zeros: Vec<Complex64> = self.zeros.iter().map(|&z| wo / z).collect();
        zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
        let poles = self.poles.iter().map(|&p| wo / p).collect();
        let ratio = product(self.zeros.iter().map(|&z| -z)) / product(self.poles.iter().map(|&p| -p));
        Zpk { zeros, poles, gain: self.gain * ratio.re }
    }

    /// Bilinear transform at sampling rate `fs`
    pub fn bilinear(&self, fs: f64) -> Zpk {
        let degree = self.relative_degree();
        let fs2 = 2.0 * fs;
        let mut zeros: Vec<Complex64> = self.zeros.iter().map(|&z| (fs2 + z) / (fs2 - z)).collect();
        zeros.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(degree));
        let poles = self.poles.iter().map(|&p| (fs2 + p) / (fs2 - p)).collect();
        let ratio = product(self.zeros.iter().map(|&z| fs2 - z)) / product(self.poles.iter().map(|&p| fs2 - p));
        Zpk { zeros, poles, gain: self.gain * ratio.re }
    }

    /// Expand to polynomial coefficients
    pub fn to_transfer_function(&self) -> EcgResult<TransferFunction> {
        let b: Vec<f64> = poly(&self.zeros).iter().map(|c| self.gain * c.re).collect();
        let a: Vec<f64> = poly(&self.poles).iter().map(|c| c.re).collect();
        TransferFunction::new(b, a)
    }
}

fn product<I: Iterator<Item = Complex64>>(values: I) -> Complex64 {
    values.fold(Complex64::new(1.0, 0.0), |acc, v| acc * v)
}

/// Monic polynomial with the given roots, highest power first
fn poly(roots: &[Complex64]) -> Vec<Complex64> {
    let mut coeffs = vec![Complex64::new(1.0, 0.0)];
    for root in roots {
        let mut next = coeffs.clone();
        next.push(Complex64::new(0.0, 0.0));
        for i in 1..next.len() {
            next[i] -= *root * coeffs[i - 1];
        }
        coeffs = next;
    }
    coeffs
}

/// Minimum elliptic order for digital band edges normalised to Nyquist (0..1).
///
/// A passband edge above the stopband edge selects a high-pass design.
/// Returns the order and the natural frequency to design at.
pub fn min_order(passband: f64, stopband: f64, ripple_db: f64, attenuation_db: f64) -> EcgResult<(usize, f64)> {
    if !(passband > 0.0 && passband < 1.0 && stopband > 0.0 && stopband < 1.0) {
        return Err(design_error(format!(
            "band edges must lie in (0, 1) of Nyquist, got passband {} stopband {}",
            passband, stopband
        )));
    }
    if passband == stopband {
        return Err(design_error("passband and stopband edges coincide"));
    }
    if ripple_db <= 0.0 || attenuation_db <= ripple_db {
        return Err(design_error(format!(
            "need 0 < ripple < attenuation, got {} dB / {} dB",
            ripple_db, attenuation_db
        )));
    }

    let passb = (PI * passband / 2.0).tan();
    let stopb = (PI * stopband / 2.0).tan();
    let selectivity = if passband > stopband { passb / stopb } else { stopb / passb };

    let stop_gain = 10f64.powf(0.1 * attenuation_db);
    let pass_gain = 10f64.powf(0.1 * ripple_db);
    let discrimination = ((pass_gain - 1.0) / (stop_gain - 1.0)).sqrt();

    let m0 = (1.0 / selectivity).powi(2);
    let m1 = discrimination.powi(2);
    let ratio = ellipk(m0) * ellipk_complement(m1) / (ellipk_complement(m0) * ellipk(m1));
    if !ratio.is_finite() {
        return Err(design_error("order estimate is not finite"));
    }

    let order = (ratio.ceil() as usize).max(1);
    Ok((order, passband))
}

/// Analog elliptic low-pass prototype with unit passband edge
pub fn analog_prototype(order: usize, ripple_db: f64, attenuation_db: f64) -> EcgResult<Zpk> {
    if order == 0 {
        return Err(design_error("order must be at least 1"));
    }

    let eps_sq = pow10_minus_one(0.1 * ripple_db);
    if order == 1 {
        let pole = -(1.0 / eps_sq).sqrt();
        return Ok(Zpk {
            zeros: Vec::new(),
            poles: vec![Complex64::new(pole, 0.0)],
            gain: -pole,
        });
    }

    let eps = eps_sq.sqrt();
    let ck1_sq = eps_sq / pow10_minus_one(0.1 * attenuation_db);
    if ck1_sq == 0.0 {
        return Err(design_error("attenuation too large for the requested ripple"));
    }

    let k_ck1 = ellipk(ck1_sq);
    let m = ellipdeg(order, ck1_sq);
    let capk = ellipk(m);

    let indices = ((1 - order % 2)..order).step_by(2);
    let jacobi: Vec<_> = indices
        .map(|j| ellipj(j as f64 * capk / order as f64, m))
        .collect();

    let mut zeros: Vec<Complex64> = jacobi
        .iter()
        .filter(|j| j.sn.abs() > ROOT_EPSILON)
        .map(|j| Complex64::new(0.0, 1.0 / (m.sqrt() * j.sn)))
        .collect();
    let conjugates: Vec<Complex64> = zeros.iter().map(|z| z.conj()).collect();
    zeros.extend(conjugates);

    let r = arc_jac_sc1(1.0 / eps, ck1_sq)
        .ok_or_else(|| design_error("inverse Jacobi function did not converge"))?;
    let v0 = capk * r / (order as f64 * k_ck1);
    let v = ellipj(v0, 1.0 - m);

    let mut poles: Vec<Complex64> = jacobi
        .iter()
        .map(|j| {
            let numerator = Complex64::new(j.cn * j.dn * v.sn * v.cn, j.sn * v.dn);
            -numerator / (1.0 - (j.dn * v.sn).powi(2))
        })
        .collect();

    if order % 2 == 1 {
        let norm = poles.iter().map(|p| p.norm_sqr()).sum::<f64>().sqrt();
        let complex_poles: Vec<Complex64> = poles
            .iter()
            .filter(|p| p.im.abs() > ROOT_EPSILON * norm)
            .map(|p| p.conj())
            .collect();
        poles.extend(complex_poles);
    } else {
        let conjugates: Vec<Complex64> = poles.iter().map(|p| p.conj()).collect();
        poles.extend(conjugates);
    }

    let mut gain = (product(poles.iter().map(|&p| -p)) / product(zeros.iter().map(|&z| -z))).re;
    if order % 2 == 0 {
        gain /= (1.0 + eps_sq).sqrt();
    }

    Ok(Zpk { zeros, poles, gain })
}

/// Digital elliptic high-pass with passband edge `wn` (normalised to Nyquist)
pub fn highpass(order: usize, ripple_db: f64, attenuation_db: f64, wn: f64) -> EcgResult<TransferFunction> {
    if !(wn > 0.0 && wn < 1.0) {
        return Err(design_error(format!("cutoff {} outside (0, 1) of Nyquist", wn)));
    }
    // Prewarp for a bilinear transform at fs = 2.
    let fs = 2.0;
    let warped = 2.0 * fs * (PI * wn / fs).tan();
    analog_prototype(order, ripple_db, attenuation_db)?
        .lowpass_to_highpass(warped)
        .bilinear(fs)
        .to_transfer_function()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: f64 = 360.0;

    #[test]
    fn test_min_order_for_baseline_highpass() {
        let (order, wn) = min_order(1.0 / 180.0, 0.05 / 180.0, 0.5, 40.0).unwrap();
        assert_eq!(order, 2);
        assert!((wn - 1.0 / 180.0).abs() < 1e-15);
    }

    #[test]
    fn test_min_order_rejects_bad_edges() {
        assert!(min_order(1.2, 0.1, 0.5, 40.0).is_err());
        assert!(min_order(0.1, 0.1, 0.5, 40.0).is_err());
        assert!(min_order(0.1, 0.05, 40.0, 0.5).is_err());
    }

    #[test]
    fn test_prototype_passband_edge_and_stopband() {
        let proto = analog_prototype(4, 0.5, 40.0).unwrap();
        assert_eq!(proto.poles.len(), 4);
        assert_eq!(proto.zeros.len(), 4);
        assert!(proto.poles.iter().all(|p| p.re < 0.0));

        let response = |w: f64| {
            let s = Complex64::new(0.0, w);
            let num = product(proto.zeros.iter().map(|&z| s - z));
            let den = product(proto.poles.iter().map(|&p| s - p));
            (proto.gain * num / den).norm()
        };
        // Ripple bound at the passband edge, attenuation well into the stopband.
        let edge_db = 20.0 * response(1.0).log10();
        assert!((edge_db + 0.5).abs() < 1e-4, "edge {} dB", edge_db);
        assert!(20.0 * response(10.0).log10() <= -40.0 + 1e-4);
    }

    #[test]
    fn test_highpass_response() {
        let (order, wn) = min_order(1.0 / 180.0, 0.05 / 180.0, 0.5, 40.0).unwrap();
        let tf = highpass(order, 0.5, 40.0, wn).unwrap();
        assert_eq!(tf.order(), 2);

        let passband_edge = tf.magnitude_db(1.0, FS);
        assert!(passband_edge > -0.5 - 1e-3 && passband_edge < 1e-9, "1 Hz: {}", passband_edge);
        let passband = tf.magnitude_db(10.0, FS);
        assert!(passband > -0.5 - 1e-3 && passband < 1e-9, "10 Hz: {}", passband);
        let stopband = tf.magnitude_db(0.05, FS);
        assert!(stopband <= -40.0 + 1e-3, "0.05 Hz: {}", stopband);
    }
}

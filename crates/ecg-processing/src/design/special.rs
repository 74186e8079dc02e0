//! Elliptic integrals and Jacobi elliptic functions used by the elliptic designer.
//!
//! All functions take the parameter `m = k²`, not the modulus `k`.

use num_complex::Complex64;
use std::f64::consts::{FRAC_PI_2, PI};

const MAX_AGM_STEPS: usize = 32;
const MAX_LANDEN_STEPS: usize = 10;

/// Arithmetic-geometric mean of `a` and `b`
fn agm(mut a: f64, mut b: f64) -> f64 {
    for _ in 0..MAX_AGM_STEPS {
        if (a - b).abs() <= f64::EPSILON * a {
            break;
        }
        let next = 0.5 * (a + b);
        b = (a * b).sqrt();
        a = next;
    }
    a
}

/// Complete elliptic integral of the first kind, K(m)
pub fn ellipk(m: f64) -> f64 {
    ellipk_complement(1.0 - m)
}

/// K(1 - p), accurate for small `p` where `ellipk(1 - p)` would cancel
pub fn ellipk_complement(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::INFINITY;
    }
    FRAC_PI_2 / agm(1.0, p.sqrt())
}

/// Values of the Jacobi elliptic functions at one argument
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jacobi {
    pub sn: f64,
    pub cn: f64,
    pub dn: f64,
    /// Amplitude φ with sn = sin φ
    pub ph: f64,
}

/// Jacobi elliptic functions sn, cn, dn of `u` for parameter `m` in `[0, 1]`
pub fn ellipj(u: f64, m: f64) -> Jacobi {
    if m < 1.0e-9 {
        let t = u.sin();
        let b = u.cos();
        let ai = 0.25 * m * (u - t * b);
        return Jacobi {
            sn: t - ai * b,
            cn: b + ai * t,
            dn: 1.0 - 0.5 * m * t * t,
            ph: u - ai,
        };
    }

    if m >= 0.999_999_999_9 {
        let ai = 0.25 * (1.0 - m);
        let b = u.cosh();
        let t = u.tanh();
        let phi = 1.0 / b;
        let twon = b * u.sinh();
        let scaled = ai * t * phi;
        return Jacobi {
            sn: t + ai * (twon - u) / (b * b),
            cn: phi - scaled * (twon - u),
            dn: phi + scaled * (twon + u),
            ph: 2.0 * u.exp().atan() - FRAC_PI_2 + ai * (twon - u) / b,
        };
    }

    // Descending AGM scale, then backward recurrence on the amplitude.
    let mut a = vec![1.0];
    let mut c = vec![m.sqrt()];
    let mut b = (1.0 - m).sqrt();
    let mut twon = 1.0;
    while (c[c.len() - 1] / a[a.len() - 1]).abs() > f64::EPSILON && a.len() <= MAX_LANDEN_STEPS {
        let ai = a[a.len() - 1];
        c.push(0.5 * (ai - b));
        let geometric = (ai * b).sqrt();
        a.push(0.5 * (ai + b));
        b = geometric;
        twon *= 2.0;
    }

    let last = a.len() - 1;
    let mut phi = twon * a[last] * u;
    let mut previous = phi;
    for i in (1..=last).rev() {
        let t = c[i] * phi.sin() / a[i];
        previous = phi;
        phi = 0.5 * (t.asin() + phi);
    }

    let sn = phi.sin();
    let cn = phi.cos();
    let dn_factor = (phi - previous).cos();
    let dn = if dn_factor.abs() < 0.1 {
        (1.0 - m * sn * sn).sqrt()
    } else {
        cn / dn_factor
    };

    Jacobi { sn, cn, dn, ph: phi }
}

/// Inverse of the Jacobi sn function for complex argument, via Landen's transformation.
///
/// Returns `None` when `m` is outside `[0, 1]` or the transformation fails to settle.
pub fn arc_jac_sn(w: Complex64, m: f64) -> Option<Complex64> {
    if !(0.0..=1.0).contains(&m) {
        return None;
    }
    let k = m.sqrt();
    if k == 1.0 {
        return Some(w.atanh());
    }

    let mut moduli = vec![k];
    while moduli[moduli.len() - 1] != 0.0 {
        if moduli.len() > MAX_LANDEN_STEPS {
            return None;
        }
        let kn = moduli[moduli.len() - 1];
        let kn_prime = ((1.0 - kn) * (1.0 + kn)).sqrt();
        moduli.push((1.0 - kn_prime) / (1.0 + kn_prime));
    }

    let quarter_period = moduli[1..].iter().map(|kn| 1.0 + kn).product::<f64>() * FRAC_PI_2;

    let mut wn = w;
    for pair in moduli.windows(2) {
        let (kn, knext) = (pair[0], pair[1]);
        let complement = ((1.0 - kn * wn) * (1.0 + kn * wn)).sqrt();
        wn = 2.0 * wn / ((1.0 + knext) * (1.0 + complement));
    }

    Some(wn.asin() * (2.0 / PI) * quarter_period)
}

/// Real inverse of the Jacobi sc function with complementary parameter
pub fn arc_jac_sc1(w: f64, m: f64) -> Option<f64> {
    let z = arc_jac_sn(Complex64::new(0.0, w), m)?;
    if z.re.abs() > 1e-14 {
        return None;
    }
    Some(z.im)
}

/// Solve the degree equation for the elliptic parameter of an order-`n` filter
pub fn ellipdeg(n: usize, m1: f64) -> f64 {
    const TERMS: i32 = 7;
    let k1 = ellipk(m1);
    let k1_prime = ellipk_complement(m1);
    let q1 = (-PI * k1_prime / k1).exp();
    let q = q1.powf(1.0 / n as f64);
    let num: f64 = (0..=TERMS).map(|i| q.powi(i * (i + 1))).sum();
    let den = 1.0 + 2.0 * (1..=TERMS + 1).map(|i| q.powi(i * i)).sum::<f64>();
    16.0 * q * (num / den).powi(4)
}

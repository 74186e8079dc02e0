//! Parks-McClellan equiripple design for symmetric odd-length FIR filters.
//!
//! Frequencies are in cycles per sample (0 to 0.5).

use ecg_core::{EcgError, EcgResult};
use std::f64::consts::PI;
use tracing::debug;

const FILTER: &str = "equiripple";
const GRID_DENSITY: usize = 16;
const MAX_ITERATIONS: usize = 40;
const CONVERGENCE_TOLERANCE: f64 = 1e-6;

fn design_error(reason: impl Into<String>) -> EcgError {
    EcgError::FilterDesign {
        filter: FILTER,
        reason: reason.into(),
    }
}

/// One approximation band with piecewise-constant target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub low: f64,
    pub high: f64,
    pub desired: f64,
    pub weight: f64,
}

/// Result of an exchange run
#[derive(Debug, Clone)]
pub struct RemezDesign {
    pub taps: Vec<f64>,
    /// Weighted peak error on the final extremal set
    pub deviation: f64,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Debug, Clone, Copy)]
struct GridPoint {
    freq: f64,
    desired: f64,
    weight: f64,
}

/// Kaiser's estimate of the tap count for the given edges, rounded up to odd
pub fn estimate_taps(passband_hz: f64, stopband_hz: f64, attenuation_db: f64, sample_rate: f64) -> EcgResult<usize> {
    let nyquist = sample_rate / 2.0;
    let width = (stopband_hz - passband_hz) / nyquist;
    if width <= 0.0 || width > 1.0 {
        return Err(design_error(format!(
            "transition band {}..{} Hz is empty or exceeds Nyquist",
            passband_hz, stopband_hz
        )));
    }
    let estimate = ((attenuation_db - 7.95) / (2.285 * width * PI)).ceil();
    let taps = (estimate.max(1.0) as usize + 1).max(3);
    Ok(if taps % 2 == 0 { taps + 1 } else { taps })
}

fn build_grid(bands: &[Band], delf: f64) -> Vec<GridPoint> {
    let mut grid = Vec::new();
    for band in bands {
        // A band whose edges coincide still contributes its single frequency.
        let points = (((band.high - band.low) / delf).round() as usize).max(1);
        for i in 0..points {
            grid.push(GridPoint {
                freq: band.low + i as f64 * delf,
                desired: band.desired,
                weight: band.weight,
            });
        }
        if let Some(last) = grid.last_mut() {
            last.freq = band.high;
        }
    }
    grid
}

/// Barycentric weights over the extremal abscissae, scaled by 2 per factor against underflow
fn barycentric_weights(x: &[f64]) -> Vec<f64> {
    x.iter()
        .enumerate()
        .map(|(i, &xi)| {
            let denom: f64 = x
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, &xj)| 2.0 * (xi - xj))
                .product();
            let denom = if denom.abs() < 1e-300 { 1e-300_f64.copysign(denom) } else { denom };
            1.0 / denom
        })
        .collect()
}

/// Barycentric form of the current best approximation on the extremal set
struct Interpolant {
    x: Vec<f64>,
    weights: Vec<f64>,
    y: Vec<f64>,
    delta: f64,
}

impl Interpolant {
    fn fit(grid: &[GridPoint], cosines: &[f64], extremals: &[usize]) -> Self {
        let x: Vec<f64> = extremals.iter().map(|&i| cosines[i]).collect();
        let weights = barycentric_weights(&x);

        let mut numer = 0.0;
        let mut denom = 0.0;
        let mut sign = 1.0;
        for (k, &i) in extremals.iter().enumerate() {
            numer += weights[k] * grid[i].desired;
            denom += sign * weights[k] / grid[i].weight;
            sign = -sign;
        }
        let delta = numer / denom;

        let mut sign = 1.0;
        let y = extremals
            .iter()
            .map(|&i| {
                let value = grid[i].desired - sign * delta / grid[i].weight;
                sign = -sign;
                value
            })
            .collect();

        Interpolant { x, weights, y, delta }
    }

    fn evaluate(&self, xc: f64) -> f64 {
        let mut numer = 0.0;
        let mut denom = 0.0;
        for ((&xi, &wi), &yi) in self.x.iter().zip(&self.weights).zip(&self.y) {
            let diff = xc - xi;
            if diff.abs() < 1e-7 {
                return yi;
            }
            let c = wi / diff;
            numer += c * yi;
            denom += c;
        }
        numer / denom
    }
}

/// Local extrema of the weighted error, reduced to `count` alternating points
fn select_extrema(error: &[f64], count: usize) -> Option<Vec<usize>> {
    let n = error.len();
    let mut found = Vec::new();

    if (error[0] > 0.0 && error[0] > error[1]) || (error[0] < 0.0 && error[0] < error[1]) {
        found.push(0);
    }
    for i in 1..n - 1 {
        let e = error[i];
        if (e >= error[i - 1] && e > error[i + 1] && e > 0.0)
            || (e <= error[i - 1] && e < error[i + 1] && e < 0.0)
        {
            found.push(i);
        }
    }
    let last = n - 1;
    if (error[last] > 0.0 && error[last] > error[last - 1])
        || (error[last] < 0.0 && error[last] < error[last - 1])
    {
        found.push(last);
    }

    // Collapse runs of equal sign to their largest member.
    let mut alternating: Vec<usize> = Vec::with_capacity(found.len());
    for idx in found {
        match alternating.last_mut() {
            Some(prev) if error[*prev].signum() == error[idx].signum() => {
                if error[idx].abs() > error[*prev].abs() {
                    *prev = idx;
                }
            }
            _ => alternating.push(idx),
        }
    }

    // Trim from whichever end carries the smaller error.
    while alternating.len() > count {
        let first = error[alternating[0]].abs();
        let last = error[alternating[alternating.len() - 1]].abs();
        if first < last {
            alternating.remove(0);
        } else {
            alternating.pop();
        }
    }

    (alternating.len() == count).then_some(alternating)
}

/// Design a symmetric FIR filter with `numtaps` taps (must be odd)
pub fn remez(numtaps: usize, bands: &[Band]) -> EcgResult<RemezDesign> {
    if numtaps < 3 || numtaps % 2 == 0 {
        return Err(design_error(format!("tap count must be odd and at least 3, got {}", numtaps)));
    }
    if bands.is_empty() {
        return Err(design_error("no bands given"));
    }
    for pair in bands.windows(2) {
        if pair[1].low < pair[0].high {
            return Err(design_error("bands overlap or are out of order"));
        }
    }
    for band in bands {
        if !(0.0..=0.5).contains(&band.low) || !(0.0..=0.5).contains(&band.high) || band.high < band.low {
            return Err(design_error(format!("band {}..{} outside 0..0.5", band.low, band.high)));
        }
        if band.weight <= 0.0 {
            return Err(design_error("band weights must be positive"));
        }
    }

    let r = numtaps / 2 + 1;
    let delf = 0.5 / (GRID_DENSITY * r) as f64;
    let grid = build_grid(bands, delf);
    if grid.len() < r + 1 {
        return Err(design_error(format!("grid of {} points is too small for {} taps", grid.len(), numtaps)));
    }

    let cosines: Vec<f64> = grid.iter().map(|p| (2.0 * PI * p.freq).cos()).collect();
    let mut extremals: Vec<usize> = (0..=r).map(|i| i * (grid.len() - 1) / r).collect();

    let mut interpolant = Interpolant::fit(&grid, &cosines, &extremals);
    let mut deviation = interpolant.delta.abs();
    let mut iterations = 0;
    let mut converged = false;

    while iterations < MAX_ITERATIONS {
        iterations += 1;

        let error: Vec<f64> = grid
            .iter()
            .zip(&cosines)
            .map(|(p, &c)| p.weight * (p.desired - interpolant.evaluate(c)))
            .collect();

        let Some(next) = select_extrema(&error, r + 1) else {
            debug!(iterations, "extremal search lost alternation, keeping previous set");
            break;
        };

        let magnitudes: Vec<f64> = next.iter().map(|&i| error[i].abs()).collect();
        let max = magnitudes.iter().cloned().fold(0.0, f64::max);
        let min = magnitudes.iter().cloned().fold(f64::INFINITY, f64::min);
        deviation = max;

        if max == 0.0 || (max - min) / max < CONVERGENCE_TOLERANCE {
            converged = true;
            break;
        }

        extremals = next;
        interpolant = Interpolant::fit(&grid, &cosines, &extremals);
    }

    // Sample the amplitude response on the DFT grid and invert it.
    let half = (numtaps - 1) / 2;
    let amplitudes: Vec<f64> = (0..=half)
        .map(|k| interpolant.evaluate((2.0 * PI * k as f64 / numtaps as f64).cos()))
        .collect();

    let taps = (0..numtaps)
        .map(|n| {
            let offset = n as f64 - half as f64;
            let mut value = amplitudes[0];
            for (k, &a) in amplitudes.iter().enumerate().skip(1) {
                value += 2.0 * a * (2.0 * PI * k as f64 * offset / numtaps as f64).cos();
            }
            value / numtaps as f64
        })
        .collect();

    Ok(RemezDesign { taps, deviation, iterations, converged })
}

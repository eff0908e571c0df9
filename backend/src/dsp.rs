//! Per-integration signal processing: visibility spectra from lag
//! vectors and the linear phase fit that yields group delay and mean
//! phase.

use std::f64::consts::PI;

use num_complex::Complex64;
use rustfft::FftPlanner;

const TAU: f64 = 2.0 * PI;

/// Visibility spectrum of a lag vector.
///
/// The zero lag sits at index L/2, so the two halves are swapped before
/// the FFT and the spectrum is recentered afterwards. The length-L
/// vector folds to L-1 points with bins -(L/2-1)..=(L/2-1).
pub fn visibility(lags: &[Complex64]) -> Vec<Complex64> {
    let l = lags.len();
    let mut buf: Vec<Complex64> = lags[l / 2..]
        .iter()
        .chain(lags[1..l / 2].iter())
        .copied()
        .collect();
    FftPlanner::<f64>::new().plan_fft_forward(buf.len()).process(&mut buf);
    fftshift(&buf)
}

/// Frequency bin indices matching `visibility`'s output order.
pub fn visibility_freqs(lags: usize) -> Vec<f64> {
    let half = lags as i64 / 2 - 1;
    (-half..=half).map(|f| f as f64).collect()
}

fn fftshift(spectrum: &[Complex64]) -> Vec<Complex64> {
    let split = (spectrum.len() + 1) / 2;
    spectrum[split..]
        .iter()
        .chain(spectrum[..split].iter())
        .copied()
        .collect()
}

/// Remove 2-pi jumps along a phase sequence (discontinuity threshold pi).
pub fn unwrap_phases(phases: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phases.len());
    let Some(&first) = phases.first() else {
        return out;
    };
    out.push(first);
    let mut offset = 0.0;
    for pair in phases.windows(2) {
        let mut step = pair[1] - pair[0];
        while step > PI {
            step -= TAU;
            offset -= TAU;
        }
        while step < -PI {
            step += TAU;
            offset += TAU;
        }
        out.push(pair[1] + offset);
    }
    out
}

/// Least-squares line through (x, y); returns (slope, intercept).
pub fn linear_fit(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let sx: f64 = x.iter().sum();
    let sy: f64 = y.iter().sum();
    let sxx: f64 = x.iter().map(|v| v * v).sum();
    let sxy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
    let denom = n * sxx - sx * sx;
    if denom.abs() < f64::EPSILON {
        return (0.0, if n > 0.0 { sy / n } else { 0.0 });
    }
    let slope = (n * sxy - sx * sy) / denom;
    let intercept = (sy - slope * sx) / n;
    (slope, intercept)
}

/// Unwrap the phases and fit a line against the frequency bins.
/// Returns ((slope, intercept), fitted values).
pub fn phase_fit(freqs: &[f64], phases: &[f64]) -> ((f64, f64), Vec<f64>) {
    let unwrapped = unwrap_phases(phases);
    let (m, c) = linear_fit(freqs, &unwrapped);
    let fitted = freqs.iter().map(|&f| m * f + c).collect();
    ((m, c), fitted)
}

/// Group delay in ns from the phase slope over the lag spectrum.
pub fn slope_to_delay_ns(slope: f64, bandwidth_hz: f64, lags: usize) -> f64 {
    slope * 1e9 / ((bandwidth_hz / lags as f64) * 1.024 * TAU)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_folds_to_l_minus_one_points() {
        let lags: Vec<Complex64> = (0..16).map(|i| Complex64::new(i as f64, 0.0)).collect();
        assert_eq!(visibility(&lags).len(), 15);
        assert_eq!(visibility_freqs(16), (-7..=7).map(f64::from).collect::<Vec<_>>());
    }

    #[test]
    fn centered_impulse_gives_flat_phase() {
        // A unit peak at the zero lag transforms to a constant spectrum.
        let mut lags = vec![Complex64::new(0.0, 0.0); 16];
        lags[8] = Complex64::new(1.0, 0.0);
        let vis = visibility(&lags);
        for v in &vis {
            assert!((v.re - 1.0).abs() < 1e-9);
            assert!(v.im.abs() < 1e-9);
        }
    }

    #[test]
    fn unwrap_removes_wraps() {
        let wrapped = vec![3.0, -3.0, 3.0];
        let unwrapped = unwrap_phases(&wrapped);
        assert!((unwrapped[1] - (TAU - 3.0)).abs() < 1e-12);
        for pair in unwrapped.windows(2) {
            assert!((pair[1] - pair[0]).abs() <= PI + 1e-12);
        }
    }

    #[test]
    fn fit_recovers_a_linear_ramp() {
        let freqs = visibility_freqs(16);
        let phases: Vec<f64> = freqs.iter().map(|f| 0.21 * f - 0.4).collect();
        let ((m, c), fitted) = phase_fit(&freqs, &phases);
        assert!((m - 0.21).abs() < 1e-9);
        assert!((c + 0.4).abs() < 1e-9);
        assert_eq!(fitted.len(), freqs.len());
    }

    #[test]
    fn fit_survives_wrapped_input() {
        // Slope steep enough that raw angles wrap twice across the band.
        let freqs = visibility_freqs(16);
        let phases: Vec<f64> = freqs
            .iter()
            .map(|f| {
                let p = 1.1 * f + 0.2;
                (p + PI).rem_euclid(TAU) - PI
            })
            .collect();
        let ((m, c), _) = phase_fit(&freqs, &phases);
        assert!((m - 1.1).abs() < 1e-9);
        // Intercept can land a whole turn away after unwrapping.
        let residual = (c - 0.2).rem_euclid(TAU);
        assert!(residual < 1e-9 || (TAU - residual) < 1e-9);
    }

    #[test]
    fn std_dev_matches_hand_computation() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!((mean(&values) - 2.5).abs() < 1e-12);
        assert!((std_dev(&values) - (1.25f64).sqrt()).abs() < 1e-12);
    }
}

//! Kalman-filter spectral significance.
//!
//! A genuine transient seen through the synthesized beam has a spectrum
//! that varies slowly across the band, while noise is independent from
//! channel to channel.  The detector runs a scalar Kalman filter along the
//! channel axis, modelling the signal amplitude as a random walk whose
//! step variance is `sig_t²`, and reports how much more likely the
//! spectrum is under that model than under pure noise.
//!
//! The raw log-likelihood ratio has no closed-form null distribution, so
//! [`prepare_coeffs`] calibrates it by Monte Carlo: the upper tail of the
//! null scores is approximated as exponential and fitted with a straight
//! line mapping score to `-log₂(p)`.  [`significance`] then converts the
//! best calibrated score to natural-log units, and [`combined_snr`] merges
//! it with the image-plane significance.

use std::f64::consts::{LN_2, PI};

use log::{debug, info};
use ndarray::{Array3, ArrayView2, ArrayView4};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use statrs::statistics::Statistics;

use crate::image::median;

/// Multiples of the median channel noise used as smoothness scales when
/// none are given.
pub const DEFAULT_SCALE_FACTORS: [f64; 4] = [0.3, 0.1, 0.03, 0.01];

/// Monte-Carlo trials per smoothness scale.
pub const DEFAULT_TRIALS: usize = 10_000;

/// Tail quantiles `1 - 2^-i` fitted for `i` in this range.
const TAIL_ORDERS: std::ops::RangeInclusive<i32> = 3..=9;

/// Calibrated detector: one linear map per smoothness scale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KalmanModel {
    /// Smoothness scales `sig_t`, in spectrum units.
    pub sig_ts: Vec<f64>,

    /// `(slope, intercept)` turning a raw score into `-log₂ p`.
    pub coeffs: Vec<(f64, f64)>,
}

impl KalmanModel {
    pub fn len(&self) -> usize {
        self.sig_ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sig_ts.is_empty()
    }
}

/// Default smoothness scales for a noise spectrum.
pub fn default_sig_ts(spec_std: &[f64]) -> Vec<f64> {
    let med = median(spec_std.iter().copied()).unwrap_or(0.0);
    DEFAULT_SCALE_FACTORS.iter().map(|f| f * med).collect()
}

#[inline]
fn usable_variance(std: f64) -> Option<f64> {
    let var = std * std;
    if var > 0.0 && var.is_finite() {
        Some(var)
    } else {
        None
    }
}

/// Log-likelihood ratio of `spec` under a smoothly varying signal model
/// versus noise alone.
///
/// Channels are processed strictly in order; the filter state carries
/// from each channel to the next.  The spectrum is mean-subtracted first;
/// the filter starts from the raw mean with variance `median(spec_std)²`.
/// Channels with zero or non-finite noise are skipped by both models.
pub fn filter_detector(spec: &[f64], spec_std: &[f64], sig_t: f64) -> f64 {
    let n = spec.len().min(spec_std.len());
    if n == 0 {
        return 0.0;
    }
    let mean = spec[..n].iter().sum::<f64>() / n as f64;
    let sig_0 = median(spec_std[..n].iter().copied()).unwrap_or(0.0);
    let process_v = sig_t * sig_t;

    let mut cur_mu = mean;
    let mut cur_state_v = sig_0 * sig_0;
    let mut cur_log_l = 0.0;
    let mut h0_log_l = 0.0;

    for (&raw, &std) in spec[..n].iter().zip(&spec_std[..n]) {
        let Some(cur_spec_v) = usable_variance(std) else {
            continue;
        };
        let cur_z = raw - mean;

        // consistency of this channel with the prediction
        let total_v = cur_state_v + cur_spec_v + process_v;
        cur_log_l += -(cur_z - cur_mu).powi(2) / total_v / 2.0 - 0.5 * (2.0 * PI * total_v).ln();

        // update
        if cur_state_v > 0.0 {
            cur_mu = (cur_mu / cur_state_v + cur_z / cur_spec_v) / (1.0 / cur_state_v + 1.0 / cur_spec_v);
            cur_state_v = cur_spec_v * cur_state_v / (cur_spec_v + cur_state_v) + process_v;
        } else {
            cur_state_v = process_v;
        }

        h0_log_l += -cur_z * cur_z / cur_spec_v / 2.0 - 0.5 * (2.0 * PI * cur_spec_v).ln();
    }

    cur_log_l - h0_log_l
}

/// Percentile with linear interpolation between order statistics, `pct`
/// in `[0, 100]`.  `sorted` must be ascending and non-empty.
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Least-squares line through `(x, y)`, as `(slope, intercept)`.
fn linear_fit(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|xi| (xi - mx).powi(2)).sum();
    let sxy: f64 = x.iter().zip(y).map(|(xi, yi)| (xi - mx) * (yi - my)).sum();
    if sxx > 0.0 {
        let slope = sxy / sxx;
        (slope, my - slope * mx)
    } else {
        (0.0, my)
    }
}

/// Null-hypothesis scores of `n_trial` noise spectra.
fn null_scores(spec_std: &[f64], sig_t: f64, n_trial: usize, seed: u64) -> Vec<f64> {
    (0..n_trial)
        .into_par_iter()
        .map(|trial| {
            let mut rng = StdRng::seed_from_u64(seed ^ (trial as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            let mut noise: Vec<f64> = spec_std
                .iter()
                .map(|&s| match Normal::new(0.0, s.abs()) {
                    Ok(dist) => dist.sample(&mut rng),
                    Err(_) => 0.0,
                })
                .collect();
            let mean = noise.iter().sum::<f64>() / noise.len().max(1) as f64;
            noise.iter_mut().for_each(|v| *v -= mean);
            filter_detector(&noise, spec_std, sig_t)
        })
        .collect()
}

/// Calibrate the detector against simulated noise with per-channel
/// standard deviation `spec_std`.
///
/// `sig_ts` defaults to [`default_sig_ts`].  Trials are seeded from `rng`
/// so a given seed reproduces the same model on any thread count.
pub fn prepare_coeffs<R: Rng + ?Sized>(
    spec_std: &[f64],
    sig_ts: Option<&[f64]>,
    n_trial: usize,
    rng: &mut R,
) -> KalmanModel {
    let sig_ts = match sig_ts {
        Some(scales) => scales.to_vec(),
        None => default_sig_ts(spec_std),
    };
    info!("Measuring Kalman significance distribution for sig_ts {:?}", sig_ts);

    let orders: Vec<f64> = TAIL_ORDERS.map(f64::from).collect();
    let coeffs = sig_ts
        .iter()
        .map(|&sig_t| {
            let mut scores = null_scores(spec_std, sig_t, n_trial.max(2), rng.gen());
            scores.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let tail: Vec<f64> = TAIL_ORDERS
                .map(|i| percentile(&scores, 100.0 * (1.0 - 2f64.powi(-i))))
                .collect();
            linear_fit(&tail, &orders)
        })
        .collect();

    KalmanModel { sig_ts, coeffs }
}

/// Calibrated Kalman significance of `spec` in natural-log units: the best
/// of the per-scale calibrated scores, times ln 2.
pub fn significance(spec: &[f64], spec_std: &[f64], model: &KalmanModel) -> f64 {
    debug!("Calculating max Kalman significance for {} channel spectrum", spec.len());
    let best = model
        .sig_ts
        .iter()
        .zip(&model.coeffs)
        .map(|(&sig_t, &(slope, intercept))| slope * filter_detector(spec, spec_std, sig_t) + intercept)
        .fold(f64::NEG_INFINITY, f64::max);
    if best.is_finite() {
        best * LN_2
    } else {
        0.0
    }
}

/// `-ln P(X > snr)` for a standard normal `X`.
///
/// Uses the asymptotic tail expansion where the direct survival function
/// underflows.
pub fn image_significance(snr: f64) -> f64 {
    let sf = 0.5 * erfc(snr / std::f64::consts::SQRT_2);
    if sf > 1e-300 {
        -sf.ln()
    } else {
        let x2 = snr * snr;
        x2 / 2.0 + snr.ln() + 0.5 * (2.0 * PI).ln() - (1.0 - 1.0 / x2 + 3.0 / (x2 * x2)).ln()
    }
}

/// Combined SNR of image and spectral evidence,
/// `sqrt(2·(kalman + image))`; zero when the total is not positive.
pub fn combined_snr(kalman_significance: f64, image_significance: f64) -> f64 {
    let total = kalman_significance + image_significance;
    if total > 0.0 {
        (2.0 * total).sqrt()
    } else {
        0.0
    }
}

/// Per-channel standard deviation over the selected integrations of the
/// real spectrum (mean over baselines and polarizations).
pub fn spectrum_std(data: ArrayView4<'_, Complex32>, integrations: &[usize]) -> Vec<f64> {
    let (_, nbl, nchan, npol) = data.dim();
    let count = (nbl * npol).max(1) as f64;
    let spectra: Vec<Vec<f64>> = integrations
        .iter()
        .map(|&i| {
            (0..nchan)
                .map(|k| {
                    let mut sum = 0.0;
                    for j in 0..nbl {
                        for l in 0..npol {
                            sum += data[[i, j, k, l]].re as f64;
                        }
                    }
                    sum / count
                })
                .collect()
        })
        .collect();
    std_over_rows(&spectra, nchan)
}

fn std_over_rows(rows: &[Vec<f64>], ncol: usize) -> Vec<f64> {
    if rows.is_empty() {
        return vec![0.0; ncol];
    }
    (0..ncol)
        .map(|k| rows.iter().map(|r| r[k]).population_std_dev())
        .collect()
}

/// Kalman-combined SNR of a stored candidate snippet.
///
/// `snippet` is `(time, channel, pol)` as held by a candidate; `on` is the
/// integration of the pulse and `off` the integrations used to measure the
/// channel noise.  Image SNR is peak over standard deviation.
pub fn candidate_significance<R: Rng + ?Sized>(
    snippet: &Array3<Complex32>,
    image: ArrayView2<'_, f32>,
    on: usize,
    off: &[usize],
    n_trial: usize,
    rng: &mut R,
) -> f64 {
    let (_, nchan, npol) = snippet.dim();
    let spectrum_at = |i: usize| -> Vec<f64> {
        (0..nchan)
            .map(|k| (0..npol).map(|l| snippet[[i, k, l]].re as f64).sum::<f64>() / npol.max(1) as f64)
            .collect()
    };
    let off_spectra: Vec<Vec<f64>> = off.iter().map(|&i| spectrum_at(i)).collect();
    let spec_std = std_over_rows(&off_spectra, nchan);
    let spec = spectrum_at(on);

    let model = prepare_coeffs(&spec_std, None, n_trial, rng);
    let significance_kalman = significance(&spec, &spec_std, &model);

    let n = image.len().max(1) as f64;
    let mean = image.iter().map(|&v| v as f64).sum::<f64>() / n;
    let std = (image.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n).sqrt();
    let max = image.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let snr_image = crate::image::snr_or_zero(max, std);

    combined_snr(significance_kalman, image_significance(snr_image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array2, Array4};

    fn smooth_profile(nchan: usize) -> Vec<f64> {
        (0..nchan)
            .map(|k| (2.0 * PI * k as f64 / nchan as f64).sin())
            .collect()
    }

    #[test]
    fn score_grows_with_injected_amplitude() {
        let nchan = 64;
        let spec_std = vec![1.0; nchan];
        let profile = smooth_profile(nchan);
        let scores: Vec<f64> = [0.5, 1.0, 2.0, 4.0, 8.0]
            .iter()
            .map(|amp| {
                let spec: Vec<f64> = profile.iter().map(|p| amp * p).collect();
                filter_detector(&spec, &spec_std, 0.3)
            })
            .collect();
        assert!(scores.windows(2).all(|w| w[1] > w[0]), "{scores:?}");
    }

    #[test]
    fn filter_depends_on_channel_order() {
        let spec_std = vec![1.0; 32];
        let spec: Vec<f64> = smooth_profile(32).iter().map(|p| 4.0 * p).collect();
        let mut shuffled = spec.clone();
        for k in (0..32).step_by(2) {
            shuffled.swap(k, 31 - k);
        }
        let ordered = filter_detector(&spec, &spec_std, 0.3);
        let scrambled = filter_detector(&shuffled, &spec_std, 0.3);
        assert!(ordered > scrambled);
    }

    #[test]
    fn calibration_gives_positive_slopes_and_is_reproducible() {
        let spec_std = vec![0.5; 24];
        let model = prepare_coeffs(&spec_std, None, 2000, &mut StdRng::seed_from_u64(11));
        assert_eq!(model.len(), 4);
        assert_relative_eq!(model.sig_ts[0], 0.15, epsilon = 1e-12);
        for &(slope, _) in &model.coeffs {
            assert!(slope > 0.0);
        }
        let again = prepare_coeffs(&spec_std, None, 2000, &mut StdRng::seed_from_u64(11));
        assert_eq!(model, again);
    }

    #[test]
    fn significance_is_larger_for_signal_than_noise() {
        let nchan = 48;
        let spec_std = vec![1.0; nchan];
        let model = prepare_coeffs(&spec_std, None, 2000, &mut StdRng::seed_from_u64(3));
        let signal: Vec<f64> = smooth_profile(nchan).iter().map(|p| 6.0 * p).collect();
        let flat = vec![0.0; nchan];
        assert!(significance(&signal, &spec_std, &model) > significance(&flat, &spec_std, &model));
    }

    #[test]
    fn image_significance_matches_known_tail() {
        // P(X > 1.6448536) = 0.05
        assert_relative_eq!(image_significance(1.6448536), -(0.05f64).ln(), epsilon = 1e-6);
        // Asymptotic branch stays continuous with the direct branch.
        let direct = image_significance(30.0);
        let asymptotic = image_significance(38.0);
        assert!(asymptotic > direct);
        assert!(image_significance(40.0) > asymptotic);
    }

    #[test]
    fn combined_snr_increases_in_each_argument() {
        let base = combined_snr(5.0, 20.0);
        assert!(combined_snr(6.0, 20.0) > base);
        assert!(combined_snr(5.0, 21.0) > base);
        assert_relative_eq!(combined_snr(0.0, 32.0), 8.0);
        assert_eq!(combined_snr(-3.0, 1.0), 0.0);
    }

    #[test]
    fn spectrum_std_over_selected_integrations() {
        let data = Array4::from_shape_fn((4, 1, 2, 1), |(i, _, k, _)| Complex32::new((i * (k + 1)) as f32, 0.0));
        let std = spectrum_std(data.view(), &[0, 2]);
        // channel 0: values 0, 2 → std 1; channel 1: values 0, 4 → std 2
        assert_relative_eq!(std[0], 1.0);
        assert_relative_eq!(std[1], 2.0);
    }

    #[test]
    fn candidate_significance_runs_on_snippet() {
        let nchan = 16;
        let snippet = Array3::from_shape_fn((30, nchan, 2), |(i, k, l)| {
            let noise = (((i * 31 + k * 17 + l * 7) % 13) as f32 - 6.0) * 0.1;
            let pulse = if i == 15 { 3.0 } else { 0.0 };
            Complex32::new(noise + pulse, 0.0)
        });
        let mut image = Array2::from_shape_fn((16, 16), |(x, y)| (((x * 7 + y * 3) % 11) as f32 - 5.0) * 0.1);
        image[[8, 8]] = 10.0;
        let off: Vec<usize> = (0..10).chain(20..30).collect();
        let snr = candidate_significance(&snippet, image.view(), 15, &off, 500, &mut StdRng::seed_from_u64(1));
        assert!(snr.is_finite());
        assert!(snr > 0.0);
    }

    #[test]
    fn column_std_is_population_std() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0], vec![5.0, 5.0], vec![7.0, 5.0]];
        let std = std_over_rows(&rows, 2);
        assert_relative_eq!(std[0], 5.0f64.sqrt(), epsilon = 1e-12);
        assert_eq!(std[1], 0.0);
        assert_eq!(std_over_rows(&[], 3), vec![0.0; 3]);
    }
}

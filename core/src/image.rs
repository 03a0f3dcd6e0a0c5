//! Imaging: inverse Fourier transform of gridded visibilities.
//!
//! Grids arrive as Hermitian half planes (see [`crate::grid`]).  The imager
//! rebuilds the full plane, applies an inverse 2-D FFT, keeps the real part
//! and cyclically shifts it so that the phase centre lands on pixel
//! `(npixx/2, npixy/2)`.
//!
//! FFT plans are expensive to build and depend only on the transform size,
//! so they live in a [`PlanCache`] keyed by image dimensions.  Populate it
//! once with [`PlanCache::prepare`] before fanning out; afterwards every
//! lookup takes only a shared read lock.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use log::{debug, info};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use num_complex::Complex32;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

/// MAD → standard deviation for Gaussian noise.
pub const MAD_TO_STD: f64 = 1.4826;

// ---------------------------------------------------------------------------
// Plan cache
// ---------------------------------------------------------------------------

/// Inverse transforms for one image size.
pub struct ImagePlan {
    pub npixx: usize,
    pub npixy: usize,
    /// Length-`npixx` inverse FFT (along the u axis).
    x_fft: Arc<dyn Fft<f32>>,
    /// Length-`npixy` inverse FFT (along the v axis).  Unused by 1-D plans.
    y_fft: Arc<dyn Fft<f32>>,
}

impl std::fmt::Debug for ImagePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ImagePlan({}x{})", self.npixx, self.npixy)
    }
}

/// Size-keyed cache of inverse FFT plans.
///
/// Construct one per process (see [`PlanCache::global`]) or inject a fresh
/// one in tests.  Plans are shared as `Arc`s and are safe to use from many
/// threads at once.
#[derive(Default)]
pub struct PlanCache {
    plans: RwLock<HashMap<(usize, usize), Arc<ImagePlan>>>,
}

static GLOBAL_PLANS: OnceLock<Arc<PlanCache>> = OnceLock::new();

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache.
    pub fn global() -> Arc<PlanCache> {
        GLOBAL_PLANS.get_or_init(|| Arc::new(PlanCache::new())).clone()
    }

    /// Build (or fetch) the plan for an `npixx × npixy` image.
    ///
    /// This is the one-time initialisation step; call it from a single
    /// thread before images of that size are formed concurrently.
    pub fn prepare(&self, npixx: usize, npixy: usize) -> Arc<ImagePlan> {
        if let Some(plan) = self.get(npixx, npixy) {
            return plan;
        }
        info!("Calculating FFT plan for {}x{} images...", npixx, npixy);
        let mut planner = FftPlanner::<f32>::new();
        let plan = Arc::new(ImagePlan {
            npixx,
            npixy,
            x_fft: planner.plan_fft_inverse(npixx),
            y_fft: planner.plan_fft_inverse(npixy),
        });
        let mut plans = self.plans.write().unwrap_or_else(|e| e.into_inner());
        plans.entry((npixx, npixy)).or_insert(plan).clone()
    }

    /// Look up a prepared plan without building one.
    pub fn get(&self, npixx: usize, npixy: usize) -> Option<Arc<ImagePlan>> {
        let plans = self.plans.read().unwrap_or_else(|e| e.into_inner());
        plans.get(&(npixx, npixy)).cloned()
    }

    pub fn len(&self) -> usize {
        self.plans.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Cyclic shift of `src` by half its length into `dst`, moving index 0 to
/// the centre (numpy's `fftshift`).
fn fftshift_into<T: Copy>(src: &[T], dst: &mut [T]) {
    let n = src.len();
    let half = n / 2;
    for (i, &value) in src.iter().enumerate() {
        dst[(i + half) % n] = value;
    }
}

/// Image one half-plane grid of shape `(npixx, npixy/2 + 1)`.
pub fn image_grid(grid: ArrayView2<'_, Complex32>, plan: &ImagePlan) -> Array2<f32> {
    let (nx, ny) = (plan.npixx, plan.npixy);
    let half = grid.ncols();

    // Rebuild the full Hermitian plane, row-major (x, y).
    let mut plane = vec![Complex32::new(0.0, 0.0); nx * ny];
    for x in 0..nx {
        for y in 0..ny {
            plane[x * ny + y] = if y < half {
                grid[[x, y]]
            } else {
                grid[[(nx - x) % nx, ny - y]].conj()
            };
        }
    }
    // The v = 0 column is its own mirror: each cell also takes the
    // conjugate of its (−u, 0) partner, so v = 0 samples weigh the same
    // as the rest.  The DC cell is left as is.
    for x in 1..nx {
        plane[x * ny] = grid[[x, 0]] + grid[[nx - x, 0]].conj();
    }

    // Rows are contiguous in y; transform them in place.
    plan.y_fft.process(&mut plane);

    // Then each column along x.
    let mut column = vec![Complex32::new(0.0, 0.0); nx];
    for y in 0..ny {
        for x in 0..nx {
            column[x] = plane[x * ny + y];
        }
        plan.x_fft.process(&mut column);
        for x in 0..nx {
            plane[x * ny + y] = column[x];
        }
    }

    let scale = 1.0 / (nx * ny) as f32;
    let mut image = Array2::zeros((nx, ny));
    let mut row = vec![0.0f32; ny];
    let mut shifted = vec![0.0f32; ny];
    for x in 0..nx {
        for y in 0..ny {
            row[y] = plane[x * ny + y].re * scale;
        }
        fftshift_into(&row, &mut shifted);
        let xs = (x + nx / 2) % nx;
        for y in 0..ny {
            image[[xs, y]] = shifted[y];
        }
    }
    image
}

/// Image every integration of a `(nint, npixx, npixy/2 + 1)` grid stack.
///
/// With `parallel` set, integrations are transformed on the current rayon
/// pool; each task owns its own scratch buffers.
pub fn image_grids(grids: &Array3<Complex32>, plan: &ImagePlan, parallel: bool) -> Array3<f32> {
    let nint = grids.dim().0;
    debug!("Starting ifft2 of {} grids ({}x{})", nint, plan.npixx, plan.npixy);

    let images: Vec<Array2<f32>> = if parallel {
        (0..nint)
            .into_par_iter()
            .map(|i| image_grid(grids.index_axis(Axis(0), i), plan))
            .collect()
    } else {
        grids.outer_iter().map(|grid| image_grid(grid, plan)).collect()
    };

    let mut out = Array3::zeros((nint, plan.npixx, plan.npixy));
    for (i, image) in images.into_iter().enumerate() {
        out.index_axis_mut(Axis(0), i).assign(&image);
    }
    out
}

/// 1-D variant for arm profiles: inverse FFT of each `(npix,)` row of a
/// `(nint, npix)` grid, real part, recentred.  Uses the `x` transform of
/// an `(npix, 1)` plan.
pub fn image_1d(grids: &Array2<Complex32>, plan: &ImagePlan) -> Array2<f32> {
    let (nint, npix) = grids.dim();
    let scale = 1.0 / npix as f32;
    let mut out = Array2::zeros((nint, npix));
    let mut buf = vec![Complex32::new(0.0, 0.0); npix];
    let mut real = vec![0.0f32; npix];
    let mut shifted = vec![0.0f32; npix];
    for i in 0..nint {
        for p in 0..npix {
            buf[p] = grids[[i, p]];
        }
        plan.x_fft.process(&mut buf);
        for p in 0..npix {
            real[p] = buf[p].re * scale;
        }
        fftshift_into(&real, &mut shifted);
        for p in 0..npix {
            out[[i, p]] = shifted[p];
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Image statistics
// ---------------------------------------------------------------------------

fn median_in_place(values: &mut [f64]) -> f64 {
    let n = values.len();
    let cmp = |a: &f64, b: &f64| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal);
    let (_, &mut upper, _) = values.select_nth_unstable_by(n / 2, cmp);
    if n % 2 == 1 {
        upper
    } else {
        let lower = values[..n / 2].iter().copied().fold(f64::NEG_INFINITY, f64::max);
        0.5 * (lower + upper)
    }
}

/// Median of the finite values, `None` when there are none.
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    Some(median_in_place(&mut finite))
}

/// Robust standard deviation: 1.4826 × median absolute deviation of the
/// finite values.  Zero when there are none.
pub fn madtostd(values: impl IntoIterator<Item = f64>) -> f64 {
    let mut finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return 0.0;
    }
    let med = median_in_place(&mut finite);
    for v in finite.iter_mut() {
        *v = (*v - med).abs();
    }
    MAD_TO_STD * median_in_place(&mut finite)
}

/// Root mean square of the finite pixels.
pub fn rms(image: ArrayView2<'_, f32>) -> f64 {
    let (sum, count) = image
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0f64, 0usize), |(s, c), &v| (s + (v as f64).powi(2), c + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

/// Peak and noise summary of one image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageStats {
    pub peak: f64,
    pub noise: f64,
    /// First pixel (row-major) holding the peak value.
    pub peak_pixel: (usize, usize),
}

impl ImageStats {
    /// Peak over MAD-derived noise, the CPU search statistic.
    pub fn robust(image: ArrayView2<'_, f32>) -> Self {
        let (peak, peak_pixel) = peak(image);
        let noise = madtostd(image.iter().map(|&v| v as f64));
        Self { peak, noise, peak_pixel }
    }

    /// Peak over RMS, the statistic reported by device backends.
    pub fn with_rms(image: ArrayView2<'_, f32>) -> Self {
        let (peak, peak_pixel) = peak(image);
        Self {
            peak,
            noise: rms(image),
            peak_pixel,
        }
    }

    /// `peak / noise`, or 0 when the noise estimate is degenerate.
    pub fn peak_snr(&self) -> f64 {
        snr_or_zero(self.peak, self.noise)
    }
}

/// `peak / noise` guarded against zero or non-finite noise.
pub fn snr_or_zero(peak: f64, noise: f64) -> f64 {
    if noise > 0.0 && noise.is_finite() && peak.is_finite() {
        peak / noise
    } else {
        0.0
    }
}

/// Maximum finite pixel and its location.
pub fn peak(image: ArrayView2<'_, f32>) -> (f64, (usize, usize)) {
    let mut best = (f64::NEG_INFINITY, (0, 0));
    for ((x, y), &v) in image.indexed_iter() {
        if v.is_finite() && (v as f64) > best.0 {
            best = (v as f64, (x, y));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{half_plane, Gridder, SequentialGridder};
    use crate::types::Uvw;
    use approx::assert_relative_eq;
    use ndarray::Array4;

    #[test]
    fn dc_only_grid_images_to_flat_plane() {
        let cache = PlanCache::new();
        let plan = cache.prepare(8, 8);
        let mut grid = Array2::zeros((8, half_plane(8)));
        grid[[0, 0]] = Complex32::new(64.0, 0.0);
        let image = image_grid(grid.view(), &plan);
        for &v in image.iter() {
            assert_relative_eq!(v, 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn phase_centre_source_peaks_at_image_centre() {
        // Ring of baselines, all visibilities 1 + 0i: a source at (l, m) = (0, 0).
        let n = 24;
        let u: Vec<f32> = (0..n).map(|j| 300.0 * (j as f32 * 0.7).cos()).collect();
        let v: Vec<f32> = (0..n).map(|j| 300.0 * (j as f32 * 0.7).sin()).collect();
        let uvw = Uvw {
            u: Array2::from_shape_vec((n, 1), u).unwrap(),
            v: Array2::from_shape_vec((n, 1), v).unwrap(),
            w: Array2::zeros((n, 1)),
        };
        let data = Array4::from_elem((1, n, 1, 1), Complex32::new(1.0, 0.0));
        let grids = SequentialGridder.grid(&data, &uvw, 32, 32, 50.0);
        let cache = PlanCache::new();
        let plan = cache.prepare(32, 32);
        let images = image_grids(&grids, &plan, false);
        let stats = ImageStats::robust(images.index_axis(Axis(0), 0));
        assert_eq!(stats.peak_pixel, (16, 16));
        assert!(stats.peak_snr() > 0.0);
    }

    #[test]
    fn zero_v_baseline_images_like_its_rotation() {
        let image_of = |u: f32, v: f32| {
            let uvw = Uvw {
                u: Array2::from_elem((1, 1), u),
                v: Array2::from_elem((1, 1), v),
                w: Array2::zeros((1, 1)),
            };
            let data = Array4::from_elem((1, 1, 1, 1), Complex32::new(1.0, 0.0));
            let grids = SequentialGridder.grid(&data, &uvw, 32, 32, 50.0);
            let plan = PlanCache::new().prepare(32, 32);
            image_grid(grids.index_axis(Axis(0), 0), &plan)
        };
        let along_u = image_of(100.0, 0.0);
        let along_v = image_of(0.0, 100.0);
        // One fringe, ridges through the phase centre.
        assert_relative_eq!(along_u[[16, 16]], 2.0 / 1024.0, epsilon = 1e-7);
        assert_relative_eq!(along_v[[16, 16]], 2.0 / 1024.0, epsilon = 1e-7);
        let (peak_u, _) = peak(along_u.view());
        let (peak_v, _) = peak(along_v.view());
        assert_relative_eq!(peak_u, peak_v, epsilon = 1e-7);
    }

    #[test]
    fn parallel_and_sequential_imaging_agree() {
        let grids = Array3::from_shape_fn((3, 16, half_plane(16)), |(i, x, y)| {
            Complex32::new((i * 3 + x) as f32 * 0.1, y as f32 * 0.05)
        });
        let cache = PlanCache::new();
        let plan = cache.prepare(16, 16);
        let a = image_grids(&grids, &plan, false);
        let b = image_grids(&grids, &plan, true);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_relative_eq!(x, y, epsilon = 1e-6);
        }
    }

    #[test]
    fn plan_cache_builds_once_per_size() {
        let cache = PlanCache::new();
        assert!(cache.get(16, 16).is_none());
        let first = cache.prepare(16, 16);
        let second = cache.prepare(16, 16);
        assert!(Arc::ptr_eq(&first, &second));
        cache.prepare(32, 16);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn one_dimensional_image_recentres_dc() {
        let cache = PlanCache::new();
        let plan = cache.prepare(8, 1);
        let mut grids = Array2::zeros((1, 8));
        grids[[0, 0]] = Complex32::new(8.0, 0.0);
        grids[[0, 1]] = Complex32::new(8.0, 0.0);
        let profile = image_1d(&grids, &plan);
        // Peak of 1 + cos(2πp/8) at p = 0 lands on the centre pixel.
        let (argmax, _) = profile
            .row(0)
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (p, &v)| if v > best.1 { (p, v) } else { best });
        assert_eq!(argmax, 4);
    }

    #[test]
    fn mad_matches_hand_computation() {
        // median 3, deviations [2, 1, 0, 1, 2] → MAD 1
        assert_relative_eq!(madtostd([1.0, 2.0, 3.0, 4.0, 5.0]), MAD_TO_STD);
        // even count: median 2.5, deviations [1.5, 0.5, 0.5, 1.5] → MAD 1
        assert_relative_eq!(madtostd([1.0, 2.0, 3.0, 4.0]), MAD_TO_STD);
        assert_eq!(madtostd(std::iter::empty()), 0.0);
        assert_eq!(median([f64::NAN, 2.0, 4.0]), Some(3.0));
    }

    #[test]
    fn degenerate_noise_gives_zero_snr() {
        let flat = Array2::from_elem((4, 4), 2.0f32);
        let stats = ImageStats::robust(flat.view());
        assert_eq!(stats.noise, 0.0);
        assert_eq!(stats.peak_snr(), 0.0);
        assert_eq!(snr_or_zero(5.0, f64::NAN), 0.0);
    }
}

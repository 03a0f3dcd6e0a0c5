//! Transient search engine: the DM × dt trial loop.
//!
//! # Background
//!
//! A dispersed radio pulse arrives later at low frequencies than at high
//! ones, by `4.1488e-3 · DM · (f⁻² − f_ref⁻²)` seconds.  For each trial DM the
//! engine shifts every channel back by its delay, averages the corrected
//! block down to each trial time resolution `dt`, and images every
//! integration.  A pulse that matches the trial adds coherently and shows
//! up as a bright point in the image of its integration.
//!
//! # Algorithm overview
//!
//! 1. **Correction**: for each `dt` (outer) and DM (inner), dedisperse and
//!    resample the segment in one fused pass.
//! 2. **Imaging**: grid the integrations chosen by the
//!    [`IntegrationPolicy`] and transform them to sky images.
//! 3. **Thresholding**: keep integrations whose peak-over-robust-noise
//!    exceeds `sigma_image1`; optionally confirm with the Kalman spectral
//!    significance (`image1k`) or trigger from the arm search first
//!    (`imagearm`, `imagearmk`).
//! 4. **Extraction**: phase the visibilities around each detection to its
//!    sky position, average over baselines and hand the result to the
//!    [`CandidateAccumulator`], which reduces buffered detections to feature
//!    records whenever the memory budget would be exceeded.
//!
//! The device backend runs the same loop on a resident Stokes-I block:
//! dedispersion becomes a per-channel shift applied while gridding, and each
//! `dt` step halves the block, which requires a dyadic `dt` ladder.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::{s, Array3, Axis};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::{seq::index, SeedableRng};

use crate::accumulator::{CandData, CandidateAccumulator, CandidateCollection};
use crate::arm::{image_arms, placeholder_arm_map, search_thresh_arms, ArmLayout};
use crate::backend::{BackendRegistry, SelectedBackend};
use crate::dedisperse::{is_all_zero, kernels_for, DedisperseError, Dedisperser};
use crate::delay::{max_delay, TrialGrid, TrialGridError};
use crate::device::{Device, DeviceError};
use crate::grid::{gridder_for, Gridder};
use crate::image::{image_grid, image_grids, peak, snr_or_zero, ImagePlan, ImageStats, PlanCache};
use crate::kalman::{self, KalmanModel};
use crate::phase::{mean_over_baselines, phase_shift, real_spectrum};
use crate::policy::{fetch_uvw, IntegrationPolicy, UvwProvider};
use crate::types::{CandLoc, ConfigError, RunMetadata, SearchConfig, SearchMode, Uvw, VisibilityCube};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during a transient search.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("device search needs a dyadic dt ladder: {0}")]
    InvalidDtLadder(TrialGridError),

    #[error("trial grid invalid: {0}")]
    BadTrialGrid(TrialGridError),

    #[error("search mode {mode} is not implemented for the {backend} backend")]
    NotImplemented { mode: SearchMode, backend: &'static str },

    #[error("{what} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error(transparent)]
    BadConfig(#[from] ConfigError),

    #[error(transparent)]
    Dedisperse(#[from] DedisperseError),

    #[error("device failure: {0}")]
    Device(#[from] DeviceError),

    #[error("cannot build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

// ---------------------------------------------------------------------------
// TransientSearch
// ---------------------------------------------------------------------------

/// The transient search engine.
///
/// Construct with a [`SearchConfig`], the run's [`RunMetadata`] and the
/// [`TrialGrid`] to search, then call [`TransientSearch::search_segment`]
/// once per segment.
pub struct TransientSearch {
    config: SearchConfig,
    metadata: RunMetadata,
    grid: TrialGrid,
    plans: Arc<PlanCache>,
    registry: BackendRegistry,
    arm_layout: Option<ArmLayout>,
    uvw_lock: Option<Arc<Mutex<()>>>,
}

impl TransientSearch {
    pub fn new(config: SearchConfig, metadata: RunMetadata, grid: TrialGrid) -> Result<Self, SearchError> {
        config.validate()?;
        grid.validate().map_err(SearchError::BadTrialGrid)?;
        Ok(Self {
            config,
            metadata,
            grid,
            plans: PlanCache::global(),
            registry: BackendRegistry::new(),
            arm_layout: None,
            uvw_lock: None,
        })
    }

    /// Use `plans` instead of the process-wide plan cache.
    pub fn with_plans(mut self, plans: Arc<PlanCache>) -> Self {
        self.plans = plans;
        self
    }

    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a device for the GPU backend.
    pub fn with_device(self, device: Box<dyn Device>) -> Self {
        self.with_registry(BackendRegistry::with_device(device))
    }

    /// Baselines of each array arm, required by the arm search modes.
    pub fn with_arm_layout(mut self, layout: ArmLayout) -> Self {
        self.arm_layout = Some(layout);
        self
    }

    /// Hold `lock` while fetching uvw coordinates.
    pub fn with_uvw_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.uvw_lock = Some(lock);
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn trial_grid(&self) -> &TrialGrid {
        &self.grid
    }

    /// Search one segment over the whole trial grid.
    pub fn search_segment(
        &mut self,
        segment: usize,
        data: &VisibilityCube,
        uvw_provider: &dyn UvwProvider,
        policy: &dyn IntegrationPolicy,
    ) -> Result<CandidateCollection, SearchError> {
        let start = Instant::now();
        self.check_data(data)?;
        let uvw = fetch_uvw(uvw_provider, segment, self.uvw_lock.as_deref());
        self.check_uvw(&uvw)?;

        info!(
            "Starting {} search of segment {}: {:?} visibilities, {} DMs x {} dts",
            self.config.search_mode,
            segment,
            data.dim(),
            self.grid.dms.len(),
            self.grid.dts.len(),
        );

        let nthread = self.config.nthread;
        let plan = self.plans.prepare(self.config.npixx, self.config.npixy);
        let selected = self.registry.resolve(self.config.backend, nthread);
        let parallel = !matches!(selected, SelectedBackend::Sequential);
        let ctx = SearchContext {
            config: &self.config,
            metadata: &self.metadata,
            grid: &self.grid,
            plans: &self.plans,
            plan,
            arm_layout: self.arm_layout.as_ref(),
            kernels: kernels_for(if parallel { nthread.max(2) } else { 1 }),
            gridder: gridder_for(if parallel { nthread.max(2) } else { 1 }),
            parallel,
        };

        let collection = match selected {
            SelectedBackend::Gpu(device) => ctx.dedisperse_image_device(device, segment, data, &uvw, policy)?,
            SelectedBackend::Parallel if nthread > 1 => {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(nthread).build()?;
                pool.install(|| ctx.dedisperse_image(segment, data, &uvw, policy))?
            }
            SelectedBackend::Parallel | SelectedBackend::Sequential => {
                ctx.dedisperse_image(segment, data, &uvw, policy)?
            }
        };

        info!(
            "{} candidates returned for seg {} in {} ms",
            collection.len(),
            segment,
            start.elapsed().as_millis()
        );
        Ok(collection)
    }

    /// As [`TransientSearch::search_segment`], with the search mode given by
    /// name.  An unrecognised name is logged and yields an empty collection.
    pub fn search_segment_named(
        &mut self,
        mode: &str,
        segment: usize,
        data: &VisibilityCube,
        uvw_provider: &dyn UvwProvider,
        policy: &dyn IntegrationPolicy,
    ) -> Result<CandidateCollection, SearchError> {
        let mode: SearchMode = match mode.parse() {
            Ok(mode) => mode,
            Err(_) => {
                warn!("searchtype {} not recognized", mode);
                return Ok(CandidateCollection::new(self.config.clone(), self.metadata.clone()));
            }
        };
        let previous = std::mem::replace(&mut self.config.search_mode, mode);
        let result = self.search_segment(segment, data, uvw_provider, policy);
        self.config.search_mode = previous;
        result
    }

    /// Image and threshold one already dedispersed and resampled block.
    ///
    /// `integrations` index the time axis of `data`.  The returned
    /// collection holds this trial's candidates only.
    pub fn search_thresh(
        &self,
        segment: usize,
        data: &VisibilityCube,
        dmind: usize,
        dtind: usize,
        uvw: &Uvw,
        integrations: &[usize],
    ) -> Result<CandidateCollection, SearchError> {
        self.check_uvw(uvw)?;
        let parallel = self.config.nthread > 1;
        let ctx = SearchContext {
            config: &self.config,
            metadata: &self.metadata,
            grid: &self.grid,
            plans: &self.plans,
            plan: self.plans.prepare(self.config.npixx, self.config.npixy),
            arm_layout: self.arm_layout.as_ref(),
            kernels: kernels_for(self.config.nthread),
            gridder: gridder_for(self.config.nthread),
            parallel,
        };
        let mut acc = CandidateAccumulator::for_search(self.config.clone(), self.metadata.clone());
        ctx.search_thresh(&mut acc, segment, data, dmind, dtind, uvw, integrations)?;
        Ok(acc.finish())
    }

    fn check_data(&self, data: &VisibilityCube) -> Result<(), SearchError> {
        let (nint, nbl, nchan, npol) = data.dim();
        if (nbl, nchan, npol) != (self.metadata.nbl, self.metadata.nchan(), self.metadata.npol) {
            return Err(SearchError::ShapeMismatch {
                what: "visibility block",
                expected: vec![nint, self.metadata.nbl, self.metadata.nchan(), self.metadata.npol],
                found: vec![nint, nbl, nchan, npol],
            });
        }
        Ok(())
    }

    fn check_uvw(&self, uvw: &Uvw) -> Result<(), SearchError> {
        let expected = vec![self.metadata.nbl, self.metadata.nchan()];
        let found = vec![uvw.nbl(), uvw.nchan()];
        if expected != found || uvw.v.dim() != uvw.u.dim() {
            return Err(SearchError::ShapeMismatch {
                what: "uvw",
                expected,
                found,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-segment context
// ---------------------------------------------------------------------------

/// Borrowed state shared by the stages of one segment search.
struct SearchContext<'a> {
    config: &'a SearchConfig,
    metadata: &'a RunMetadata,
    grid: &'a TrialGrid,
    plans: &'a PlanCache,
    plan: Arc<ImagePlan>,
    arm_layout: Option<&'a ArmLayout>,
    kernels: Box<dyn Dedisperser>,
    gridder: Box<dyn Gridder>,
    parallel: bool,
}

/// Reproducible generator for one trial of one segment.
fn trial_rng(seed: u64, segment: usize, dmind: usize, dtind: usize) -> StdRng {
    let key = ((segment as u64) << 40) ^ ((dmind as u64) << 20) ^ dtind as u64;
    StdRng::seed_from_u64(seed ^ key.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

impl SearchContext<'_> {
    fn accumulator(&self) -> CandidateAccumulator {
        CandidateAccumulator::for_search(self.config.clone(), self.metadata.clone())
    }

    /// Host search: fused dedispersion and resampling per trial, then
    /// imaging and thresholding.
    fn dedisperse_image(
        &self,
        segment: usize,
        data: &VisibilityCube,
        uvw: &Uvw,
        policy: &dyn IntegrationPolicy,
    ) -> Result<CandidateCollection, SearchError> {
        let delays = self.grid.delays(&self.metadata.freq, self.metadata.inttime);
        let mut acc = self.accumulator();

        for (dtind, &dt) in self.grid.dts.iter().enumerate() {
            for (dmind, delay) in delays.iter().enumerate() {
                let data_corr = self.kernels.dedisperse_resample(data, delay, dt)?;
                let integrations = policy.integrations(segment, dmind, dtind);
                self.search_thresh(&mut acc, segment, &data_corr, dmind, dtind, uvw, &integrations)?;
            }
        }

        Ok(acc.finish())
    }

    /// Device search: resident Stokes-I block, shift-while-gridding
    /// dedispersion and in-place time halving.
    fn dedisperse_image_device(
        &self,
        device: &mut dyn Device,
        segment: usize,
        data: &VisibilityCube,
        uvw: &Uvw,
        policy: &dyn IntegrationPolicy,
    ) -> Result<CandidateCollection, SearchError> {
        self.grid.validate_dyadic().map_err(SearchError::InvalidDtLadder)?;
        if self.config.search_mode != SearchMode::Image1 {
            return Err(SearchError::NotImplemented {
                mode: self.config.search_mode,
                backend: "gpu",
            });
        }

        let mut acc = self.accumulator();
        if is_all_zero(data) {
            info!("Data is all zeros. Skipping search.");
            return Ok(acc.finish());
        }

        // Stokes I, rolled to (nbl, nchan, nint)
        let (nint, nbl, nchan, npol) = data.dim();
        let stokes_i = Array3::from_shape_fn((nbl, nchan, nint), |(j, k, i)| {
            let mut sum = data[[i, j, k, 0]];
            for l in 1..npol {
                sum += data[[i, j, k, l]];
            }
            sum / npol.max(1) as f32
        });
        device.upload(stokes_i);

        let delays = self.grid.delays(&self.metadata.freq, self.metadata.inttime);
        let (npixx, npixy, uvres) = (self.config.npixx, self.config.npixy, self.config.uvres);

        for (dtind, &dt) in self.grid.dts.iter().enumerate() {
            if dtind > 0 {
                device.downsample()?;
            }
            for (dmind, delay) in delays.iter().enumerate() {
                let shifts: Vec<usize> = delay.iter().map(|d| d >> dtind).collect();
                // Same length as the host-corrected block snippets are cut from.
                let searchable = (nint.saturating_sub(max_delay(delay)) / dt).min(device.nint());
                let integrations: Vec<usize> = policy
                    .integrations(segment, dmind, dtind)
                    .into_iter()
                    .filter(|&i| i < searchable)
                    .collect();
                let (Some(&minint), Some(&maxint)) = (integrations.first(), integrations.last()) else {
                    continue;
                };
                info!(
                    "Imaging {} ints ({}-{}) in seg {} at DM/dt {:.1}/{} with image {}x{} (uvres {}) on {} device",
                    integrations.len(),
                    minint,
                    maxint,
                    segment,
                    self.grid.dms[dmind],
                    dt,
                    npixx,
                    npixy,
                    uvres,
                    device.name(),
                );

                let mut data_corr: Option<VisibilityCube> = None;
                for &i in &integrations {
                    let handle = device.grid_image(i, &shifts, uvw, npixx, npixy, uvres)?;
                    let (max, rms) = device.stats(&handle)?;
                    let peak_snr = snr_or_zero(max, rms);
                    if peak_snr <= self.config.sigma_image1 {
                        continue;
                    }

                    let image = device.download(&handle)?;
                    let (_, pixel) = peak(image.view());
                    let (l, m) = self.config.pix_to_lm(pixel);
                    let loc = self.loc(segment, i, dmind, dtind);
                    info!(
                        "Got one! SNR {:.1} candidate at {} and (l, m) = ({:.5}, {:.5})",
                        peak_snr, loc, l, m
                    );

                    if data_corr.is_none() {
                        data_corr = Some(self.kernels.dedisperse_resample(data, delay, dt)?);
                    }
                    let corrected = data_corr.as_ref().unwrap_or(data);
                    let (snippet, snippet_on) = self.snippet(corrected, uvw, i, l, m);
                    acc.push(CandData {
                        loc,
                        image,
                        snippet,
                        snippet_on,
                        snr1: peak_snr,
                        snrk: None,
                        snrarm: None,
                        l,
                        m,
                    });
                }
            }
        }

        Ok(acc.finish())
    }

    fn loc(&self, segment: usize, integration: usize, dmind: usize, dtind: usize) -> CandLoc {
        CandLoc {
            segment,
            integration,
            dmind,
            dtind,
            beamnum: self.config.beamnum,
        }
    }

    /// Phased, baseline-averaged data around integration `i`, and the row
    /// of `i` within it.
    fn snippet(&self, data: &VisibilityCube, uvw: &Uvw, i: usize, l: f64, m: f64) -> (Array3<Complex32>, usize) {
        let nint = data.dim().0;
        let half = self.config.timewindow / 2;
        let hi = (i + half).max(i + 1).min(nint);
        let lo = i.saturating_sub(half).min(hi);
        let mut window = data.slice(s![lo..hi, .., .., ..]).to_owned();
        phase_shift(window.view_mut(), uvw, l, m);
        (mean_over_baselines(window.view()), (i - lo).min(hi - lo))
    }

    /// Real spectrum of integration `i` phased to `(l, m)`.
    fn phased_spectrum(&self, data: &VisibilityCube, uvw: &Uvw, i: usize, l: f64, m: f64) -> Vec<f64> {
        let mut one = data.slice(s![i..i + 1, .., .., ..]).to_owned();
        phase_shift(one.view_mut(), uvw, l, m);
        real_spectrum(one.view(), 0).to_vec()
    }

    /// Noise spectrum and calibrated Kalman model for a block, measured
    /// from a random subset of its integrations.
    fn prepare_kalman(&self, data: &VisibilityCube, rng: &mut StdRng) -> (Vec<f64>, KalmanModel) {
        let nint = data.dim().0;
        let amount = (nint / 10).max(10).min(nint);
        let offints = index::sample(rng, nint, amount).into_vec();
        let spec_std = kalman::spectrum_std(data.view(), &offints);
        let model = kalman::prepare_coeffs(&spec_std, None, self.config.kalman_trials, rng);
        (spec_std, model)
    }

    /// Kalman-combined SNR of a detection.
    fn kalman_snr(&self, spectrum: &[f64], prep: &(Vec<f64>, KalmanModel), peak_snr: f64) -> f64 {
        let (spec_std, model) = prep;
        let significance_kalman = kalman::significance(spectrum, spec_std, model);
        let significance_image = kalman::image_significance(peak_snr);
        kalman::combined_snr(significance_kalman, significance_image)
    }

    /// Steps 2-4 of the search for one trial, feeding `acc`.
    #[allow(clippy::too_many_arguments)]
    fn search_thresh(
        &self,
        acc: &mut CandidateAccumulator,
        segment: usize,
        data: &VisibilityCube,
        dmind: usize,
        dtind: usize,
        uvw: &Uvw,
        integrations: &[usize],
    ) -> Result<(), SearchError> {
        if is_all_zero(data) {
            info!("Data is all zeros. Skipping search.");
            return Ok(());
        }

        let nint = data.dim().0;
        let integrations: Vec<usize> = integrations.iter().copied().filter(|&i| i < nint).collect();
        let (Some(&minint), Some(&maxint)) = (
            integrations.iter().min(),
            integrations.iter().max(),
        ) else {
            debug!("No integrations to search for ({}, {}, {})", segment, dmind, dtind);
            return Ok(());
        };

        let mode = self.config.search_mode;
        let mut rng = trial_rng(self.config.seed, segment, dmind, dtind);
        let kalman_prep = mode.uses_kalman().then(|| self.prepare_kalman(data, &mut rng));

        info!(
            "{} search of {} ints ({}-{}) in seg {} at DM/dt {:.1}/{} with image {}x{} (uvres {}) in {} mode",
            mode,
            integrations.len(),
            minint,
            maxint,
            segment,
            self.grid.dms.get(dmind).copied().unwrap_or(f64::NAN),
            self.grid.dts.get(dtind).copied().unwrap_or(0),
            self.config.npixx,
            self.config.npixy,
            self.config.uvres,
            self.gridder.mode(),
        );

        match mode {
            SearchMode::Image1 | SearchMode::Image1k => {
                let grids = self.gridder.grid(
                    &data.select(Axis(0), &integrations),
                    uvw,
                    self.config.npixx,
                    self.config.npixy,
                    self.config.uvres,
                );
                let images = image_grids(&grids, &self.plan, self.parallel);

                for (image, &i) in images.outer_iter().zip(&integrations) {
                    let stats = ImageStats::robust(image);
                    let peak_snr = stats.peak_snr();
                    if peak_snr <= self.config.sigma_image1 {
                        continue;
                    }
                    let (l, m) = self.config.pix_to_lm(stats.peak_pixel);
                    let loc = self.loc(segment, i, dmind, dtind);

                    let snrk = match &kalman_prep {
                        Some(prep) => {
                            let spectrum = self.phased_spectrum(data, uvw, i, l, m);
                            let total_snr = self.kalman_snr(&spectrum, prep, peak_snr);
                            if total_snr <= self.config.sigma_kalman {
                                debug!("SNRk {:.1} below threshold at {}", total_snr, loc);
                                continue;
                            }
                            info!(
                                "Got one! SNR1 {:.1} and SNRk {:.1} candidate at {} and (l, m) = ({:.5}, {:.5})",
                                peak_snr, total_snr, loc, l, m
                            );
                            Some(total_snr)
                        }
                        None => {
                            info!(
                                "Got one! SNR1 {:.1} candidate at {} and (l, m) = ({:.5}, {:.5})",
                                peak_snr, loc, l, m
                            );
                            None
                        }
                    };

                    let (snippet, snippet_on) = self.snippet(data, uvw, i, l, m);
                    acc.push(CandData {
                        loc,
                        image: image.to_owned(),
                        snippet,
                        snippet_on,
                        snr1: peak_snr,
                        snrk,
                        snrarm: None,
                        l,
                        m,
                    });
                }
            }
            SearchMode::ImageArm | SearchMode::ImageArmK => {
                let layout = self.arm_layout.ok_or_else(|| {
                    ConfigError::Invalid(format!("search mode {mode} needs an arm layout"))
                })?;
                let npix = self.config.npixx.max(self.config.npixy);
                let arms = image_arms(data, uvw, layout, &integrations, npix, self.config.uvres, self.plans);
                let map = placeholder_arm_map(npix, &mut rng);
                let hits = search_thresh_arms(&arms, &map, self.config.sigma_arm, self.config.sigma_arms, None);

                for (row, snrarm) in hits {
                    let i = integrations[row];
                    let grids = self.gridder.grid(
                        &data.select(Axis(0), &[i]),
                        uvw,
                        self.config.npixx,
                        self.config.npixy,
                        self.config.uvres,
                    );
                    let image = image_grid(grids.index_axis(Axis(0), 0), &self.plan);
                    let stats = ImageStats::robust(image.view());
                    let peak_snr = stats.peak_snr();
                    if peak_snr <= self.config.sigma_image1 {
                        continue;
                    }
                    let (l, m) = self.config.pix_to_lm(stats.peak_pixel);
                    let loc = self.loc(segment, i, dmind, dtind);

                    let snrk = match &kalman_prep {
                        Some(prep) => {
                            let spectrum = self.phased_spectrum(data, uvw, i, l, m);
                            let total_snr = self.kalman_snr(&spectrum, prep, peak_snr);
                            if total_snr <= self.config.sigma_kalman {
                                continue;
                            }
                            info!(
                                "Got one! SNRarm {:.1} and SNR1 {:.1} and SNRk {:.1} candidate at {} and (l, m) = ({:.5}, {:.5})",
                                snrarm, peak_snr, total_snr, loc, l, m
                            );
                            Some(total_snr)
                        }
                        None => {
                            info!(
                                "Got one! SNRarm {:.1} and SNR1 {:.1} candidate at {} and (l, m) = ({:.5}, {:.5})",
                                snrarm, peak_snr, loc, l, m
                            );
                            None
                        }
                    };

                    let (snippet, snippet_on) = self.snippet(data, uvw, i, l, m);
                    acc.push(CandData {
                        loc,
                        image,
                        snippet,
                        snippet_on,
                        snr1: peak_snr,
                        snrk,
                        snrarm: Some(snrarm),
                        l,
                        m,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::device::HostDevice;
    use crate::policy::FixedUvw;
    use ndarray::{Array2, Array4};

    fn metadata(nbl: usize) -> RunMetadata {
        RunMetadata {
            datasetid: "unit".into(),
            freq: vec![1.4, 1.45, 1.5],
            inttime: 0.01,
            readints: 16,
            nbl,
            npol: 2,
        }
    }

    fn uvw(nbl: usize) -> Uvw {
        Uvw {
            u: Array2::from_shape_fn((nbl, 3), |(j, k)| 200.0 * (j as f32 + 1.0) * (1.0 + 0.03 * k as f32)),
            v: Array2::from_shape_fn((nbl, 3), |(j, k)| -150.0 * j as f32 * (1.0 + 0.03 * k as f32)),
            w: Array2::zeros((nbl, 3)),
        }
    }

    fn config() -> SearchConfig {
        SearchConfig {
            npixx: 32,
            npixy: 32,
            uvres: 40.0,
            timewindow: 4,
            ..SearchConfig::default()
        }
    }

    fn all_ints(_: usize, _: usize, _: usize) -> Vec<usize> {
        (0..16).collect()
    }

    #[test]
    fn unknown_mode_name_is_a_logged_no_op() {
        let mut search = TransientSearch::new(config(), metadata(4), TrialGrid::new(vec![0.0], vec![1])).unwrap();
        let data = Array4::from_elem((16, 4, 3, 2), Complex32::new(1.0, 0.0));
        let out = search
            .search_segment_named("image9", 0, &data, &FixedUvw(uvw(4)), &all_ints)
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(search.config().search_mode, SearchMode::Image1);
    }

    #[test]
    fn named_mode_applies_to_one_call_only() {
        let config = SearchConfig {
            backend: Backend::Gpu,
            ..config()
        };
        let mut search = TransientSearch::new(config, metadata(4), TrialGrid::new(vec![0.0], vec![1]))
            .unwrap()
            .with_device(Box::new(HostDevice::with_plans(Arc::new(PlanCache::new()))));
        let data = Array4::from_elem((16, 4, 3, 2), Complex32::new(1.0, 0.0));
        let err = search
            .search_segment_named("image1k", 0, &data, &FixedUvw(uvw(4)), &all_ints)
            .unwrap_err();
        assert!(matches!(err, SearchError::NotImplemented { mode: SearchMode::Image1k, .. }));
        assert_eq!(search.config().search_mode, SearchMode::Image1);
    }

    #[test]
    fn device_search_rejects_non_dyadic_dts() {
        let config = SearchConfig {
            backend: Backend::Gpu,
            ..config()
        };
        let mut search = TransientSearch::new(config, metadata(4), TrialGrid::new(vec![0.0], vec![1, 3]))
            .unwrap()
            .with_device(Box::new(HostDevice::with_plans(Arc::new(PlanCache::new()))));
        let data = Array4::from_elem((16, 4, 3, 2), Complex32::new(1.0, 0.0));
        let err = search
            .search_segment(0, &data, &FixedUvw(uvw(4)), &all_ints)
            .unwrap_err();
        assert!(matches!(err, SearchError::InvalidDtLadder(_)));
    }

    #[test]
    fn device_search_supports_image1_only() {
        let config = SearchConfig {
            backend: Backend::Gpu,
            search_mode: SearchMode::Image1k,
            ..config()
        };
        let mut search = TransientSearch::new(config, metadata(4), TrialGrid::new(vec![0.0], vec![1, 2]))
            .unwrap()
            .with_device(Box::new(HostDevice::with_plans(Arc::new(PlanCache::new()))));
        let data = Array4::from_elem((16, 4, 3, 2), Complex32::new(1.0, 0.0));
        let err = search
            .search_segment(0, &data, &FixedUvw(uvw(4)), &all_ints)
            .unwrap_err();
        assert!(matches!(err, SearchError::NotImplemented { .. }));
    }

    #[test]
    fn all_zero_segment_gives_empty_collection() {
        for backend in [Backend::Sequential, Backend::Gpu] {
            let config = SearchConfig { backend, ..config() };
            let mut search = TransientSearch::new(config, metadata(4), TrialGrid::new(vec![0.0, 10.0], vec![1, 2]))
                .unwrap()
                .with_device(Box::new(HostDevice::with_plans(Arc::new(PlanCache::new()))));
            let data = Array4::zeros((16, 4, 3, 2));
            let out = search.search_segment(0, &data, &FixedUvw(uvw(4)), &all_ints).unwrap();
            assert!(out.is_empty());
        }
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let mut search = TransientSearch::new(config(), metadata(4), TrialGrid::new(vec![0.0], vec![1])).unwrap();
        let data = Array4::from_elem((16, 3, 3, 2), Complex32::new(1.0, 0.0));
        let err = search
            .search_segment(0, &data, &FixedUvw(uvw(3)), &all_ints)
            .unwrap_err();
        assert!(matches!(err, SearchError::ShapeMismatch { what: "visibility block", .. }));

        let data = Array4::from_elem((16, 4, 3, 2), Complex32::new(1.0, 0.0));
        let err = search
            .search_segment(0, &data, &FixedUvw(uvw(5)), &all_ints)
            .unwrap_err();
        assert!(matches!(err, SearchError::ShapeMismatch { what: "uvw", .. }));
    }

    #[test]
    fn arm_modes_need_a_layout() {
        let config = SearchConfig {
            search_mode: SearchMode::ImageArm,
            ..config()
        };
        let search = TransientSearch::new(config, metadata(4), TrialGrid::new(vec![0.0], vec![1])).unwrap();
        let data = Array4::from_elem((16, 4, 3, 2), Complex32::new(1.0, 0.5));
        let err = search.search_thresh(0, &data, 0, 0, &uvw(4), &[0, 1]).unwrap_err();
        assert!(matches!(err, SearchError::BadConfig(_)));
    }

    #[test]
    fn trial_generators_differ_between_trials() {
        use rand::Rng;
        let a: u64 = trial_rng(1, 0, 0, 0).gen();
        let b: u64 = trial_rng(1, 0, 1, 0).gen();
        let c: u64 = trial_rng(1, 0, 0, 0).gen();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }
}

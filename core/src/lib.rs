//! # rfsearch-core
//!
//! Detection core of an interferometric fast-radio-transient search, with
//! optional Python bindings via [PyO3](https://pyo3.rs).
//!
//! ## Overview
//!
//! Given a segment of visibilities (integration × baseline × channel ×
//! polarization), the crate searches a grid of trial dispersion measures
//! and time resolutions, images every corrected integration and returns
//! ranked candidates with position, significance and a phased snippet of
//! data.
//!
//! | Module           | Purpose                                                   |
//! |------------------|-----------------------------------------------------------|
//! | [`delay`]        | Dispersion delays, trial grids, DM-grid construction      |
//! | [`dedisperse`]   | Dedispersion and resampling kernels                       |
//! | [`grid`]         | Gridding of visibilities onto the uv plane                |
//! | [`image`]        | FFT imaging, plan cache, image statistics                 |
//! | [`phase`]        | Phase rotation toward a sky offset                        |
//! | [`kalman`]       | Kalman-filter spectral significance                       |
//! | [`accumulator`]  | Memory-bounded candidate buffer and feature records       |
//! | [`search`]       | The DM × dt search engine                                 |
//! | [`arm`]          | Experimental arm-based trigger                            |
//! | [`device`]       | Device contract for resident Stokes-I imaging             |
//! | [`backend`]      | Backend selection with graceful fallback                  |
//! | [`policy`]       | Integration-selection policies and uvw providers          |
//! | [`simulate`]     | Synthetic dispersed transients                            |
//! | [`types`]        | Shared data structures and configuration                  |
//!
//! ## Rust usage
//!
//! ```no_run
//! use rfsearch_core::{FixedUvw, RunMetadata, SearchConfig, SegmentOverlapPolicy, TransientSearch, TrialGrid};
//! # fn run(data: rfsearch_core::VisibilityCube, uvw: rfsearch_core::Uvw, metadata: RunMetadata) -> Result<(), rfsearch_core::SearchError> {
//! let grid = TrialGrid::new(vec![0.0, 50.0, 100.0], vec![1, 2]);
//! let policy = SegmentOverlapPolicy::for_trial_grid(&metadata, &grid);
//! let mut search = TransientSearch::new(SearchConfig::default(), metadata, grid)?;
//! let candidates = search.search_segment(0, &data, &FixedUvw(uvw), &policy)?;
//! for cand in candidates.ranked() {
//!     println!("{} snr={:.1}", cand.loc(), cand.snr());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Python usage
//!
//! Built with `--features python`, the library exposes a module called
//! `rfsearch_core`:
//!
//! ```python
//! import rfsearch_core
//!
//! config = rfsearch_core.SearchConfig.from_json('{"search_mode": "image1k"}')
//! meta = rfsearch_core.RunMetadata("obs1", freqs, 0.005, 128, nbl)
//! cands = rfsearch_core.search_segment(config, meta, dms, [1, 2], 0,
//!                                      data_re, data_im, u, v, w)
//! ```

pub mod accumulator;
pub mod arm;
pub mod backend;
pub mod dedisperse;
pub mod delay;
pub mod device;
pub mod grid;
pub mod image;
pub mod kalman;
pub mod phase;
pub mod policy;
pub mod search;
pub mod simulate;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export the most commonly used items at crate root for convenience.
pub use accumulator::{CandData, Candidate, CandidateAccumulator, CandidateCollection, CandidateSummary};
pub use backend::{Backend, BackendRegistry};
pub use delay::{calc_delay, TrialGrid};
pub use device::{Device, HostDevice};
pub use image::PlanCache;
pub use kalman::KalmanModel;
pub use policy::{FixedUvw, IntegrationPolicy, SegmentOverlapPolicy, UvwProvider};
pub use search::{SearchError, TransientSearch};
pub use types::{CandLoc, ConfigError, RunMetadata, SearchConfig, SearchMode, Uvw, VisibilityCube};

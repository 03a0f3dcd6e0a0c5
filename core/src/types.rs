//! Common types shared across the transient-search core.
//!
//! These structures represent the fundamental data objects of an
//! interferometric fast-transient search: visibility blocks and their
//! baseline coordinates, search configuration, run metadata, and the
//! identity of a detection on the DM × dt trial grid.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, Array4};
use num_complex::Complex32;
#[cfg(feature = "python")]
use pyo3::prelude::*;
use serde::{Deserialize, Serialize};

use crate::backend::Backend;

/// Visibility block indexed `(integration, baseline, channel, polarization)`.
///
/// A sample equal to exactly `0 + 0i` means "flagged or missing" and is
/// never a genuine measurement.
pub type VisibilityCube = Array4<Complex32>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// SearchMode
// ---------------------------------------------------------------------------

/// Detection algorithm applied to each dedispersed, resampled block.
#[cfg_attr(feature = "python", pyclass)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Image every integration and threshold on image SNR.
    Image1,
    /// As `Image1`, with the Kalman spectral significance as a second stage.
    Image1k,
    /// Experimental arm search, confirmed by a full image.
    ImageArm,
    /// Arm search with the Kalman second stage.
    ImageArmK,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Image1 => "image1",
            SearchMode::Image1k => "image1k",
            SearchMode::ImageArm => "imagearm",
            SearchMode::ImageArmK => "imagearmk",
        }
    }

    /// Whether the Kalman second-stage filter is applied.
    pub fn uses_kalman(&self) -> bool {
        matches!(self, SearchMode::Image1k | SearchMode::ImageArmK)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image1" => Ok(SearchMode::Image1),
            "image1k" => Ok(SearchMode::Image1k),
            "imagearm" => Ok(SearchMode::ImageArm),
            "imagearmk" => Ok(SearchMode::ImageArmK),
            other => Err(ConfigError::Invalid(format!(
                "search mode '{other}' not recognized (image1, image1k, imagearm, imagearmk allowed)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// SearchConfig
// ---------------------------------------------------------------------------

/// Configuration for a transient search.
///
/// Thresholds are in units of image signal-to-noise; `memory_limit` is in
/// GB (10⁹ bytes) and bounds the in-flight candidate buffer.
#[cfg_attr(feature = "python", pyclass(get_all, set_all))]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub search_mode: SearchMode,

    /// Execution backend for the hot kernels.
    pub backend: Backend,

    /// First-stage image SNR threshold.
    pub sigma_image1: f64,

    /// Second-stage threshold on the Kalman-combined SNR.
    pub sigma_kalman: f64,

    /// Per-arm threshold of the arm search.
    pub sigma_arm: f64,

    /// Combined three-arm trigger threshold.
    pub sigma_arms: f64,

    /// Number of integrations kept around each detection.
    pub timewindow: usize,

    pub memory_limit: f64,

    /// Worker threads.  Values above 1 select the data-parallel kernels.
    pub nthread: usize,

    pub npixx: usize,
    pub npixy: usize,

    /// uv cell size in wavelengths (1 / field of view in radians).
    pub uvres: f64,

    /// Monte-Carlo trials per smoothness scale when calibrating the
    /// Kalman detector.
    pub kalman_trials: usize,

    /// Seed for all random draws made during a search.
    pub seed: u64,

    pub beamnum: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            search_mode: SearchMode::Image1,
            backend: Backend::Sequential,
            sigma_image1: 7.0,
            sigma_kalman: 7.0,
            sigma_arm: 2.0,
            sigma_arms: 7.0,
            timewindow: 30,
            memory_limit: 16.0,
            nthread: 1,
            npixx: 256,
            npixy: 256,
            uvres: 50.0,
            kalman_trials: 10_000,
            seed: 0,
            beamnum: 0,
        }
    }
}

impl SearchConfig {
    /// Parse a JSON document; missing keys take their default values.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SearchConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.npixx == 0 || self.npixy == 0 || self.npixx % 2 != 0 || self.npixy % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "image dimensions must be positive and even, got {}x{}",
                self.npixx, self.npixy
            )));
        }
        if !(self.uvres > 0.0 && self.uvres.is_finite()) {
            return Err(ConfigError::Invalid(format!("uvres must be positive, got {}", self.uvres)));
        }
        if !(self.memory_limit > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "memory_limit must be positive, got {}",
                self.memory_limit
            )));
        }
        if self.timewindow == 0 {
            return Err(ConfigError::Invalid("timewindow must be at least 1".into()));
        }
        for (name, value) in [
            ("sigma_image1", self.sigma_image1),
            ("sigma_kalman", self.sigma_kalman),
            ("sigma_arm", self.sigma_arm),
            ("sigma_arms", self.sigma_arms),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::Invalid(format!("{name} must be finite")));
            }
        }
        Ok(())
    }

    /// Projected size in bytes of one in-flight candidate: its image plus
    /// the phased snippet.
    pub fn bytes_per_candidate(&self, nchan: usize, npol: usize) -> usize {
        8 * (self.npixx * self.npixy + self.timewindow * nchan * npol)
    }

    /// Sky offset `(l, m)` in radians of an image pixel `(x, y)`, with the
    /// image already recentred so that pixel `(npixx/2, npixy/2)` is the
    /// phase centre.
    pub fn pix_to_lm(&self, pix: (usize, usize)) -> (f64, f64) {
        let (x, y) = pix;
        let l = (self.npixx as f64 / 2.0 - x as f64) / (self.npixx as f64 * self.uvres);
        let m = (self.npixy as f64 / 2.0 - y as f64) / (self.npixy as f64 * self.uvres);
        (l, m)
    }

    /// Inverse of [`SearchConfig::pix_to_lm`], rounded to the nearest pixel.
    pub fn lm_to_pix(&self, l: f64, m: f64) -> (i64, i64) {
        let x = self.npixx as f64 / 2.0 - l * self.npixx as f64 * self.uvres;
        let y = self.npixy as f64 / 2.0 - m * self.npixy as f64 * self.uvres;
        (x.round() as i64, y.round() as i64)
    }
}

// ---------------------------------------------------------------------------
// RunMetadata
// ---------------------------------------------------------------------------

/// Observation metadata supplied by the data-preparation collaborator.
#[cfg_attr(feature = "python", pyclass(get_all, set_all))]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Dataset identifier carried into candidate summaries.
    pub datasetid: String,

    /// Channel centre frequencies in GHz.
    pub freq: Vec<f64>,

    /// Integration time in seconds.
    pub inttime: f64,

    /// Integrations per segment.
    pub readints: usize,

    pub nbl: usize,
    pub npol: usize,
}

impl RunMetadata {
    pub fn nchan(&self) -> usize {
        self.freq.len()
    }

    /// Highest channel frequency, the dedispersion reference.
    pub fn freq_max(&self) -> f64 {
        self.freq.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn freq_min(&self) -> f64 {
        self.freq.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Expected shape of a segment's visibility cube.
    pub fn datashape(&self) -> (usize, usize, usize, usize) {
        (self.readints, self.nbl, self.nchan(), self.npol)
    }
}

// ---------------------------------------------------------------------------
// Uvw
// ---------------------------------------------------------------------------

/// Baseline coordinates for one segment, in wavelengths, each of shape
/// `(nbl, nchan)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Uvw {
    pub u: Array2<f32>,
    pub v: Array2<f32>,
    pub w: Array2<f32>,
}

impl Uvw {
    /// Scale per-baseline coordinates in metres to wavelengths for every
    /// channel (`freq` in GHz).
    pub fn from_meters(u_m: &[f64], v_m: &[f64], w_m: &[f64], freq: &[f64]) -> Self {
        let scale = |coord: &[f64]| {
            Array2::from_shape_fn((coord.len(), freq.len()), |(j, k)| {
                (coord[j] * freq[k] * 1e9 / 2.998e8) as f32
            })
        };
        Self {
            u: scale(u_m),
            v: scale(v_m),
            w: scale(w_m),
        }
    }

    pub fn nbl(&self) -> usize {
        self.u.nrows()
    }

    pub fn nchan(&self) -> usize {
        self.u.ncols()
    }
}

// ---------------------------------------------------------------------------
// CandLoc
// ---------------------------------------------------------------------------

/// Identity of a detection on the trial grid.
#[cfg_attr(feature = "python", pyclass(get_all))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandLoc {
    pub segment: usize,
    pub integration: usize,
    pub dmind: usize,
    pub dtind: usize,
    pub beamnum: usize,
}

impl fmt::Display for CandLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {}, {})",
            self.segment, self.integration, self.dmind, self.dtind, self.beamnum
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn search_mode_parses_known_names_only() {
        assert_eq!("image1k".parse::<SearchMode>().unwrap(), SearchMode::Image1k);
        assert_eq!("imagearmk".parse::<SearchMode>().unwrap(), SearchMode::ImageArmK);
        assert!("image2".parse::<SearchMode>().is_err());
        assert_eq!(SearchMode::ImageArm.to_string(), "imagearm");
    }

    #[test]
    fn config_from_json_fills_defaults() {
        let config = SearchConfig::from_json(r#"{"search_mode": "image1k", "npixx": 64}"#).unwrap();
        assert_eq!(config.search_mode, SearchMode::Image1k);
        assert_eq!(config.npixx, 64);
        assert_eq!(config.npixy, SearchConfig::default().npixy);
    }

    #[test]
    fn config_rejects_odd_image_size() {
        let err = SearchConfig::from_json(r#"{"npixx": 63}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn pixel_offset_round_trips_through_lm() {
        let config = SearchConfig {
            npixx: 64,
            npixy: 32,
            uvres: 40.0,
            ..SearchConfig::default()
        };
        let (l, m) = config.pix_to_lm((32, 16));
        assert_relative_eq!(l, 0.0);
        assert_relative_eq!(m, 0.0);
        let (l, m) = config.pix_to_lm((20, 9));
        assert_eq!(config.lm_to_pix(l, m), (20, 9));
    }

    #[test]
    fn candidate_size_counts_image_and_snippet() {
        let config = SearchConfig {
            npixx: 10,
            npixy: 10,
            timewindow: 4,
            ..SearchConfig::default()
        };
        assert_eq!(config.bytes_per_candidate(5, 2), 8 * (100 + 40));
    }
}

//! Candidate bookkeeping under a memory budget.
//!
//! Detections leave the search loop as [`CandData`]: the full sky image and
//! a phased snippet of visibilities.  Those are large, so the
//! [`CandidateAccumulator`] only holds them until their projected size would
//! cross the configured memory limit.  A flush reduces every buffered
//! detection to a [`Candidate`] feature record, appends it to the output
//! [`CandidateCollection`] and empties the buffer.

use std::ops::AddAssign;

use log::{info, warn};
use ndarray::{Array2, Array3};
use num_complex::Complex32;
#[cfg(feature = "python")]
use pyo3::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::image::peak;
use crate::types::{CandLoc, RunMetadata, SearchConfig};

// ---------------------------------------------------------------------------
// In-flight and permanent records
// ---------------------------------------------------------------------------

/// A detection as produced by the search loop, before feature reduction.
#[derive(Clone, Debug)]
pub struct CandData {
    pub loc: CandLoc,

    /// Sky image of the detecting integration, `(npixx, npixy)`.
    pub image: Array2<f32>,

    /// Visibilities phased to the detection and averaged over baselines,
    /// `(time, channel, pol)`.
    pub snippet: Array3<Complex32>,

    /// Row of `snippet` holding the detecting integration.
    pub snippet_on: usize,

    /// Image SNR.
    pub snr1: f64,

    /// Kalman-combined SNR, when the second stage ran.
    pub snrk: Option<f64>,

    /// Arm-search SNR, when the arm search triggered this detection.
    pub snrarm: Option<f64>,

    /// Sky offset of the peak pixel, radians.
    pub l: f64,
    pub m: f64,
}

impl CandData {
    /// Real spectrum of the detecting integration, averaged over
    /// polarizations.
    pub fn on_spectrum(&self) -> Vec<f64> {
        let (ntime, nchan, npol) = self.snippet.dim();
        if ntime == 0 || npol == 0 {
            return Vec::new();
        }
        let on = self.snippet_on.min(ntime - 1);
        (0..nchan)
            .map(|k| (0..npol).map(|l| self.snippet[[on, k, l]].re as f64).sum::<f64>() / npol as f64)
            .collect()
    }

    /// Approximate heap footprint in bytes.
    pub fn nbytes(&self) -> usize {
        self.image.len() * std::mem::size_of::<f32>() + self.snippet.len() * std::mem::size_of::<Complex32>()
    }
}

/// Reduced description of a detection.
#[cfg_attr(feature = "python", pyclass(get_all))]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandFeatures {
    pub snr1: f64,
    pub snrk: Option<f64>,
    pub snrarm: Option<f64>,
    /// Peak image value.
    pub immax1: f64,
    pub l1: f64,
    pub m1: f64,
    /// Standard deviation of the on-pulse spectrum.
    pub specstd: f64,
    /// Skewness of the on-pulse spectrum.
    pub specskew: f64,
    /// Excess kurtosis of the on-pulse spectrum.
    pub speckurtosis: f64,
}

/// Permanent candidate record.  Fields are fixed once built.
#[derive(Clone, Debug)]
pub struct Candidate {
    loc: CandLoc,
    features: CandFeatures,
    image: Array2<f32>,
    snippet: Array3<Complex32>,
}

impl Candidate {
    pub fn loc(&self) -> CandLoc {
        self.loc
    }

    pub fn features(&self) -> &CandFeatures {
        &self.features
    }

    pub fn image(&self) -> &Array2<f32> {
        &self.image
    }

    pub fn snippet(&self) -> &Array3<Complex32> {
        &self.snippet
    }

    /// Best available SNR: Kalman-combined, else arm, else image.
    pub fn snr(&self) -> f64 {
        self.features
            .snrk
            .or(self.features.snrarm)
            .unwrap_or(self.features.snr1)
    }

    pub fn summary(&self) -> CandidateSummary {
        CandidateSummary {
            segment: self.loc.segment,
            integration: self.loc.integration,
            dmind: self.loc.dmind,
            dtind: self.loc.dtind,
            beamnum: self.loc.beamnum,
            features: self.features.clone(),
        }
    }
}

/// Standardised third and fourth moments `(skew, excess kurtosis)`.
fn higher_moments(values: &[f64], mean: f64, std: f64) -> (f64, f64) {
    if values.is_empty() || !(std > 0.0) {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let (m3, m4) = values.iter().fold((0.0, 0.0), |(m3, m4), &v| {
        let z = (v - mean) / std;
        (m3 + z.powi(3), m4 + z.powi(4))
    });
    (m3 / n, m4 / n - 3.0)
}

/// Reduce a detection to its feature record.
pub fn calc_features(cand: CandData) -> Candidate {
    let spectrum = cand.on_spectrum();
    let (specstd, specskew, speckurtosis) = if spectrum.is_empty() {
        (0.0, 0.0, 0.0)
    } else {
        let mean = spectrum.iter().mean();
        let std = spectrum.iter().population_std_dev();
        let (skew, kurtosis) = higher_moments(&spectrum, mean, std);
        (std, skew, kurtosis)
    };
    let (immax1, _) = peak(cand.image.view());

    Candidate {
        loc: cand.loc,
        features: CandFeatures {
            snr1: cand.snr1,
            snrk: cand.snrk,
            snrarm: cand.snrarm,
            immax1,
            l1: cand.l,
            m1: cand.m,
            specstd,
            specskew,
            speckurtosis,
        },
        image: cand.image,
        snippet: cand.snippet,
    }
}

// ---------------------------------------------------------------------------
// CandidateCollection
// ---------------------------------------------------------------------------

/// Flat, serialisable view of one candidate.
#[cfg_attr(feature = "python", pyclass(get_all))]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub segment: usize,
    pub integration: usize,
    pub dmind: usize,
    pub dtind: usize,
    pub beamnum: usize,
    #[serde(flatten)]
    pub features: CandFeatures,
}

#[derive(Serialize)]
struct CollectionSummary<'a> {
    datasetid: &'a str,
    search_mode: &'a str,
    n_candidates: usize,
    candidates: Vec<CandidateSummary>,
}

/// Ordered candidates of a run, together with the configuration and
/// metadata that produced them.  Grows by appending only.
#[derive(Clone, Debug)]
pub struct CandidateCollection {
    pub candidates: Vec<Candidate>,
    pub prefs: SearchConfig,
    pub metadata: RunMetadata,
}

impl CandidateCollection {
    pub fn new(prefs: SearchConfig, metadata: RunMetadata) -> Self {
        Self {
            candidates: Vec::new(),
            prefs,
            metadata,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn locs(&self) -> Vec<CandLoc> {
        self.candidates.iter().map(Candidate::loc).collect()
    }

    pub fn snrs(&self) -> Vec<f64> {
        self.candidates.iter().map(Candidate::snr).collect()
    }

    /// Candidate with the highest [`Candidate::snr`].
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates
            .iter()
            .max_by(|a, b| a.snr().partial_cmp(&b.snr()).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Candidates sorted by descending SNR.
    pub fn ranked(&self) -> Vec<&Candidate> {
        let mut out: Vec<&Candidate> = self.candidates.iter().collect();
        out.sort_by(|a, b| b.snr().partial_cmp(&a.snr()).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Append the candidates of `other`, which should come from the same
    /// run.
    pub fn merge(&mut self, other: CandidateCollection) {
        if other.metadata.datasetid != self.metadata.datasetid {
            warn!(
                "Merging candidates from dataset {} into {}",
                other.metadata.datasetid, self.metadata.datasetid
            );
        }
        self.candidates.extend(other.candidates);
    }

    pub fn summaries(&self) -> Vec<CandidateSummary> {
        self.candidates.iter().map(Candidate::summary).collect()
    }

    /// Pretty-printed JSON summary of the collection.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&CollectionSummary {
            datasetid: &self.metadata.datasetid,
            search_mode: self.prefs.search_mode.as_str(),
            n_candidates: self.len(),
            candidates: self.summaries(),
        })
    }
}

impl Extend<Candidate> for CandidateCollection {
    fn extend<I: IntoIterator<Item = Candidate>>(&mut self, iter: I) {
        self.candidates.extend(iter);
    }
}

impl AddAssign for CandidateCollection {
    fn add_assign(&mut self, other: CandidateCollection) {
        self.merge(other);
    }
}

// ---------------------------------------------------------------------------
// CandidateAccumulator
// ---------------------------------------------------------------------------

/// Bounded buffer of in-flight detections.
#[derive(Debug)]
pub struct CandidateAccumulator {
    pending: Vec<CandData>,
    output: CandidateCollection,
    bytes_per_candidate: usize,
    limit_bytes: f64,
    flushes: usize,
}

impl CandidateAccumulator {
    /// `bytes_per_candidate` is the projected footprint of one detection and
    /// `memory_limit` the budget in GB.
    pub fn new(prefs: SearchConfig, metadata: RunMetadata, bytes_per_candidate: usize, memory_limit: f64) -> Self {
        Self {
            pending: Vec::new(),
            output: CandidateCollection::new(prefs, metadata),
            bytes_per_candidate,
            limit_bytes: memory_limit * 1e9,
            flushes: 0,
        }
    }

    /// Accumulator sized from the search configuration.
    pub fn for_search(prefs: SearchConfig, metadata: RunMetadata) -> Self {
        let bytes = prefs.bytes_per_candidate(metadata.nchan(), metadata.npol);
        let limit = prefs.memory_limit;
        Self::new(prefs, metadata, bytes, limit)
    }

    fn projected(&self, count: usize) -> f64 {
        (count * self.bytes_per_candidate) as f64
    }

    /// Buffer one detection, flushing first if it would not fit.
    ///
    /// A detection that alone exceeds the budget is flushed straight away,
    /// so the buffer never holds more than the limit between calls.
    pub fn push(&mut self, cand: CandData) {
        if !self.pending.is_empty() && self.projected(self.pending.len() + 1) > self.limit_bytes {
            info!(
                "Candidate buffer would reach {:.3} GB; flushing {} candidates",
                self.projected(self.pending.len() + 1) / 1e9,
                self.pending.len()
            );
            self.flush();
        }
        self.pending.push(cand);
        if self.projected(self.pending.len()) > self.limit_bytes {
            self.flush();
        }
    }

    /// Reduce every buffered detection to a feature record.
    pub fn flush(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            info!("Calculating features for {} candidates.", pending.len());
        }
        self.output.extend(pending.into_iter().map(calc_features));
        self.flushes += 1;
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Projected size of the buffer in bytes.
    pub fn pending_bytes(&self) -> f64 {
        self.projected(self.pending.len())
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Candidates already reduced.
    pub fn collected(&self) -> &CandidateCollection {
        &self.output
    }

    /// Final flush, then hand over the collection.
    pub fn finish(mut self) -> CandidateCollection {
        self.flush();
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn metadata() -> RunMetadata {
        RunMetadata {
            datasetid: "test".into(),
            freq: vec![1.4, 1.5],
            inttime: 0.005,
            readints: 10,
            nbl: 3,
            npol: 2,
        }
    }

    fn cand(integration: usize, snr1: f64) -> CandData {
        let mut image = Array2::zeros((4, 4));
        image[[1, 2]] = snr1 as f32;
        let snippet = Array3::from_shape_fn((3, 4, 2), |(i, k, _)| {
            Complex32::new(if i == 1 { [1.0, 2.0, 3.0, 10.0][k] } else { 0.0 }, 0.0)
        });
        CandData {
            loc: CandLoc {
                segment: 0,
                integration,
                dmind: 0,
                dtind: 0,
                beamnum: 0,
            },
            image,
            snippet,
            snippet_on: 1,
            snr1,
            snrk: None,
            snrarm: None,
            l: 0.001,
            m: -0.002,
        }
    }

    #[test]
    fn features_describe_on_pulse_spectrum() {
        let record = calc_features(cand(5, 9.0));
        let f = record.features();
        assert_relative_eq!(f.immax1, 9.0);
        assert_relative_eq!(f.l1, 0.001);
        // spectrum [1, 2, 3, 10]: mean 4, population variance 12.5
        assert_relative_eq!(f.specstd, 12.5f64.sqrt(), epsilon = 1e-12);
        assert!(f.specskew > 0.0);
        assert_eq!(record.loc().integration, 5);
    }

    #[test]
    fn flush_happens_before_limit_is_crossed() {
        // 1000 bytes per candidate, 3500 byte budget.
        let mut acc = CandidateAccumulator::new(SearchConfig::default(), metadata(), 1000, 3.5e-6);
        for i in 0..3 {
            acc.push(cand(i, 8.0));
            assert!(acc.pending_bytes() <= 3500.0);
        }
        assert_eq!(acc.flushes(), 0);
        assert_eq!(acc.pending(), 3);

        acc.push(cand(3, 8.0));
        assert_eq!(acc.flushes(), 1);
        assert_eq!(acc.pending(), 1);
        assert_eq!(acc.collected().len(), 3);

        let out = acc.finish();
        assert_eq!(out.len(), 4);
        assert_eq!(out.locs().iter().map(|l| l.integration).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn oversized_candidate_is_flushed_immediately() {
        let mut acc = CandidateAccumulator::new(SearchConfig::default(), metadata(), 5000, 1e-6);
        acc.push(cand(0, 8.0));
        assert_eq!(acc.pending(), 0);
        assert_eq!(acc.flushes(), 1);
    }

    #[test]
    fn final_flush_runs_even_when_empty() {
        let acc = CandidateAccumulator::for_search(SearchConfig::default(), metadata());
        let out = acc.finish();
        assert!(out.is_empty());
    }

    #[test]
    fn collections_merge_and_serialise() {
        let mut a = CandidateCollection::new(SearchConfig::default(), metadata());
        a.extend([calc_features(cand(1, 8.0))]);
        let mut b = CandidateCollection::new(SearchConfig::default(), metadata());
        b.extend([calc_features(cand(2, 12.0))]);
        a += b;
        assert_eq!(a.len(), 2);
        assert_eq!(a.best().map(|c| c.loc().integration), Some(2));
        assert_eq!(a.ranked()[1].loc().integration, 1);

        let json = a.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["n_candidates"], 2);
        assert_eq!(value["candidates"][1]["integration"], 2);
        assert_eq!(value["search_mode"], "image1");
    }
}

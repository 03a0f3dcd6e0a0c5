//! Python bindings, built with the `python` feature.
//!
//! Arrays cross the boundary as flat row-major lists, with complex
//! visibilities split into real and imaginary parts.

use ndarray::{Array2, Array4};
use num_complex::Complex32;
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::accumulator::{CandFeatures, CandidateSummary};
use crate::backend::Backend;
use crate::delay::{calc_delay, TrialGrid, DM_DELAY_SCALE};
use crate::policy::{FixedUvw, SegmentOverlapPolicy};
use crate::search::TransientSearch;
use crate::types::{CandLoc, RunMetadata, SearchConfig, SearchMode, Uvw};

fn value_error(e: impl std::fmt::Display) -> PyErr {
    PyValueError::new_err(e.to_string())
}

#[pymethods]
impl SearchConfig {
    #[new]
    fn py_new() -> Self {
        Self::default()
    }

    /// Build a configuration from a JSON document.
    #[staticmethod]
    #[pyo3(name = "from_json")]
    fn py_from_json(text: &str) -> PyResult<Self> {
        Self::from_json(text).map_err(value_error)
    }

    #[pyo3(name = "to_json")]
    fn py_to_json(&self) -> PyResult<String> {
        serde_json::to_string_pretty(self).map_err(value_error)
    }

    fn __repr__(&self) -> String {
        format!(
            "SearchConfig(mode={}, backend={}, sigma_image1={:.1}, npix={}x{})",
            self.search_mode, self.backend, self.sigma_image1, self.npixx, self.npixy
        )
    }
}

#[pymethods]
impl RunMetadata {
    #[new]
    #[pyo3(signature = (datasetid, freq, inttime, readints, nbl, npol=2))]
    fn py_new(datasetid: String, freq: Vec<f64>, inttime: f64, readints: usize, nbl: usize, npol: usize) -> Self {
        Self {
            datasetid,
            freq,
            inttime,
            readints,
            nbl,
            npol,
        }
    }

    fn __repr__(&self) -> String {
        format!(
            "RunMetadata({}, nint={}, nbl={}, nchan={}, npol={})",
            self.datasetid,
            self.readints,
            self.nbl,
            self.nchan(),
            self.npol
        )
    }
}

#[pymethods]
impl CandidateSummary {
    fn __repr__(&self) -> String {
        format!(
            "Candidate(seg={}, int={}, dmind={}, dtind={}, snr1={:.1})",
            self.segment, self.integration, self.dmind, self.dtind, self.features.snr1
        )
    }
}

/// Per-channel delay in integrations for a trial DM.
#[pyfunction]
#[pyo3(name = "calc_delay", signature = (freq, freq_ref, dm, inttime, scale=DM_DELAY_SCALE))]
fn py_calc_delay(freq: Vec<f64>, freq_ref: f64, dm: f64, inttime: f64, scale: f64) -> Vec<usize> {
    calc_delay(&freq, freq_ref, dm, inttime, Some(scale))
}

/// Search one segment and return candidate summaries.
///
/// `data_re`/`data_im` hold `(nint, nbl, nchan, npol)` visibilities; `u`,
/// `v` and `w` hold `(nbl, nchan)` coordinates in wavelengths.
#[pyfunction]
#[pyo3(name = "search_segment")]
#[allow(clippy::too_many_arguments)]
fn py_search_segment(
    config: SearchConfig,
    metadata: RunMetadata,
    dms: Vec<f64>,
    dts: Vec<usize>,
    segment: usize,
    data_re: Vec<f32>,
    data_im: Vec<f32>,
    u: Vec<f32>,
    v: Vec<f32>,
    w: Vec<f32>,
) -> PyResult<Vec<CandidateSummary>> {
    if data_re.len() != data_im.len() {
        return Err(value_error("data_re and data_im differ in length"));
    }
    let nbl = metadata.nbl;
    let nchan = metadata.nchan();
    let npol = metadata.npol;
    let per_int = nbl * nchan * npol;
    if per_int == 0 || data_re.len() % per_int != 0 {
        return Err(value_error(format!(
            "{} samples do not fill whole integrations of {} samples",
            data_re.len(),
            per_int
        )));
    }
    let samples: Vec<Complex32> = data_re
        .into_iter()
        .zip(data_im)
        .map(|(re, im)| Complex32::new(re, im))
        .collect();
    let data = Array4::from_shape_vec((samples.len() / per_int, nbl, nchan, npol), samples).map_err(value_error)?;
    let uvw = Uvw {
        u: Array2::from_shape_vec((nbl, nchan), u).map_err(value_error)?,
        v: Array2::from_shape_vec((nbl, nchan), v).map_err(value_error)?,
        w: Array2::from_shape_vec((nbl, nchan), w).map_err(value_error)?,
    };

    let grid = TrialGrid::new(dms, dts);
    let policy = SegmentOverlapPolicy::for_trial_grid(&metadata, &grid);
    let mut search = TransientSearch::new(config, metadata, grid).map_err(value_error)?;
    let collection = search
        .search_segment(segment, &data, &FixedUvw(uvw), &policy)
        .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
    Ok(collection.summaries())
}

/// The top-level Python module exposed by this crate.
#[pymodule]
fn rfsearch_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<SearchConfig>()?;
    m.add_class::<RunMetadata>()?;
    m.add_class::<SearchMode>()?;
    m.add_class::<Backend>()?;
    m.add_class::<CandLoc>()?;
    m.add_class::<CandFeatures>()?;
    m.add_class::<CandidateSummary>()?;
    m.add_function(wrap_pyfunction!(py_calc_delay, m)?)?;
    m.add_function(wrap_pyfunction!(py_search_segment, m)?)?;

    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add("__doc__", "Dedispersion, imaging and candidate extraction for fast radio transients.")?;

    Ok(())
}

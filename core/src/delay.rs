//! Dispersion delays and the DM × dt trial grid.
//!
//! Radio waves crossing ionised interstellar gas arrive later at lower
//! frequencies, with a delay proportional to the dispersion measure (DM)
//! and to `1/ν²`.  Searching for an unknown DM means shifting every
//! channel by the delay of each trial DM before the channels are summed.

use log::debug;
use serde::{Deserialize, Serialize};

/// Dispersion constant in s·GHz²·cm³/pc.
pub const DM_DELAY_SCALE: f64 = 4.1488e-3;

/// Pulse-broadening constant (µs for DM in pc/cm³, channel width in MHz,
/// frequency in GHz) used by the DM-grid loss model.
const DM_SMEAR_CONSTANT: f64 = 8.3;

/// Spacing of the fine grid walked by [`calc_dm_grid`], in pc/cm³.
const DM_GRID_STEP: f64 = 0.05;

/// Per-channel delay in integrations for a trial DM.
///
/// `freq` and `freq_ref` are in GHz, `inttime` in seconds.  The delay is
/// truncated toward zero, not rounded: a channel whose delay is 1.9
/// integrations is shifted by one.  Channels above `freq_ref` would get a
/// negative delay and are clamped to zero.
pub fn calc_delay(freq: &[f64], freq_ref: f64, dm: f64, inttime: f64, scale: Option<f64>) -> Vec<usize> {
    let scale = scale.unwrap_or(DM_DELAY_SCALE);
    freq.iter()
        .map(|&f| {
            let delay = scale * dm * (1.0 / (f * f) - 1.0 / (freq_ref * freq_ref)) / inttime;
            if delay > 0.0 {
                delay as usize
            } else {
                0
            }
        })
        .collect()
}

/// Continuous dispersion delay in seconds relative to `freq_ref`.
pub fn calc_delay_seconds(freq: &[f64], freq_ref: f64, dm: f64, scale: Option<f64>) -> Vec<f64> {
    let scale = scale.unwrap_or(DM_DELAY_SCALE);
    freq.iter()
        .map(|&f| scale * dm * (1.0 / (f * f) - 1.0 / (freq_ref * freq_ref)))
        .collect()
}

/// Largest entry of a delay table, i.e. the number of trailing
/// integrations lost to dedispersion.
pub fn max_delay(delay: &[usize]) -> usize {
    delay.iter().copied().max().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// TrialGrid
// ---------------------------------------------------------------------------

/// Errors describing a malformed trial grid.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrialGridError {
    #[error("trial grid has no DM values")]
    NoDms,

    #[error("dt ladder must start at 1, got {0}")]
    FirstDtNotOne(usize),

    #[error("dt ladder must double at each step, got {prev} then {next}")]
    NotDyadic { prev: usize, next: usize },

    #[error("dt values must be positive")]
    ZeroDt,
}

/// The DM values and time-decimation factors to search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialGrid {
    /// Trial dispersion measures in pc/cm³.
    pub dms: Vec<f64>,

    /// Decimation factors in integrations.
    pub dts: Vec<usize>,
}

impl TrialGrid {
    pub fn new(dms: Vec<f64>, dts: Vec<usize>) -> Self {
        Self { dms, dts }
    }

    /// Check the structural requirements shared by every backend.
    pub fn validate(&self) -> Result<(), TrialGridError> {
        if self.dms.is_empty() {
            return Err(TrialGridError::NoDms);
        }
        if self.dts.iter().any(|&dt| dt == 0) {
            return Err(TrialGridError::ZeroDt);
        }
        Ok(())
    }

    /// Check that `dts` is `1, 2, 4, …`, which incremental halving needs.
    pub fn validate_dyadic(&self) -> Result<(), TrialGridError> {
        self.validate()?;
        match self.dts.first() {
            Some(&1) | None => {}
            Some(&first) => return Err(TrialGridError::FirstDtNotOne(first)),
        }
        for pair in self.dts.windows(2) {
            if pair[1] != 2 * pair[0] {
                return Err(TrialGridError::NotDyadic {
                    prev: pair[0],
                    next: pair[1],
                });
            }
        }
        Ok(())
    }

    /// Delay tables for every trial DM.
    pub fn delays(&self, freq: &[f64], inttime: f64) -> Vec<Vec<usize>> {
        let freq_ref = freq.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        self.dms
            .iter()
            .map(|&dm| calc_delay(freq, freq_ref, dm, inttime, None))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.dms.len() * self.dts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// DM grid construction
// ---------------------------------------------------------------------------

/// Inputs of [`calc_dm_grid`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DmGridParams {
    /// Tolerated fractional sensitivity loss between neighbouring DMs.
    pub dm_maxloss: f64,

    /// Assumed intrinsic pulse width in µs.
    pub dm_pulsewidth: f64,

    pub mindm: f64,
    pub maxdm: f64,

    /// Integration time in seconds.
    pub inttime: f64,

    /// Mean observing frequency in GHz.
    pub freq_center: f64,

    /// Total bandwidth in MHz.
    pub bandwidth: f64,

    /// Channel width in MHz.
    pub chan_width: f64,
}

impl DmGridParams {
    /// Effective pulse width in µs at `dm`, including sampling and
    /// intra-channel smearing.
    fn width(&self, dm: f64) -> f64 {
        let tsamp = self.inttime * 1e6;
        let smear = DM_SMEAR_CONSTANT * dm * self.chan_width / self.freq_center.powi(3);
        (self.dm_pulsewidth.powi(2) + tsamp.powi(2) + smear.powi(2)).sqrt()
    }

    /// Effective width when the pulse is dedispersed with a DM error `ddm`.
    fn width_offset(&self, dm: f64, ddm: f64) -> f64 {
        let sweep = DM_SMEAR_CONSTANT * ddm * self.bandwidth / self.freq_center.powi(3);
        (self.width(dm).powi(2) + sweep.powi(2)).sqrt()
    }
}

/// Fractional sensitivity lost when a pulse at `dm` is searched at a trial
/// DM off by `ddm`.
pub fn dm_sensitivity_loss(params: &DmGridParams, dm: f64, ddm: f64) -> f64 {
    1.0 - (params.width(dm) / params.width_offset(dm, ddm)).sqrt()
}

/// Build a DM grid whose spacing keeps the sensitivity loss of a pulse
/// halfway between neighbours below `dm_maxloss`.
///
/// `maxdm == 0` returns `[0]`.  The last entry is always `maxdm`.
pub fn calc_dm_grid(params: &DmGridParams) -> Vec<f64> {
    if params.maxdm == 0.0 {
        return vec![0.0];
    }

    let mut grid = vec![params.mindm];
    let nsteps = ((params.maxdm - params.mindm) / DM_GRID_STEP).ceil().max(0.0) as usize;
    for step in 0..nsteps {
        let dm = params.mindm + step as f64 * DM_GRID_STEP;
        if dm >= params.maxdm {
            break;
        }
        let last = grid[grid.len() - 1];
        let ddm = (dm - last) / 2.0;
        if dm_sensitivity_loss(params, dm, ddm) > params.dm_maxloss {
            grid.push(dm);
        }
    }
    if grid[grid.len() - 1] != params.maxdm {
        grid.push(params.maxdm);
    }

    debug!(
        "DM grid of {} values from {} to {} at max loss {}",
        grid.len(),
        params.mindm,
        params.maxdm,
        params.dm_maxloss
    );
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn vla_lband() -> DmGridParams {
        DmGridParams {
            dm_maxloss: 0.05,
            dm_pulsewidth: 3000.0,
            mindm: 0.0,
            maxdm: 200.0,
            inttime: 5e-3,
            freq_center: 1.4,
            bandwidth: 256.0,
            chan_width: 1.0,
        }
    }

    #[test]
    fn delay_is_truncated_not_rounded() {
        // Exact delay of the low channel: 4.1488e-3 * 10 * (1/1 - 1/4) / 0.01 = 3.1116
        let delay = calc_delay(&[1.0, 2.0], 2.0, 10.0, 0.01, None);
        assert_eq!(delay, vec![3, 0]);
    }

    #[test]
    fn delay_grows_toward_low_frequency() {
        let freq: Vec<f64> = (0..16).map(|i| 1.0 + 0.05 * i as f64).collect();
        let delay = calc_delay(&freq, 1.75, 500.0, 5e-3, None);
        assert!(delay.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(delay[15], 0);
        assert_eq!(max_delay(&delay), delay[0]);
    }

    #[test]
    fn zero_dm_has_no_delay() {
        let delay = calc_delay(&[1.0, 1.2, 1.4], 1.4, 0.0, 1e-3, None);
        assert_eq!(delay, vec![0, 0, 0]);
    }

    #[test]
    fn custom_scale_is_honoured() {
        let seconds = calc_delay_seconds(&[1.0], 2.0, 10.0, Some(4.2e-3));
        assert_relative_eq!(seconds[0], 4.2e-3 * 10.0 * 0.75, epsilon = 1e-12);
    }

    #[test]
    fn dyadic_ladder_validation() {
        let ok = TrialGrid::new(vec![0.0, 10.0], vec![1, 2, 4, 8]);
        assert!(ok.validate_dyadic().is_ok());

        let bad_start = TrialGrid::new(vec![0.0], vec![2, 4]);
        assert_eq!(bad_start.validate_dyadic(), Err(TrialGridError::FirstDtNotOne(2)));

        let not_doubling = TrialGrid::new(vec![0.0], vec![1, 2, 3]);
        assert_eq!(
            not_doubling.validate_dyadic(),
            Err(TrialGridError::NotDyadic { prev: 2, next: 3 })
        );
        // A non-dyadic ladder is still searchable by the CPU backends.
        assert!(not_doubling.validate().is_ok());
    }

    #[test]
    fn dm_grid_spans_range_and_respects_loss() {
        let params = vla_lband();
        let grid = calc_dm_grid(&params);
        assert_eq!(grid[0], 0.0);
        assert_eq!(*grid.last().unwrap(), 200.0);
        assert!(grid.windows(2).all(|w| w[1] > w[0]));
        assert!(grid.len() > 2);
    }

    #[test]
    fn zero_maxdm_yields_single_trial() {
        let params = DmGridParams {
            maxdm: 0.0,
            ..vla_lband()
        };
        assert_eq!(calc_dm_grid(&params), vec![0.0]);
    }

    #[test]
    fn loss_increases_with_dm_error() {
        let params = vla_lband();
        let small = dm_sensitivity_loss(&params, 50.0, 0.5);
        let large = dm_sensitivity_loss(&params, 50.0, 5.0);
        assert!(small >= 0.0);
        assert!(large > small);
        assert_relative_eq!(dm_sensitivity_loss(&params, 50.0, 0.0), 0.0);
    }
}

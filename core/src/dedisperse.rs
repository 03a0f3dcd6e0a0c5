//! Dedispersion and resampling kernels.
//!
//! Both operations walk the integration axis of a visibility cube:
//!
//! - **dedisperse** shifts every channel earlier by its delay, so that a
//!   dispersed pulse lines up in a single integration;
//! - **resample** averages `dt` consecutive integrations, matching the
//!   time resolution to a trial pulse width;
//! - **dedisperse_resample** fuses the two and is the one used on the hot
//!   path.  Unlike plain `resample` it skips flagged (zero) samples when
//!   averaging and writes an exact zero when every sample of a cell is
//!   flagged.
//!
//! Two interchangeable strategies implement the [`Dedisperser`] trait:
//! [`SequentialKernels`] (single-core loop nest) and [`ParallelKernels`]
//! (rayon over independent baseline × channel units).  Both borrow the
//! input cube and return a freshly allocated output cube; the caller's
//! buffer is never modified.

use log::{debug, info};
use ndarray::Array4;
use num_complex::Complex32;
use rayon::prelude::*;

use crate::delay::max_delay;
use crate::types::VisibilityCube;

const ZERO: Complex32 = Complex32::new(0.0, 0.0);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised for malformed kernel inputs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DedisperseError {
    #[error("delay table has {delays} entries but data has {nchan} channels")]
    ChannelMismatch { delays: usize, nchan: usize },

    #[error("resampling factor must be at least 1")]
    ZeroDt,
}

/// `true` when every sample is flagged, including the degenerate case of
/// an empty cube.
pub fn is_all_zero(data: &VisibilityCube) -> bool {
    data.iter().all(|&v| v == ZERO)
}

fn empty_like(data: &VisibilityCube) -> VisibilityCube {
    let (_, nbl, nchan, npol) = data.dim();
    Array4::zeros((0, nbl, nchan, npol))
}

fn check_delay(data: &VisibilityCube, delay: &[usize]) -> Result<(), DedisperseError> {
    let nchan = data.dim().2;
    if delay.len() != nchan {
        return Err(DedisperseError::ChannelMismatch {
            delays: delay.len(),
            nchan,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// A dedispersion / resampling strategy.
///
/// Implementors provide the three kernels, each writing into a zeroed
/// output of the documented shape.  The provided methods validate inputs,
/// short-circuit all-zero data to an empty cube (zero integrations) and
/// allocate the output.
pub trait Dedisperser: Send + Sync {
    /// Short label used in log messages.
    fn mode(&self) -> &'static str;

    /// `out[i, j, k, l] = data[i + delay[k], j, k, l]`.
    fn dedisperse_kernel(&self, data: &VisibilityCube, delay: &[usize], out: &mut VisibilityCube);

    /// `out[i] = mean(data[i*dt .. (i+1)*dt])`, zeros included.
    fn resample_kernel(&self, data: &VisibilityCube, dt: usize, out: &mut VisibilityCube);

    /// Shift and average with flagged samples excluded from the weight.
    fn dedisperse_resample_kernel(
        &self,
        data: &VisibilityCube,
        delay: &[usize],
        dt: usize,
        out: &mut VisibilityCube,
    );

    /// Dedisperse `data`; the output is `max(delay)` integrations shorter.
    fn dedisperse(&self, data: &VisibilityCube, delay: &[usize]) -> Result<VisibilityCube, DedisperseError> {
        check_delay(data, delay)?;
        if is_all_zero(data) {
            info!("Data is all zeros. Skipping dedispersion.");
            return Ok(empty_like(data));
        }

        let (nint, nbl, nchan, npol) = data.dim();
        let maxdelay = max_delay(delay);
        info!("Dedispersing up to delay shift of {} integrations", maxdelay);

        let mut out = Array4::zeros((nint.saturating_sub(maxdelay), nbl, nchan, npol));
        self.dedisperse_kernel(data, delay, &mut out);
        Ok(out)
    }

    /// Average by `dt`; the output has `nint / dt` integrations.
    fn resample(&self, data: &VisibilityCube, dt: usize) -> Result<VisibilityCube, DedisperseError> {
        if dt == 0 {
            return Err(DedisperseError::ZeroDt);
        }
        if is_all_zero(data) {
            info!("Data is all zeros. Skipping resampling.");
            return Ok(empty_like(data));
        }

        let (nint, nbl, nchan, npol) = data.dim();
        info!("Resampling data of length {} by a factor of {}", nint, dt);

        let mut out = Array4::zeros((nint / dt, nbl, nchan, npol));
        self.resample_kernel(data, dt, &mut out);
        Ok(out)
    }

    /// Fused dedisperse and resample; the output has
    /// `(nint - max(delay)) / dt` integrations.
    fn dedisperse_resample(
        &self,
        data: &VisibilityCube,
        delay: &[usize],
        dt: usize,
    ) -> Result<VisibilityCube, DedisperseError> {
        check_delay(data, delay)?;
        if dt == 0 {
            return Err(DedisperseError::ZeroDt);
        }
        if is_all_zero(data) {
            info!("Data is all zeros. Skipping dedispersion and resampling.");
            return Ok(empty_like(data));
        }

        let (nint, nbl, nchan, npol) = data.dim();
        let maxdelay = max_delay(delay);
        info!(
            "Correcting by delay/resampling {}/{} ints in {} mode",
            maxdelay,
            dt,
            self.mode()
        );

        let mut out = Array4::zeros((nint.saturating_sub(maxdelay) / dt, nbl, nchan, npol));
        self.dedisperse_resample_kernel(data, delay, dt, &mut out);
        Ok(out)
    }
}

/// Weighted mean of one output cell of the fused kernel.
///
/// Flagged samples contribute nothing; a cell with no unflagged samples is
/// an exact zero.
#[inline]
fn flagged_mean(samples: impl Iterator<Item = Complex32>) -> Complex32 {
    let mut sum = ZERO;
    let mut weight = 0u32;
    for val in samples {
        sum += val;
        if val != ZERO {
            weight += 1;
        }
    }
    if weight > 0 {
        sum / weight as f32
    } else {
        ZERO
    }
}

// ---------------------------------------------------------------------------
// Sequential strategy
// ---------------------------------------------------------------------------

/// Single-core kernels with the channel loop outermost, so each channel's
/// delay is loaded once.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialKernels;

impl Dedisperser for SequentialKernels {
    fn mode(&self) -> &'static str {
        "single"
    }

    fn dedisperse_kernel(&self, data: &VisibilityCube, delay: &[usize], out: &mut VisibilityCube) {
        let (nout, nbl, nchan, npol) = out.dim();
        for k in 0..nchan {
            for i in 0..nout {
                let iprime = i + delay[k];
                for j in 0..nbl {
                    for l in 0..npol {
                        out[[i, j, k, l]] = data[[iprime, j, k, l]];
                    }
                }
            }
        }
    }

    fn resample_kernel(&self, data: &VisibilityCube, dt: usize, out: &mut VisibilityCube) {
        let (nout, nbl, nchan, npol) = out.dim();
        let scale = 1.0 / dt as f32;
        for j in 0..nbl {
            for k in 0..nchan {
                for l in 0..npol {
                    for i in 0..nout {
                        let iprime = i * dt;
                        let mut sum = data[[iprime, j, k, l]];
                        for r in 1..dt {
                            sum += data[[iprime + r, j, k, l]];
                        }
                        out[[i, j, k, l]] = sum * scale;
                    }
                }
            }
        }
    }

    fn dedisperse_resample_kernel(
        &self,
        data: &VisibilityCube,
        delay: &[usize],
        dt: usize,
        out: &mut VisibilityCube,
    ) {
        let (nout, nbl, nchan, npol) = out.dim();
        for j in 0..nbl {
            for l in 0..npol {
                for k in 0..nchan {
                    for i in 0..nout {
                        let start = i * dt + delay[k];
                        out[[i, j, k, l]] = flagged_mean((start..start + dt).map(|ip| data[[ip, j, k, l]]));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel strategy
// ---------------------------------------------------------------------------

/// Data-parallel kernels.
///
/// Work is split into independent (baseline, channel) units.  Each unit
/// walks its own integration axis and returns an owned series which is
/// then copied into the output, so no two workers touch the same memory.
/// Runs on whichever rayon pool is current.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParallelKernels;

impl ParallelKernels {
    /// Evaluate `unit` for every (baseline, channel) pair in parallel and
    /// scatter the resulting `(nout, npol)` series into `out`.
    fn scatter<F>(out: &mut VisibilityCube, unit: F)
    where
        F: Fn(usize, usize, usize, usize) -> Vec<Complex32> + Send + Sync,
    {
        let (nout, nbl, nchan, npol) = out.dim();
        if nout == 0 {
            return;
        }
        let series: Vec<(usize, usize, Vec<Complex32>)> = (0..nbl * nchan)
            .into_par_iter()
            .map(|unit_index| {
                let (j, k) = (unit_index / nchan, unit_index % nchan);
                (j, k, unit(j, k, nout, npol))
            })
            .collect();

        for (j, k, values) in series {
            for i in 0..nout {
                for l in 0..npol {
                    out[[i, j, k, l]] = values[i * npol + l];
                }
            }
        }
    }
}

impl Dedisperser for ParallelKernels {
    fn mode(&self) -> &'static str {
        "parallel"
    }

    fn dedisperse_kernel(&self, data: &VisibilityCube, delay: &[usize], out: &mut VisibilityCube) {
        Self::scatter(out, |j, k, nout, npol| {
            let mut values = Vec::with_capacity(nout * npol);
            for i in 0..nout {
                for l in 0..npol {
                    values.push(data[[i + delay[k], j, k, l]]);
                }
            }
            values
        });
    }

    fn resample_kernel(&self, data: &VisibilityCube, dt: usize, out: &mut VisibilityCube) {
        let scale = 1.0 / dt as f32;
        Self::scatter(out, |j, k, nout, npol| {
            let mut values = Vec::with_capacity(nout * npol);
            for i in 0..nout {
                for l in 0..npol {
                    let sum: Complex32 = (i * dt..(i + 1) * dt).map(|ip| data[[ip, j, k, l]]).sum();
                    values.push(sum * scale);
                }
            }
            values
        });
    }

    fn dedisperse_resample_kernel(
        &self,
        data: &VisibilityCube,
        delay: &[usize],
        dt: usize,
        out: &mut VisibilityCube,
    ) {
        Self::scatter(out, |j, k, nout, npol| {
            let mut values = Vec::with_capacity(nout * npol);
            for i in 0..nout {
                let start = i * dt + delay[k];
                for l in 0..npol {
                    values.push(flagged_mean((start..start + dt).map(|ip| data[[ip, j, k, l]])));
                }
            }
            values
        });
        debug!("Parallel dedisperse/resample filled {} integrations", out.dim().0);
    }
}

/// Kernel strategy for a thread count: more than one thread selects the
/// parallel kernels.
pub fn kernels_for(nthread: usize) -> Box<dyn Dedisperser> {
    if nthread > 1 {
        Box::new(ParallelKernels)
    } else {
        Box::new(SequentialKernels)
    }
}

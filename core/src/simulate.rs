//! Synthetic transients for exercising the search end to end.
//!
//! [`make_transient_data`] builds the dynamic spectrum of a dispersed pulse
//! of finite width, spreading each channel's flux over the integrations the
//! pulse overlaps.  [`inject_point_source`] adds that spectrum to every
//! baseline with the phase of a point source at `(l, m)`.

use std::f64::consts::PI;

use log::warn;
use ndarray::Array2;
use num_complex::Complex32;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::delay::calc_delay_seconds;
use crate::types::{Uvw, VisibilityCube};

/// Dynamic spectrum `(nchan, readints)` of a pulse of amplitude `amp`
/// starting at fractional integration `i0`, dispersed by `dm` and lasting
/// `dt` seconds.
///
/// A channel whose pulse spans two or three integrations has its flux split
/// by overlap fraction.  Wider channels are left empty with a warning, as
/// are samples that fall past the end of the block.
pub fn make_transient_data(
    freq: &[f64],
    readints: usize,
    inttime: f64,
    amp: f64,
    i0: f64,
    dm: f64,
    dt: f64,
) -> Array2<Complex32> {
    let nchan = freq.len();
    let mut model = Array2::<Complex32>::zeros((nchan, readints));
    let freq_ref = freq.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let delays = calc_delay_seconds(freq, freq_ref, dm, None);
    let width = dt / inttime;
    let mut too_broad = false;

    let mut add = |k: usize, i: i64, weight: f64| {
        if i >= 0 && (i as usize) < readints {
            model[[k, i as usize]] += Complex32::new((weight * amp) as f32, 0.0);
        }
    };

    for (k, delay) in delays.iter().enumerate() {
        let i = i0 + delay / inttime;
        let i_f = i.floor();
        let imax = (i + width).ceil();
        let span = (imax - i_f) as i64;
        let first = i_f as i64;
        match span {
            1 => add(k, first, 1.0),
            2 => {
                let f1 = (width - (i.ceil() - i)) / width;
                add(k, first, 1.0 - f1);
                add(k, first + 1, f1);
            }
            3 => {
                let f2 = (i + width - (imax - 1.0)) / width;
                let f0 = ((i_f + 1.0) - i) / width;
                add(k, first, f0);
                add(k, first + 1, 1.0 - f2 - f0);
                add(k, first + 2, f2);
            }
            _ => too_broad = true,
        }
    }
    if too_broad {
        warn!("Some channels broadened more than 3 integrations, which is not yet supported.");
    }
    model
}

/// Add `model` (`(nchan, nint)`) to every baseline and polarization of
/// `data`, phased as a point source at `(l, m)`.
pub fn inject_point_source(data: &mut VisibilityCube, uvw: &Uvw, model: &Array2<Complex32>, l: f64, m: f64) {
    let (nint, nbl, nchan, npol) = data.dim();
    let nint = nint.min(model.ncols());
    for j in 0..nbl {
        for k in 0..nchan {
            let phase = 2.0 * PI * (l * uvw.u[[j, k]] as f64 + m * uvw.v[[j, k]] as f64);
            let rot = Complex32::new(phase.cos() as f32, phase.sin() as f32);
            for i in 0..nint {
                let value = model[[k, i]] * rot;
                for p in 0..npol {
                    data[[i, j, k, p]] += value;
                }
            }
        }
    }
}

/// Independent complex Gaussian noise of standard deviation `sigma` in
/// each of the real and imaginary parts.
pub fn add_noise<R: Rng + ?Sized>(data: &mut VisibilityCube, sigma: f32, rng: &mut R) {
    let Ok(normal) = Normal::new(0.0f32, sigma) else {
        return;
    };
    data.mapv_inplace(|v| v + Complex32::new(normal.sample(rng), normal.sample(rng)));
}

//! Phase rotation of visibilities toward a sky offset.
//!
//! A point source at direction cosines `(l, m)` contributes
//! `A·exp(2πi(u·l + v·m))` to a baseline at `(u, v)`.  Multiplying by the
//! inverse phasor moves that source to the phase centre, after which the
//! baseline average is the source's spectrum.

use std::f64::consts::PI;

use ndarray::{Array1, Array3, ArrayView4, ArrayViewMut4};
use num_complex::Complex32;

use crate::types::Uvw;

/// Rotate `data` in place so that `(dl, dm)` becomes the phase centre.
///
/// `data` has shape `(nint, nbl, nchan, npol)` and is mutated; pass a copy
/// when the original must be kept.  A zero offset is a no-op.
pub fn phase_shift(mut data: ArrayViewMut4<'_, Complex32>, uvw: &Uvw, dl: f64, dm: f64) {
    if dl == 0.0 && dm == 0.0 {
        return;
    }
    let (nint, nbl, nchan, npol) = data.dim();
    for j in 0..nbl {
        for k in 0..nchan {
            let phase = -2.0 * PI * (dl * uvw.u[[j, k]] as f64 + dm * uvw.v[[j, k]] as f64);
            let frot = Complex32::new(phase.cos() as f32, phase.sin() as f32);
            for i in 0..nint {
                for l in 0..npol {
                    data[[i, j, k, l]] *= frot;
                }
            }
        }
    }
}

/// Average over the baseline axis, giving `(nint, nchan, npol)`.
pub fn mean_over_baselines(data: ArrayView4<'_, Complex32>) -> Array3<Complex32> {
    let (nint, nbl, nchan, npol) = data.dim();
    let mut out = Array3::zeros((nint, nchan, npol));
    if nbl == 0 {
        return out;
    }
    let scale = 1.0 / nbl as f32;
    for i in 0..nint {
        for j in 0..nbl {
            for k in 0..nchan {
                for l in 0..npol {
                    out[[i, k, l]] += data[[i, j, k, l]];
                }
            }
        }
    }
    out.mapv_inplace(|v| v * scale);
    out
}

/// Real spectrum of one integration, averaged over baselines and
/// polarizations.
pub fn real_spectrum(data: ArrayView4<'_, Complex32>, integration: usize) -> Array1<f64> {
    let (_, nbl, nchan, npol) = data.dim();
    let count = (nbl * npol).max(1) as f64;
    Array1::from_shape_fn(nchan, |k| {
        let mut sum = 0.0f64;
        for j in 0..nbl {
            for l in 0..npol {
                sum += data[[integration, j, k, l]].re as f64;
            }
        }
        sum / count
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array2, Array4};

    fn single_baseline(u: f32, v: f32) -> Uvw {
        Uvw {
            u: Array2::from_elem((1, 1), u),
            v: Array2::from_elem((1, 1), v),
            w: Array2::zeros((1, 1)),
        }
    }

    #[test]
    fn shift_undoes_source_phase() {
        let (l, m) = (0.002, -0.001);
        let uvw = single_baseline(120.0, 80.0);
        let phase = 2.0 * PI * (120.0 * l + 80.0 * m);
        let mut data = Array4::from_elem((2, 1, 1, 2), Complex32::new(phase.cos() as f32, phase.sin() as f32));
        phase_shift(data.view_mut(), &uvw, l, m);
        for v in data.iter() {
            assert_relative_eq!(v.re, 1.0, epsilon = 1e-5);
            assert_relative_eq!(v.im, 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn zero_offset_leaves_data_untouched() {
        let uvw = single_baseline(1e4, 1e4);
        let mut data = Array4::from_elem((1, 1, 1, 1), Complex32::new(0.3, 0.4));
        phase_shift(data.view_mut(), &uvw, 0.0, 0.0);
        assert_eq!(data[[0, 0, 0, 0]], Complex32::new(0.3, 0.4));
    }

    #[test]
    fn baseline_mean_and_spectrum() {
        let data = Array4::from_shape_fn((1, 2, 3, 2), |(_, j, k, l)| Complex32::new((j + k + l) as f32, 1.0));
        let mean = mean_over_baselines(data.view());
        assert_eq!(mean.dim(), (1, 3, 2));
        assert_relative_eq!(mean[[0, 1, 1]].re, 2.5);
        let spec = real_spectrum(data.view(), 0);
        // channel 2: values j + 2 + l over j, l ∈ {0, 1} → mean 3
        assert_relative_eq!(spec[2], 3.0);
    }
}

//! Gridding of visibilities onto a regular spatial-frequency plane.
//!
//! Each (baseline, channel) pair samples the sky's Fourier transform at
//! its `(u, v)` coordinate.  Gridding rounds that coordinate to the nearest
//! cell of a `npixx × npixy` plane and sums every polarization into it.
//! Because the sky brightness is real its transform is Hermitian, so only
//! the half plane `v ≥ 0` is stored: a sample with `v < 0` is placed,
//! conjugated, at `(−u, −v)`.  Grids therefore have shape
//! `(nint, npixx, npixy/2 + 1)`.

use log::debug;
use ndarray::{Array2, Array3, Axis};
use num_complex::Complex32;
use rayon::prelude::*;

use crate::types::{Uvw, VisibilityCube};

/// Length of the stored v axis for an image `npixy` pixels high.
pub fn half_plane(npixy: usize) -> usize {
    npixy / 2 + 1
}

/// Grid cell hit by one (baseline, channel) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridCell {
    pub baseline: usize,
    pub channel: usize,
    pub x: usize,
    pub y: usize,
    /// Sample was folded from the `v < 0` half and must be conjugated.
    pub conjugate: bool,
}

/// Map every (baseline, channel) pair to its grid cell, dropping pairs that
/// fall outside the imaged field (`|u'| ≥ npixx/2` or `|v'| ≥ npixy/2`).
pub fn grid_cells(uvw: &Uvw, npixx: usize, npixy: usize, uvres: f64) -> Vec<GridCell> {
    let half_x = (npixx / 2) as i64;
    let half_y = (npixy / 2) as i64;
    let mut cells = Vec::with_capacity(uvw.nbl() * uvw.nchan());

    for ((baseline, channel), &u) in uvw.u.indexed_iter() {
        let v = uvw.v[[baseline, channel]];
        let ubl = (u as f64 / uvres).round() as i64;
        let vbl = (v as f64 / uvres).round() as i64;
        if ubl.abs() >= half_x || vbl.abs() >= half_y {
            continue;
        }
        let (ubl, vbl, conjugate) = if vbl < 0 { (-ubl, -vbl, true) } else { (ubl, vbl, false) };
        cells.push(GridCell {
            baseline,
            channel,
            x: ubl.rem_euclid(npixx as i64) as usize,
            y: vbl as usize,
            conjugate,
        });
    }
    cells
}

#[inline]
fn cell_sum(data: &VisibilityCube, i: usize, cell: &GridCell) -> Complex32 {
    let npol = data.dim().3;
    let mut sum = Complex32::new(0.0, 0.0);
    for l in 0..npol {
        sum += data[[i, cell.baseline, cell.channel, l]];
    }
    if cell.conjugate {
        sum.conj()
    } else {
        sum
    }
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// A gridding strategy.  Implementations borrow the visibilities and
/// return newly allocated half-plane grids.
pub trait Gridder: Send + Sync {
    fn mode(&self) -> &'static str;

    fn grid(&self, data: &VisibilityCube, uvw: &Uvw, npixx: usize, npixy: usize, uvres: f64) -> Array3<Complex32>;
}

/// Single-core gridder.
#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialGridder;

impl Gridder for SequentialGridder {
    fn mode(&self) -> &'static str {
        "single"
    }

    fn grid(&self, data: &VisibilityCube, uvw: &Uvw, npixx: usize, npixy: usize, uvres: f64) -> Array3<Complex32> {
        let nint = data.dim().0;
        debug!(
            "Gridding {} ints at ({}, {}) pix and {} resolution in single mode.",
            nint, npixx, npixy, uvres
        );
        let cells = grid_cells(uvw, npixx, npixy, uvres);
        let mut grids = Array3::zeros((nint, npixx, half_plane(npixy)));
        for cell in &cells {
            for i in 0..nint {
                grids[[i, cell.x, cell.y]] += cell_sum(data, i, cell);
            }
        }
        grids
    }
}

/// Gridder that builds each integration's plane on its own rayon task.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParallelGridder;

impl Gridder for ParallelGridder {
    fn mode(&self) -> &'static str {
        "parallel"
    }

    fn grid(&self, data: &VisibilityCube, uvw: &Uvw, npixx: usize, npixy: usize, uvres: f64) -> Array3<Complex32> {
        let nint = data.dim().0;
        debug!(
            "Gridding {} ints at ({}, {}) pix and {} resolution in parallel mode.",
            nint, npixx, npixy, uvres
        );
        let cells = grid_cells(uvw, npixx, npixy, uvres);
        let planes: Vec<Array2<Complex32>> = (0..nint)
            .into_par_iter()
            .map(|i| {
                let mut plane = Array2::zeros((npixx, half_plane(npixy)));
                for cell in &cells {
                    plane[[cell.x, cell.y]] += cell_sum(data, i, cell);
                }
                plane
            })
            .collect();

        let mut grids = Array3::zeros((nint, npixx, half_plane(npixy)));
        for (i, plane) in planes.into_iter().enumerate() {
            grids.index_axis_mut(Axis(0), i).assign(&plane);
        }
        grids
    }
}

/// Gridding strategy for a thread count.
pub fn gridder_for(nthread: usize) -> Box<dyn Gridder> {
    if nthread > 1 {
        Box::new(ParallelGridder)
    } else {
        Box::new(SequentialGridder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn uvw_from(u: &[f32], v: &[f32]) -> Uvw {
        let n = u.len();
        Uvw {
            u: Array2::from_shape_vec((n, 1), u.to_vec()).unwrap(),
            v: Array2::from_shape_vec((n, 1), v.to_vec()).unwrap(),
            w: Array2::zeros((n, 1)),
        }
    }

    #[test]
    fn cells_round_and_fold() {
        let uvw = uvw_from(&[49.0, -110.0, 20.0, 500.0], &[26.0, -60.0, 0.0, 0.0]);
        let cells = grid_cells(&uvw, 16, 16, 50.0);
        // Fourth baseline is at |u'| = 10 ≥ 8 and is dropped.
        assert_eq!(cells.len(), 3);
        assert_eq!((cells[0].x, cells[0].y, cells[0].conjugate), (1, 1, false));
        // (-2, -1) folds to (2, 1), conjugated.
        assert_eq!((cells[1].x, cells[1].y, cells[1].conjugate), (2, 1, true));
        assert_eq!((cells[2].x, cells[2].y), (0, 0));
    }

    #[test]
    fn negative_u_wraps_modulo_npixx() {
        let uvw = uvw_from(&[-150.0], &[100.0]);
        let cells = grid_cells(&uvw, 16, 16, 50.0);
        assert_eq!((cells[0].x, cells[0].y), (13, 2));
    }

    #[test]
    fn polarizations_are_summed_and_folded_conjugated() {
        let uvw = uvw_from(&[100.0, 50.0], &[50.0, -50.0]);
        let mut data = Array4::zeros((2, 2, 1, 2));
        data[[1, 0, 0, 0]] = Complex32::new(1.0, 1.0);
        data[[1, 0, 0, 1]] = Complex32::new(2.0, -3.0);
        data[[0, 1, 0, 0]] = Complex32::new(0.5, 2.0);
        let grids = SequentialGridder.grid(&data, &uvw, 8, 8, 50.0);
        assert_eq!(grids.dim(), (2, 8, 5));
        assert_eq!(grids[[1, 2, 1]], Complex32::new(3.0, -2.0));
        assert_eq!(grids[[0, 7, 1]], Complex32::new(0.5, -2.0));
    }

    #[test]
    fn strategies_agree() {
        let u: Vec<f32> = (0..20).map(|j| (j as f32 - 10.0) * 37.0).collect();
        let v: Vec<f32> = (0..20).map(|j| (j as f32 * 13.0) % 300.0 - 150.0).collect();
        let uvw = uvw_from(&u, &v);
        let data = Array4::from_shape_fn((5, 20, 1, 2), |(i, j, _, l)| {
            Complex32::new((i + j) as f32, (j * l) as f32 - 1.0)
        });
        let seq = SequentialGridder.grid(&data, &uvw, 32, 32, 25.0);
        let par = ParallelGridder.grid(&data, &uvw, 32, 32, 25.0);
        assert_eq!(seq, par);
    }
}

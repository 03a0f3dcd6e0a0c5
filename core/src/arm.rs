//! Arm search: a fast, experimental alternative to full imaging.
//!
//! Baselines formed entirely within one linear arm of a Y-shaped array
//! sample the sky along a single direction.  Gridding them by projected
//! length and applying a 1-D transform gives one brightness profile per
//! arm.  A point source appears in all three profiles, so a trigger needs a
//! joint excursion: a pixel above threshold in each of the first two arms
//! and a combined score above the trigger level once the third arm's
//! matching pixel is added.
//!
//! The geometric map from a pair of arm pixels to the matching pixel of the
//! third arm is not yet derived.  [`placeholder_arm_map`] supplies random
//! indices so the path can be exercised; detections it produces are always
//! confirmed by a full image before being kept.

use log::debug;
use ndarray::{Array2, Axis};
use num_complex::Complex32;
use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::image::{image_1d, PlanCache};
use crate::kalman::image_significance;
use crate::types::{Uvw, VisibilityCube};

/// Arm of a Y-shaped array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arm {
    North,
    East,
    West,
}

/// Baseline indices whose two antennas lie on the same arm.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmLayout {
    pub north: Vec<usize>,
    pub east: Vec<usize>,
    pub west: Vec<usize>,
}

impl ArmLayout {
    /// Classify baselines from the arm of each of their two antennas.
    /// Cross-arm baselines are left out.
    pub fn from_baseline_arms(arms: &[(Arm, Arm)]) -> Self {
        let mut layout = ArmLayout::default();
        for (j, &(a, b)) in arms.iter().enumerate() {
            if a != b {
                continue;
            }
            match a {
                Arm::North => layout.north.push(j),
                Arm::East => layout.east.push(j),
                Arm::West => layout.west.push(j),
            }
        }
        layout
    }

    pub fn baselines(&self, arm: Arm) -> &[usize] {
        match arm {
            Arm::North => &self.north,
            Arm::East => &self.east,
            Arm::West => &self.west,
        }
    }
}

/// Grid the given integrations of one arm's baselines by projected length
/// `sqrt(u² + v²)` into `(nintegrations, npix)` cells, summing
/// polarizations.
///
/// Lengths are truncated to whole cells; those at or beyond `npix / 2`
/// cells are dropped.
pub fn grid_arm(
    data: &VisibilityCube,
    uvw: &Uvw,
    baselines: &[usize],
    integrations: &[usize],
    npix: usize,
    uvres: f64,
) -> Array2<Complex32> {
    let npol = data.dim().3;
    let nchan = uvw.nchan();
    let mut grids = Array2::zeros((integrations.len(), npix));
    for &j in baselines {
        for k in 0..nchan {
            let (u, v) = (uvw.u[[j, k]] as f64, uvw.v[[j, k]] as f64);
            let cell = ((u * u + v * v).sqrt() / uvres) as usize;
            if cell >= npix / 2 {
                continue;
            }
            for (row, &i) in integrations.iter().enumerate() {
                for l in 0..npol {
                    grids[[row, cell]] += data[[i, j, k, l]];
                }
            }
        }
    }
    grids
}

/// 1-D images of the north, east and west arms, each `(nintegrations, npix)`.
pub fn image_arms(
    data: &VisibilityCube,
    uvw: &Uvw,
    layout: &ArmLayout,
    integrations: &[usize],
    npix: usize,
    uvres: f64,
    plans: &PlanCache,
) -> [Array2<f32>; 3] {
    let plan = plans.prepare(npix, 1);
    [Arm::North, Arm::East, Arm::West].map(|arm| {
        let grids = grid_arm(data, uvw, layout.baselines(arm), integrations, npix, uvres);
        image_1d(&grids, &plan)
    })
}

/// Random stand-in for the cross-arm pixel map: entry `[p1, p2]` is the
/// third-arm pixel paired with pixel `p1` of arm 1 and `p2` of arm 2.
pub fn placeholder_arm_map<R: Rng + ?Sized>(npix: usize, rng: &mut R) -> Array2<usize> {
    Array2::from_shape_fn((npix, npix), |_| if npix > 0 { rng.gen_range(0..npix) } else { 0 })
}

fn population_std(values: &Array2<f32>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|&v| v as f64).population_std_dev()
}

/// Joint three-arm threshold.  Returns `(row, snrarm)` for every row of
/// the arm images with a trigger, keeping the best score of each row.
///
/// Per-arm thresholds are `η(sigma_arm)·std` and the trigger is
/// `η(sigma_arms)·sqrt(Σ std²)`, with `η(σ) = −ln sf(σ)`.  `stds` defaults
/// to each arm's standard deviation over all rows and pixels.
pub fn search_thresh_arms(
    arms: &[Array2<f32>; 3],
    map: &Array2<usize>,
    sigma_arm: f64,
    sigma_arms: f64,
    stds: Option<[f64; 3]>,
) -> Vec<(usize, f64)> {
    let [arm1, arm2, arm3] = arms;
    let [std1, std2, std3] = stds.unwrap_or_else(|| arms.each_ref().map(population_std));
    let eta_arm = image_significance(sigma_arm);
    let eta_trigger = image_significance(sigma_arms);
    let effective_trigger = eta_trigger * (std1 * std1 + std2 * std2 + std3 * std3).sqrt();
    debug!(
        "Arm thresholds {:.3}/{:.3}, trigger {:.3}",
        eta_arm * std1,
        eta_arm * std2,
        effective_trigger
    );

    let above = |row: ndarray::ArrayView1<'_, f32>, level: f64| -> Vec<usize> {
        row.iter()
            .enumerate()
            .filter(|&(_, &v)| v as f64 > level)
            .map(|(p, _)| p)
            .collect()
    };

    let npix3 = arm3.len_of(Axis(1));
    let mut candisnr = Vec::new();
    for (i, (row1, row2)) in arm1.outer_iter().zip(arm2.outer_iter()).enumerate() {
        let ind1 = above(row1, eta_arm * std1);
        let ind2 = above(row2, eta_arm * std2);
        let mut best: Option<f64> = None;
        for &p1 in &ind1 {
            for &p2 in &ind2 {
                let Some(&p3) = map.get((p1, p2)) else {
                    continue;
                };
                if p3 >= npix3 {
                    continue;
                }
                let score = (row1[p1] + row2[p2] + arm3[[i, p3]]) as f64;
                if score > effective_trigger && best.map_or(true, |b| score > b) {
                    best = Some(score);
                }
            }
        }
        if let Some(score) = best {
            candisnr.push((i, (2.0 * score).sqrt()));
        }
    }
    candisnr
}

/// Which pair of indices of a `T[i, j] = k` table to exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableInversion {
    /// Build `T'[i, k] = j`.
    SwapSecondThird,
    /// Build `T'[j, k] = i`.
    SwapFirstThird,
}

/// Re-key a pixel map so a different pair of arms indexes it.  Cells that
/// no entry maps to are zero; entries out of range are ignored.
pub fn invert_table_indices(table: &Array2<usize>, inversion: TableInversion) -> Array2<usize> {
    let (nrow, ncol) = table.dim();
    let mut out = Array2::zeros((nrow, ncol));
    for ((i, j), &k) in table.indexed_iter() {
        let (row, value) = match inversion {
            TableInversion::SwapSecondThird => (i, j),
            TableInversion::SwapFirstThird => (j, i),
        };
        if row < nrow && k < ncol {
            out[[row, k]] = value;
        }
    }
    out
}

//! Accelerator device contract for the Stokes-I imaging path.
//!
//! The device search uploads one Stokes-I visibility block per segment and
//! keeps it resident.  Each DM trial is expressed as a per-channel time
//! shift applied while gridding, each dt step halves the resident block in
//! place, and images stay on the device until their statistics show they
//! are worth downloading.
//!
//! [`HostDevice`] implements the contract in ordinary memory.  It is the
//! device used when no accelerator binding is compiled in, and it makes the
//! device search path testable anywhere.

use std::sync::Arc;

use log::debug;
use ndarray::{Array2, Array3};
use num_complex::Complex32;

use crate::grid::{grid_cells, half_plane, GridCell};
use crate::image::{image_grid, peak, rms, PlanCache};
use crate::types::Uvw;

/// Errors raised by device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no visibilities uploaded")]
    NotUploaded,

    #[error("integration {integration} out of range for {nint} resident integrations")]
    IntegrationOutOfRange { integration: usize, nint: usize },

    #[error("{shifts} channel shifts given for {nchan} channels")]
    ShiftMismatch { shifts: usize, nchan: usize },

    #[error("uvw covers {uvw_nbl}x{uvw_nchan} but data holds {nbl}x{nchan}")]
    UvwMismatch {
        uvw_nbl: usize,
        uvw_nchan: usize,
        nbl: usize,
        nchan: usize,
    },

    #[error("image handle is stale; the device buffer has since been overwritten")]
    StaleImage,
}

/// Handle to an image held in device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceImage {
    pub npixx: usize,
    pub npixy: usize,
    generation: u64,
}

/// Device-resident Stokes-I imaging.
pub trait Device: Send {
    fn name(&self) -> &str;

    /// Copy a `(nbl, nchan, nint)` Stokes-I block to the device, replacing
    /// whatever was resident.
    fn upload(&mut self, vis: Array3<Complex32>);

    /// Integrations currently resident.
    fn nint(&self) -> usize;

    /// Halve the resident time axis in place, averaging adjacent pairs.
    fn downsample(&mut self) -> Result<(), DeviceError>;

    /// Grid and image one integration, reading channel `k` at
    /// `integration + shifts[k]`.  The image stays on the device.
    fn grid_image(
        &mut self,
        integration: usize,
        shifts: &[usize],
        uvw: &Uvw,
        npixx: usize,
        npixy: usize,
        uvres: f64,
    ) -> Result<DeviceImage, DeviceError>;

    /// `(max, rms)` of a resident image.
    fn stats(&self, image: &DeviceImage) -> Result<(f64, f64), DeviceError>;

    /// Copy a resident image to the host.
    fn download(&self, image: &DeviceImage) -> Result<Array2<f32>, DeviceError>;
}

/// Reference device in host memory.
pub struct HostDevice {
    plans: Arc<PlanCache>,
    vis: Option<Array3<Complex32>>,
    cells: Option<((usize, usize, u64), Vec<GridCell>)>,
    image: Array2<f32>,
    generation: u64,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_plans(PlanCache::global())
    }

    pub fn with_plans(plans: Arc<PlanCache>) -> Self {
        Self {
            plans,
            vis: None,
            cells: None,
            image: Array2::zeros((0, 0)),
            generation: 0,
        }
    }

    fn check_handle(&self, image: &DeviceImage) -> Result<(), DeviceError> {
        if image.generation != self.generation || self.generation == 0 {
            return Err(DeviceError::StaleImage);
        }
        Ok(())
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn upload(&mut self, vis: Array3<Complex32>) {
        debug!("Uploading {:?} visibilities to host device", vis.dim());
        self.vis = Some(vis);
        self.cells = None;
    }

    fn nint(&self) -> usize {
        self.vis.as_ref().map_or(0, |v| v.dim().2)
    }

    fn downsample(&mut self) -> Result<(), DeviceError> {
        let vis = self.vis.as_mut().ok_or(DeviceError::NotUploaded)?;
        let (nbl, nchan, nint) = vis.dim();
        let halved = Array3::from_shape_fn((nbl, nchan, nint / 2), |(j, k, t)| {
            (vis[[j, k, 2 * t]] + vis[[j, k, 2 * t + 1]]) * 0.5
        });
        *vis = halved;
        Ok(())
    }

    fn grid_image(
        &mut self,
        integration: usize,
        shifts: &[usize],
        uvw: &Uvw,
        npixx: usize,
        npixy: usize,
        uvres: f64,
    ) -> Result<DeviceImage, DeviceError> {
        let vis = self.vis.as_ref().ok_or(DeviceError::NotUploaded)?;
        let (nbl, nchan, nint) = vis.dim();
        if integration >= nint {
            return Err(DeviceError::IntegrationOutOfRange { integration, nint });
        }
        if shifts.len() != nchan {
            return Err(DeviceError::ShiftMismatch {
                shifts: shifts.len(),
                nchan,
            });
        }
        if uvw.nbl() != nbl || uvw.nchan() != nchan {
            return Err(DeviceError::UvwMismatch {
                uvw_nbl: uvw.nbl(),
                uvw_nchan: uvw.nchan(),
                nbl,
                nchan,
            });
        }

        let key = (npixx, npixy, uvres.to_bits());
        if self.cells.as_ref().map(|(k, _)| *k) != Some(key) {
            self.cells = Some((key, grid_cells(uvw, npixx, npixy, uvres)));
        }
        let cells = self.cells.as_ref().map(|(_, c)| c.as_slice()).unwrap_or(&[]);

        let mut grid = Array2::<Complex32>::zeros((npixx, half_plane(npixy)));
        for cell in cells {
            let t = integration + shifts[cell.channel];
            if t >= nint {
                continue;
            }
            let sample = vis[[cell.baseline, cell.channel, t]];
            grid[[cell.x, cell.y]] += if cell.conjugate { sample.conj() } else { sample };
        }

        let plan = self.plans.prepare(npixx, npixy);
        self.image = image_grid(grid.view(), &plan);
        self.generation += 1;
        Ok(DeviceImage {
            npixx,
            npixy,
            generation: self.generation,
        })
    }

    fn stats(&self, image: &DeviceImage) -> Result<(f64, f64), DeviceError> {
        self.check_handle(image)?;
        let (max, _) = peak(self.image.view());
        Ok((max, rms(self.image.view())))
    }

    fn download(&self, image: &DeviceImage) -> Result<Array2<f32>, DeviceError> {
        self.check_handle(image)?;
        Ok(self.image.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn point_uvw() -> Uvw {
        Uvw {
            u: Array2::from_shape_vec((2, 2), vec![100.0, 110.0, -60.0, -66.0]).unwrap(),
            v: Array2::from_shape_vec((2, 2), vec![40.0, 44.0, 80.0, 88.0]).unwrap(),
            w: Array2::zeros((2, 2)),
        }
    }

    #[test]
    fn downsample_averages_pairs_and_drops_remainder() {
        let mut device = HostDevice::with_plans(Arc::new(PlanCache::new()));
        let vis = Array3::from_shape_fn((1, 1, 5), |(_, _, t)| Complex32::new(t as f32, 0.0));
        device.upload(vis);
        device.downsample().unwrap();
        assert_eq!(device.nint(), 2);
        device.downsample().unwrap();
        assert_eq!(device.nint(), 1);
        // ((0 + 1)/2 + (2 + 3)/2) / 2
        let image_at_dc = {
            let uvw = Uvw {
                u: Array2::zeros((1, 1)),
                v: Array2::zeros((1, 1)),
                w: Array2::zeros((1, 1)),
            };
            let handle = device.grid_image(0, &[0], &uvw, 4, 4, 10.0).unwrap();
            device.download(&handle).unwrap()
        };
        assert_relative_eq!(image_at_dc[[0, 0]] * 16.0, 1.5, epsilon = 1e-5);
    }

    #[test]
    fn shifted_channel_reads_later_integration() {
        let mut device = HostDevice::with_plans(Arc::new(PlanCache::new()));
        let mut vis = Array3::zeros((2, 2, 4));
        vis[[0, 1, 3]] = Complex32::new(1.0, 0.0);
        device.upload(vis);
        let uvw = point_uvw();
        let unshifted = device.grid_image(1, &[0, 0], &uvw, 16, 16, 20.0).unwrap();
        let (max0, _) = device.stats(&unshifted).unwrap();
        assert_eq!(max0, 0.0);
        let shifted = device.grid_image(1, &[0, 2], &uvw, 16, 16, 20.0).unwrap();
        let (max1, rms1) = device.stats(&shifted).unwrap();
        assert!(max1 > 0.0);
        assert!(rms1 > 0.0);
        assert!(matches!(device.stats(&unshifted), Err(DeviceError::StaleImage)));
    }

    #[test]
    fn misuse_is_reported() {
        let mut device = HostDevice::with_plans(Arc::new(PlanCache::new()));
        assert!(matches!(device.downsample(), Err(DeviceError::NotUploaded)));
        device.upload(Array3::zeros((2, 2, 3)));
        let uvw = point_uvw();
        assert!(matches!(
            device.grid_image(3, &[0, 0], &uvw, 8, 8, 20.0),
            Err(DeviceError::IntegrationOutOfRange { .. })
        ));
        assert!(matches!(
            device.grid_image(0, &[0], &uvw, 8, 8, 20.0),
            Err(DeviceError::ShiftMismatch { .. })
        ));
    }
}

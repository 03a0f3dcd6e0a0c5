//! Collaborator seams of the search loop: which integrations to search for
//! each trial, and where a segment's baseline coordinates come from.

use std::sync::Mutex;

use log::debug;

use crate::delay::{max_delay, TrialGrid};
use crate::types::{RunMetadata, Uvw};

// ---------------------------------------------------------------------------
// Integration selection
// ---------------------------------------------------------------------------

/// Integrations (indices into the dedispersed, resampled block) to search
/// for one `(segment, dmind, dtind)` trial.
pub trait IntegrationPolicy: Sync {
    fn integrations(&self, segment: usize, dmind: usize, dtind: usize) -> Vec<usize>;
}

impl<F> IntegrationPolicy for F
where
    F: Fn(usize, usize, usize) -> Vec<usize> + Sync,
{
    fn integrations(&self, segment: usize, dmind: usize, dtind: usize) -> Vec<usize> {
        self(segment, dmind, dtind)
    }
}

/// Search every valid integration once across overlapping segments.
///
/// A dedispersed, resampled block for trial `(dm, dt)` holds
/// `(readints - maxdelay[dm]) / dt` integrations.  Consecutive segments
/// overlap by `overlap_ints` raw integrations, so every segment after the
/// first skips the `overlap_ints / dt` integrations its predecessor
/// already covered.
#[derive(Clone, Debug)]
pub struct SegmentOverlapPolicy {
    pub readints: usize,
    pub maxdelays: Vec<usize>,
    pub dts: Vec<usize>,
    pub overlap_ints: usize,
}

impl SegmentOverlapPolicy {
    pub fn new(readints: usize, maxdelays: Vec<usize>, dts: Vec<usize>, overlap_ints: usize) -> Self {
        Self {
            readints,
            maxdelays,
            dts,
            overlap_ints,
        }
    }

    /// Policy for a trial grid, with segments overlapping by the largest
    /// dispersion delay of the grid.
    pub fn for_trial_grid(metadata: &RunMetadata, grid: &TrialGrid) -> Self {
        let maxdelays: Vec<usize> = grid
            .delays(&metadata.freq, metadata.inttime)
            .iter()
            .map(|d| max_delay(d))
            .collect();
        let overlap = maxdelays.iter().copied().max().unwrap_or(0);
        Self::new(metadata.readints, maxdelays, grid.dts.clone(), overlap)
    }

    /// Length of the searchable block for a trial.
    pub fn searchable(&self, dmind: usize, dtind: usize) -> usize {
        let maxdelay = self.maxdelays.get(dmind).copied().unwrap_or(0);
        let dt = self.dts.get(dtind).copied().unwrap_or(1).max(1);
        self.readints.saturating_sub(maxdelay) / dt
    }
}

impl IntegrationPolicy for SegmentOverlapPolicy {
    fn integrations(&self, segment: usize, dmind: usize, dtind: usize) -> Vec<usize> {
        let len = self.searchable(dmind, dtind);
        let start = if segment == 0 {
            0
        } else {
            let dt = self.dts.get(dtind).copied().unwrap_or(1).max(1);
            self.overlap_ints / dt
        };
        (start.min(len)..len).collect()
    }
}

// ---------------------------------------------------------------------------
// uvw provider
// ---------------------------------------------------------------------------

/// Source of baseline coordinates for a segment.
pub trait UvwProvider: Sync {
    fn uvw(&self, segment: usize) -> Uvw;
}

impl<F> UvwProvider for F
where
    F: Fn(usize) -> Uvw + Sync,
{
    fn uvw(&self, segment: usize) -> Uvw {
        self(segment)
    }
}

/// The same coordinates for every segment.
#[derive(Clone, Debug)]
pub struct FixedUvw(pub Uvw);

impl UvwProvider for FixedUvw {
    fn uvw(&self, _segment: usize) -> Uvw {
        self.0.clone()
    }
}

/// Fetch coordinates, holding `lock` only for the duration of the call.
///
/// Providers backed by non-reentrant geometry libraries share one lock
/// among all callers; a poisoned lock is still taken.
pub fn fetch_uvw(provider: &dyn UvwProvider, segment: usize, lock: Option<&Mutex<()>>) -> Uvw {
    match lock {
        Some(lock) => {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            debug!("Fetching uvw for segment {} under lock", segment);
            provider.uvw(segment)
        }
        None => provider.uvw(segment),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn first_segment_searches_from_zero() {
        let policy = SegmentOverlapPolicy::new(100, vec![0, 10], vec![1, 2], 10);
        assert_eq!(policy.integrations(0, 0, 0), (0..100).collect::<Vec<_>>());
        assert_eq!(policy.integrations(0, 1, 1), (0..45).collect::<Vec<_>>());
    }

    #[test]
    fn later_segments_skip_the_overlap() {
        let policy = SegmentOverlapPolicy::new(100, vec![0, 10], vec![1, 2], 10);
        assert_eq!(policy.integrations(1, 1, 0).first(), Some(&10));
        assert_eq!(policy.integrations(1, 1, 0).len(), 80);
        assert_eq!(policy.integrations(3, 0, 1), (5..50).collect::<Vec<_>>());
    }

    #[test]
    fn policy_from_trial_grid_uses_largest_delay() {
        let metadata = RunMetadata {
            datasetid: "grid".into(),
            freq: vec![1.0, 1.5, 2.0],
            inttime: 0.01,
            readints: 64,
            nbl: 1,
            npol: 1,
        };
        let grid = TrialGrid::new(vec![0.0, 50.0], vec![1, 2]);
        let policy = SegmentOverlapPolicy::for_trial_grid(&metadata, &grid);
        // 4.1488e-3 * 50 * (1 - 0.25) / 0.01 = 15.558 → 15
        assert_eq!(policy.maxdelays, vec![0, 15]);
        assert_eq!(policy.overlap_ints, 15);
        assert_eq!(policy.searchable(1, 1), 24);
    }

    #[test]
    fn closures_serve_as_collaborators() {
        let every_other = |_: usize, _: usize, _: usize| vec![0, 2, 4];
        assert_eq!(every_other.integrations(0, 0, 0), vec![0, 2, 4]);

        let uvw = Uvw {
            u: Array2::from_elem((2, 3), 1.0),
            v: Array2::zeros((2, 3)),
            w: Array2::zeros((2, 3)),
        };
        let lock = Mutex::new(());
        let provider = FixedUvw(uvw.clone());
        assert_eq!(fetch_uvw(&provider, 7, Some(&lock)), uvw);
        assert!(lock.try_lock().is_ok());
    }
}

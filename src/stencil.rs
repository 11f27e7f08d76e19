//! Per-row inclusion masks
//!
//! An [`ImageStencil`] stores, for every `(y, z)` row of an extent, a sorted
//! list of inclusive x runs that are "inside". The reslice engine reads one to
//! skip excluded runs, and can produce one that records which output voxels
//! were interpolated from the input.

use serde::{Deserialize, Serialize};

use crate::image::Extent;

/// Sorted, non-overlapping inclusive x runs per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStencil {
    extent: Extent,
    rows: Vec<Vec<(i32, i32)>>,
}

impl ImageStencil {
    /// Empty stencil (nothing inside) over `extent`.
    pub fn new(extent: Extent) -> Self {
        let [_, ny, nz] = extent.dims();
        Self {
            extent,
            rows: vec![Vec::new(); ny * nz],
        }
    }

    /// Stencil whose inside voxels are those where `f(x, y, z)` is true.
    pub fn from_fn<G>(extent: Extent, mut f: G) -> Self
    where
        G: FnMut(i32, i32, i32) -> bool,
    {
        let mut stencil = Self::new(extent);
        for z in extent.min(2)..=extent.max(2) {
            for y in extent.min(1)..=extent.max(1) {
                let mut start = None;
                for x in extent.min(0)..=extent.max(0) {
                    match (f(x, y, z), start) {
                        (true, None) => start = Some(x),
                        (false, Some(s)) => {
                            stencil.insert_next_extent(s, x - 1, y, z);
                            start = None;
                        }
                        _ => {}
                    }
                }
                if let Some(s) = start {
                    stencil.insert_next_extent(s, extent.max(0), y, z);
                }
            }
        }
        stencil
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    #[inline]
    fn row_index(&self, y: i32, z: i32) -> Option<usize> {
        let e = &self.extent;
        if y < e.min(1) || y > e.max(1) || z < e.min(2) || z > e.max(2) {
            return None;
        }
        Some((z - e.min(2)) as usize * e.len(1) + (y - e.min(1)) as usize)
    }

    /// Append the run `[x0, x1]` to row `(y, z)`.
    ///
    /// Runs are expected in increasing x order within a row; a run that
    /// touches or overlaps the previous one is merged into it. Rows outside
    /// the stencil extent are ignored.
    pub fn insert_next_extent(&mut self, x0: i32, x1: i32, y: i32, z: i32) {
        if x1 < x0 {
            return;
        }
        let Some(r) = self.row_index(y, z) else {
            return;
        };
        let row = &mut self.rows[r];
        match row.last_mut() {
            Some(last) if x0 <= last.1 + 1 && x0 >= last.0 => last.1 = last.1.max(x1),
            Some(last) if x0 < last.0 => {
                row.push((x0, x1));
                normalize(row);
            }
            _ => row.push((x0, x1)),
        }
    }

    /// Inside runs of row `(y, z)`.
    pub fn extents(&self, y: i32, z: i32) -> &[(i32, i32)] {
        match self.row_index(y, z) {
            Some(r) => &self.rows[r],
            None => &[],
        }
    }

    pub fn is_inside(&self, x: i32, y: i32, z: i32) -> bool {
        self.extents(y, z).iter().any(|&(a, b)| x >= a && x <= b)
    }

    /// Split `[x0, x1]` of row `(y, z)` into consecutive `(start, end, inside)` spans.
    pub fn spans(&self, y: i32, z: i32, x0: i32, x1: i32) -> Vec<(i32, i32, bool)> {
        let mut out = Vec::new();
        let mut x = x0;
        for &(a, b) in self.extents(y, z) {
            if b < x {
                continue;
            }
            if a > x1 {
                break;
            }
            let a = a.max(x);
            if a > x {
                out.push((x, a - 1, false));
            }
            let b = b.min(x1);
            out.push((a, b, true));
            x = b + 1;
        }
        if x <= x1 {
            out.push((x, x1, false));
        }
        out
    }

    /// Add every run of `other` (union), over this stencil's extent.
    pub fn merge(&mut self, other: &ImageStencil) {
        let e = other.extent;
        for z in e.min(2)..=e.max(2) {
            for y in e.min(1)..=e.max(1) {
                let Some(r) = self.row_index(y, z) else {
                    continue;
                };
                let row = &mut self.rows[r];
                row.extend_from_slice(other.extents(y, z));
                normalize(row);
            }
        }
    }

    /// Replace row `(y, z)` with already sorted runs.
    pub(crate) fn set_row(&mut self, y: i32, z: i32, runs: Vec<(i32, i32)>) {
        if let Some(r) = self.row_index(y, z) {
            self.rows[r] = runs;
            normalize(&mut self.rows[r]);
        }
    }

    /// Number of voxels inside.
    pub fn count_inside(&self) -> usize {
        self.rows
            .iter()
            .flatten()
            .map(|&(a, b)| (b - a + 1) as usize)
            .sum()
    }
}

// sort and coalesce touching runs
fn normalize(row: &mut Vec<(i32, i32)>) {
    row.sort_unstable();
    let mut merged: Vec<(i32, i32)> = Vec::with_capacity(row.len());
    for &(a, b) in row.iter() {
        match merged.last_mut() {
            Some(last) if a <= last.1 + 1 => last.1 = last.1.max(b),
            _ => merged.push((a, b)),
        }
    }
    *row = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_adjacent_runs() {
        let mut s = ImageStencil::new(Extent::from_dims([10, 2, 1]));
        s.insert_next_extent(1, 3, 0, 0);
        s.insert_next_extent(4, 5, 0, 0);
        s.insert_next_extent(8, 9, 0, 0);
        s.insert_next_extent(0, 0, 1, 0);
        assert_eq!(s.extents(0, 0), &[(1, 5), (8, 9)]);
        assert_eq!(s.extents(1, 0), &[(0, 0)]);
        assert_eq!(s.count_inside(), 8);
        // out of order and outside rows
        s.insert_next_extent(6, 6, 0, 0);
        s.insert_next_extent(2, 2, 5, 0);
        assert_eq!(s.extents(0, 0), &[(1, 6), (8, 9)]);
        assert!(s.extents(5, 0).is_empty());
    }

    #[test]
    fn test_spans_cover_the_range() {
        let s = ImageStencil::from_fn(Extent::from_dims([12, 1, 1]), |x, _, _| {
            (2..=4).contains(&x) || (7..=8).contains(&x)
        });
        assert_eq!(s.extents(0, 0), &[(2, 4), (7, 8)]);
        assert_eq!(
            s.spans(0, 0, 0, 11),
            vec![
                (0, 1, false),
                (2, 4, true),
                (5, 6, false),
                (7, 8, true),
                (9, 11, false)
            ]
        );
        assert_eq!(s.spans(0, 0, 3, 7), vec![(3, 4, true), (5, 6, false), (7, 7, true)]);
        assert_eq!(s.spans(3, 0, 0, 2), vec![(0, 2, false)]);
        assert!(s.is_inside(8, 0, 0));
        assert!(!s.is_inside(9, 0, 0));
    }

    #[test]
    fn test_merge_is_a_union() {
        let e = Extent::from_dims([8, 2, 2]);
        let mut a = ImageStencil::from_fn(e, |x, y, _| y == 0 && x < 3);
        let b = ImageStencil::from_fn(e, |x, _, z| z == 1 || x == 3);
        a.merge(&b);
        assert_eq!(a.extents(0, 0), &[(0, 3)]);
        assert_eq!(a.extents(1, 1), &[(0, 7)]);
        assert_eq!(a.count_inside(), 4 + 1 + 16);
    }
}

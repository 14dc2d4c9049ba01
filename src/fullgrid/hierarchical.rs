//! One-dimensional hierarchical index arithmetic.
//!
//! Along a dimension of level `l` the grid spans the positions
//! `x = 0..=N` with `N = 2^l`. With boundary points the global 1-D index is
//! `x` itself; without them only `x = 1..N-1` exist and the index is `x - 1`.
//!
//! An interior point at position `x` has level `l - tz(x)` (`tz` = trailing
//! zeros) and its hierarchical predecessors sit at `x ± 2^(l - level)`.
//! Boundary points have level 0 but are stored in the level-1 subspace,
//! which then holds 3 points instead of 1.

use crate::levels::LevelType;
use std::ops::Range;

#[inline]
fn span(level: LevelType) -> usize {
    1usize << level
}

/// Number of grid points along one dimension.
#[inline]
pub fn num_points(level: LevelType, boundary: bool) -> usize {
    if boundary {
        span(level) + 1
    } else {
        span(level) - 1
    }
}

/// Position `x` of global 1-D index `idx`.
#[inline]
pub fn position(idx: usize, boundary: bool) -> usize {
    if boundary { idx } else { idx + 1 }
}

/// Global 1-D index of position `x`, if that point exists.
#[inline]
pub fn index_of(x: usize, level: LevelType, boundary: bool) -> Option<usize> {
    let n = span(level);
    if boundary {
        (x <= n).then_some(x)
    } else {
        (x >= 1 && x < n).then(|| x - 1)
    }
}

/// Level of the point at `idx` (0 for boundary points).
#[inline]
pub fn point_level(level: LevelType, boundary: bool, idx: usize) -> LevelType {
    let x = position(idx, boundary);
    if x == 0 || x == span(level) {
        0
    } else {
        level - x.trailing_zeros() as LevelType
    }
}

/// Level of the subspace holding the point at `idx`.
#[inline]
pub fn subspace_level(level: LevelType, boundary: bool, idx: usize) -> LevelType {
    point_level(level, boundary, idx).max(1)
}

#[inline]
fn parent_offset(level: LevelType, boundary: bool, idx: usize) -> Option<usize> {
    match point_level(level, boundary, idx) {
        0 => None,
        k => Some(1usize << (level - k)),
    }
}

/// Left hierarchical predecessor of `idx`, if it exists on this grid.
pub fn left_predecessor(level: LevelType, boundary: bool, idx: usize) -> Option<usize> {
    let h = parent_offset(level, boundary, idx)?;
    index_of(position(idx, boundary) - h, level, boundary)
}

/// Right hierarchical predecessor of `idx`, if it exists on this grid.
pub fn right_predecessor(level: LevelType, boundary: bool, idx: usize) -> Option<usize> {
    let h = parent_offset(level, boundary, idx)?;
    index_of(position(idx, boundary) + h, level, boundary)
}

/// Children `(left, right)` of the interior point `idx`; `None` on the
/// finest level and for boundary points.
pub fn successors(level: LevelType, boundary: bool, idx: usize) -> Option<(usize, usize)> {
    let k = point_level(level, boundary, idx);
    if k == 0 || k == level {
        return None;
    }
    let h = 1usize << (level - k - 1);
    let x = position(idx, boundary);
    Some((index_of(x - h, level, boundary)?, index_of(x + h, level, boundary)?))
}

/// Number of points in the 1-D subspace of level `sublevel`.
#[inline]
pub fn subspace_size_1d(sublevel: LevelType, boundary: bool) -> usize {
    if sublevel == 1 && boundary {
        3
    } else {
        1usize << (sublevel - 1)
    }
}

/// Position of the point at `idx` inside its 1-D subspace.
pub fn subspace_offset_1d(level: LevelType, boundary: bool, idx: usize) -> usize {
    let x = position(idx, boundary);
    match point_level(level, boundary, idx) {
        0 => {
            if x == 0 {
                0
            } else {
                2
            }
        }
        1 if boundary => 1,
        k => {
            let h = 1usize << (level - k);
            (x / h - 1) / 2
        }
    }
}

/// For the index range `[lo, hi)` of one process, the range of subspace
/// offsets it holds in every 1-D subspace `k = 1..=level` (entry `k - 1`).
/// Offsets are monotone in the global index, so each range is contiguous.
pub fn subspace_ranges(level: LevelType, boundary: bool, lo: usize, hi: usize) -> Vec<Range<usize>> {
    let mut ranges: Vec<Range<usize>> = vec![0..0; level as usize];
    for idx in lo..hi {
        let k = subspace_level(level, boundary, idx) as usize - 1;
        let off = subspace_offset_1d(level, boundary, idx);
        let r = &mut ranges[k];
        if r.is_empty() {
            *r = off..off + 1;
        } else {
            r.end = off + 1;
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_counts() {
        assert_eq!(num_points(1, true), 3);
        assert_eq!(num_points(3, true), 9);
        assert_eq!(num_points(1, false), 1);
        assert_eq!(num_points(3, false), 7);
    }

    #[test]
    fn levels_with_boundary() {
        let lv: Vec<_> = (0..9).map(|i| point_level(3, true, i)).collect();
        assert_eq!(lv, vec![0, 3, 2, 3, 1, 3, 2, 3, 0]);
        assert_eq!(subspace_level(3, true, 0), 1);
        assert_eq!(subspace_level(3, true, 8), 1);
    }

    #[test]
    fn levels_without_boundary() {
        let lv: Vec<_> = (0..7).map(|i| point_level(3, false, i)).collect();
        assert_eq!(lv, vec![3, 2, 3, 1, 3, 2, 3]);
    }

    #[test]
    fn predecessors() {
        // x = 3 on level 3: parents at 2 and 4
        assert_eq!(left_predecessor(3, true, 3), Some(2));
        assert_eq!(right_predecessor(3, true, 3), Some(4));
        // level-1 midpoint reaches the boundary
        assert_eq!(left_predecessor(3, true, 4), Some(0));
        assert_eq!(right_predecessor(3, true, 4), Some(8));
        assert_eq!(left_predecessor(3, true, 0), None);
        // without boundary the outermost points lose one parent
        assert_eq!(left_predecessor(3, false, 0), None);
        assert_eq!(right_predecessor(3, false, 0), Some(1));
        assert_eq!(right_predecessor(3, false, 6), None);
        assert_eq!(left_predecessor(3, false, 3), None);
        assert_eq!(right_predecessor(3, false, 3), None);
    }

    #[test]
    fn successors_are_inverse_of_predecessors() {
        for boundary in [true, false] {
            for idx in 0..num_points(4, boundary) {
                if let Some((a, b)) = successors(4, boundary, idx) {
                    assert_eq!(right_predecessor(4, boundary, a), Some(idx));
                    assert_eq!(left_predecessor(4, boundary, b), Some(idx));
                }
            }
        }
    }

    #[test]
    fn subspace_offsets_enumerate_each_subspace() {
        for boundary in [true, false] {
            let level = 4;
            let n = num_points(level, boundary);
            for k in 1..=level {
                let offs: Vec<_> = (0..n)
                    .filter(|&i| subspace_level(level, boundary, i) == k)
                    .map(|i| subspace_offset_1d(level, boundary, i))
                    .collect();
                let want: Vec<_> = (0..subspace_size_1d(k, boundary)).collect();
                assert_eq!(offs, want, "level {k} boundary {boundary}");
            }
        }
    }

    #[test]
    fn ranges_of_a_split() {
        // level 3 with boundary split at 4: [0,4) and [4,9)
        let a = subspace_ranges(3, true, 0, 4);
        let b = subspace_ranges(3, true, 4, 9);
        assert_eq!(a, vec![0..1, 0..1, 0..2]);
        assert_eq!(b, vec![1..3, 1..2, 2..4]);
    }
}

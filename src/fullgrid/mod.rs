//! Full grids: the domain-decomposed component grid and its serial counterpart.

pub mod decomposition;
pub mod distributed;
pub mod element;
pub mod full_grid;
pub mod hierarchical;

pub use decomposition::Decomposition;
pub use distributed::{DistributedFullGrid, GridGeometry};
pub use element::GridElement;
pub use full_grid::FullGrid;

use std::ops::Range;

/// Prefix-product strides of a dense array, dimension 0 fastest.
pub(crate) fn strides_of(sizes: &[usize]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(sizes.len());
    let mut s = 1;
    for &n in sizes {
        strides.push(s);
        s *= n;
    }
    strides
}

/// Call `f(offset)` for every point of the box `ranges` inside a dense array
/// of extents `sizes`, in box order with dimension 0 fastest.
pub(crate) fn for_each_in_box(sizes: &[usize], ranges: &[Range<usize>], mut f: impl FnMut(usize)) {
    if ranges.iter().any(|r| r.is_empty()) {
        return;
    }
    let d = sizes.len();
    let strides = strides_of(sizes);
    let mut idx: Vec<usize> = ranges.iter().map(|r| r.start).collect();
    let mut off: usize = idx.iter().zip(&strides).map(|(i, s)| i * s).sum();
    loop {
        f(off);
        let mut k = 0;
        loop {
            if k == d {
                return;
            }
            idx[k] += 1;
            off += strides[k];
            if idx[k] < ranges[k].end {
                break;
            }
            off -= (idx[k] - ranges[k].start) * strides[k];
            idx[k] = ranges[k].start;
            k += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_walk_is_dim0_fastest() {
        let mut seen = Vec::new();
        for_each_in_box(&[4, 3], &[1..3, 1..3], |o| seen.push(o));
        assert_eq!(seen, vec![5, 6, 9, 10]);
        seen.clear();
        for_each_in_box(&[4, 3], &[1..1, 0..3], |o| seen.push(o));
        assert!(seen.is_empty());
        assert_eq!(strides_of(&[4, 3, 2]), vec![1, 4, 12]);
    }
}

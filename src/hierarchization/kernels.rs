//! Closed-form 1-D hierarchization on complete lines.
//!
//! A line holds every point of one dimension, indexed by global 1-D index.
//! Lines with boundary points store position `x` at offset `x`; lines
//! without them store it at `x - 1`, and the two outermost points of every
//! level have only one parent.

use crate::fullgrid::element::GridElement;
use crate::fullgrid::{for_each_in_box, strides_of};
use crate::levels::LevelType;
use std::ops::Range;

/// One level `k` of a line with boundary points: `x = h, 3h, .., n - h`.
#[inline]
fn level_bound<T: GridElement>(line: &mut [T], level: LevelType, k: LevelType, sign: T) {
    let n = 1usize << level;
    let h = 1usize << (level - k);
    let w = sign * T::half();
    let mut x = h;
    while x < n {
        let parents = line[x - h] + line[x + h];
        line[x] += w * parents;
        x += 2 * h;
    }
}

/// One level `k` of a line without boundary points. Offsets are `x - 1`.
#[inline]
fn level_nobound<T: GridElement>(line: &mut [T], level: LevelType, k: LevelType, sign: T) {
    // the single level-1 point has no parents
    if k == 1 {
        return;
    }
    let n = 1usize << level;
    let h = 1usize << (level - k);
    let w = sign * T::half();
    let first = h - 1;
    let last = n - h - 1;
    let right = line[first + h];
    line[first] += w * right;
    let mut i = first + 2 * h;
    while i < last {
        let parents = line[i - h] + line[i + h];
        line[i] += w * parents;
        i += 2 * h;
    }
    let left = line[last - h];
    line[last] += w * left;
}

/// Nodal to hierarchical values on a line with boundary points.
pub fn hierarchize_line_bound<T: GridElement>(line: &mut [T], level: LevelType) {
    for k in (1..=level).rev() {
        level_bound(line, level, k, -T::one());
    }
}

/// Nodal to hierarchical values on a line without boundary points.
pub fn hierarchize_line_nobound<T: GridElement>(line: &mut [T], level: LevelType) {
    for k in (1..=level).rev() {
        level_nobound(line, level, k, -T::one());
    }
}

pub fn dehierarchize_line_bound<T: GridElement>(line: &mut [T], level: LevelType) {
    for k in 1..=level {
        level_bound(line, level, k, T::one());
    }
}

pub fn dehierarchize_line_nobound<T: GridElement>(line: &mut [T], level: LevelType) {
    for k in 1..=level {
        level_nobound(line, level, k, T::one());
    }
}

/// Nodal to hierarchical surplus values, finest level first.
pub fn hierarchize_line<T: GridElement>(line: &mut [T], level: LevelType, boundary: bool) {
    if boundary {
        hierarchize_line_bound(line, level)
    } else {
        hierarchize_line_nobound(line, level)
    }
}

/// Hierarchical surplus to nodal values, coarsest level first.
pub fn dehierarchize_line<T: GridElement>(line: &mut [T], level: LevelType, boundary: bool) {
    if boundary {
        dehierarchize_line_bound(line, level)
    } else {
        dehierarchize_line_nobound(line, level)
    }
}

/// Run `f` on every pole of `data` along `dim`. Each pole is copied into
/// `line`, handed to `f` together with its starting offset, and written back.
pub fn for_each_pole<T: GridElement>(
    data: &mut [T],
    sizes: &[usize],
    dim: usize,
    line: &mut Vec<T>,
    mut f: impl FnMut(usize, &mut [T]),
) {
    let stride = strides_of(sizes)[dim];
    let n = sizes[dim];
    let ranges: Vec<Range<usize>> = sizes
        .iter()
        .enumerate()
        .map(|(k, &m)| if k == dim { 0..1 } else { 0..m })
        .collect();
    for_each_in_box(sizes, &ranges, |start| {
        line.clear();
        line.extend((0..n).map(|i| data[start + i * stride]));
        f(start, line.as_mut_slice());
        for (i, &v) in line.iter().enumerate() {
            data[start + i * stride] = v;
        }
    });
}

/// Hierarchize a dense grid in place, dimension by dimension.
pub fn hierarchize_dense<T: GridElement>(data: &mut [T], sizes: &[usize], levels: &[LevelType], boundary: &[bool]) {
    let mut line = Vec::new();
    for dim in 0..sizes.len() {
        for_each_pole(data, sizes, dim, &mut line, |_, l| {
            hierarchize_line(l, levels[dim], boundary[dim])
        });
    }
}

/// Inverse of [`hierarchize_dense`].
pub fn dehierarchize_dense<T: GridElement>(data: &mut [T], sizes: &[usize], levels: &[LevelType], boundary: &[bool]) {
    let mut line = Vec::new();
    for dim in 0..sizes.len() {
        for_each_pole(data, sizes, dim, &mut line, |_, l| {
            dehierarchize_line(l, levels[dim], boundary[dim])
        });
    }
}

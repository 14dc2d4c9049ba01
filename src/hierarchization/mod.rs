//! In-place hierarchization of domain-decomposed grids.
//!
//! Dimensions are transformed one after the other in the order `0..d-1`, in
//! both directions. A dimension that is not split across processes is
//! handled by the closed-form line kernels. A split dimension first runs the
//! boundary exchange of [`exchange`] and then the working-set kernel. It
//! only visits the local index range (plus, when dehierarchizing, the
//! received predecessor chain) and resolves every parent through
//! [`PointSource`]. Each update has the same operands as in the line
//! kernels, so serial and decomposed transforms agree bit for bit.

pub mod exchange;
pub mod kernels;

pub use exchange::{Direction, ExchangePlan};

use crate::algs::comm_group::CommGroup;
use crate::algs::communicator::Communicator;
use crate::combi_error::CombiError;
use crate::fullgrid::distributed::DistributedFullGrid;
use crate::fullgrid::element::GridElement;
use crate::fullgrid::hierarchical::{left_predecessor, point_level, right_predecessor};
use crate::levels::LevelType;
use std::ops::Range;

/// Where the value at a global 1-D index of the current pole comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PointSource {
    /// Position along the local pole.
    Local(usize),
    /// Received hyperplane `container`, at the pole's position in it.
    Remote { container: usize },
}

/// Nodal to hierarchical basis. Collective over `group` when any dimension
/// is decomposed; a no-op on an already hierarchized grid.
pub fn hierarchize<T: GridElement, C: Communicator>(
    grid: &mut DistributedFullGrid<T>,
    group: &CommGroup<C>,
) -> Result<(), CombiError> {
    if grid.is_hierarchized() {
        return Ok(());
    }
    transform(grid, group, Direction::Hierarchize)?;
    grid.set_hierarchized(true);
    Ok(())
}

/// Hierarchical to nodal basis. Collective over `group` when any dimension
/// is decomposed; a no-op on a nodal grid.
pub fn dehierarchize<T: GridElement, C: Communicator>(
    grid: &mut DistributedFullGrid<T>,
    group: &CommGroup<C>,
) -> Result<(), CombiError> {
    if !grid.is_hierarchized() {
        return Ok(());
    }
    transform(grid, group, Direction::Dehierarchize)?;
    grid.set_hierarchized(false);
    Ok(())
}

fn transform<T: GridElement, C: Communicator>(
    grid: &mut DistributedFullGrid<T>,
    group: &CommGroup<C>,
    direction: Direction,
) -> Result<(), CombiError> {
    grid.check_group(group)?;
    let rank = grid.rank();
    let (geom, decomposition, data) = grid.parts_mut();
    let local_sizes = geom.local_sizes().to_vec();
    let lower = geom.lower().to_vec();
    let mut line = Vec::new();

    for dim in 0..geom.dim() {
        let level = geom.levels()[dim];
        let boundary = geom.boundary()[dim];
        if decomposition.procs()[dim] == 1 {
            kernels::for_each_pole(data, &local_sizes, dim, &mut line, |_, pole| {
                apply_line(pole, level, boundary, direction)
            });
            continue;
        }

        let coord = decomposition.partition_coords(rank)[dim];
        let plan = ExchangePlan::new(decomposition, dim, coord, level, boundary, direction);
        let remote = exchange::exchange(&plan, decomposition, group, data, &local_sizes, &lower, dim)?;
        log::trace!(
            "{direction:?} dim {dim}: rank {rank} received {} hyperplanes",
            remote.len()
        );

        let lo = lower[dim];
        let steps = working_set(level, boundary, lo..lo + local_sizes[dim], &remote, direction)?;
        let mut remote_values = vec![T::zero(); remote.len()];
        let mut pole_index = 0;
        kernels::for_each_pole(data, &local_sizes, dim, &mut line, |_, pole| {
            for (slot, (_, plane)) in remote_values.iter_mut().zip(&remote) {
                *slot = plane[pole_index];
            }
            apply_steps(&steps, pole, &mut remote_values, direction);
            pole_index += 1;
        });
    }
    Ok(())
}

/// One update of the working-set kernel: `target += sign * 0.5 * (left + right)`.
/// A parent missing from the grid contributes nothing.
#[derive(Clone, Copy, Debug)]
struct Step {
    target: PointSource,
    left: Option<PointSource>,
    right: Option<PointSource>,
}

/// Update schedule of the local index range `local` along one dimension.
/// Hierarchization touches the local points finest level first and only
/// reads the received parents. Dehierarchization also brings the received
/// predecessor chain back to nodal values, coarsest level first.
fn working_set<T>(
    level: LevelType,
    boundary: bool,
    local: Range<usize>,
    remote: &[(usize, Vec<T>)],
    direction: Direction,
) -> Result<Vec<Step>, CombiError> {
    let lookup = |idx: usize| -> Option<PointSource> {
        if local.contains(&idx) {
            Some(PointSource::Local(idx - local.start))
        } else {
            remote
                .binary_search_by_key(&idx, |(i, _)| *i)
                .ok()
                .map(|container| PointSource::Remote { container })
        }
    };
    let parent = |p: Option<usize>| -> Result<Option<PointSource>, CombiError> {
        match p {
            None => Ok(None),
            Some(idx) => lookup(idx).map(Some).ok_or_else(|| {
                CombiError::InvalidDecomposition(format!("predecessor {idx} was not exchanged"))
            }),
        }
    };

    let mut points: Vec<usize> = local.clone().collect();
    if direction == Direction::Dehierarchize {
        points.extend(remote.iter().map(|(idx, _)| *idx));
    }
    points.retain(|&idx| point_level(level, boundary, idx) > 0);
    match direction {
        Direction::Hierarchize => points.sort_by_key(|&idx| std::cmp::Reverse(point_level(level, boundary, idx))),
        Direction::Dehierarchize => points.sort_by_key(|&idx| point_level(level, boundary, idx)),
    }

    points
        .into_iter()
        .map(|idx| {
            Ok(Step {
                target: lookup(idx)
                    .ok_or_else(|| CombiError::InvalidDecomposition(format!("point {idx} is not local")))?,
                left: parent(left_predecessor(level, boundary, idx))?,
                right: parent(right_predecessor(level, boundary, idx))?,
            })
        })
        .collect()
}

fn apply_steps<T: GridElement>(steps: &[Step], pole: &mut [T], remote: &mut [T], direction: Direction) {
    let sign = match direction {
        Direction::Hierarchize => -T::one(),
        Direction::Dehierarchize => T::one(),
    };
    let w = sign * T::half();
    let read = |source: PointSource, pole: &[T], remote: &[T]| match source {
        PointSource::Local(i) => pole[i],
        PointSource::Remote { container } => remote[container],
    };
    for step in steps {
        let parents = match (step.left, step.right) {
            (Some(l), Some(r)) => read(l, pole, remote) + read(r, pole, remote),
            (Some(p), None) | (None, Some(p)) => read(p, pole, remote),
            (None, None) => continue,
        };
        match step.target {
            PointSource::Local(i) => pole[i] += w * parents,
            PointSource::Remote { container } => remote[container] += w * parents,
        }
    }
}

#[inline]
fn apply_line<T: GridElement>(line: &mut [T], level: LevelType, boundary: bool, direction: Direction) {
    match direction {
        Direction::Hierarchize => kernels::hierarchize_line(line, level, boundary),
        Direction::Dehierarchize => kernels::dehierarchize_line(line, level, boundary),
    }
}

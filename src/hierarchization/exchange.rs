//! Dependency discovery and boundary exchange along one dimension.
//!
//! Along a decomposed dimension a process owns the 1-D index range
//! `[lo, hi)`. Hierarchizing a local point needs the nodal values of its two
//! direct predecessors; dehierarchizing it needs the surpluses of its whole
//! predecessor chain. Whatever falls outside `[lo, hi)` is received from the
//! process owning it, one message per global 1-D index carrying the full
//! hyperplane slice at that index.

use crate::algs::comm_group::{tags, CommGroup};
use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{cast_slice, decode_exact};
use crate::combi_error::CombiError;
use crate::fullgrid::decomposition::Decomposition;
use crate::fullgrid::element::GridElement;
use crate::fullgrid::for_each_in_box;
use crate::fullgrid::hierarchical::{left_predecessor, right_predecessor};
use crate::levels::LevelType;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Hierarchize,
    Dehierarchize,
}

fn predecessors(level: LevelType, boundary: bool, idx: usize) -> impl Iterator<Item = usize> {
    left_predecessor(level, boundary, idx)
        .into_iter()
        .chain(right_predecessor(level, boundary, idx))
}

/// Global 1-D indices outside `range` whose values the points of `range`
/// depend on, sorted and deduplicated.
pub fn recv_indices(level: LevelType, boundary: bool, range: Range<usize>, direction: Direction) -> Vec<usize> {
    let outside = |i: &usize| !range.contains(i);
    let mut needed = BTreeSet::new();
    match direction {
        Direction::Hierarchize => {
            for idx in range.clone() {
                needed.extend(predecessors(level, boundary, idx).filter(outside));
            }
        }
        Direction::Dehierarchize => {
            let mut work: Vec<usize> = range.clone().collect();
            while let Some(idx) = work.pop() {
                for p in predecessors(level, boundary, idx).filter(outside) {
                    if needed.insert(p) {
                        work.push(p);
                    }
                }
            }
        }
    }
    needed.into_iter().collect()
}

/// Exchange plan of one process along one dimension.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExchangePlan {
    /// Partition coordinate along the dimension -> indices received from it.
    pub recv: BTreeMap<usize, Vec<usize>>,
    /// Partition coordinate along the dimension -> indices sent to it.
    pub send: BTreeMap<usize, Vec<usize>>,
}

impl ExchangePlan {
    /// Plan for partition coordinate `coord` along `dim`. The send side is
    /// obtained by evaluating every other coordinate's receive set and
    /// keeping what falls into our range, so both sides agree exactly.
    pub fn new(
        decomposition: &Decomposition,
        dim: usize,
        coord: usize,
        level: LevelType,
        boundary: bool,
        direction: Direction,
    ) -> Self {
        let mine = decomposition.bounds_1d(dim, coord);
        let mut plan = Self::default();
        for idx in recv_indices(level, boundary, mine.clone(), direction) {
            plan.recv
                .entry(decomposition.coord_of_index(dim, idx))
                .or_default()
                .push(idx);
        }
        for other in (0..decomposition.procs()[dim]).filter(|&c| c != coord) {
            let theirs = decomposition.bounds_1d(dim, other);
            let wanted: Vec<usize> = recv_indices(level, boundary, theirs, direction)
                .into_iter()
                .filter(|i| mine.contains(i))
                .collect();
            if !wanted.is_empty() {
                plan.send.insert(other, wanted);
            }
        }
        plan
    }

    pub fn num_recv(&self) -> usize {
        self.recv.values().map(Vec::len).sum()
    }
}

#[inline]
fn index_tag(idx: usize) -> CommTag {
    tags::HIERARCHIZATION.offset(idx as u32 & tags::MAX_OFFSET)
}

/// Values of the local hyperplane `global index along dim == idx`, in box
/// order (dimension 0 fastest).
fn hyperplane<T: GridElement>(data: &[T], local_sizes: &[usize], dim: usize, local_idx: usize) -> Vec<T> {
    let ranges: Vec<Range<usize>> = local_sizes
        .iter()
        .enumerate()
        .map(|(k, &n)| if k == dim { local_idx..local_idx + 1 } else { 0..n })
        .collect();
    let mut out = Vec::with_capacity(data.len() / local_sizes[dim].max(1));
    for_each_in_box(local_sizes, &ranges, |off| out.push(data[off]));
    out
}

/// Run the exchange of `plan` and return the received hyperplanes as
/// `(global index, values)`, sorted by index. Collective over the processes
/// that share every partition coordinate except `dim`.
pub fn exchange<T: GridElement, C: Communicator>(
    plan: &ExchangePlan,
    decomposition: &Decomposition,
    group: &CommGroup<C>,
    data: &[T],
    local_sizes: &[usize],
    lower: &[usize],
    dim: usize,
) -> Result<Vec<(usize, Vec<T>)>, CombiError> {
    let me = group.rank();
    let slice_len = local_sizes
        .iter()
        .enumerate()
        .filter(|&(k, _)| k != dim)
        .map(|(_, &n)| n)
        .product::<usize>();

    let mut recvs = Vec::with_capacity(plan.num_recv());
    for (&coord, indices) in &plan.recv {
        let partner = decomposition.neighbor_rank(me, dim, decomposition.bounds_1d(dim, coord).start);
        for &idx in indices {
            recvs.push((idx, partner, group.irecv(partner, index_tag(idx))));
        }
    }

    let mut pending_sends = Vec::new();
    for (&coord, indices) in &plan.send {
        let partner = decomposition.neighbor_rank(me, dim, decomposition.bounds_1d(dim, coord).start);
        for &idx in indices {
            let values = hyperplane(data, local_sizes, dim, idx - lower[dim]);
            pending_sends.push(group.isend(partner, index_tag(idx), cast_slice(&values)));
        }
    }

    let mut received = Vec::with_capacity(recvs.len());
    let mut maybe_err = None;
    for (idx, partner, h) in recvs {
        match group
            .complete(partner, index_tag(idx), h)
            .and_then(|buf| decode_exact::<T>(&buf, slice_len, group.world_rank(partner)))
        {
            Ok(values) => received.push((idx, values)),
            Err(e) => {
                maybe_err.get_or_insert(e);
            }
        }
    }
    for send in pending_sends {
        let _ = send.wait();
    }
    if let Some(e) = maybe_err {
        return Err(e);
    }
    received.sort_by_key(|(idx, _)| *idx);
    Ok(received)
}

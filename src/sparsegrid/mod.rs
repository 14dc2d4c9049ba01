//! Distributed sparse grid: the per-group combination target.
//!
//! The target holds one buffer per hierarchical subspace that any component
//! grid of the scheme can contain. Each subspace is owned by exactly one
//! process of the group; the owner is a pure function of the subspace's
//! position in the list, so every process agrees on it without talking.
//! Buffers are materialized lazily on the owner and keep a length fixed by
//! the level vector and boundary flags alone.

use crate::algs::comm_group::CommGroup;
use crate::algs::communicator::Communicator;
use crate::combi_error::CombiError;
use crate::debug_invariants::DebugInvariants;
use crate::fullgrid::element::GridElement;
use crate::fullgrid::hierarchical::subspace_size_1d;
use crate::levels::{validate_levels, LevelType, LevelVector};
use hashbrown::HashMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Rule mapping a subspace's list position to its owning group rank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubspacePlacement {
    /// `owner(i) = i mod P`.
    #[default]
    RoundRobin,
    /// Only the first rank of every node owns subspaces:
    /// `owner(i) = (i mod ceil(P / ppn)) * ppn`.
    NodeAware { procs_per_node: usize },
}

impl SubspacePlacement {
    pub fn owner(&self, index: usize, group_size: usize) -> usize {
        match *self {
            SubspacePlacement::RoundRobin => index % group_size,
            SubspacePlacement::NodeAware { procs_per_node } => {
                let ppn = procs_per_node.max(1);
                (index % group_size.div_ceil(ppn)) * ppn
            }
        }
    }
}

/// Every level vector `1 <= l <= lmax` with `sum(l) <= sum(lmin) + max(lmax - lmin)`.
pub fn target_levels(lmin: &LevelVector, lmax: &LevelVector) -> Vec<LevelVector> {
    let n: LevelType = lmin.sum()
        + lmin
            .iter()
            .zip(lmax.iter())
            .map(|(a, b)| b - a)
            .max()
            .unwrap_or(0);
    lmax.iter()
        .map(|m| 1..=m)
        .multi_cartesian_product()
        .filter(|l| l.iter().sum::<LevelType>() <= n)
        .map(LevelVector::from)
        .collect()
}

#[derive(Debug)]
pub struct DistributedSparseGrid<T: GridElement> {
    lmin: LevelVector,
    lmax: LevelVector,
    boundary: Vec<bool>,
    levels: Vec<LevelVector>,
    lookup: HashMap<LevelVector, usize>,
    sizes: Vec<usize>,
    data: Vec<Vec<T>>,
    rank: usize,
    group_size: usize,
    placement: SubspacePlacement,
}

impl<T: GridElement> DistributedSparseGrid<T> {
    pub fn new(
        lmin: LevelVector,
        lmax: LevelVector,
        boundary: Vec<bool>,
        rank: usize,
        group_size: usize,
        placement: SubspacePlacement,
    ) -> Result<Self, CombiError> {
        let dim = lmin.dim();
        validate_levels(&lmin, dim)?;
        validate_levels(&lmax, dim)?;
        if boundary.len() != dim {
            return Err(CombiError::DimensionMismatch {
                expected: dim,
                found: boundary.len(),
            });
        }
        if !lmin.le_all(&lmax) {
            return Err(CombiError::InvalidLevelBounds { lmin, lmax });
        }
        if rank >= group_size {
            return Err(CombiError::RankOutOfRange { rank, size: group_size });
        }
        if let SubspacePlacement::NodeAware { procs_per_node: 0 } = placement {
            return Err(CombiError::InvalidConfig("procs_per_node must be positive".into()));
        }

        let levels = target_levels(&lmin, &lmax);
        let lookup = levels.iter().cloned().enumerate().map(|(i, l)| (l, i)).collect();
        let sizes = levels
            .iter()
            .map(|l| {
                l.iter()
                    .zip(&boundary)
                    .map(|(k, &b)| subspace_size_1d(k, b))
                    .product()
            })
            .collect();
        log::debug!(
            "sparse grid lmin={lmin} lmax={lmax}: {} subspaces over {group_size} ranks",
            levels.len()
        );
        let n = levels.len();
        Ok(Self {
            lmin,
            lmax,
            boundary,
            levels,
            lookup,
            sizes,
            data: vec![Vec::new(); n],
            rank,
            group_size,
            placement,
        })
    }

    pub fn dim(&self) -> usize {
        self.lmin.dim()
    }

    pub fn lmin(&self) -> &LevelVector {
        &self.lmin
    }

    pub fn lmax(&self) -> &LevelVector {
        &self.lmax
    }

    pub fn boundary(&self) -> &[bool] {
        &self.boundary
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn placement(&self) -> SubspacePlacement {
        self.placement
    }

    pub fn num_subspaces(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[LevelVector] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> &LevelVector {
        &self.levels[index]
    }

    /// Position of `level` in the subspace list. `None` is an expected
    /// answer: component grids may hold subspaces the target lacks.
    pub fn index(&self, level: &LevelVector) -> Option<usize> {
        self.lookup.get(level).copied()
    }

    pub fn is_contained(&self, level: &LevelVector) -> bool {
        self.lookup.contains_key(level)
    }

    pub fn owner(&self, index: usize) -> usize {
        self.placement.owner(index, self.group_size)
    }

    pub fn is_owned(&self, index: usize) -> bool {
        self.owner(index) == self.rank
    }

    /// Subspaces owned by this process, in list order.
    pub fn owned_subspaces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_subspaces()).filter(move |&i| self.is_owned(i))
    }

    /// Fixed number of points of subspace `index`.
    pub fn subspace_size(&self, index: usize) -> usize {
        self.sizes[index]
    }

    pub fn is_initialized(&self, index: usize) -> bool {
        !self.data[index].is_empty()
    }

    fn check_owner(&self, index: usize) -> Result<(), CombiError> {
        let owner = self.owner(index);
        if owner != self.rank {
            return Err(CombiError::NotOwner {
                subspace: index,
                owner,
                rank: self.rank,
            });
        }
        Ok(())
    }

    /// Materialize subspace `index` filled with `fill`. A no-op when the
    /// buffer already exists.
    pub fn ensure_initialized(&mut self, index: usize, fill: T) -> Result<(), CombiError> {
        self.check_owner(index)?;
        if self.data[index].is_empty() {
            self.data[index] = vec![fill; self.sizes[index]];
        }
        Ok(())
    }

    /// Buffer of subspace `index`; empty until initialized.
    pub fn data(&self, index: usize) -> Result<&[T], CombiError> {
        self.check_owner(index)?;
        Ok(&self.data[index])
    }

    pub fn data_mut(&mut self, index: usize) -> Result<&mut [T], CombiError> {
        self.check_owner(index)?;
        Ok(&mut self.data[index])
    }

    /// Replace the buffer of subspace `index`.
    pub fn set_data(&mut self, index: usize, values: Vec<T>) -> Result<(), CombiError> {
        self.check_owner(index)?;
        if values.len() != self.sizes[index] {
            return Err(CombiError::SubspaceSizeMismatch {
                subspace: index,
                expected: self.sizes[index],
                found: values.len(),
            });
        }
        self.data[index] = values;
        Ok(())
    }

    /// Zero every initialized buffer, keeping its allocation.
    pub fn set_zero(&mut self) {
        for buf in &mut self.data {
            buf.iter_mut().for_each(|v| *v = T::zero());
        }
    }

    /// Verify that every process of `comm` agrees on all subspace sizes.
    /// Collective over `comm`.
    pub fn check_uniform_sizes<C: Communicator>(&self, comm: &CommGroup<C>) -> Result<(), CombiError> {
        let mut sizes: Vec<u64> = self.sizes.iter().map(|&s| s as u64).collect();
        let mut count = [sizes.len() as u64];
        comm.allreduce_max_u64(&mut count)?;
        if count[0] != sizes.len() as u64 {
            return Err(CombiError::DataSizeMismatch {
                expected: count[0] as usize,
                found: sizes.len(),
            });
        }
        comm.allreduce_max_u64(&mut sizes)?;
        for (i, (&global, &local)) in sizes.iter().zip(&self.sizes).enumerate() {
            if global as usize != local {
                return Err(CombiError::SubspaceSizeMismatch {
                    subspace: i,
                    expected: global as usize,
                    found: local,
                });
            }
        }
        Ok(())
    }
}

impl<T: GridElement> DebugInvariants for DistributedSparseGrid<T> {
    fn validate_invariants(&self) -> Result<(), CombiError> {
        for (i, buf) in self.data.iter().enumerate() {
            if buf.is_empty() {
                continue;
            }
            self.check_owner(i)?;
            if buf.len() != self.sizes[i] {
                return Err(CombiError::SubspaceSizeMismatch {
                    subspace: i,
                    expected: self.sizes[i],
                    found: buf.len(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dsg(rank: usize, size: usize, placement: SubspacePlacement) -> DistributedSparseGrid<f64> {
        DistributedSparseGrid::new(
            LevelVector::from([2, 2]),
            LevelVector::from([4, 4]),
            vec![true, true],
            rank,
            size,
            placement,
        )
        .unwrap()
    }

    #[test]
    fn subspace_list_covers_the_scheme() {
        let g = dsg(0, 1, SubspacePlacement::RoundRobin);
        // n = 4 + 2 = 6
        assert!(g.levels().iter().all(|l| l.sum() <= 6));
        assert!(g.is_contained(&LevelVector::from([4, 2])));
        assert!(g.is_contained(&LevelVector::from([1, 1])));
        assert_eq!(g.index(&LevelVector::from([4, 3])), None);
        assert_eq!(g.num_subspaces(), 13);
    }

    #[test]
    fn sizes_depend_on_boundary_only_at_level_one() {
        let g = dsg(0, 1, SubspacePlacement::RoundRobin);
        let i = g.index(&LevelVector::from([1, 3])).unwrap();
        assert_eq!(g.subspace_size(i), 3 * 4);
    }

    #[test]
    fn owners_are_deterministic() {
        let a = dsg(0, 4, SubspacePlacement::RoundRobin);
        let b = dsg(3, 4, SubspacePlacement::RoundRobin);
        for i in 0..a.num_subspaces() {
            assert_eq!(a.owner(i), b.owner(i));
            assert_eq!(a.owner(i), i % 4);
        }
        let n = dsg(0, 6, SubspacePlacement::NodeAware { procs_per_node: 4 });
        let owners: Vec<_> = (0..4).map(|i| n.owner(i)).collect();
        assert_eq!(owners, vec![0, 4, 0, 4]);
    }

    #[test]
    fn lazy_idempotent_initialization() {
        let mut g = dsg(1, 2, SubspacePlacement::RoundRobin);
        assert!(matches!(g.ensure_initialized(0, 0.0), Err(CombiError::NotOwner { .. })));
        assert!(g.data(0).is_err());
        assert!(!g.is_initialized(1));
        g.ensure_initialized(1, 0.0).unwrap();
        g.data_mut(1).unwrap()[0] = 5.0;
        g.ensure_initialized(1, 0.0).unwrap();
        assert_eq!(g.data(1).unwrap()[0], 5.0);
        assert_eq!(g.data(1).unwrap().len(), g.subspace_size(1));
        g.validate_invariants().unwrap();
    }
}

//! Process grid and per-dimension partition of a full grid.
//!
//! Ranks are laid out on a Cartesian process grid with dimension 0 varying
//! fastest. Along dimension `d` the process with coordinate `j` owns the
//! global 1-D indices `[lower[d][j], lower[d][j+1])`, the last one up to the
//! global extent. The default lower bounds are `ceil(n * j / p)`.

use crate::combi_error::CombiError;
use crate::debug_invariants::DebugInvariants;
use crate::levels::IndexVector;
use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    global_sizes: Vec<usize>,
    procs: Vec<usize>,
    lower_1d: Vec<Vec<usize>>,
}

impl Decomposition {
    /// Default even split of `global_sizes` over `procs` processes per dimension.
    pub fn new(global_sizes: Vec<usize>, procs: Vec<usize>) -> Result<Self, CombiError> {
        if global_sizes.len() != procs.len() {
            return Err(CombiError::DimensionMismatch {
                expected: global_sizes.len(),
                found: procs.len(),
            });
        }
        let lower_1d = global_sizes
            .iter()
            .zip(&procs)
            .map(|(&n, &p)| (0..p).map(|j| (n * j).div_ceil(p.max(1))).collect())
            .collect();
        Self::with_bounds(global_sizes, procs, lower_1d)
    }

    /// Decomposition with explicit 1-D lower bounds (one list per dimension).
    pub fn with_bounds(
        global_sizes: Vec<usize>,
        procs: Vec<usize>,
        lower_1d: Vec<Vec<usize>>,
    ) -> Result<Self, CombiError> {
        let d = Self {
            global_sizes,
            procs,
            lower_1d,
        };
        d.validate_invariants()?;
        Ok(d)
    }

    /// Deterministic factorisation of `nprocs` into a per-dimension layout:
    /// prime factors, largest first, each go to the dimension with the most
    /// points per process that can still be split.
    pub fn balanced_procs(nprocs: usize, global_sizes: &[usize]) -> Result<Vec<usize>, CombiError> {
        if global_sizes.is_empty() || nprocs == 0 {
            return Err(CombiError::InvalidDecomposition(format!(
                "cannot lay out {nprocs} processes over {} dimensions",
                global_sizes.len()
            )));
        }
        let mut factors = Vec::new();
        let mut rest = nprocs;
        let mut f = 2;
        while rest > 1 {
            while rest % f == 0 {
                factors.push(f);
                rest /= f;
            }
            f += 1;
        }
        factors.reverse();

        let mut procs = vec![1usize; global_sizes.len()];
        for f in factors {
            let best = (0..global_sizes.len())
                .filter(|&k| global_sizes[k] >= procs[k] * f)
                .max_by(|&a, &b| {
                    (global_sizes[a] * procs[b])
                        .cmp(&(global_sizes[b] * procs[a]))
                        .then(b.cmp(&a))
                })
                .ok_or_else(|| {
                    CombiError::InvalidDecomposition(format!(
                        "{nprocs} processes do not fit a grid of sizes {global_sizes:?}"
                    ))
                })?;
            procs[best] *= f;
        }
        Ok(procs)
    }

    pub fn dim(&self) -> usize {
        self.procs.len()
    }

    pub fn num_procs(&self) -> usize {
        self.procs.iter().product()
    }

    pub fn procs(&self) -> &[usize] {
        &self.procs
    }

    pub fn global_sizes(&self) -> &[usize] {
        &self.global_sizes
    }

    pub fn lower_1d(&self, dim: usize) -> &[usize] {
        &self.lower_1d[dim]
    }

    /// Cartesian coordinates of `rank` (dimension 0 fastest).
    pub fn partition_coords(&self, rank: usize) -> Vec<usize> {
        let mut rest = rank;
        self.procs
            .iter()
            .map(|&p| {
                let c = rest % p;
                rest /= p;
                c
            })
            .collect()
    }

    /// Inverse of [`partition_coords`](Self::partition_coords).
    pub fn rank_of(&self, coords: &[usize]) -> usize {
        coords
            .iter()
            .zip(&self.procs)
            .rev()
            .fold(0, |acc, (&c, &p)| acc * p + c)
    }

    /// Global 1-D index range of partition coordinate `coord` along `dim`.
    pub fn bounds_1d(&self, dim: usize, coord: usize) -> Range<usize> {
        let lower = &self.lower_1d[dim];
        let hi = lower
            .get(coord + 1)
            .copied()
            .unwrap_or(self.global_sizes[dim]);
        lower[coord]..hi
    }

    pub fn lower_bounds(&self, rank: usize) -> IndexVector {
        self.partition_coords(rank)
            .into_iter()
            .enumerate()
            .map(|(d, c)| self.bounds_1d(d, c).start)
            .collect()
    }

    pub fn upper_bounds(&self, rank: usize) -> IndexVector {
        self.partition_coords(rank)
            .into_iter()
            .enumerate()
            .map(|(d, c)| self.bounds_1d(d, c).end)
            .collect()
    }

    pub fn local_sizes(&self, rank: usize) -> Vec<usize> {
        self.partition_coords(rank)
            .into_iter()
            .enumerate()
            .map(|(d, c)| self.bounds_1d(d, c).len())
            .collect()
    }

    /// Partition coordinate owning global 1-D index `idx` along `dim`.
    pub fn coord_of_index(&self, dim: usize, idx: usize) -> usize {
        self.lower_1d[dim].partition_point(|&lb| lb <= idx) - 1
    }

    /// Rank that shares every partition coordinate with `rank` except along
    /// `dim`, where it owns global index `idx`.
    pub fn neighbor_rank(&self, rank: usize, dim: usize, idx: usize) -> usize {
        let mut coords = self.partition_coords(rank);
        coords[dim] = self.coord_of_index(dim, idx);
        self.rank_of(&coords)
    }

    /// Rank owning the global grid point `global`.
    pub fn owner_of(&self, global: &[usize]) -> usize {
        let coords: Vec<usize> = global
            .iter()
            .enumerate()
            .map(|(d, &i)| self.coord_of_index(d, i))
            .collect();
        self.rank_of(&coords)
    }
}

impl DebugInvariants for Decomposition {
    fn validate_invariants(&self) -> Result<(), CombiError> {
        if self.global_sizes.len() != self.procs.len() || self.lower_1d.len() != self.procs.len() {
            return Err(CombiError::DimensionMismatch {
                expected: self.procs.len(),
                found: self.global_sizes.len().min(self.lower_1d.len()),
            });
        }
        for (d, ((&n, &p), lower)) in self
            .global_sizes
            .iter()
            .zip(&self.procs)
            .zip(&self.lower_1d)
            .enumerate()
        {
            if p == 0 || lower.len() != p {
                return Err(CombiError::InvalidDecomposition(format!(
                    "dimension {d}: {p} processes but {} lower bounds",
                    lower.len()
                )));
            }
            if lower[0] != 0 {
                return Err(CombiError::InvalidDecomposition(format!(
                    "dimension {d}: first lower bound is {} instead of 0",
                    lower[0]
                )));
            }
            if lower.windows(2).any(|w| w[0] >= w[1]) || lower[p - 1] >= n {
                return Err(CombiError::InvalidDecomposition(format!(
                    "dimension {d}: lower bounds {lower:?} are not strictly increasing below {n}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bounds_are_ceil_fractions() {
        let d = Decomposition::new(vec![9, 7], vec![4, 2]).unwrap();
        assert_eq!(d.lower_1d(0), &[0, 3, 5, 7]);
        assert_eq!(d.lower_1d(1), &[0, 4]);
        assert_eq!(d.bounds_1d(0, 3), 7..9);
    }

    #[test]
    fn coords_roundtrip_dim0_fastest() {
        let d = Decomposition::new(vec![9, 9, 9], vec![2, 3, 2]).unwrap();
        assert_eq!(d.partition_coords(1), vec![1, 0, 0]);
        assert_eq!(d.partition_coords(2), vec![0, 1, 0]);
        for r in 0..d.num_procs() {
            assert_eq!(d.rank_of(&d.partition_coords(r)), r);
        }
    }

    #[test]
    fn neighbor_keeps_other_coordinates() {
        let d = Decomposition::new(vec![9, 9], vec![2, 2]).unwrap();
        // rank 3 = (1, 1); along dim 0 index 0 belongs to coord 0
        assert_eq!(d.neighbor_rank(3, 0, 0), 2);
        assert_eq!(d.neighbor_rank(3, 1, 0), 1);
        assert_eq!(d.owner_of(&[8, 0]), 1);
    }

    #[test]
    fn explicit_bounds_are_validated() {
        assert!(Decomposition::with_bounds(vec![9], vec![2], vec![vec![0, 6]]).is_ok());
        assert!(Decomposition::with_bounds(vec![9], vec![2], vec![vec![0, 0]]).is_err());
        assert!(Decomposition::with_bounds(vec![9], vec![2], vec![vec![1, 6]]).is_err());
        assert!(Decomposition::with_bounds(vec![9], vec![2], vec![vec![0, 9]]).is_err());
        assert!(Decomposition::new(vec![3], vec![4]).is_err());
    }

    #[test]
    fn balanced_layout() {
        assert_eq!(Decomposition::balanced_procs(1, &[9, 9]).unwrap(), vec![1, 1]);
        assert_eq!(Decomposition::balanced_procs(4, &[17, 5]).unwrap(), vec![4, 1]);
        assert_eq!(Decomposition::balanced_procs(4, &[9, 9]).unwrap(), vec![2, 2]);
        assert_eq!(Decomposition::balanced_procs(8, &[9, 9, 9]).unwrap(), vec![2, 2, 2]);
        assert!(Decomposition::balanced_procs(8, &[3]).is_err());
    }
}

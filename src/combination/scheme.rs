//! Component grids and coefficients of the combination technique.
//!
//! For `lmin <= lmax` let `effdim` be the number of dimensions with
//! `lmin[k] < lmax[k]` and `n = |lmin|_1 + max_k(lmax[k] - lmin[k])`. The
//! scheme contains every `l` in the box `[lmin, lmax]` with `|l|_1 = n - p`
//! for `p = 0..effdim-1`, weighted `(-1)^p * C(effdim-1, p)`. Dimensions with
//! `lmin[k] == lmax[k]` stay fixed at that level. The fault-tolerant variant
//! appends the diagonals `p = effdim..effdim+extra-1` with coefficient
//! exactly `0.0`; they only provide spare grids for recovery.

use crate::combi_error::CombiError;
use crate::debug_invariants::{check_len, DebugInvariants};
use crate::levels::{validate_levels, LevelType, LevelVector};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CombinationScheme {
    lmin: LevelVector,
    lmax: LevelVector,
    levels: Vec<LevelVector>,
    coeffs: Vec<f64>,
    extra_diagonals: usize,
}

/// `C(n, k)` as a float.
fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0.0;
    }
    (0..k.min(n - k)).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

impl CombinationScheme {
    /// Standard scheme.
    pub fn new(lmin: LevelVector, lmax: LevelVector) -> Result<Self, CombiError> {
        Self::fault_tolerant(lmin, lmax, 0)
    }

    /// Standard scheme plus `extra` zero-coefficient diagonals below it.
    pub fn fault_tolerant(
        lmin: LevelVector,
        lmax: LevelVector,
        extra: usize,
    ) -> Result<Self, CombiError> {
        validate_levels(&lmin, lmin.dim())?;
        validate_levels(&lmax, lmin.dim())?;
        if !lmin.le_all(&lmax) {
            return Err(CombiError::InvalidLevelBounds { lmin, lmax });
        }

        let effdim = (0..lmin.dim()).filter(|&k| lmin[k] < lmax[k]).count();
        let n = Self::diagonal_sum(&lmin, &lmax);
        let standard = effdim.max(1);

        let mut levels = Vec::new();
        let mut coeffs = Vec::new();
        for p in 0..standard + extra {
            let coeff = if p < standard {
                let sign = if p % 2 == 0 { 1.0 } else { -1.0 };
                sign * binomial(standard - 1, p)
            } else {
                0.0
            };
            for l in Self::box_diagonal(&lmin, &lmax, n - p as LevelType) {
                levels.push(l);
                coeffs.push(coeff);
            }
        }
        log::debug!(
            "combination scheme lmin={lmin} lmax={lmax}: {} grids ({} extra diagonals)",
            levels.len(),
            extra
        );
        let scheme = Self {
            lmin,
            lmax,
            levels,
            coeffs,
            extra_diagonals: extra,
        };
        scheme.debug_assert_invariants();
        Ok(scheme)
    }

    /// Level sum of the top diagonal.
    pub fn diagonal_sum(lmin: &LevelVector, lmax: &LevelVector) -> LevelType {
        let spread = lmin
            .iter()
            .zip(lmax.iter())
            .map(|(a, b)| b - a)
            .max()
            .unwrap_or(0);
        lmin.sum() + spread
    }

    /// All `l` in `[lmin, lmax]` with `|l|_1 == target`, lexicographically sorted.
    fn box_diagonal(lmin: &LevelVector, lmax: &LevelVector, target: LevelType) -> Vec<LevelVector> {
        (0..lmin.dim())
            .map(|k| lmin[k]..=lmax[k])
            .multi_cartesian_product()
            .filter(|l| l.iter().sum::<LevelType>() == target)
            .map(LevelVector::from)
            .collect()
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

    pub fn extra_diagonals(&self) -> usize {
        self.extra_diagonals
    }

    pub fn levels(&self) -> &[LevelVector] {
        &self.levels
    }

    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LevelVector, f64)> + '_ {
        self.levels.iter().zip(self.coeffs.iter().copied())
    }

    pub fn coefficient(&self, level: &LevelVector) -> Option<f64> {
        self.levels
            .iter()
            .position(|l| l == level)
            .map(|i| self.coeffs[i])
    }

    /// Overwrite the coefficient of `level` (fault recovery). Returns `false`
    /// if `level` is not part of the scheme.
    pub fn set_coefficient(&mut self, level: &LevelVector, coeff: f64) -> bool {
        match self.levels.iter().position(|l| l == level) {
            Some(i) => {
                self.coeffs[i] = coeff;
                true
            }
            None => false,
        }
    }

    /// Grids on diagonal `p` (`|l|_1 == n - p`).
    pub fn levels_of_diagonal(&self, p: usize) -> Vec<&LevelVector> {
        let target = Self::diagonal_sum(&self.lmin, &self.lmax) - p as LevelType;
        self.levels.iter().filter(|l| l.sum() == target).collect()
    }

    /// Sum of all coefficients; 1 for every consistent scheme.
    pub fn coefficient_sum(&self) -> f64 {
        self.coeffs.iter().sum()
    }
}

impl DebugInvariants for CombinationScheme {
    fn validate_invariants(&self) -> Result<(), CombiError> {
        check_len(self.levels.len(), self.coeffs.len())?;
        if let Some(l) = self
            .levels
            .iter()
            .find(|l| !self.lmin.le_all(l) || !l.le_all(&self.lmax))
        {
            return Err(CombiError::InvalidLevelBounds {
                lmin: self.lmin.clone(),
                lmax: l.clone(),
            });
        }
        if self.levels.iter().duplicates().next().is_some() {
            return Err(CombiError::InvalidConfig("a level vector appears twice".into()));
        }
        Ok(())
    }
}

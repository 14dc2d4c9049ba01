//! Level and index vectors.
//!
//! A [`LevelVector`] holds one resolution exponent per dimension, an
//! [`IndexVector`] one grid index per dimension. Both are immutable
//! value types: the derived `Ord` is lexicographic and gives the total order
//! used for deterministic iteration, while [`MultiIndex::le_all`] and friends
//! implement the elementwise partial order of the combination technique.

use crate::combi_error::CombiError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Index, Sub};

/// Per-dimension resolution level (1-based; 0 is used for boundary points).
pub type LevelType = i32;
/// Per-dimension grid index.
pub type IndexType = usize;

/// Fixed-length tuple with one entry per dimension.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultiIndex<T>(Vec<T>);

pub type LevelVector = MultiIndex<LevelType>;
pub type IndexVector = MultiIndex<IndexType>;

impl<T: Copy + PartialOrd> MultiIndex<T> {
    pub fn new(entries: Vec<T>) -> Self {
        Self(entries)
    }

    /// `dim` copies of `value`.
    pub fn filled(dim: usize, value: T) -> Self {
        Self(vec![value; dim])
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.0
    }

    pub fn iter(&self) -> std::iter::Copied<std::slice::Iter<'_, T>> {
        self.0.iter().copied()
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }

    /// Copy of `self` with entry `dim` replaced by `value`.
    pub fn with(&self, dim: usize, value: T) -> Self {
        let mut v = self.0.clone();
        v[dim] = value;
        Self(v)
    }

    #[inline]
    fn all_pairs(&self, other: &Self, f: impl Fn(T, T) -> bool) -> bool {
        self.dim() == other.dim() && self.0.iter().zip(&other.0).all(|(&a, &b)| f(a, b))
    }

    /// Elementwise `<=`. Vectors of different length never compare.
    pub fn le_all(&self, other: &Self) -> bool {
        self.all_pairs(other, |a, b| a <= b)
    }

    /// Elementwise `<`.
    pub fn lt_all(&self, other: &Self) -> bool {
        self.all_pairs(other, |a, b| a < b)
    }

    /// Elementwise `>=`.
    pub fn ge_all(&self, other: &Self) -> bool {
        self.all_pairs(other, |a, b| a >= b)
    }

    /// Elementwise `>`.
    pub fn gt_all(&self, other: &Self) -> bool {
        self.all_pairs(other, |a, b| a > b)
    }
}

impl<T: Copy + Sum<T>> MultiIndex<T> {
    pub fn sum(&self) -> T {
        self.0.iter().copied().sum()
    }
}

impl<T: Copy + Add<Output = T>> Add for &MultiIndex<T> {
    type Output = MultiIndex<T>;

    fn add(self, rhs: Self) -> MultiIndex<T> {
        debug_assert_eq!(self.0.len(), rhs.0.len());
        MultiIndex(self.0.iter().zip(&rhs.0).map(|(&a, &b)| a + b).collect())
    }
}

impl<T: Copy + Sub<Output = T>> Sub for &MultiIndex<T> {
    type Output = MultiIndex<T>;

    fn sub(self, rhs: Self) -> MultiIndex<T> {
        debug_assert_eq!(self.0.len(), rhs.0.len());
        MultiIndex(self.0.iter().zip(&rhs.0).map(|(&a, &b)| a - b).collect())
    }
}

impl<T> Index<usize> for MultiIndex<T> {
    type Output = T;

    #[inline]
    fn index(&self, i: usize) -> &T {
        &self.0[i]
    }
}

impl<T> From<Vec<T>> for MultiIndex<T> {
    fn from(v: Vec<T>) -> Self {
        Self(v)
    }
}

impl<T: Copy> From<&[T]> for MultiIndex<T> {
    fn from(v: &[T]) -> Self {
        Self(v.to_vec())
    }
}

impl<T: Copy, const N: usize> From<[T; N]> for MultiIndex<T> {
    fn from(v: [T; N]) -> Self {
        Self(v.to_vec())
    }
}

impl<T> FromIterator<T> for MultiIndex<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T: fmt::Display> fmt::Display for MultiIndex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str(")")
    }
}

/// Check that every level is `>= 1` and that the vector has `dim` entries.
pub fn validate_levels(levels: &LevelVector, dim: usize) -> Result<(), CombiError> {
    if levels.dim() != dim {
        return Err(CombiError::DimensionMismatch {
            expected: dim,
            found: levels.dim(),
        });
    }
    match levels.iter().enumerate().find(|&(_, l)| l < 1) {
        Some((d, l)) => Err(CombiError::InvalidLevel { dim: d, level: l }),
        None => Ok(()),
    }
}

//! Serial full grid: the gathered form of a component grid and the target
//! of grid evaluation.

use crate::combi_error::CombiError;
use crate::fullgrid::element::GridElement;
use crate::fullgrid::hierarchical::{num_points, position};
use crate::fullgrid::strides_of;
use crate::hierarchization::kernels;
use crate::levels::{validate_levels, IndexVector, LevelVector};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct FullGrid<T: GridElement> {
    levels: LevelVector,
    boundary: Vec<bool>,
    sizes: Vec<usize>,
    data: Vec<T>,
    hierarchized: bool,
}

impl<T: GridElement> FullGrid<T> {
    /// Zero grid of the given level.
    pub fn new(levels: LevelVector, boundary: Vec<bool>) -> Result<Self, CombiError> {
        validate_levels(&levels, levels.dim())?;
        if boundary.len() != levels.dim() {
            return Err(CombiError::DimensionMismatch {
                expected: levels.dim(),
                found: boundary.len(),
            });
        }
        let sizes: Vec<usize> = levels
            .iter()
            .zip(&boundary)
            .map(|(l, &b)| num_points(l, b))
            .collect();
        let n = sizes.iter().product();
        Ok(Self {
            levels,
            boundary,
            sizes,
            data: vec![T::zero(); n],
            hierarchized: false,
        })
    }

    /// Nodal grid over existing values (dimension 0 fastest).
    pub fn from_data(levels: LevelVector, boundary: Vec<bool>, data: Vec<T>) -> Result<Self, CombiError> {
        let mut fg = Self::new(levels, boundary)?;
        if data.len() != fg.data.len() {
            return Err(CombiError::DataSizeMismatch {
                expected: fg.data.len(),
                found: data.len(),
            });
        }
        fg.data = data;
        Ok(fg)
    }

    pub fn dim(&self) -> usize {
        self.levels.dim()
    }

    pub fn levels(&self) -> &LevelVector {
        &self.levels
    }

    pub fn boundary(&self) -> &[bool] {
        &self.boundary
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn is_hierarchized(&self) -> bool {
        self.hierarchized
    }

    pub fn set_hierarchized(&mut self, hierarchized: bool) {
        self.hierarchized = hierarchized;
    }

    pub fn linear_index(&self, index: &IndexVector) -> usize {
        index
            .iter()
            .zip(strides_of(&self.sizes))
            .map(|(i, s)| i * s)
            .sum()
    }

    pub fn vector_index(&self, mut linear: usize) -> IndexVector {
        self.sizes
            .iter()
            .map(|&n| {
                let i = linear % n;
                linear /= n;
                i
            })
            .collect()
    }

    /// Coordinates in `[0, 1]^d` of the point at `linear`.
    pub fn coords(&self, linear: usize) -> Vec<f64> {
        self.vector_index(linear)
            .iter()
            .enumerate()
            .map(|(d, i)| position(i, self.boundary[d]) as f64 / (1usize << self.levels[d]) as f64)
            .collect()
    }

    pub fn set_from_fn(&mut self, f: impl Fn(&[f64]) -> T) {
        for i in 0..self.data.len() {
            let x = self.coords(i);
            self.data[i] = f(&x);
        }
        self.hierarchized = false;
    }

    /// Multilinear interpolation of the nodal values at `x`. Without
    /// boundary points the grid is taken to vanish on the domain boundary.
    pub fn eval(&self, x: &[f64]) -> Result<T, CombiError> {
        if self.hierarchized {
            return Err(CombiError::HierarchizationState { hierarchized: true });
        }
        if x.len() != self.dim() {
            return Err(CombiError::DimensionMismatch {
                expected: self.dim(),
                found: x.len(),
            });
        }
        let d = self.dim();
        let strides = strides_of(&self.sizes);
        let mut cell = Vec::with_capacity(d);
        for (k, &xk) in x.iter().enumerate() {
            let n = 1usize << self.levels[k];
            let s = xk.clamp(0.0, 1.0) * n as f64;
            let left = (s.floor() as usize).min(n - 1);
            cell.push((left, s - left as f64, n));
        }

        let mut acc = T::zero();
        for corner in 0..(1usize << d) {
            let mut weight = 1.0;
            let mut offset = 0;
            let mut present = true;
            for (k, &(left, t, n)) in cell.iter().enumerate() {
                let upper = (corner >> k) & 1 == 1;
                let p = left + upper as usize;
                weight *= if upper { t } else { 1.0 - t };
                if self.boundary[k] {
                    offset += p * strides[k];
                } else if p == 0 || p == n {
                    present = false;
                } else {
                    offset += (p - 1) * strides[k];
                }
            }
            if present && weight != 0.0 {
                acc += T::from_real(weight) * self.data[offset];
            }
        }
        Ok(acc)
    }

    /// `self += coeff * other`; both grids must share level and basis.
    pub fn add_scaled(&mut self, other: &Self, coeff: f64) -> Result<(), CombiError> {
        if self.levels != other.levels || self.boundary != other.boundary {
            return Err(CombiError::DataSizeMismatch {
                expected: self.len(),
                found: other.len(),
            });
        }
        if self.hierarchized != other.hierarchized {
            return Err(CombiError::HierarchizationState {
                hierarchized: other.hierarchized,
            });
        }
        let c = T::from_real(coeff);
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a += c * b;
        }
        Ok(())
    }

    /// Add `coeff` times the interpolant of `other` at every point of `self`.
    pub fn accumulate_interpolation(&mut self, other: &Self, coeff: f64) -> Result<(), CombiError> {
        if self.hierarchized {
            return Err(CombiError::HierarchizationState { hierarchized: true });
        }
        let c = T::from_real(coeff);
        for i in 0..self.data.len() {
            let x = self.coords(i);
            let v = other.eval(&x)?;
            self.data[i] += c * v;
        }
        Ok(())
    }

    /// Largest absolute pointwise difference to a grid of the same shape.
    pub fn max_abs_diff(&self, other: &Self) -> Option<T> {
        (self.sizes == other.sizes).then(|| {
            self.data
                .iter()
                .zip(&other.data)
                .fold(T::zero(), |m, (&a, &b)| m.max((a - b).abs()))
        })
    }

    pub fn hierarchize(&mut self) {
        if !self.hierarchized {
            kernels::hierarchize_dense(&mut self.data, &self.sizes, self.levels.as_slice(), &self.boundary);
            self.hierarchized = true;
        }
    }

    pub fn dehierarchize(&mut self) {
        if self.hierarchized {
            kernels::dehierarchize_dense(&mut self.data, &self.sizes, self.levels.as_slice(), &self.boundary);
            self.hierarchized = false;
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CombiError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CombiError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_reproduces_bilinear_functions() {
        let mut fg = FullGrid::<f64>::new(LevelVector::from([2, 3]), vec![true, true]).unwrap();
        fg.set_from_fn(|x| 1.0 + 2.0 * x[0] - x[1] + 0.5 * x[0] * x[1]);
        for p in [[0.3, 0.7], [0.0, 1.0], [1.0, 0.0], [0.125, 0.55]] {
            let want = 1.0 + 2.0 * p[0] - p[1] + 0.5 * p[0] * p[1];
            assert!((fg.eval(&p).unwrap() - want).abs() < 1e-12);
        }
    }

    #[test]
    fn eval_without_boundary_vanishes_outside() {
        let mut fg = FullGrid::<f64>::new(LevelVector::from([1]), vec![false]).unwrap();
        fg.data_mut()[0] = 2.0;
        assert_eq!(fg.eval(&[0.5]).unwrap(), 2.0);
        assert_eq!(fg.eval(&[0.25]).unwrap(), 1.0);
        assert_eq!(fg.eval(&[1.0]).unwrap(), 0.0);
    }

    #[test]
    fn interpolation_between_levels() {
        let mut coarse = FullGrid::<f64>::new(LevelVector::from([1, 1]), vec![true, true]).unwrap();
        coarse.set_from_fn(|x| x[0] + x[1]);
        let mut fine = FullGrid::<f64>::new(LevelVector::from([3, 2]), vec![true, true]).unwrap();
        fine.accumulate_interpolation(&coarse, 2.0).unwrap();
        let mut want = fine.clone();
        want.set_from_fn(|x| 2.0 * (x[0] + x[1]));
        assert!(fine.max_abs_diff(&want).unwrap() < 1e-12);
    }

    #[test]
    fn hierarchize_roundtrip_and_basis_guard() {
        let mut fg = FullGrid::<f64>::new(LevelVector::from([3, 2]), vec![true, false]).unwrap();
        fg.set_from_fn(|x| (x[0] * 3.0).sin() * x[1]);
        let nodal = fg.clone();
        fg.hierarchize();
        assert!(matches!(fg.eval(&[0.5, 0.5]), Err(CombiError::HierarchizationState { .. })));
        fg.dehierarchize();
        assert!(fg.max_abs_diff(&nodal).unwrap() < 1e-12);
    }

    #[test]
    fn bincode_roundtrip() {
        let fg = FullGrid::<f32>::from_data(LevelVector::from([1]), vec![true], vec![1.0, 2.0, 3.0]).unwrap();
        let back = FullGrid::<f32>::from_bytes(&fg.to_bytes().unwrap()).unwrap();
        assert_eq!(back, fg);
        assert!(FullGrid::<f32>::from_data(LevelVector::from([1]), vec![true], vec![1.0]).is_err());
    }
}

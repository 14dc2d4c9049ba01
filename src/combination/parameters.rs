//! Manager-owned combination configuration, broadcast verbatim to workers.

use crate::combi_error::CombiError;
use crate::combination::scheme::CombinationScheme;
use crate::levels::{validate_levels, LevelVector};
use crate::manager::task::TaskId;
use crate::sparsegrid::SubspacePlacement;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Authoritative combination parameters. Workers never mutate their copy;
/// they replace it wholesale on `UpdateCombiParameters`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CombiParameters {
    lmin: LevelVector,
    lmax: LevelVector,
    boundary: Vec<bool>,
    levels: BTreeMap<TaskId, LevelVector>,
    coeffs: BTreeMap<TaskId, f64>,
    procs: Option<Vec<usize>>,
    placement: SubspacePlacement,
}

impl CombiParameters {
    pub fn new(
        lmin: LevelVector,
        lmax: LevelVector,
        boundary: Vec<bool>,
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
        Ok(Self {
            lmin,
            lmax,
            boundary,
            levels: BTreeMap::new(),
            coeffs: BTreeMap::new(),
            procs: None,
            placement: SubspacePlacement::default(),
        })
    }

    /// Parameters matching `scheme`, with task ids assigned in scheme order.
    pub fn from_scheme(
        scheme: &CombinationScheme,
        boundary: Vec<bool>,
        ids: &[TaskId],
    ) -> Result<Self, CombiError> {
        if ids.len() != scheme.len() {
            return Err(CombiError::DimensionMismatch {
                expected: scheme.len(),
                found: ids.len(),
            });
        }
        let mut params = Self::new(scheme.lmin().clone(), scheme.lmax().clone(), boundary)?;
        for (&id, (level, coeff)) in ids.iter().zip(scheme.iter()) {
            params.insert_task(id, level.clone(), coeff)?;
        }
        Ok(params)
    }

    /// Register (or replace) the level and coefficient of task `id`.
    pub fn insert_task(
        &mut self,
        id: TaskId,
        level: LevelVector,
        coeff: f64,
    ) -> Result<(), CombiError> {
        validate_levels(&level, self.dim())?;
        self.levels.insert(id, level);
        self.coeffs.insert(id, coeff);
        Ok(())
    }

    pub fn set_coefficient(&mut self, id: TaskId, coeff: f64) -> Result<(), CombiError> {
        match self.coeffs.get_mut(&id) {
            Some(c) => {
                *c = coeff;
                Ok(())
            }
            None => Err(CombiError::TaskNotFound(id)),
        }
    }

    /// Fix the per-dimension process layout used for every task grid.
    pub fn with_procs(mut self, procs: Vec<usize>) -> Result<Self, CombiError> {
        if procs.len() != self.dim() {
            return Err(CombiError::DimensionMismatch {
                expected: self.dim(),
                found: procs.len(),
            });
        }
        self.procs = Some(procs);
        Ok(self)
    }

    pub fn with_placement(mut self, placement: SubspacePlacement) -> Self {
        self.placement = placement;
        self
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

    pub fn coefficient(&self, id: TaskId) -> Option<f64> {
        self.coeffs.get(&id).copied()
    }

    pub fn level(&self, id: TaskId) -> Option<&LevelVector> {
        self.levels.get(&id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.levels.keys().copied()
    }

    pub fn procs(&self) -> Option<&[usize]> {
        self.procs.as_deref()
    }

    pub fn placement(&self) -> SubspacePlacement {
        self.placement
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
    fn from_scheme_keeps_ids_and_coefficients() {
        let scheme =
            CombinationScheme::new(LevelVector::from([2, 2]), LevelVector::from([4, 4])).unwrap();
        let ids: Vec<TaskId> = (10..10 + scheme.len() as u64).collect();
        let mut params = CombiParameters::from_scheme(&scheme, vec![true, true], &ids).unwrap();
        for (&id, (level, coeff)) in ids.iter().zip(scheme.iter()) {
            assert_eq!(params.level(id), Some(level));
            assert_eq!(params.coefficient(id), Some(coeff));
        }
        params.set_coefficient(10, 0.0).unwrap();
        assert_eq!(params.coefficient(10), Some(0.0));
        assert!(matches!(
            params.set_coefficient(99, 1.0),
            Err(CombiError::TaskNotFound(99))
        ));
    }

    #[test]
    fn bytes_roundtrip_is_verbatim() {
        let params = CombiParameters::new(LevelVector::from([1, 2]), LevelVector::from([3, 3]), vec![
            false, true,
        ])
        .unwrap()
        .with_procs(vec![2, 1])
        .unwrap()
        .with_placement(SubspacePlacement::NodeAware { procs_per_node: 2 });
        let back = CombiParameters::from_bytes(&params.to_bytes().unwrap()).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn boundary_length_is_checked() {
        assert!(matches!(
            CombiParameters::new(LevelVector::from([1, 1]), LevelVector::from([2, 2]), vec![true]),
            Err(CombiError::DimensionMismatch { expected: 2, found: 1 })
        ));
    }
}

//! Run-wide configuration of the process topology.

use crate::combi_error::CombiError;
use crate::sparsegrid::SubspacePlacement;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Number of process groups computing tasks.
    pub num_groups: usize,
    /// Processes in every group.
    pub procs_per_group: usize,
    /// Owner rule for sparse-grid subspaces inside a group.
    pub placement: SubspacePlacement,
    /// Sleep between two non-blocking status polls on the manager.
    pub poll_interval_us: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            num_groups: 1,
            procs_per_group: 1,
            placement: SubspacePlacement::RoundRobin,
            poll_interval_us: 100,
        }
    }
}

impl SystemConfig {
    pub fn new(num_groups: usize, procs_per_group: usize) -> Self {
        Self {
            num_groups,
            procs_per_group,
            ..Self::default()
        }
    }

    pub fn with_placement(mut self, placement: SubspacePlacement) -> Self {
        self.placement = placement;
        self
    }

    /// Workers plus the manager.
    pub fn world_size(&self) -> usize {
        self.num_groups * self.procs_per_group + 1
    }

    /// World rank of the manager.
    pub fn manager_rank(&self) -> usize {
        self.num_groups * self.procs_per_group
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn validate(&self) -> Result<(), CombiError> {
        if self.num_groups == 0 {
            return Err(CombiError::InvalidConfig("num_groups must be positive".into()));
        }
        if self.procs_per_group == 0 {
            return Err(CombiError::InvalidConfig("procs_per_group must be positive".into()));
        }
        if let SubspacePlacement::NodeAware { procs_per_node } = self.placement {
            if procs_per_node == 0 {
                return Err(CombiError::InvalidConfig("procs_per_node must be positive".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_topology() {
        let c = SystemConfig::new(3, 4);
        assert_eq!(c.world_size(), 13);
        assert_eq!(c.manager_rank(), 12);
        assert!(c.validate().is_ok());
        assert!(SystemConfig::new(0, 1).validate().is_err());
        assert!(SystemConfig::new(1, 1)
            .with_placement(SubspacePlacement::NodeAware { procs_per_node: 0 })
            .validate()
            .is_err());
    }
}

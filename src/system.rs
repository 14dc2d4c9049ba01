//! Process topology and the communicators derived from it.
//!
//! World ranks `0..G*P` are workers, rank `G*P` is the manager. Worker `w`
//! belongs to group `w / P` with rank-in-group `w % P`; rank 0 of a group is
//! its master. Three sub-communicators are built once and reused for the
//! whole run:
//!
//! * the local group communicator (all processes of one group);
//! * the reduce communicator (all processes with the same rank-in-group,
//!   one per group, in group order);
//! * the global communicator (every master in group order, then the
//!   manager).

use crate::algs::comm_group::CommGroup;
use crate::algs::communicator::Communicator;
use crate::combi_error::CombiError;
use crate::manager::config::SystemConfig;
use std::sync::Arc;

const LOCAL_CONTEXT: u8 = 1;
const REDUCE_CONTEXT: u8 = 2;
const GLOBAL_CONTEXT: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Manager,
    Worker { group: usize, rank_in_group: usize },
}

pub struct CombiSystem<C: Communicator> {
    config: SystemConfig,
    world: CommGroup<C>,
    role: Role,
    local: Option<CommGroup<C>>,
    reduce: Option<CommGroup<C>>,
    global: Option<CommGroup<C>>,
}

impl<C: Communicator> CombiSystem<C> {
    pub fn new(comm: Arc<C>, config: SystemConfig) -> Result<Self, CombiError> {
        config.validate()?;
        if comm.size() != config.world_size() {
            return Err(CombiError::ProcessCountMismatch {
                expected: config.world_size(),
                found: comm.size(),
            });
        }
        let me = comm.rank();
        let ppg = config.procs_per_group;
        let manager = config.manager_rank();
        let masters: Vec<usize> = (0..config.num_groups).map(|g| g * ppg).collect();

        let role = if me == manager {
            Role::Manager
        } else {
            Role::Worker {
                group: me / ppg,
                rank_in_group: me % ppg,
            }
        };

        let (local, reduce) = match role {
            Role::Manager => (None, None),
            Role::Worker { group, rank_in_group } => {
                let local = CommGroup::new(
                    Arc::clone(&comm),
                    (group * ppg..(group + 1) * ppg).collect(),
                    LOCAL_CONTEXT,
                )?;
                let reduce = CommGroup::new(
                    Arc::clone(&comm),
                    (0..config.num_groups).map(|g| g * ppg + rank_in_group).collect(),
                    REDUCE_CONTEXT,
                )?;
                (Some(local), Some(reduce))
            }
        };

        let global = if me == manager || masters.contains(&me) {
            let mut members = masters;
            members.push(manager);
            Some(CommGroup::new(Arc::clone(&comm), members, GLOBAL_CONTEXT)?)
        } else {
            None
        };

        log::debug!("rank {me}: {role:?}");
        Ok(Self {
            config,
            world: CommGroup::world(comm),
            role,
            local,
            reduce,
            global,
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn world(&self) -> &CommGroup<C> {
        &self.world
    }

    pub fn world_rank(&self) -> usize {
        self.world.rank()
    }

    pub fn is_manager(&self) -> bool {
        self.role == Role::Manager
    }

    /// Rank 0 of a group.
    pub fn is_master(&self) -> bool {
        matches!(self.role, Role::Worker { rank_in_group: 0, .. })
    }

    pub fn group_id(&self) -> Option<usize> {
        match self.role {
            Role::Worker { group, .. } => Some(group),
            Role::Manager => None,
        }
    }

    pub fn num_groups(&self) -> usize {
        self.config.num_groups
    }

    pub fn procs_per_group(&self) -> usize {
        self.config.procs_per_group
    }

    /// Index of the manager in the global communicator.
    pub fn manager_index(&self) -> usize {
        self.config.num_groups
    }

    pub fn local(&self) -> Result<&CommGroup<C>, CombiError> {
        self.local.as_ref().ok_or(CombiError::NotAMember {
            rank: self.world_rank(),
        })
    }

    pub fn reduce(&self) -> Result<&CommGroup<C>, CombiError> {
        self.reduce.as_ref().ok_or(CombiError::NotAMember {
            rank: self.world_rank(),
        })
    }

    pub fn global(&self) -> Result<&CommGroup<C>, CombiError> {
        self.global.as_ref().ok_or(CombiError::NotAMember {
            rank: self.world_rank(),
        })
    }
}

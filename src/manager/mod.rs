//! Manager/worker orchestration.
//!
//! One manager rank drives `G` process groups through a small command
//! protocol ([`signals`]). The manager keeps a [`ProcessGroupManager`] per
//! group that tracks whether the group is idle; each worker rank runs a
//! [`ProcessGroupWorker`] loop that executes the commands on its tasks.

pub mod config;
pub mod group_manager;
pub mod group_worker;
pub mod process_manager;
pub mod signals;
pub mod task;

pub use config::SystemConfig;
pub use group_manager::ProcessGroupManager;
pub use group_worker::ProcessGroupWorker;
pub use process_manager::ProcessManager;
pub use signals::{Signal, Status};
pub use task::{
    DecayTaskSpec, FunctionTaskSpec, Task, TaskBase, TaskContext, TaskDescriptor, TaskId, TaskSpec,
    TestFunction,
};

use crate::algs::communicator::{Communicator, LocalComm};
use crate::combi_error::CombiError;
use crate::system::CombiSystem;
use std::sync::Arc;

/// Entry point for one rank of a distributed run: workers serve signals
/// until `Exit`, the manager runs `drive` and then releases the workers.
pub fn run_rank<C, R>(
    system: &CombiSystem<C>,
    drive: impl FnOnce(&mut ProcessManager<'_, C>) -> Result<R, CombiError>,
) -> Result<Option<R>, CombiError>
where
    C: Communicator,
{
    if system.is_manager() {
        let mut manager = ProcessManager::new(system)?;
        let result = drive(&mut manager);
        if let Err(e) = &result {
            log::error!("manager failed: {e}");
        }
        manager.exit()?;
        result.map(Some)
    } else {
        ProcessGroupWorker::new(system)?.run()?;
        Ok(None)
    }
}

/// Run a whole system inside this process: one thread per world rank over
/// a [`LocalComm`] universe. `drive` runs on the manager rank; afterwards
/// every group receives `Exit` and all threads are joined.
pub fn run_local<R, F>(config: SystemConfig, drive: F) -> Result<R, CombiError>
where
    F: FnOnce(&mut ProcessManager<'_, LocalComm>) -> Result<R, CombiError>,
{
    config.validate()?;
    let manager_rank = config.manager_rank();
    let mut endpoints = LocalComm::universe(config.world_size());
    let manager_comm = endpoints.remove(manager_rank);

    std::thread::scope(|s| {
        let workers: Vec<_> = endpoints
            .into_iter()
            .map(|comm| {
                let config = config.clone();
                s.spawn(move || -> Result<(), CombiError> {
                    let system = CombiSystem::new(Arc::new(comm), config)?;
                    run_rank(&system, |_| Ok(()))?;
                    Ok(())
                })
            })
            .collect();

        let system = CombiSystem::new(Arc::new(manager_comm), config.clone())?;
        let result = run_rank(&system, drive)?;

        for handle in workers {
            match handle.join() {
                Ok(r) => r?,
                Err(_) => {
                    return Err(CombiError::InvalidConfig("a worker thread panicked".into()));
                }
            }
        }
        result.ok_or(CombiError::NotAMember { rank: manager_rank })
    })
}

/// Unwrap `result` or log the error and abort the process. For binaries in
/// which one failing rank must take the whole run down.
pub fn abort_on_error<T>(result: Result<T, CombiError>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => {
            log::error!("fatal: {e}");
            std::process::abort()
        }
    }
}

//! Worker side of the protocol: one instance per worker rank.
//!
//! The group master receives a signal (and its payload) from the manager
//! over the global communicator and broadcasts both inside the group. Every
//! process of the group then runs the handler. Afterwards the master sends
//! the handler's result, if the signal has one, and the group's new status
//! back to the manager.

use crate::algs::comm_group::{tags, CommGroup};
use crate::algs::communicator::Communicator;
use crate::algs::wire::cast_slice;
use crate::combi_error::CombiError;
use crate::combicom;
use crate::combination::parameters::CombiParameters;
use crate::fullgrid::full_grid::FullGrid;
use crate::hierarchization::dehierarchize;
use crate::levels::LevelVector;
use crate::manager::signals::{Signal, Status};
use crate::manager::task::{Task, TaskContext, TaskDescriptor};
use crate::sparsegrid::DistributedSparseGrid;
use crate::system::CombiSystem;

pub struct ProcessGroupWorker<'s, C: Communicator> {
    system: &'s CombiSystem<C>,
    tasks: Vec<(Box<dyn Task>, TaskContext)>,
    params: Option<CombiParameters>,
    last_target: Option<DistributedSparseGrid<f64>>,
    status: Status,
}

impl<'s, C: Communicator> ProcessGroupWorker<'s, C> {
    pub fn new(system: &'s CombiSystem<C>) -> Result<Self, CombiError> {
        system.local()?;
        Ok(Self {
            system,
            tasks: Vec::new(),
            params: None,
            last_target: None,
            status: Status::Wait,
        })
    }

    pub fn tasks(&self) -> impl Iterator<Item = &dyn Task> + '_ {
        self.tasks.iter().map(|(t, _)| t.as_ref())
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn combi_parameters(&self) -> Option<&CombiParameters> {
        self.params.as_ref()
    }

    /// Serve signals until `Exit`. A failing handler is reported to the
    /// manager as `Fail` and the loop goes on; only a failure to receive a
    /// signal ends it.
    pub fn run(&mut self) -> Result<(), CombiError> {
        loop {
            match self.wait_for_signal() {
                Ok(Signal::Exit) => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    log::error!("rank {}: worker stopped: {e}", self.system.world_rank());
                    return Err(e);
                }
            }
        }
    }

    /// Receive, distribute and handle one signal.
    pub fn wait_for_signal(&mut self) -> Result<Signal, CombiError> {
        let system = self.system;
        let local = system.local()?;
        let (signal, payload) = if system.is_master() {
            let global = system.global()?;
            let manager = system.manager_index();
            let raw = global.recv(manager, tags::SIGNAL)?;
            let signal = Signal::decode(&raw, global.world_rank(manager))?;
            let payload = if signal.has_payload() {
                global.recv(manager, tags::PAYLOAD)?
            } else {
                Vec::new()
            };
            local.broadcast_bytes(0, &raw)?;
            if signal.has_payload() {
                local.broadcast_bytes(0, &payload)?;
            }
            (signal, payload)
        } else {
            let raw = local.broadcast_bytes(0, &[])?;
            let signal = Signal::decode(&raw, local.world_rank(0))?;
            let payload = if signal.has_payload() {
                local.broadcast_bytes(0, &[])?
            } else {
                Vec::new()
            };
            (signal, payload)
        };

        log::debug!(
            "rank {} (group {:?}): {signal:?}",
            system.world_rank(),
            system.group_id()
        );
        self.status = Status::Busy;
        let result = match self.handle(signal, &payload, local) {
            Ok(result) => result,
            Err(e) => {
                log::error!("rank {}: {signal:?} failed: {e}", system.world_rank());
                self.status = Status::Fail;
                None
            }
        };
        if !signal.has_status() {
            return Ok(signal);
        }

        // the group fails as a whole if any of its processes failed
        let mut failed = [u64::from(self.status == Status::Fail)];
        local.allreduce_max_u64(&mut failed)?;
        self.status = if failed[0] == 0 { Status::Wait } else { Status::Fail };

        if system.is_master() {
            let global = system.global()?;
            let manager = system.manager_index();
            if signal.has_result() {
                let reply = if self.status == Status::Fail { None } else { result };
                global.send(manager, tags::RESULT, &reply.unwrap_or_default());
            }
            global.send(manager, tags::STATUS, cast_slice(&[self.status.to_wire()]));
        }
        Ok(signal)
    }

    fn handle(
        &mut self,
        signal: Signal,
        payload: &[u8],
        local: &CommGroup<C>,
    ) -> Result<Option<Vec<u8>>, CombiError> {
        match signal {
            Signal::RunFirst => {
                let (mut task, ctx) = self.prepare(payload)?;
                task.init(&ctx)?;
                task.run(&ctx)?;
                self.tasks.push((task, ctx));
            }
            Signal::AddTask => {
                let (mut task, ctx) = self.prepare(payload)?;
                task.init(&ctx)?;
                self.tasks.push((task, ctx));
            }
            Signal::Recompute => {
                let (mut task, ctx) = self.prepare(payload)?;
                task.init(&ctx)?;
                let target = self.last_target.as_ref().ok_or(CombiError::NoCombinationTarget)?;
                let id = task.id();
                let grid = task.grid_mut().ok_or(CombiError::TaskNotFound(id))?;
                grid.set_hierarchized(true);
                grid.extract_from_combination_target(target, local)?;
                dehierarchize(grid, local)?;
                task.run(&ctx)?;
                self.tasks.push((task, ctx));
            }
            Signal::RunNext => {
                for (task, ctx) in &mut self.tasks {
                    task.run(ctx)?;
                }
            }
            Signal::SyncTasks => {
                let states: Vec<TaskDescriptor> = self.tasks().map(|t| t.descriptor()).collect();
                return Ok(Some(bincode::serialize(&states)?));
            }
            Signal::Combine => self.combine(local)?,
            Signal::GridEval => {
                let level: LevelVector = bincode::deserialize(payload)?;
                return self.grid_eval(&level, local);
            }
            Signal::CombineFg => {
                let level: LevelVector = bincode::deserialize(payload)?;
                self.combine(local)?;
                return self.grid_eval(&level, local);
            }
            Signal::GridGather => {
                let level: LevelVector = bincode::deserialize(payload)?;
                let gathered = match self.tasks.iter().find(|(t, _)| *t.level() == level) {
                    Some((task, _)) => {
                        let grid = task.grid().ok_or(CombiError::TaskNotFound(task.id()))?;
                        grid.gather_full_grid(local, 0)?
                    }
                    None => None,
                };
                return Ok(Some(bincode::serialize(&gathered)?));
            }
            Signal::Eval => {
                let points: Vec<Vec<f64>> = bincode::deserialize(payload)?;
                return self.eval(&points, local);
            }
            Signal::UpdateCombiParameters => {
                self.params = Some(CombiParameters::from_bytes(payload)?);
            }
            Signal::Exit => {}
        }
        Ok(None)
    }

    fn prepare(&self, payload: &[u8]) -> Result<(Box<dyn Task>, TaskContext), CombiError> {
        let desc = TaskDescriptor::from_bytes(payload)?;
        let local = self.system.local()?;
        let ctx = TaskContext::for_level(
            local.rank(),
            local.size(),
            self.params.as_ref().and_then(|p| p.procs()),
            &desc.base.level,
            &desc.base.boundary,
        )?;
        Ok((desc.instantiate(), ctx))
    }

    fn coefficient(&self, task: &dyn Task) -> Result<f64, CombiError> {
        let params = self.params.as_ref().ok_or(CombiError::MissingCombiParameters)?;
        Ok(params.coefficient(task.id()).unwrap_or(task.base().coeff))
    }

    fn combine(&mut self, local: &CommGroup<C>) -> Result<(), CombiError> {
        let system = self.system;
        let params = self.params.clone().ok_or(CombiError::MissingCombiParameters)?;
        let reduce = system.reduce()?;
        let coeffs = self
            .tasks
            .iter()
            .map(|(t, _)| self.coefficient(t.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut grids = Vec::with_capacity(self.tasks.len());
        for ((task, _), coeff) in self.tasks.iter_mut().zip(coeffs) {
            let id = task.id();
            grids.push((task.grid_mut().ok_or(CombiError::TaskNotFound(id))?, coeff));
        }
        // drop the previous target before the new one is built
        self.last_target = None;
        self.last_target = Some(combicom::combine(grids, &params, local, reduce)?);
        Ok(())
    }

    /// Coefficient-weighted interpolation of every local task onto a full
    /// grid of `level`, assembled on the master.
    fn grid_eval(&self, level: &LevelVector, local: &CommGroup<C>) -> Result<Option<Vec<u8>>, CombiError> {
        let params = self.params.as_ref().ok_or(CombiError::MissingCombiParameters)?;
        let mut out = FullGrid::<f64>::new(level.clone(), params.boundary().to_vec())?;
        for (task, _) in &self.tasks {
            let grid = task.grid().ok_or(CombiError::TaskNotFound(task.id()))?;
            if let Some(fg) = grid.gather_full_grid(local, 0)? {
                out.accumulate_interpolation(&fg, self.coefficient(task.as_ref())?)?;
            }
        }
        if local.rank() == 0 {
            Ok(Some(out.to_bytes()?))
        } else {
            Ok(None)
        }
    }

    /// Coefficient-weighted sum of the task interpolants at `points`.
    fn eval(&self, points: &[Vec<f64>], local: &CommGroup<C>) -> Result<Option<Vec<u8>>, CombiError> {
        let mut values = vec![0.0f64; points.len()];
        for (task, _) in &self.tasks {
            let grid = task.grid().ok_or(CombiError::TaskNotFound(task.id()))?;
            if let Some(fg) = grid.gather_full_grid(local, 0)? {
                let coeff = self.coefficient(task.as_ref())?;
                for (v, x) in values.iter_mut().zip(points) {
                    *v += coeff * fg.eval(x)?;
                }
            }
        }
        Ok(Some(bincode::serialize(&values)?))
    }
}

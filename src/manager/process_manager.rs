//! The manager: schedules tasks onto groups and drives the phases.

use crate::algs::communicator::Communicator;
use crate::combi_error::CombiError;
use crate::combination::parameters::CombiParameters;
use crate::fullgrid::full_grid::FullGrid;
use crate::levels::LevelVector;
use crate::manager::group_manager::ProcessGroupManager;
use crate::manager::signals::Signal;
use crate::manager::task::{TaskDescriptor, TaskId};
use crate::system::CombiSystem;
use std::time::Duration;

pub struct ProcessManager<'s, C: Communicator> {
    system: &'s CombiSystem<C>,
    groups: Vec<ProcessGroupManager<'s, C>>,
    tasks: Vec<TaskDescriptor>,
    params: Option<CombiParameters>,
    params_sent: bool,
    combined: bool,
    poll_interval: Duration,
}

impl<'s, C: Communicator> ProcessManager<'s, C> {
    pub fn new(system: &'s CombiSystem<C>) -> Result<Self, CombiError> {
        let global = system.global()?;
        let poll_interval = system.config().poll_interval();
        let groups = (0..system.num_groups())
            .map(|g| ProcessGroupManager::new(global, g, poll_interval))
            .collect();
        Ok(Self {
            system,
            groups,
            tasks: Vec::new(),
            params: None,
            params_sent: false,
            combined: false,
            poll_interval,
        })
    }

    pub fn groups(&self) -> &[ProcessGroupManager<'s, C>] {
        &self.groups
    }

    pub fn group_mut(&mut self, group: usize) -> Option<&mut ProcessGroupManager<'s, C>> {
        self.groups.get_mut(group)
    }

    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    pub fn combi_parameters(&self) -> Option<&CombiParameters> {
        self.params.as_ref()
    }

    /// Group the task `id` is scheduled on.
    pub fn group_of(&self, id: TaskId) -> Option<usize> {
        self.groups.iter().position(|g| g.tasks().contains(&id))
    }

    /// Index of the group with the smallest accumulated load.
    fn least_loaded(&self) -> usize {
        self.groups
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.load().total_cmp(&b.1.load()).then(a.0.cmp(&b.0)))
            .map_or(0, |(i, _)| i)
    }

    fn broadcast_signal(&mut self, signal: Signal, payload: &[u8]) -> Result<(), CombiError> {
        for g in &mut self.groups {
            g.send_signal(signal, payload)?;
        }
        Ok(())
    }

    /// Poll every group until all are back in `Wait`.
    /// A group that reports `Fail` still counts as idle; the first such
    /// failure is returned once every group is back in `Wait`.
    pub fn wait_all(&mut self) -> Result<(), CombiError> {
        let mut first_err = None;
        loop {
            let mut busy = false;
            for g in &mut self.groups {
                match g.is_ready() {
                    Ok(ready) => busy |= !ready,
                    Err(e @ CombiError::GroupFailed { .. }) => {
                        first_err.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            if !busy {
                return first_err.map_or(Ok(()), Err);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Wait for the reply of every group, even after one of them failed, and
    /// return the first error.
    fn collect_results(&mut self) -> Result<Vec<Vec<u8>>, CombiError> {
        let mut out = Vec::with_capacity(self.groups.len());
        let mut first_err = None;
        for g in &mut self.groups {
            match g.take_result() {
                Ok(r) => out.push(r.unwrap_or_default()),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Replace the combination parameters and push them to every group.
    pub fn update_combi_parameters(&mut self, params: CombiParameters) -> Result<(), CombiError> {
        let params = params.with_placement(self.system.config().placement);
        let bytes = params.to_bytes()?;
        self.wait_all()?;
        self.broadcast_signal(Signal::UpdateCombiParameters, &bytes)?;
        self.params = Some(params);
        self.params_sent = true;
        self.wait_all()
    }

    fn ensure_params_sent(&mut self) -> Result<(), CombiError> {
        if self.params_sent {
            return Ok(());
        }
        match self.params.clone() {
            Some(p) => self.update_combi_parameters(p),
            None => Err(CombiError::MissingCombiParameters),
        }
    }

    /// Distribute `tasks` over the groups and run each once. Assignment is
    /// longest-processing-time first: tasks sorted by decreasing estimated
    /// runtime, each to the group with the smallest load so far. Tasks are
    /// sent as soon as their group is idle.
    pub fn run_first(&mut self, tasks: Vec<TaskDescriptor>) -> Result<(), CombiError> {
        if self.params.is_some() {
            self.ensure_params_sent()?;
        }
        let mut order: Vec<(f64, TaskDescriptor)> =
            tasks.into_iter().map(|t| (t.estimate_runtime(), t)).collect();
        order.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut queues: Vec<Vec<TaskDescriptor>> = vec![Vec::new(); self.groups.len()];
        for (estimate, task) in order {
            let g = self.least_loaded();
            self.groups[g].assign(task.id(), estimate);
            queues[g].push(task);
        }
        for q in &mut queues {
            q.reverse();
        }
        log::info!(
            "run_first: {} tasks on {} groups",
            queues.iter().map(Vec::len).sum::<usize>(),
            self.groups.len()
        );

        while queues.iter().any(|q| !q.is_empty()) {
            let mut sent = false;
            for (g, q) in self.groups.iter_mut().zip(&mut queues) {
                if q.is_empty() || !g.is_ready()? {
                    continue;
                }
                if let Some(task) = q.pop() {
                    g.send_signal(Signal::RunFirst, &task.to_bytes()?)?;
                    self.tasks.push(task);
                    sent = true;
                }
            }
            if !sent {
                std::thread::sleep(self.poll_interval);
            }
        }
        self.wait_all()
    }

    /// Run every scheduled task once more.
    pub fn run_next(&mut self) -> Result<(), CombiError> {
        log::info!("run_next");
        self.wait_all()?;
        self.broadcast_signal(Signal::RunNext, &[])?;
        self.wait_all()
    }

    /// Register a task on the least loaded group without running it.
    pub fn add_task(&mut self, task: TaskDescriptor) -> Result<usize, CombiError> {
        self.wait_all()?;
        let g = self.least_loaded();
        self.groups[g].send_signal(Signal::AddTask, &task.to_bytes()?)?;
        self.groups[g].assign(task.id(), task.estimate_runtime());
        self.tasks.push(task);
        self.groups[g].wait_status()?;
        Ok(g)
    }

    /// Rebuild a task from the last combined solution on the least loaded
    /// group. Any earlier copy of the task is forgotten.
    pub fn recompute(&mut self, task: TaskDescriptor) -> Result<usize, CombiError> {
        if !self.combined {
            return Err(CombiError::NoCombinationTarget);
        }
        self.wait_all()?;
        for g in &mut self.groups {
            g.unassign(task.id());
        }
        self.tasks.retain(|t| t.id() != task.id());
        let g = self.least_loaded();
        self.groups[g].send_signal(Signal::Recompute, &task.to_bytes()?)?;
        self.groups[g].assign(task.id(), task.estimate_runtime());
        self.tasks.push(task);
        self.groups[g].wait_status()?;
        Ok(g)
    }

    fn check_combinable(&mut self) -> Result<(), CombiError> {
        if self.tasks.is_empty() {
            return Err(CombiError::NoTasks);
        }
        self.wait_all()?;
        self.ensure_params_sent()
    }

    /// One combination phase on all groups.
    pub fn combine(&mut self) -> Result<(), CombiError> {
        self.check_combinable()?;
        log::info!("combine: {} tasks", self.tasks.len());
        self.broadcast_signal(Signal::Combine, &[])?;
        self.wait_all()?;
        self.combined = true;
        Ok(())
    }

    fn sum_grids(&mut self) -> Result<FullGrid<f64>, CombiError> {
        let mut total: Option<FullGrid<f64>> = None;
        for bytes in self.collect_results()? {
            let fg = FullGrid::<f64>::from_bytes(&bytes)?;
            match total.as_mut() {
                Some(t) => t.add_scaled(&fg, 1.0)?,
                None => total = Some(fg),
            }
        }
        total.ok_or(CombiError::NoTasks)
    }

    /// Combine, then interpolate the combined solution onto a full grid of
    /// `level`.
    pub fn combine_fg(&mut self, level: &LevelVector) -> Result<FullGrid<f64>, CombiError> {
        self.check_combinable()?;
        log::info!("combine_fg onto level {level}");
        self.broadcast_signal(Signal::CombineFg, &bincode::serialize(level)?)?;
        let out = self.sum_grids()?;
        self.combined = true;
        Ok(out)
    }

    /// Coefficient-weighted interpolation of all tasks onto a full grid of
    /// `level`.
    pub fn grid_eval(&mut self, level: &LevelVector) -> Result<FullGrid<f64>, CombiError> {
        self.wait_all()?;
        self.ensure_params_sent()?;
        self.broadcast_signal(Signal::GridEval, &bincode::serialize(level)?)?;
        self.sum_grids()
    }

    /// The grid of the task with level vector `level`, if any group has it.
    pub fn grid_gather(&mut self, level: &LevelVector) -> Result<Option<FullGrid<f64>>, CombiError> {
        self.wait_all()?;
        self.broadcast_signal(Signal::GridGather, &bincode::serialize(level)?)?;
        let mut found = None;
        for bytes in self.collect_results()? {
            let fg: Option<FullGrid<f64>> = bincode::deserialize(&bytes)?;
            if found.is_none() {
                found = fg;
            }
        }
        Ok(found)
    }

    /// Coefficient-weighted sum of the task interpolants at `points`.
    pub fn eval(&mut self, points: &[Vec<f64>]) -> Result<Vec<f64>, CombiError> {
        self.wait_all()?;
        self.ensure_params_sent()?;
        self.broadcast_signal(Signal::Eval, &bincode::serialize(points)?)?;
        let mut total = vec![0.0; points.len()];
        for bytes in self.collect_results()? {
            let part: Vec<f64> = bincode::deserialize(&bytes)?;
            for (t, p) in total.iter_mut().zip(part) {
                *t += p;
            }
        }
        Ok(total)
    }

    /// Current state of every task, as reported by the groups.
    pub fn sync_tasks(&mut self) -> Result<Vec<TaskDescriptor>, CombiError> {
        self.wait_all()?;
        self.broadcast_signal(Signal::SyncTasks, &[])?;
        let mut states = Vec::new();
        for bytes in self.collect_results()? {
            let part: Vec<TaskDescriptor> = bincode::deserialize(&bytes)?;
            states.extend(part);
        }
        for state in &states {
            if let Some(t) = self.tasks.iter_mut().find(|t| t.id() == state.id()) {
                *t = state.clone();
            }
        }
        Ok(states)
    }

    /// Tell every group to leave its worker loop.
    pub fn exit(&mut self) -> Result<(), CombiError> {
        match self.wait_all() {
            // the failure belongs to an earlier call
            Ok(()) | Err(CombiError::GroupFailed { .. }) => {}
            Err(e) => return Err(e),
        }
        log::info!("exit");
        self.broadcast_signal(Signal::Exit, &[])
    }
}

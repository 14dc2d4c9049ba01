//! Component-grid tasks.
//!
//! A task owns one decomposed component grid and knows how to advance it.
//! Tasks travel between manager and workers as a [`TaskDescriptor`]: the
//! common [`TaskBase`] plus a [`TaskSpec`] naming the concrete variant, so
//! the receiver can rebuild the task without any registry lookup.

use crate::combi_error::CombiError;
use crate::fullgrid::decomposition::Decomposition;
use crate::fullgrid::distributed::DistributedFullGrid;
use crate::fullgrid::hierarchical::num_points;
use crate::levels::{validate_levels, LevelVector};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique task id.
pub fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// State shared by every task variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskBase {
    pub id: TaskId,
    pub level: LevelVector,
    pub coeff: f64,
    pub boundary: Vec<bool>,
    /// Set once `run` has done all local work of the current phase; cleared
    /// by `init`.
    pub finished: bool,
    pub steps: u64,
}

impl TaskBase {
    pub fn new(level: LevelVector, boundary: Vec<bool>, coeff: f64) -> Result<Self, CombiError> {
        validate_levels(&level, level.dim())?;
        if boundary.len() != level.dim() {
            return Err(CombiError::DimensionMismatch {
                expected: level.dim(),
                found: boundary.len(),
            });
        }
        Ok(Self {
            id: next_task_id(),
            level,
            coeff,
            boundary,
            finished: false,
            steps: 0,
        })
    }

    /// Total number of grid points.
    pub fn num_points(&self) -> usize {
        self.level
            .iter()
            .zip(&self.boundary)
            .map(|(l, &b)| num_points(l, b))
            .product()
    }
}

/// Closed-form functions used to seed and drive tasks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TestFunction {
    Constant(f64),
    /// `offset + sum slopes[k] * x[k]`.
    Linear { offset: f64, slopes: Vec<f64> },
    /// `prod x[k] * (1 - x[k])`, zero on the boundary.
    Bubble,
    /// `exp(-|x - center|^2 / width^2)`.
    Gaussian { center: Vec<f64>, width: f64 },
    /// `prod sin(pi * x[k])`.
    SinProduct,
}

impl TestFunction {
    pub fn eval(&self, x: &[f64]) -> f64 {
        match self {
            TestFunction::Constant(c) => *c,
            TestFunction::Linear { offset, slopes } => {
                offset + x.iter().zip(slopes).map(|(a, b)| a * b).sum::<f64>()
            }
            TestFunction::Bubble => x.iter().map(|&a| a * (1.0 - a)).product(),
            TestFunction::Gaussian { center, width } => {
                let r2: f64 = x.iter().zip(center).map(|(a, c)| (a - c) * (a - c)).sum();
                (-r2 / (width * width)).exp()
            }
            TestFunction::SinProduct => x.iter().map(|&a| (std::f64::consts::PI * a).sin()).product(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionTaskSpec {
    pub function: TestFunction,
}

/// `u(t + dt) = exp(-rate * dt) * u(t)`, starting from `initial`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecayTaskSpec {
    pub initial: TestFunction,
    pub rate: f64,
    pub dt: f64,
}

/// Concrete task variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TaskSpec {
    /// Samples a fixed function on every run.
    Function(FunctionTaskSpec),
    /// Exponential decay time stepping.
    Decay(DecayTaskSpec),
}

/// Serialized form of a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub base: TaskBase,
    pub spec: TaskSpec,
}

impl TaskDescriptor {
    pub fn new(level: LevelVector, boundary: Vec<bool>, coeff: f64, spec: TaskSpec) -> Result<Self, CombiError> {
        Ok(Self {
            base: TaskBase::new(level, boundary, coeff)?,
            spec,
        })
    }

    pub fn id(&self) -> TaskId {
        self.base.id
    }

    pub fn level(&self) -> &LevelVector {
        &self.base.level
    }

    /// Rebuild the task; no grid is allocated until `init`.
    pub fn instantiate(&self) -> Box<dyn Task> {
        match &self.spec {
            TaskSpec::Function(spec) => Box::new(FunctionTask {
                base: self.base.clone(),
                spec: spec.clone(),
                grid: None,
            }),
            TaskSpec::Decay(spec) => Box::new(DecayTask {
                base: self.base.clone(),
                spec: spec.clone(),
                grid: None,
            }),
        }
    }

    pub fn estimate_runtime(&self) -> f64 {
        self.instantiate().estimate_runtime()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CombiError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CombiError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Where a task runs: this process's rank in its group and the process
/// layout of the task grid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskContext {
    pub rank: usize,
    pub group_size: usize,
    pub procs: Vec<usize>,
}

impl TaskContext {
    /// Context for a grid of `level`; without an explicit layout the group
    /// is factorised with [`Decomposition::balanced_procs`].
    pub fn for_level(
        rank: usize,
        group_size: usize,
        procs: Option<&[usize]>,
        level: &LevelVector,
        boundary: &[bool],
    ) -> Result<Self, CombiError> {
        let procs = match procs {
            Some(p) => {
                let n: usize = p.iter().product();
                if n != group_size {
                    return Err(CombiError::ProcessCountMismatch {
                        expected: group_size,
                        found: n,
                    });
                }
                p.to_vec()
            }
            None => {
                let sizes: Vec<usize> = level
                    .iter()
                    .zip(boundary)
                    .map(|(l, &b)| num_points(l, b))
                    .collect();
                Decomposition::balanced_procs(group_size, &sizes)?
            }
        };
        Ok(Self {
            rank,
            group_size,
            procs,
        })
    }
}

pub trait Task: Send + Debug {
    fn base(&self) -> &TaskBase;
    fn base_mut(&mut self) -> &mut TaskBase;

    /// Allocate the grid and set the initial state. Collective over the group.
    fn init(&mut self, ctx: &TaskContext) -> Result<(), CombiError>;
    /// Advance the task by one step.
    fn run(&mut self, ctx: &TaskContext) -> Result<(), CombiError>;

    fn grid(&self) -> Option<&DistributedFullGrid<f64>>;
    fn grid_mut(&mut self) -> Option<&mut DistributedFullGrid<f64>>;

    /// Relative cost used by the scheduler.
    fn estimate_runtime(&self) -> f64 {
        self.base().num_points() as f64
    }

    fn spec(&self) -> TaskSpec;

    fn id(&self) -> TaskId {
        self.base().id
    }

    fn level(&self) -> &LevelVector {
        &self.base().level
    }

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor {
            base: self.base().clone(),
            spec: self.spec(),
        }
    }
}

fn new_grid(base: &TaskBase, ctx: &TaskContext) -> Result<DistributedFullGrid<f64>, CombiError> {
    DistributedFullGrid::with_procs(base.level.clone(), base.boundary.clone(), ctx.procs.clone(), ctx.rank)
}

fn grid_or_err(grid: &mut Option<DistributedFullGrid<f64>>, id: TaskId) -> Result<&mut DistributedFullGrid<f64>, CombiError> {
    grid.as_mut().ok_or(CombiError::TaskNotFound(id))
}

#[derive(Debug)]
struct FunctionTask {
    base: TaskBase,
    spec: FunctionTaskSpec,
    grid: Option<DistributedFullGrid<f64>>,
}

impl Task for FunctionTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn init(&mut self, ctx: &TaskContext) -> Result<(), CombiError> {
        self.grid = Some(new_grid(&self.base, ctx)?);
        self.base.finished = false;
        Ok(())
    }

    fn run(&mut self, _ctx: &TaskContext) -> Result<(), CombiError> {
        let f = &self.spec.function;
        grid_or_err(&mut self.grid, self.base.id)?.set_from_fn(|x| f.eval(x));
        self.base.steps += 1;
        self.base.finished = true;
        Ok(())
    }

    fn grid(&self) -> Option<&DistributedFullGrid<f64>> {
        self.grid.as_ref()
    }

    fn grid_mut(&mut self) -> Option<&mut DistributedFullGrid<f64>> {
        self.grid.as_mut()
    }

    fn spec(&self) -> TaskSpec {
        TaskSpec::Function(self.spec.clone())
    }
}

#[derive(Debug)]
struct DecayTask {
    base: TaskBase,
    spec: DecayTaskSpec,
    grid: Option<DistributedFullGrid<f64>>,
}

impl Task for DecayTask {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut TaskBase {
        &mut self.base
    }

    fn init(&mut self, ctx: &TaskContext) -> Result<(), CombiError> {
        let mut grid = new_grid(&self.base, ctx)?;
        let f = &self.spec.initial;
        grid.set_from_fn(|x| f.eval(x));
        self.grid = Some(grid);
        self.base.finished = false;
        Ok(())
    }

    fn run(&mut self, _ctx: &TaskContext) -> Result<(), CombiError> {
        let factor = (-self.spec.rate * self.spec.dt).exp();
        let grid = grid_or_err(&mut self.grid, self.base.id)?;
        if grid.is_hierarchized() {
            return Err(CombiError::HierarchizationState { hierarchized: true });
        }
        grid.data_mut().iter_mut().for_each(|v| *v *= factor);
        self.base.steps += 1;
        self.base.finished = true;
        Ok(())
    }

    fn grid(&self) -> Option<&DistributedFullGrid<f64>> {
        self.grid.as_ref()
    }

    fn grid_mut(&mut self) -> Option<&mut DistributedFullGrid<f64>> {
        self.grid.as_mut()
    }

    fn estimate_runtime(&self) -> f64 {
        // one extra sweep per step
        2.0 * self.base.num_points() as f64
    }

    fn spec(&self) -> TaskSpec {
        TaskSpec::Decay(self.spec.clone())
    }
}

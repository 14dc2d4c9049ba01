//! CombiError: unified error type for combigrid-dist public APIs
//!
//! Every fallible operation in the crate returns `Result<_, CombiError>`.
//! Construction-time contract violations, protocol-sequencing violations and
//! wire/transport failures are all distinct variants so callers can tell a
//! caller bug from a stalled peer. A lookup of a subspace that is not part of
//! a combination target is *not* an error; those lookups return `Option`.

use crate::levels::LevelVector;
use thiserror::Error;

/// Unified error type for combination-technique operations.
#[derive(Debug, Error)]
pub enum CombiError {
    /// Two vectors that must describe the same number of dimensions do not.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    /// Levels are 1-based; zero or negative entries are rejected.
    #[error("invalid level {level} in dimension {dim} (levels must be >= 1)")]
    InvalidLevel { dim: usize, level: i32 },
    /// `lmin` must be elementwise `<= lmax`.
    #[error("lmin {lmin} is not elementwise <= lmax {lmax}")]
    InvalidLevelBounds { lmin: LevelVector, lmax: LevelVector },
    /// The world does not have the process count the topology declares.
    #[error("process count mismatch: expected {expected} processes, found {found}")]
    ProcessCountMismatch { expected: usize, found: usize },
    /// A process grid or a set of 1-D lower bounds is not a valid partition.
    #[error("invalid decomposition: {0}")]
    InvalidDecomposition(String),
    /// A rank outside `0..size` was addressed.
    #[error("rank {rank} out of range for communicator of size {size}")]
    RankOutOfRange { rank: usize, size: usize },
    /// The calling process is not a member of the requested sub-communicator.
    #[error("world rank {rank} is not a member of this communication group")]
    NotAMember { rank: usize },
    /// Invalid system configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A subspace buffer was accessed on a process that does not own it.
    #[error("subspace {subspace} is owned by rank {owner}, accessed on rank {rank}")]
    NotOwner {
        subspace: usize,
        owner: usize,
        rank: usize,
    },
    /// A subspace buffer did not have its fixed length.
    #[error("subspace {subspace} size mismatch: expected {expected}, found {found}")]
    SubspaceSizeMismatch {
        subspace: usize,
        expected: usize,
        found: usize,
    },
    /// A data buffer does not match the grid it is meant for.
    #[error("data size mismatch: expected {expected} values, found {found}")]
    DataSizeMismatch { expected: usize, found: usize },
    /// A grid was handed to an operation in the wrong basis.
    #[error("unexpected grid basis (hierarchized = {hierarchized})")]
    HierarchizationState { hierarchized: bool },

    /// A signal was issued to a group that has not returned to `Wait`.
    #[error("process group {group} is busy")]
    GroupBusy { group: usize },
    /// A combination was requested while no task has been scheduled.
    #[error("no tasks have been scheduled")]
    NoTasks,
    /// A handler needed combination parameters before any were received.
    #[error("combination parameters have not been set")]
    MissingCombiParameters,
    /// RECOMPUTE arrived before any combination produced a target.
    #[error("no combination target available")]
    NoCombinationTarget,
    /// A group reported that its handler for the last signal failed.
    #[error("process group {group} failed to handle the last signal")]
    GroupFailed { group: usize },
    /// No task with this id is known to the addressed party.
    #[error("unknown task id {0}")]
    TaskNotFound(u64),

    /// A signal or status value outside the fixed enumeration.
    #[error("unknown {kind} value {value} on the wire")]
    UnknownWireValue { kind: &'static str, value: u16 },
    /// A wire header carried an unsupported version.
    #[error("wire version mismatch: expected {expected}, got {got}")]
    WireVersion { expected: u16, got: u16 },
    /// A received buffer had the wrong length.
    #[error("buffer size mismatch from rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// Communication with a peer failed.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for CombiError {
    fn from(e: bincode::Error) -> Self {
        CombiError::Serialization(e.to_string())
    }
}

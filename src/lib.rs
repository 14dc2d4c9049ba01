#![cfg_attr(docsrs, feature(doc_cfg))]
//! # combigrid-dist
//!
//! combigrid-dist orchestrates the sparse-grid combination technique on
//! distributed memory. A simulation is split into many anisotropic component
//! grids (tasks); tasks run on independent process groups, each task grid is
//! itself domain-decomposed over its group, and the component solutions are
//! periodically combined through a distributed sparse grid.
//!
//! ## Features
//! - Combination schemes, standard and fault-tolerant ([`combination`])
//! - Domain-decomposed full grids with hierarchical subspace extraction ([`fullgrid`])
//! - Distributed sparse grid with deterministic subspace ownership ([`sparsegrid`])
//! - Communication-aware in-place hierarchization ([`hierarchization`])
//! - Collective combination across groups ([`combicom`])
//! - Manager/worker command protocol with task scheduling ([`manager`])
//! - Pluggable communication backends: serial, in-process threads, MPI
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! combigrid-dist = "0.3"
//! # Optional features:
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! For an in-process run see [`manager::run_local`]; MPI programs build a
//! [`system::CombiSystem`] over `MpiComm` and call [`manager::run_rank`] on
//! every rank.
//!
//! ## Determinism
//!
//! Subspace ownership is a pure function of list position and group size,
//! and every reduction combines contributions in rank order on a fixed root,
//! so repeated runs produce identical bits.

pub mod algs;
pub mod combi_error;
pub mod combicom;
pub mod combination;
pub mod debug_invariants;
pub mod fullgrid;
pub mod hierarchization;
pub mod levels;
pub mod manager;
pub mod sparsegrid;
pub mod system;

pub use combi_error::CombiError;
pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::comm_group::CommGroup;
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{Communicator, LocalComm, NoComm, Wait};
    pub use crate::combi_error::CombiError;
    pub use crate::combination::{CombiParameters, CombinationScheme};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::fullgrid::{Decomposition, DistributedFullGrid, FullGrid, GridElement};
    pub use crate::hierarchization::{dehierarchize, hierarchize};
    pub use crate::levels::{IndexVector, LevelType, LevelVector};
    pub use crate::manager::{
        run_local, run_rank, ProcessManager, SystemConfig, TaskDescriptor, TaskSpec, TestFunction,
    };
    pub use crate::sparsegrid::{DistributedSparseGrid, SubspacePlacement};
    pub use crate::system::CombiSystem;
}

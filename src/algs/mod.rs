//! Communication layer: transports, sub-communicators and wire records.

pub mod comm_group;
pub mod communicator;
pub mod wire;

pub use comm_group::{sum_op, tags, CommGroup};
pub use communicator::{CommTag, Communicator, LocalComm, NoComm, Wait};

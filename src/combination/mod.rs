//! Combination scheme and the parameters shared between manager and workers.

pub mod parameters;
pub mod scheme;

pub use parameters::CombiParameters;
pub use scheme::CombinationScheme;

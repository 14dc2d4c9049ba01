//! Structural invariants of grids, targets and schemes.
//!
//! Every checked type reports the first violation as a [`CombiError`]. The
//! `debug_invariants!` macro turns a violation into a panic in debug builds
//! and with the `strict-invariants` feature; release builds skip the check.

use crate::combi_error::CombiError;

pub trait DebugInvariants {
    /// Panic on the first violation when invariant checking is enabled.
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "invariant violated");
    }
    /// Validate invariants and return the first error encountered.
    fn validate_invariants(&self) -> Result<(), CombiError>;
}

/// A buffer that must hold exactly `expected` values.
pub(crate) fn check_len(expected: usize, found: usize) -> Result<(), CombiError> {
    if expected == found {
        Ok(())
    } else {
        Err(CombiError::DataSizeMismatch { expected, found })
    }
}

#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}

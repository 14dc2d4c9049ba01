//! Scalar type stored in grids and reduced across processes.

use bytemuck::Pod;
use num_traits::Float;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::ops::{AddAssign, MulAssign, SubAssign};

/// Floating-point grid value that can travel over the wire as raw bytes.
pub trait GridElement:
    Float
    + Pod
    + Default
    + Debug
    + Send
    + Sync
    + AddAssign
    + SubAssign
    + MulAssign
    + Serialize
    + DeserializeOwned
    + 'static
{
    fn from_real(x: f64) -> Self;
    fn to_real(self) -> f64;

    /// The hierarchical weight of a parent point.
    #[inline]
    fn half() -> Self {
        Self::from_real(0.5)
    }
}

impl GridElement for f64 {
    #[inline]
    fn from_real(x: f64) -> Self {
        x
    }
    #[inline]
    fn to_real(self) -> f64 {
        self
    }
}

impl GridElement for f32 {
    #[inline]
    fn from_real(x: f64) -> Self {
        x as f32
    }
    #[inline]
    fn to_real(self) -> f64 {
        self as f64
    }
}

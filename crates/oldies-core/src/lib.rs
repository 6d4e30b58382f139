//! # OldiesRules Core
//!
//! Shared types and utilities for legacy simulator revival.
//!
//! ## Supported Legacy Simulators
//!
//! | Simulator | Original Language | Era | Status |
//! |-----------|------------------|-----|--------|
//! | GeNN | C++ / CUDA | 2010-2018 (3.x) | Superseded by 4.x/5.x |
//!
//! ## Design Philosophy
//!
//! 1. Preserve numerical equivalence with originals
//! 2. Modern Rust safety and performance
//! 3. No process-wide state: every preference is an explicit value

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum OldiesError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Numerical error: {0}")]
    NumericalError(String),
}

pub type Result<T> = std::result::Result<T, OldiesError>;

/// Time point (ms)
pub type Time = f64;

// ============================================================================
// NUMERIC PRECISION
// ============================================================================

/// Floating point precision of generated model code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    Float,
    Double,
    /// Not supported by CUDA, host backends only
    LongDouble,
}

impl Precision {
    /// C type name used for `scalar`
    pub fn c_type(&self) -> &'static str {
        match self {
            Precision::Float => "float",
            Precision::Double => "double",
            Precision::LongDouble => "long double",
        }
    }

    /// Literal representation of `value` in this precision.
    ///
    /// Mirrors C++ `std::to_string` (six decimals) with an `f` suffix for
    /// single precision. Long double has no literal form and yields an
    /// empty string.
    pub fn scalar_expr(&self, value: f64) -> String {
        match self {
            Precision::Float => format!("{:.6}f", value as f32),
            Precision::Double => format!("{:.6}", value),
            Precision::LongDouble => String::new(),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.c_type())
    }
}

impl FromStr for Precision {
    type Err = OldiesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "float" => Ok(Precision::Float),
            "double" => Ok(Precision::Double),
            "long double" => Ok(Precision::LongDouble),
            other => Err(OldiesError::ParseError(format!(
                "Unrecognised floating-point type: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// DISTRIBUTED PLACEMENT
// ============================================================================

/// Host and device a group of units is simulated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClusterPlacement {
    pub host_id: u32,
    pub device_id: u32,
}

impl ClusterPlacement {
    pub fn new(host_id: u32, device_id: u32) -> Self {
        Self { host_id, device_id }
    }

    /// Is this placement simulated by the process running as `local_host_id`?
    pub fn is_local(&self, local_host_id: u32) -> bool {
        self.host_id == local_host_id
    }
}

// ============================================================================
// PADDING
// ============================================================================

/// Round `count` up to the next multiple of `block`.
///
/// Returns an error for a zero block size rather than dividing by zero.
pub fn pad_to_multiple(count: usize, block: usize) -> Result<usize> {
    if block == 0 {
        return Err(OldiesError::NumericalError(
            "block size must be non-zero".into(),
        ));
    }
    Ok(count.div_ceil(block) * block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_expr() {
        assert_eq!(Precision::Float.scalar_expr(0.5), "0.500000f");
        assert_eq!(Precision::Double.scalar_expr(-65.0), "-65.000000");
        assert!(Precision::LongDouble.scalar_expr(1.0).is_empty());
    }

    #[test]
    fn test_precision_roundtrip_names() {
        for p in [Precision::Float, Precision::Double, Precision::LongDouble] {
            assert_eq!(p.c_type().parse::<Precision>().unwrap(), p);
        }
        assert!("half".parse::<Precision>().is_err());
    }

    #[test]
    fn test_placement_locality() {
        let p = ClusterPlacement::new(1, 0);
        assert!(p.is_local(1));
        assert!(!p.is_local(0));
        assert!(ClusterPlacement::default().is_local(0));
    }

    #[test]
    fn test_pad_to_multiple() {
        assert_eq!(pad_to_multiple(0, 32).unwrap(), 0);
        assert_eq!(pad_to_multiple(1, 32).unwrap(), 32);
        assert_eq!(pad_to_multiple(32, 32).unwrap(), 32);
        assert_eq!(pad_to_multiple(33, 32).unwrap(), 64);
        assert!(pad_to_multiple(10, 0).is_err());
    }
}

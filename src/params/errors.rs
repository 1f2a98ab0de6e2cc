//! Errors for the parameter-space layer (settings validation and
//! internal/external transforms).
//!
//! This module defines [`ParamError`], used by parameter-settings
//! construction. It implements `Display`/`Error` and is wrapped into the
//! gradient layer's error type at that boundary.
//!
//! ## Conventions
//! - **Indices are 0-based**.
//! - A limited parameter carries finite bounds with `lower < upper`.
//! - Transforms themselves are total once settings have validated: `ext2int`
//!   clamps floating-point dust at the limit boundaries instead of failing.

/// Result alias for parameter-settings and transform paths that may produce
/// [`ParamError`].
pub type ParamResult<T> = Result<T, ParamError>;

/// Unified error type for parameter settings and space transforms.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamError {
    // ---- Settings validation ----
    /// Parameter value is NaN/±inf.
    NonFiniteValue { name: String, value: f64 },

    /// Initial step width must be finite and strictly positive.
    InvalidStep { name: String, step: f64 },

    /// Declared limits are inconsistent (non-finite, or lower ≥ upper).
    InvalidLimits { name: String, lower: f64, upper: f64, reason: &'static str },

    /// Value lies outside the declared limits.
    ValueOutsideLimits { name: String, value: f64, lower: f64, upper: f64 },
}

impl std::error::Error for ParamError {}

impl std::fmt::Display for ParamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamError::NonFiniteValue { name, value } => {
                write!(f, "Parameter '{name}' has non-finite value {value}.")
            }
            ParamError::InvalidStep { name, step } => {
                write!(f, "Parameter '{name}' has invalid step width {step}; must be finite and > 0.")
            }
            ParamError::InvalidLimits { name, lower, upper, reason } => {
                write!(f, "Parameter '{name}' has invalid limits [{lower}, {upper}]: {reason}")
            }
            ParamError::ValueOutsideLimits { name, value, lower, upper } => {
                write!(f, "Parameter '{name}' value {value} lies outside limits [{lower}, {upper}].")
            }
        }
    }
}

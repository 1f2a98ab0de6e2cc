//! Per-parameter settings for gradient computation.
//!
//! This module defines [`ParameterSettings`], a validated container holding
//! the name, current value, initial step width, limits, and constness of one
//! fit parameter. The derivator consumes a vector of these to seed its
//! state and to decide which parameters need the bounded-space transform;
//! the task manager broadcasts changes to worker processes.
//!
//! ## Invariants
//! - `value` and `step` are finite; `step > 0`.
//! - When both limits are present, `lower < upper` and
//!   `lower ≤ value ≤ upper`.
//! - Single-sided limits carry one finite bound; the other is unused.
use crate::params::errors::{ParamError, ParamResult};

/// Validated settings of a single fit parameter.
///
/// Mirrors the schema consumed by the minimizer: name, external value,
/// initial step (the minimizer's "error" width), optional limits, and a
/// fixed flag. Constructed through [`ParameterSettings::new`] or the
/// convenience constructors; fields are public for read access.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSettings {
    /// Display name, used in diagnostics only.
    pub name: String,
    /// Current value, in external coordinates.
    pub value: f64,
    /// Initial step width (werr); seeds the initial gradient.
    pub step: f64,
    /// Parameter is held constant during minimization.
    pub fixed: bool,
    /// A finite lower limit is present.
    pub has_lower_limit: bool,
    /// A finite upper limit is present.
    pub has_upper_limit: bool,
    /// Lower limit; meaningful only when `has_lower_limit`.
    pub lower: f64,
    /// Upper limit; meaningful only when `has_upper_limit`.
    pub upper: f64,
}

impl ParameterSettings {
    /// Construct fully specified settings.
    ///
    /// `lower`/`upper` are read only when the corresponding flag is set;
    /// pass `0.0` for absent bounds.
    ///
    /// # Errors
    /// - [`ParamError::NonFiniteValue`] if `value` is NaN/±inf.
    /// - [`ParamError::InvalidStep`] if `step` is not finite and > 0.
    /// - [`ParamError::InvalidLimits`] if a present bound is non-finite or
    ///   `lower ≥ upper` with both present.
    /// - [`ParamError::ValueOutsideLimits`] if `value` violates a present
    ///   bound.
    pub fn new(
        name: &str, value: f64, step: f64, fixed: bool, has_lower_limit: bool,
        has_upper_limit: bool, lower: f64, upper: f64,
    ) -> ParamResult<Self> {
        if !value.is_finite() {
            return Err(ParamError::NonFiniteValue { name: name.to_string(), value });
        }
        if !step.is_finite() || step <= 0.0 {
            return Err(ParamError::InvalidStep { name: name.to_string(), step });
        }
        if has_lower_limit && !lower.is_finite() {
            return Err(ParamError::InvalidLimits {
                name: name.to_string(),
                lower,
                upper,
                reason: "Lower limit must be finite.",
            });
        }
        if has_upper_limit && !upper.is_finite() {
            return Err(ParamError::InvalidLimits {
                name: name.to_string(),
                lower,
                upper,
                reason: "Upper limit must be finite.",
            });
        }
        if has_lower_limit && has_upper_limit && lower >= upper {
            return Err(ParamError::InvalidLimits {
                name: name.to_string(),
                lower,
                upper,
                reason: "Limits must satisfy lower < upper.",
            });
        }
        if (has_lower_limit && value < lower) || (has_upper_limit && value > upper) {
            return Err(ParamError::ValueOutsideLimits {
                name: name.to_string(),
                value,
                lower,
                upper,
            });
        }
        Ok(ParameterSettings {
            name: name.to_string(),
            value,
            step,
            fixed,
            has_lower_limit,
            has_upper_limit,
            lower,
            upper,
        })
    }

    /// Unbounded, floating parameter.
    pub fn unbounded(name: &str, value: f64, step: f64) -> ParamResult<Self> {
        Self::new(name, value, step, false, false, false, 0.0, 0.0)
    }

    /// Parameter limited on both sides.
    pub fn limited(name: &str, value: f64, step: f64, lower: f64, upper: f64) -> ParamResult<Self> {
        Self::new(name, value, step, false, true, true, lower, upper)
    }

    /// True when at least one limit is present.
    #[inline]
    pub fn has_limits(&self) -> bool {
        self.has_lower_limit || self.has_upper_limit
    }

    /// Clip an external value to the upper limit, when present.
    #[inline]
    pub fn clip_to_upper(&self, ext: f64) -> f64 {
        if self.has_upper_limit && ext > self.upper { self.upper } else { ext }
    }

    /// Clip an external value to the lower limit, when present.
    #[inline]
    pub fn clip_to_lower(&self, ext: f64) -> f64 {
        if self.has_lower_limit && ext < self.lower { self.lower } else { ext }
    }
}

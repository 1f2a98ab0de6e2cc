//! Errors for the gradient kernel (strategy validation and dimension
//! checks).
//!
//! The per-cycle refinement loop itself is error-free by construction: step
//! sizes are clamped away from zero and a failed convergence test simply
//! lets the last cycle's values stand. Everything that can go wrong is
//! rejected at configuration or setup time.

/// Result alias for gradient-kernel operations.
pub type GradResult<T> = Result<T, GradError>;

/// Unified error type for the gradient kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum GradError {
    // ---- Strategy validation ----
    /// Step tolerance must be finite and strictly positive.
    InvalidStepTolerance { tol: f64, reason: &'static str },

    /// Gradient tolerance must be finite and strictly positive.
    InvalidGradTolerance { tol: f64, reason: &'static str },

    /// At least one refinement cycle is required.
    InvalidNCycles { ncycles: usize },

    /// Error level (Up) must be finite and strictly positive.
    InvalidErrorLevel { up: f64 },

    // ---- Setup / dispatch ----
    /// Point length does not match the synchronized parameter count.
    DimensionMismatch { expected: usize, actual: usize },

    /// Component index beyond the parameter count.
    ComponentOutOfRange { index: usize, dim: usize },

    /// A component path was invoked before `setup` cached the function
    /// value at the current point.
    SetupMissing,

    // ---- Task-manager boundary ----
    /// A multiprocess operation failed while driving the distributed
    /// gradient; `text` carries the formatted manager error.
    TaskManager { text: String },
}

impl std::error::Error for GradError {}

impl std::fmt::Display for GradError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GradError::InvalidStepTolerance { tol, reason } => {
                write!(f, "Invalid step tolerance {tol}: {reason}")
            }
            GradError::InvalidGradTolerance { tol, reason } => {
                write!(f, "Invalid gradient tolerance {tol}: {reason}")
            }
            GradError::InvalidNCycles { ncycles } => {
                write!(f, "Invalid cycle count {ncycles}; at least one cycle is required.")
            }
            GradError::InvalidErrorLevel { up } => {
                write!(f, "Invalid error level {up}; must be finite and > 0.")
            }
            GradError::DimensionMismatch { expected, actual } => {
                write!(f, "Point has {actual} coordinates, expected {expected}.")
            }
            GradError::ComponentOutOfRange { index, dim } => {
                write!(f, "Component {index} out of range for {dim} parameters.")
            }
            GradError::SetupMissing => {
                write!(f, "differentiate_component called before setup cached f(x).")
            }
            GradError::TaskManager { text } => {
                write!(f, "Task manager failure during gradient computation: {text}")
            }
        }
    }
}

impl From<crate::multiprocess::MpError> for GradError {
    fn from(err: crate::multiprocess::MpError) -> Self {
        GradError::TaskManager { text: err.to_string() }
    }
}

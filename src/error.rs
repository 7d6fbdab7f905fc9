use std::path::PathBuf;
use thiserror::Error;

/// Precondition and numerical failures of the metric engine and loss accounting.
///
/// These are fatal: callers propagate them, they are never downgraded to warnings.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("shape mismatch in {what}: {left:?} vs {right:?}")]
    ShapeMismatch {
        what: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("length mismatch in {what}: {left} vs {right}")]
    LengthMismatch {
        what: &'static str,
        left: usize,
        right: usize,
    },

    #[error("file not match at index {index}: {left} vs {right}")]
    FileMismatch {
        index: usize,
        left: String,
        right: String,
    },

    #[error("imaginary component {0} in the matrix square root")]
    ImaginaryComponent(f64),

    #[error("the matrix square root is not finite")]
    NonFinite,

    #[error("invalid path: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("not enough samples: {found} found, at least {required} required")]
    NotEnoughSamples { found: usize, required: usize },

    #[error("no loss record was added since the last reset")]
    EmptyWindow,

    #[error("loss record keys {found:?} differ from the window keys {expected:?}")]
    KeyMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
}

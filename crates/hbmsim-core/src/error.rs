use std::fmt;

use crate::allocator::TensorId;
use crate::residency::Residency;

/// Errors raised by the allocator, the simulator and the attention driver.
///
/// Every variant is fatal for the batch it occurs in. Errors raised while a
/// queued batch executes are wrapped in [`SimError::Execution`] so callers
/// can see which operation failed.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("{op}: shape mismatch, {left_rows}x{left_cols} vs {right_rows}x{right_cols}")]
    ShapeMismatch {
        op: &'static str,
        left_rows: usize,
        left_cols: usize,
        right_rows: usize,
        right_cols: usize,
    },

    #[error("'{name}' is resident in {found}, expected {expected}")]
    ResidencyViolation {
        name: String,
        expected: Residency,
        found: Residency,
    },

    #[error("handle {handle} used after release")]
    UseAfterRelease { handle: TensorId },

    #[error("handle {handle} released twice")]
    DoubleRelease { handle: TensorId },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("{tier} budget exhausted: {requested} bytes requested, budget is {budget} bytes")]
    ResourceExhausted {
        tier: Residency,
        requested: usize,
        budget: usize,
    },

    #[error("{} live allocation(s) leaked: {}", names.len(), names.join(", "))]
    LeakDetected { names: Vec<String> },

    #[error("allocator slot table full ({limit} slots)")]
    SlotsExhausted { limit: usize },

    #[error("query source exhausted at round {round}")]
    SourceExhausted { round: usize },

    #[error("operation #{index} ({op}) failed: {source}")]
    Execution {
        index: usize,
        op: &'static str,
        #[source]
        source: Box<SimError>,
    },
}

/// Flat classification of [`SimError`], looking through execution wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ShapeMismatch,
    ResidencyViolation,
    UseAfterRelease,
    DoubleRelease,
    IndexOutOfRange,
    ResourceExhausted,
    LeakDetected,
    SlotsExhausted,
    SourceExhausted,
}

impl SimError {
    /// Shape mismatch between two operands of `op`.
    pub fn shape_mismatch(op: &'static str, left: (usize, usize), right: (usize, usize)) -> Self {
        SimError::ShapeMismatch {
            op,
            left_rows: left.0,
            left_cols: left.1,
            right_rows: right.0,
            right_cols: right.1,
        }
    }

    /// The underlying error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SimError::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            SimError::ResidencyViolation { .. } => ErrorKind::ResidencyViolation,
            SimError::UseAfterRelease { .. } => ErrorKind::UseAfterRelease,
            SimError::DoubleRelease { .. } => ErrorKind::DoubleRelease,
            SimError::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
            SimError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            SimError::LeakDetected { .. } => ErrorKind::LeakDetected,
            SimError::SlotsExhausted { .. } => ErrorKind::SlotsExhausted,
            SimError::SourceExhausted { .. } => ErrorKind::SourceExhausted,
            SimError::Execution { source, .. } => source.kind(),
        }
    }

    /// Queue position of the operation that failed, if this error came from a batch run.
    pub fn op_index(&self) -> Option<usize> {
        match self {
            SimError::Execution { index, .. } => Some(*index),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ShapeMismatch => "ShapeMismatch",
            ErrorKind::ResidencyViolation => "ResidencyViolation",
            ErrorKind::UseAfterRelease => "UseAfterRelease",
            ErrorKind::DoubleRelease => "DoubleRelease",
            ErrorKind::IndexOutOfRange => "IndexOutOfRange",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::LeakDetected => "LeakDetected",
            ErrorKind::SlotsExhausted => "SlotsExhausted",
            ErrorKind::SourceExhausted => "SourceExhausted",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_execution() {
        let inner = SimError::IndexOutOfRange { index: 3, len: 2 };
        let err = SimError::Execution {
            index: 7,
            op: "get_row",
            source: Box::new(inner),
        };
        assert_eq!(err.kind(), ErrorKind::IndexOutOfRange);
        assert_eq!(err.op_index(), Some(7));
        assert!(err.to_string().contains("#7"));
    }

    #[test]
    fn test_leak_message_lists_names() {
        let err = SimError::LeakDetected {
            names: vec!["q_row".into(), "row_exp".into()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 live"));
        assert!(msg.contains("q_row, row_exp"));
        assert_eq!(err.op_index(), None);
    }

    #[test]
    fn test_shape_mismatch_ctor() {
        let err = SimError::shape_mismatch("matmul", (1, 3), (2, 4));
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        assert_eq!(err.to_string(), "matmul: shape mismatch, 1x3 vs 2x4");
    }
}

// THEORY:
// Every failure the engine can report lives in one enum. Most of what a camera
// sees is "nothing useful yet" (no quad, no lock, low confidence), and that is
// never an error: those outcomes are empty vectors and `None`s. What remains
// here are the cases a caller must tell apart from "still searching":
//
// 1.  The image-processing surface is not ready (or failed to load). The UI
//     shows a loading state and retries.
// 2.  A calibration candidate was rejected. The previous calibration stays.
// 3.  A homography or warp failed numerically. The frame has no rectified
//     output and the next frame tries again.
// 4.  The caller handed over a malformed frame or configuration.
// 5.  A frame was submitted to a capture session whose worker has stopped.

use thiserror::Error;

/// Why a calibration candidate was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalibrationRejection {
    #[error("missing corner markers {missing:?}")]
    MissingMarkers { missing: Vec<u32> },

    #[error("quadrilateral is degenerate (zero area or non-convex)")]
    DegenerateQuad,

    #[error("marker layout does not match the configured mounting mode")]
    LayoutMismatch,

    #[error("invalid calibration grid: {0}")]
    InvalidGrid(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("image-processing backend is not ready yet")]
    NotReady,

    #[error("image-processing backend is unavailable: {0}")]
    Unavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("calibration rejected: {0}")]
    InvalidCalibration(#[from] CalibrationRejection),

    #[error("perspective transform failed: {0}")]
    TransformFailed(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("capture session has stopped")]
    SessionClosed,
}

impl EngineError {
    /// Retryable errors leave the session usable; the next frame (or a fresh
    /// engine context) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::NotReady | EngineError::Unavailable(_) | EngineError::TransformFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::NotReady.is_retryable());
        assert!(EngineError::TransformFailed("collinear".into()).is_retryable());
        assert!(!EngineError::InvalidConfig("bad".into()).is_retryable());
        assert!(!EngineError::from(CalibrationRejection::DegenerateQuad).is_retryable());
    }

    #[test]
    fn rejection_message_lists_missing_ids() {
        let err = EngineError::from(CalibrationRejection::MissingMarkers { missing: vec![2] });
        assert_eq!(err.to_string(), "calibration rejected: missing corner markers [2]");
    }
}

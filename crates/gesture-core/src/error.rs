use thiserror::Error;

/// Reasons a hand observation cannot be evaluated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObservationError {
    #[error("expected {expected} landmarks, got {actual}")]
    WrongLandmarkCount { expected: usize, actual: usize },
    #[error("landmark {index} has a non-finite coordinate")]
    NonFinite { index: usize },
}

//! Geometry and timing rules for detecting a held thumbs-up posture.
//!
//! The crate is pure: no threads, no I/O, no clocks. Callers feed per-frame
//! hand observations and timestamps in and receive verdicts and hold events out.
//! - `landmarks`: normalized hand keypoints and their anatomical indices.
//! - `classifier`: the thumbs-up geometric rule.
//! - `hold`: debounced hold/progress state machine.
//! - `payload`: outbound message shapes and publish deduplication.

pub mod classifier;
pub mod error;
pub mod hold;
pub mod landmarks;
pub mod payload;

pub use classifier::ThumbsUpRule;
pub use error::ObservationError;
pub use hold::{DetectionSample, HoldConfig, HoldEvent, HoldPhase, HoldState, HoldTracker};
pub use landmarks::{HandObservation, LANDMARK_COUNT, Point2D, parse_hands};
pub use payload::{PublishDedup, SessionStatus, SessionStatusPayload, StatePayload};

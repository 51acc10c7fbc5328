//! Outbound message shapes and the "last published" dedup cache.

use serde::Serialize;

use crate::hold::HoldEvent;

pub const THUMB_CAMERA_LABEL: &str = "rpi_camera";
pub const SESSION_CAMERA_LABEL: &str = "active";

/// Thumb state published on every hold transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatePayload {
    #[serde(rename = "thumb")]
    pub detected: bool,
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
    pub camera: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_complete: Option<bool>,
}

impl StatePayload {
    pub fn new(detected: bool, timestamp: f64) -> Self {
        Self {
            detected,
            timestamp,
            camera: THUMB_CAMERA_LABEL,
            progress: None,
            hold_complete: None,
        }
    }

    /// Clamp to `[0, 1]` and round to four decimals.
    pub fn with_progress(mut self, progress: f64) -> Self {
        let clamped = progress.clamp(0.0, 1.0);
        self.progress = Some((clamped * 10_000.0).round() / 10_000.0);
        self
    }

    pub fn with_hold_complete(mut self, complete: bool) -> Self {
        self.hold_complete = Some(complete);
        self
    }

    pub fn from_event(event: HoldEvent, timestamp: f64) -> Self {
        match event {
            HoldEvent::Started => Self::new(true, timestamp)
                .with_progress(0.0)
                .with_hold_complete(false),
            HoldEvent::Progress { progress, .. } => Self::new(true, timestamp)
                .with_progress(progress)
                .with_hold_complete(false),
            HoldEvent::Completed => Self::new(true, timestamp)
                .with_progress(1.0)
                .with_hold_complete(true),
            HoldEvent::Released => Self::new(false, timestamp)
                .with_progress(0.0)
                .with_hold_complete(false),
        }
    }

    fn content_key(&self) -> ContentKey {
        ContentKey {
            detected: self.detected,
            progress_e4: self.progress.map(|p| (p * 10_000.0).round() as i64),
            hold_complete: self.hold_complete,
        }
    }
}

/// Payload identity ignoring the timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentKey {
    detected: bool,
    progress_e4: Option<i64>,
    hold_complete: Option<bool>,
}

/// Suppresses back-to-back publishes of identical thumb state.
#[derive(Debug, Default)]
pub struct PublishDedup {
    last: Option<ContentKey>,
}

impl PublishDedup {
    /// Returns `true` if `payload` differs from the previous one and records it.
    pub fn admit(&mut self, payload: &StatePayload) -> bool {
        let key = payload.content_key();
        if self.last == Some(key) {
            return false;
        }
        self.last = Some(key);
        true
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    CameraReady,
    ThumbDetected,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::CameraReady => "camera_ready",
            SessionStatus::ThumbDetected => "thumb_detected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatusPayload {
    pub status: SessionStatus,
    pub camera: &'static str,
    pub timestamp: f64,
}

impl SessionStatusPayload {
    pub fn new(status: SessionStatus, timestamp: f64) -> Self {
        Self {
            status,
            camera: SESSION_CAMERA_LABEL,
            timestamp,
        }
    }
}

//! Frame acquisition for the thumb-hold pipeline.
//!
//! Capture devices are exposed through the pull-style [`FrameSource`] trait so
//! the orchestrator owns read pacing, failure counting, and reacquisition.
//! [`FfmpegCapture`] drives an `ffmpeg` child process that decodes the camera
//! into raw RGB24 frames on a background thread.

mod ffmpeg;
mod source;
mod types;

pub use ffmpeg::{CaptureSettings, FfmpegCapture, FfmpegOpener, parse_device_index};
pub use source::{CaptureOpener, FrameSource};
pub use types::{CaptureError, Frame, FrameFormat};

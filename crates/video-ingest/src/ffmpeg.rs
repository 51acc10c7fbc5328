//! FFmpeg-backed capture: decode any FFmpeg input (V4L2 devices included) into
//! raw RGB24 frames read from the child's stdout.

use std::{
    io::{ErrorKind, Read},
    process::{Child, ChildStdout, Command, Stdio},
    thread,
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::{debug, warn};

use crate::{
    source::{CaptureOpener, FrameSource},
    types::{CaptureError, Frame, FrameFormat},
};

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Device index, `/dev/videoN` path, or any URI FFmpeg accepts.
    pub uri: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Longest wait for one frame before a read is reported as failed.
    pub read_timeout: Duration,
    /// Longest wait for the first frame when opening the device.
    pub open_timeout: Duration,
}

impl CaptureSettings {
    pub fn for_device(index: u32, width: u32, height: u32, fps: u32) -> Self {
        Self {
            uri: index.to_string(),
            width,
            height,
            fps,
            read_timeout: Duration::from_secs(1),
            open_timeout: Duration::from_secs(5),
        }
    }
}

/// Parse a `/dev/videoX` style URI or bare index and return the index if present.
pub fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    let stripped = uri.strip_prefix("/dev/video")?;
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return stripped.parse().ok();
    }
    None
}

fn build_command(settings: &CaptureSettings, format: FrameFormat) -> Command {
    let (is_v4l, input) = match parse_device_index(&settings.uri) {
        Some(index) => (true, format!("/dev/video{index}")),
        None => (false, settings.uri.clone()),
    };

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-fflags")
        .arg("nobuffer");

    if is_v4l {
        cmd.arg("-f")
            .arg("video4linux2")
            .arg("-input_format")
            .arg("mjpeg")
            .arg("-video_size")
            .arg(format!("{}x{}", settings.width, settings.height))
            .arg("-framerate")
            .arg(settings.fps.to_string());
    }

    cmd.arg("-i")
        .arg(&input)
        .arg("-vf")
        .arg(format!("scale={}:{}", settings.width, settings.height))
        .arg("-pix_fmt")
        .arg(format.ffmpeg_pix_fmt())
        .arg("-f")
        .arg("rawvideo")
        .arg("-");

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    cmd
}

/// Capture device backed by an `ffmpeg` child process.
///
/// A reader thread keeps at most one decoded frame buffered, replacing it when
/// the consumer falls behind, so reads always return the freshest frame.
pub struct FfmpegCapture {
    uri: String,
    child: Option<Child>,
    frames: Receiver<Result<Frame, CaptureError>>,
    reader: Option<thread::JoinHandle<()>>,
    pending: Option<Frame>,
    read_timeout: Duration,
}

impl FfmpegCapture {
    /// Spawn FFmpeg and wait for the first frame. A device that never produces
    /// a frame is reported as an open failure.
    pub fn open(settings: &CaptureSettings) -> Result<Self, CaptureError> {
        let format = FrameFormat::Rgb8;
        let mut child = build_command(settings, format)
            .spawn()
            .map_err(|err| CaptureError::Open {
                uri: settings.uri.clone(),
                reason: err.to_string(),
            })?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Open {
                    uri: settings.uri.clone(),
                    reason: "ffmpeg stdout not captured".into(),
                });
            }
        };

        let (tx, rx) = bounded(1);
        let drain = rx.clone();
        let size = (settings.width, settings.height);
        let reader = thread::Builder::new()
            .name("video-ingest-ffmpeg".into())
            .spawn(move || reader_loop::<ChildStdout>(stdout, size, format, tx, drain));
        let reader = match reader {
            Ok(handle) => handle,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CaptureError::Io(err));
            }
        };

        let mut capture = Self {
            uri: settings.uri.clone(),
            child: Some(child),
            frames: rx,
            reader: Some(reader),
            pending: None,
            read_timeout: settings.read_timeout,
        };

        match capture.frames.recv_timeout(settings.open_timeout) {
            Ok(Ok(frame)) => {
                debug!(uri = %capture.uri, "Capture produced first frame");
                capture.pending = Some(frame);
                Ok(capture)
            }
            Ok(Err(err)) => {
                capture.release();
                Err(CaptureError::Open {
                    uri: settings.uri.clone(),
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                capture.release();
                Err(CaptureError::Open {
                    uri: settings.uri.clone(),
                    reason: format!("no frame within {:?}", settings.open_timeout),
                })
            }
        }
    }
}

impl FrameSource for FfmpegCapture {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        if self.child.is_none() {
            return Err(CaptureError::Closed);
        }
        match self.frames.recv_timeout(self.read_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::Timeout(self.read_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
        }
    }

    fn release(&mut self) {
        self.pending = None;
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                debug!(uri = %self.uri, "ffmpeg already exited: {err}");
            }
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!(uri = %self.uri, "ffmpeg reader thread panicked");
            }
        }
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Reopens an [`FfmpegCapture`] with fixed settings.
#[derive(Clone, Debug)]
pub struct FfmpegOpener {
    settings: CaptureSettings,
}

impl FfmpegOpener {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }
}

impl CaptureOpener for FfmpegOpener {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, CaptureError> {
        Ok(Box::new(FfmpegCapture::open(&self.settings)?))
    }
}

/// Split the raw stream into frames. When the consumer has not taken the
/// previous frame yet it is discarded in favor of the new one.
fn reader_loop<R: Read>(
    mut stdout: R,
    size: (u32, u32),
    format: FrameFormat,
    tx: Sender<Result<Frame, CaptureError>>,
    drain: Receiver<Result<Frame, CaptureError>>,
) {
    let frame_bytes = Frame::expected_len(size.0, size.1, format);
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        let message = match stdout.read_exact(&mut buffer) {
            Ok(()) => Ok(Frame {
                data: buffer.clone(),
                width: size.0,
                height: size.1,
                timestamp_ms: Utc::now().timestamp_millis(),
                format,
            }),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(CaptureError::Closed),
            Err(err) => Err(CaptureError::Io(err)),
        };
        let last = message.is_err();

        match tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                let _ = drain.try_recv();
                if tx.try_send(message).is_err() {
                    break;
                }
            }
            Err(TrySendError::Disconnected(_)) => break,
        }

        if last {
            break;
        }
    }
}

//! Configuration parsing for the thumb-hold pipeline.
//!
//! CLI flags fall back to the environment variables the deployment already
//! uses, and are validated once into a `ThumbConfig`.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Args, builder::BoolishValueParser};
use gesture_core::HoldConfig;
use video_ingest::CaptureSettings;

/// Broker connection settings.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
}

/// Topics derived from the site and device identifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    pub thumb: String,
    pub session: String,
}

impl Topics {
    pub fn new(site: &str, device_id: &str) -> Self {
        Self {
            thumb: format!("{site}/{device_id}/ui/thumb"),
            session: format!("{site}/{device_id}/ui/session_status"),
        }
    }
}

/// When and how the capture device is reacquired after read failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_failures: u32,
    pub backoff: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_failures: 10,
            backoff: Duration::from_secs(2),
        }
    }
}

/// How each frame is rendered before it reaches viewers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreviewOptions {
    pub jpeg_quality: u8,
    pub mirror: bool,
    pub annotate: bool,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            mirror: true,
            annotate: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ThumbConfig {
    pub capture: CaptureSettings,
    /// `None` disables the MJPEG stream.
    pub stream_port: Option<u16>,
    pub preview: PreviewOptions,
    pub hold: HoldConfig,
    pub recovery: RecoveryPolicy,
    pub mqtt: MqttSettings,
    pub topics: Topics,
    /// Sidecar landmark estimator command line.
    pub estimator: Option<Vec<String>>,
    /// Longest wait for one estimator response before the sidecar is restarted.
    pub estimator_timeout: Duration,
}

/// CLI arguments accepted by the `run` subcommand.
#[derive(Debug, Args)]
pub struct ThumbCliArgs {
    /// Site identifier, first topic segment.
    #[arg(long, env = "SITE", default_value = "gateA")]
    pub site: String,
    /// Device identifier, second topic segment.
    #[arg(long = "device-id", env = "DEVICE_ID", default_value = "esp32-01")]
    pub device_id: String,
    #[arg(long = "mqtt-host", env = "MQTT_HOST", default_value = "127.0.0.1")]
    pub mqtt_host: String,
    #[arg(long = "mqtt-port", env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,
    #[arg(long = "mqtt-user", env = "MQTT_USER", default_value = "server")]
    pub mqtt_user: String,
    #[arg(long = "mqtt-pass", env = "MQTT_PASS", default_value = "12345678", hide_env_values = true)]
    pub mqtt_pass: String,

    /// V4L2 camera index.
    #[arg(long = "cam-index", env = "CAM_INDEX", default_value_t = 0)]
    pub cam_index: u32,
    /// Any FFmpeg input; overrides --cam-index.
    #[arg(long = "source", env = "CAMERA_SOURCE", value_name = "URI")]
    pub source: Option<String>,
    #[arg(long = "width", env = "FRAME_W", default_value_t = 640)]
    pub width: u32,
    #[arg(long = "height", env = "FRAME_H", default_value_t = 480)]
    pub height: u32,
    #[arg(long = "fps", env = "CAMERA_FPS", default_value_t = 30)]
    pub fps: u32,

    #[arg(long = "stream-port", env = "STREAM_PORT", default_value_t = 9101)]
    pub stream_port: u16,
    /// Serve the MJPEG preview (`0`/`false` disables it).
    #[arg(
        long = "stream-enabled",
        env = "STREAM_ENABLED",
        default_value = "true",
        action = clap::ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub stream_enabled: bool,
    #[arg(long = "jpeg-quality", env = "STREAM_JPEG_QUALITY", default_value_t = 80)]
    pub jpeg_quality: u8,
    /// Do not mirror the preview horizontally.
    #[arg(long = "no-mirror", action = clap::ArgAction::SetTrue)]
    pub no_mirror: bool,
    /// Do not draw landmarks and hold status on the preview.
    #[arg(long = "no-annotate", action = clap::ArgAction::SetTrue)]
    pub no_annotate: bool,

    /// Time the thumbs-up must be held, in milliseconds.
    #[arg(long = "hold-ms", env = "THUMB_HOLD_MS", default_value_t = 3_000)]
    pub hold_ms: u64,
    /// Gap tolerated between positive frames, in milliseconds.
    #[arg(long = "release-grace-ms", env = "THUMB_RELEASE_GRACE_MS", default_value_t = 600)]
    pub release_grace_ms: u64,
    /// Width of one progress bucket, in (0, 1].
    #[arg(long = "progress-step", env = "THUMB_PROGRESS_STEP", default_value_t = 0.05)]
    pub progress_step: f64,
    /// Consecutive positive frames before a hold starts.
    #[arg(long = "stable-frames", env = "THUMB_STABLE_FRAMES", default_value_t = 2)]
    pub stable_frames: u32,

    /// Consecutive read failures before the camera is reacquired.
    #[arg(long = "max-failures", env = "MAX_READ_FAILURES", default_value_t = 10)]
    pub max_failures: u32,
    #[arg(long = "reacquire-backoff-ms", env = "REACQUIRE_BACKOFF_MS", default_value_t = 2_000)]
    pub reacquire_backoff_ms: u64,

    /// Landmark estimator command, e.g. "python3 hands_sidecar.py".
    #[arg(long = "estimator", env = "LANDMARK_ESTIMATOR", value_name = "CMD")]
    pub estimator: Option<String>,
    /// Per-frame estimator deadline; a stalled sidecar is killed and respawned.
    #[arg(long = "estimator-timeout-ms", env = "ESTIMATOR_TIMEOUT_MS", default_value_t = 1_000)]
    pub estimator_timeout_ms: u64,
}

impl TryFrom<ThumbCliArgs> for ThumbConfig {
    type Error = anyhow::Error;

    fn try_from(args: ThumbCliArgs) -> Result<Self> {
        if args.width == 0 || args.height == 0 {
            bail!("Frame width and height must be positive integers");
        }
        if args.fps == 0 {
            bail!("--fps must be at least 1");
        }
        if !(1..=100).contains(&args.jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }
        if args.hold_ms == 0 {
            bail!("--hold-ms must be positive");
        }
        if !(args.progress_step > 0.0 && args.progress_step <= 1.0) {
            bail!("--progress-step must be in (0, 1]");
        }
        if args.stable_frames == 0 {
            bail!("--stable-frames must be at least 1");
        }
        if args.max_failures == 0 {
            bail!("--max-failures must be at least 1");
        }
        if args.estimator_timeout_ms == 0 {
            bail!("--estimator-timeout-ms must be positive");
        }

        let mut capture =
            CaptureSettings::for_device(args.cam_index, args.width, args.height, args.fps);
        if let Some(source) = args.source {
            capture.uri = source;
        }

        let estimator = match args.estimator {
            Some(cmd) => {
                let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
                if parts.is_empty() {
                    bail!("--estimator must name a command");
                }
                Some(parts)
            }
            None => None,
        };

        let topics = Topics::new(&args.site, &args.device_id);
        let mqtt = MqttSettings {
            client_id: format!("thumbhold-{}-{}", args.site, args.device_id),
            host: args.mqtt_host,
            port: args.mqtt_port,
            username: args.mqtt_user,
            password: args.mqtt_pass,
        };

        Ok(Self {
            capture,
            stream_port: args.stream_enabled.then_some(args.stream_port),
            preview: PreviewOptions {
                jpeg_quality: args.jpeg_quality,
                mirror: !args.no_mirror,
                annotate: !args.no_annotate,
            },
            hold: HoldConfig {
                hold_duration_ms: args.hold_ms,
                release_grace_ms: args.release_grace_ms,
                progress_step: args.progress_step,
                stable_frames: args.stable_frames,
            },
            recovery: RecoveryPolicy {
                max_failures: args.max_failures,
                backoff: Duration::from_millis(args.reacquire_backoff_ms),
            },
            mqtt,
            topics,
            estimator,
            estimator_timeout: Duration::from_millis(args.estimator_timeout_ms),
        })
    }
}

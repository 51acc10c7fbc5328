//! Orchestrator driving one tick per captured frame.
//!
//! A single thread owns the capture device, the estimator, the hold tracker
//! and the publisher. The only state shared with other threads is the frame
//! cache read by stream viewers and the running flag flipped by Ctrl+C.

use std::{
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use gesture_core::{DetectionSample, HoldEvent, HoldTracker, SessionStatus, ThumbsUpRule};
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, CaptureOpener, FfmpegOpener, Frame, FrameSource};

use crate::thumb::{
    annotation,
    config::{PreviewOptions, RecoveryPolicy, ThumbConfig},
    encoding,
    estimator::{self, LandmarkEstimator},
    frame_cache::FrameCache,
    publisher::{MqttPublisher, StateReporter},
    server::{StreamServer, spawn_stream_server},
    telemetry,
};

const STOP_POLL: Duration = Duration::from_millis(100);

/// Run the thumb-hold pipeline until Ctrl+C or an unrecoverable capture failure.
pub fn run(config: ThumbConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _ = telemetry::init_metrics_recorder();
    let running = Arc::new(AtomicBool::new(true));
    let handler_running = running.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_running.store(false, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let pipeline_span = tracing::info_span!(
        "thumb.pipeline",
        source = %config.capture.uri,
        width = config.capture.width,
        height = config.capture.height,
    );
    let _pipeline_guard = pipeline_span.enter();

    let mut opener = FfmpegOpener::new(config.capture.clone());
    let source = opener
        .open()
        .with_context(|| format!("Failed to open capture source {}", config.capture.uri))?;
    info!(
        "Capture ready: {} at {}x{}",
        config.capture.uri, config.capture.width, config.capture.height
    );

    let estimator =
        estimator::build_estimator(config.estimator.as_deref(), config.estimator_timeout)?;

    let cache = Arc::new(FrameCache::new());
    let server = match config.stream_port {
        Some(port) => match spawn_stream_server(cache.clone(), port) {
            Ok(server) => {
                debug!(port = server.port(), "Preview stream attached");
                Some(server)
            }
            Err(err) => {
                error!("Stream server unavailable, continuing without preview: {err:?}");
                None
            }
        },
        None => {
            info!("MJPEG stream disabled");
            None
        }
    };

    let publisher = match MqttPublisher::connect(&config.mqtt) {
        Ok(publisher) => publisher,
        Err(err) => {
            cache.close();
            if let Some(server) = server {
                server.stop();
            }
            return Err(err.context("Failed to start MQTT publisher"));
        }
    };
    let mut reporter = StateReporter::new(Box::new(publisher), config.topics.clone());
    reporter.send_session_status(SessionStatus::CameraReady);

    let mut orchestrator = Orchestrator {
        source: Some(source),
        opener: Box::new(opener),
        estimator,
        rule: ThumbsUpRule::default(),
        tracker: HoldTracker::new(config.hold.clone()),
        reporter,
        preview: server.is_some().then_some(config.preview),
        cache,
        recovery: config.recovery,
        running,
        failures: 0,
        estimator_failing: false,
        frames: 0,
    };

    let result = orchestrator.run_loop();
    if let Err(err) = &result {
        error!("Pipeline stopped: {err:?}");
    }
    orchestrator.shutdown(server);
    result
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Frame { detected: bool },
    ReadFailed { failures: u32 },
    Reacquired,
    Stopped,
}

pub(crate) struct Orchestrator {
    source: Option<Box<dyn FrameSource>>,
    opener: Box<dyn CaptureOpener>,
    estimator: Box<dyn LandmarkEstimator>,
    rule: ThumbsUpRule,
    tracker: HoldTracker,
    reporter: StateReporter,
    /// `None` skips preview rendering when nobody can watch it.
    preview: Option<PreviewOptions>,
    cache: Arc<FrameCache>,
    recovery: RecoveryPolicy,
    running: Arc<AtomicBool>,
    failures: u32,
    estimator_failing: bool,
    /// Frames read and processed, with or without a preview.
    frames: u64,
}

impl Orchestrator {
    /// Tick until the running flag clears or a tick fails.
    pub(crate) fn run_loop(&mut self) -> Result<()> {
        let mut ticks: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            ticks += 1;
            let _frame_span = tracing::debug_span!("frame", tick = ticks).entered();
            let started = Instant::now();
            if self.tick()? == TickOutcome::Stopped {
                break;
            }
            metrics::histogram!("thumb_tick_seconds").record(started.elapsed().as_secs_f64());
        }
        Ok(())
    }

    pub(crate) fn tick(&mut self) -> Result<TickOutcome> {
        let Some(source) = self.source.as_mut() else {
            bail!("capture device is not open");
        };
        match source.read_frame() {
            Ok(frame) => {
                if self.failures > 0 {
                    info!("Frame reads recovered after {} failures", self.failures);
                }
                self.failures = 0;
                let detected = self.process(&frame);
                Ok(TickOutcome::Frame { detected })
            }
            Err(err) => self.on_read_failure(err),
        }
    }

    fn process(&mut self, frame: &Frame) -> bool {
        self.frames += 1;
        metrics::counter!("thumb_frames_total").increment(1);

        let hands = match self.estimator.estimate(frame) {
            Ok(hands) => {
                if self.estimator_failing {
                    info!("Landmark estimator recovered");
                    self.estimator_failing = false;
                }
                hands
            }
            Err(err) => {
                metrics::counter!("thumb_estimator_errors_total").increment(1);
                if !self.estimator_failing {
                    warn!("Landmark estimation failed: {err:?}");
                    self.estimator_failing = true;
                }
                Vec::new()
            }
        };

        let detected = hands
            .iter()
            .any(|hand| self.rule.classify(hand, frame.height, frame.width));
        if detected {
            metrics::counter!("thumb_detections_total").increment(1);
        }

        if let Some(event) = self
            .tracker
            .step(DetectionSample::new(detected, frame.timestamp_ms))
        {
            self.report(event);
        }

        if let Some(options) = &self.preview {
            let status = annotation::status_label(
                self.tracker.phase(),
                self.tracker.progress_at(frame.timestamp_ms),
            );
            match encoding::render_preview(frame, &hands, status.as_deref(), options) {
                Ok(jpeg) => {
                    self.cache.update(jpeg);
                }
                Err(err) => debug!("Preview encode failed: {err}"),
            }
        }
        detected
    }

    fn on_read_failure(&mut self, err: CaptureError) -> Result<TickOutcome> {
        self.failures = self.failures.saturating_add(1);
        metrics::counter!("thumb_read_failures_total").increment(1);

        warn!(
            "Frame read failed ({}/{}): {err}",
            self.failures, self.recovery.max_failures
        );
        if self.failures == 1 {
            if let Some(event) = self.tracker.reset() {
                self.report(event);
            }
        }

        if self.failures < self.recovery.max_failures {
            return Ok(TickOutcome::ReadFailed {
                failures: self.failures,
            });
        }
        self.reacquire()
    }

    fn reacquire(&mut self) -> Result<TickOutcome> {
        error!(
            "{} consecutive read failures; reacquiring capture device in {:?}",
            self.failures, self.recovery.backoff
        );
        if let Some(mut source) = self.source.take() {
            source.release();
        }
        if !sleep_while_running(&self.running, self.recovery.backoff) {
            return Ok(TickOutcome::Stopped);
        }

        let source = self
            .opener
            .open()
            .context("Failed to reacquire capture device")?;
        self.source = Some(source);
        self.failures = 0;
        metrics::counter!("thumb_reacquisitions_total").increment(1);
        info!("Capture device reacquired");
        Ok(TickOutcome::Reacquired)
    }

    fn report(&mut self, event: HoldEvent) {
        debug!(?event, "Hold event");
        self.reporter.report(event);
    }

    /// Best-effort teardown: reset the hold, release capture, stop serving, flush.
    pub(crate) fn shutdown(mut self, server: Option<StreamServer>) {
        if let Some(event) = self.tracker.reset() {
            self.report(event);
        }
        if let Some(mut source) = self.source.take() {
            source.release();
        }
        self.cache.close();
        if let Some(server) = server {
            server.stop();
        }
        self.reporter.flush();
        info!(
            frames = self.frames,
            previews = self.cache.sequence(),
            "Pipeline shut down"
        );
    }
}

/// Sleep for `duration`, waking early when `running` clears. Returns whether still running.
fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
    false
}

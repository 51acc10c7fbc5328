//! Hand-landmark estimation boundary.
//!
//! Landmarks come from an external process so the pipeline carries no model
//! runtime. Each tick sends one frame and reads back one line of JSON. Pipe
//! I/O runs on a dedicated thread and the tick waits for it with a deadline,
//! so a sidecar that stops answering is killed and respawned instead of
//! freezing the pipeline.

use std::{
    io::{self, BufRead, BufReader, Write},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use gesture_core::{HandObservation, parse_hands};
use tracing::{debug, info, warn};
use video_ingest::Frame;

use crate::thumb::telemetry;

/// Delay before retrying a sidecar that failed to start.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Produces zero or more hands for a frame.
pub(crate) trait LandmarkEstimator: Send {
    fn estimate(&mut self, frame: &Frame) -> Result<Vec<HandObservation>>;
}

/// Estimator used when no sidecar is configured.
pub(crate) struct NoHands;

impl LandmarkEstimator for NoHands {
    fn estimate(&mut self, _frame: &Frame) -> Result<Vec<HandObservation>> {
        Ok(Vec::new())
    }
}

/// One running sidecar plus the thread doing its pipe I/O.
struct SidecarProcess {
    child: Child,
    requests: Sender<Vec<u8>>,
    responses: Receiver<io::Result<String>>,
}

impl SidecarProcess {
    fn spawn(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("estimator command is empty"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn landmark estimator {program:?}"))?;
        let pipes = child.stdin.take().zip(child.stdout.take());
        let Some((stdin, stdout)) = pipes else {
            reap(&mut child);
            bail!("estimator pipes unavailable");
        };

        let (requests, request_rx) = crossbeam_channel::bounded::<Vec<u8>>(1);
        let (response_tx, responses) = crossbeam_channel::bounded(1);
        let spawned = telemetry::spawn_thread("thumb-estimator", move || {
            exchange_loop(stdin, BufReader::new(stdout), request_rx, response_tx)
        });
        if let Err(err) = spawned {
            reap(&mut child);
            return Err(err).context("Failed to spawn estimator I/O thread");
        }

        Ok(Self {
            child,
            requests,
            responses,
        })
    }

    /// Hand one request to the I/O thread and wait up to `timeout` for its line.
    fn exchange(&self, request: Vec<u8>, timeout: Duration) -> Result<String> {
        self.requests
            .try_send(request)
            .map_err(|_| anyhow!("landmark estimator exited"))?;
        match self.responses.recv_timeout(timeout) {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(err)) => Err(err).context("Landmark estimator pipe failed"),
            Err(RecvTimeoutError::Timeout) => {
                bail!("landmark estimator did not answer within {timeout:?}")
            }
            Err(RecvTimeoutError::Disconnected) => bail!("landmark estimator exited"),
        }
    }
}

impl Drop for SidecarProcess {
    // Killing the child unblocks the I/O thread; it is left to exit on its own.
    fn drop(&mut self) {
        reap(&mut self.child);
    }
}

fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!("Estimator already exited: {err}");
    }
    if let Err(err) = child.wait() {
        warn!("Failed to reap landmark estimator: {err}");
    }
}

/// Serve requests until the channel closes or the pipe breaks.
fn exchange_loop(
    mut stdin: ChildStdin,
    mut stdout: BufReader<ChildStdout>,
    requests: Receiver<Vec<u8>>,
    responses: Sender<io::Result<String>>,
) {
    for request in requests.iter() {
        let result = exchange_once(&mut stdin, &mut stdout, &request);
        let broken = result.is_err();
        if responses.send(result).is_err() || broken {
            break;
        }
    }
}

fn exchange_once(
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    request: &[u8],
) -> io::Result<String> {
    stdin.write_all(request)?;
    stdin.flush()?;
    let mut line = String::new();
    if stdout.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "landmark estimator closed its output",
        ));
    }
    Ok(line)
}

/// Child process speaking the framed RGB request / JSON line response protocol.
pub(crate) struct SidecarEstimator {
    command: Vec<String>,
    timeout: Duration,
    process: Option<SidecarProcess>,
    /// Earliest time to retry after a failed respawn.
    retry_at: Option<Instant>,
}

impl SidecarEstimator {
    pub(crate) fn spawn(command: &[String], timeout: Duration) -> Result<Self> {
        let process = SidecarProcess::spawn(command)?;
        info!(
            "Landmark estimator started: {} (timeout {timeout:?})",
            command.join(" ")
        );
        Ok(Self {
            command: command.to_vec(),
            timeout,
            process: Some(process),
            retry_at: None,
        })
    }

    /// Kill the current sidecar and start a fresh one.
    fn restart(&mut self) {
        self.process = None;
        metrics::counter!("thumb_estimator_restarts_total").increment(1);
        match SidecarProcess::spawn(&self.command) {
            Ok(process) => {
                debug!("Landmark estimator respawned");
                self.process = Some(process);
                self.retry_at = None;
            }
            Err(err) => {
                warn!("Failed to respawn landmark estimator: {err:?}");
                self.retry_at = Some(Instant::now() + RESPAWN_BACKOFF);
            }
        }
    }
}

/// 12-byte big-endian header: width, height, payload length.
pub(crate) fn request_header(frame: &Frame) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0..4].copy_from_slice(&frame.width.to_be_bytes());
    header[4..8].copy_from_slice(&frame.height.to_be_bytes());
    header[8..12].copy_from_slice(&(frame.data.len() as u32).to_be_bytes());
    header
}

impl LandmarkEstimator for SidecarEstimator {
    fn estimate(&mut self, frame: &Frame) -> Result<Vec<HandObservation>> {
        if self.process.is_none() {
            if self.retry_at.is_some_and(|at| Instant::now() < at) {
                bail!("landmark estimator is not running");
            }
            self.restart();
        }
        let Some(process) = self.process.as_ref() else {
            bail!("landmark estimator is not running");
        };

        let mut request = Vec::with_capacity(12 + frame.data.len());
        request.extend_from_slice(&request_header(frame));
        request.extend_from_slice(&frame.data);
        let line = match process.exchange(request, self.timeout) {
            Ok(line) => line,
            Err(err) => {
                self.restart();
                return Err(err);
            }
        };

        let hands = parse_hands(line.trim())
            .with_context(|| format!("Malformed estimator response: {:?}", line.trim()))?;
        debug!(hands = hands.len(), "Estimator response");
        Ok(hands)
    }
}

/// Build the configured estimator, falling back to [`NoHands`].
pub(crate) fn build_estimator(
    command: Option<&[String]>,
    timeout: Duration,
) -> Result<Box<dyn LandmarkEstimator>> {
    match command {
        Some(command) => Ok(Box::new(SidecarEstimator::spawn(command, timeout)?)),
        None => {
            warn!("No landmark estimator configured; serving preview only");
            Ok(Box::new(NoHands))
        }
    }
}

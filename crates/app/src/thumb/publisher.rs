//! MQTT state publishing with content deduplication.
//!
//! The pipeline talks to a [`StatePublisher`]; [`StateReporter`] turns hold
//! events into wire payloads, drops consecutive duplicates and swallows
//! publisher failures so the tick never stalls on the broker.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use gesture_core::{
    HoldEvent, PublishDedup, SessionStatus, SessionStatusPayload, StatePayload,
};
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::thumb::{
    config::{MqttSettings, Topics},
    telemetry,
};

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const REQUEST_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub(crate) enum PublishError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publisher already closed")]
    Closed,
}

/// Fire-and-forget sink for outbound messages.
pub(crate) trait StatePublisher: Send {
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    /// Push out anything still pending and close the connection.
    fn flush(&mut self) -> Result<(), PublishError>;
}

/// `rumqttc` client whose event loop is drained on a background thread.
pub(crate) struct MqttPublisher {
    client: Client,
    stopping: Arc<AtomicBool>,
    event_loop: Option<thread::JoinHandle<()>>,
}

impl MqttPublisher {
    pub(crate) fn connect(settings: &MqttSettings) -> anyhow::Result<Self> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_credentials(&settings.username, &settings.password);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let stopping = Arc::new(AtomicBool::new(false));
        let loop_stopping = stopping.clone();
        let host = format!("{}:{}", settings.host, settings.port);
        let event_loop = telemetry::spawn_thread("thumb-mqtt", move || {
            drain_events(connection, &loop_stopping, &host)
        })?;

        info!(
            "MQTT publisher connecting to {}:{} as {}",
            settings.host, settings.port, settings.client_id
        );
        Ok(Self {
            client,
            stopping,
            event_loop: Some(event_loop),
        })
    }
}

fn drain_events(mut connection: Connection, stopping: &AtomicBool, host: &str) {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                info!("MQTT connected to {host}");
                metrics::gauge!("thumb_mqtt_connected").set(1.0);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(err) => {
                metrics::gauge!("thumb_mqtt_connected").set(0.0);
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                warn!("MQTT connection error: {err}");
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
    debug!("MQTT event loop stopped");
}

impl StatePublisher for MqttPublisher {
    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PublishError> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.client.disconnect().map_err(PublishError::from);
        if let Some(handle) = self.event_loop.take() {
            if handle.join().is_err() {
                error!("MQTT event loop thread panicked");
            }
        }
        metrics::gauge!("thumb_mqtt_connected").set(0.0);
        result
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Wall-clock seconds since the Unix epoch, as carried in payload timestamps.
pub(crate) fn wall_clock_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1_000.0
}

/// Maps hold events onto the thumb and session topics.
pub(crate) struct StateReporter {
    publisher: Box<dyn StatePublisher>,
    topics: Topics,
    dedup: PublishDedup,
}

impl StateReporter {
    pub(crate) fn new(publisher: Box<dyn StatePublisher>, topics: Topics) -> Self {
        Self {
            publisher,
            topics,
            dedup: PublishDedup::default(),
        }
    }

    /// Publish the payload for one tracker event.
    pub(crate) fn report(&mut self, event: HoldEvent) {
        let timestamp = wall_clock_secs();
        self.send_thumb_state(StatePayload::from_event(event, timestamp));
        match event {
            HoldEvent::Completed => {
                info!("Thumbs-up hold complete");
                metrics::counter!("thumb_hold_completions_total").increment(1);
                self.send_session_status(SessionStatus::ThumbDetected);
            }
            HoldEvent::Released => self.dedup.clear(),
            HoldEvent::Started | HoldEvent::Progress { .. } => {}
        }
    }

    /// Returns `true` when the payload went out to the publisher.
    pub(crate) fn send_thumb_state(&mut self, payload: StatePayload) -> bool {
        if !self.dedup.admit(&payload) {
            metrics::counter!("thumb_publishes_total", "result" => "deduplicated").increment(1);
            return false;
        }
        let topic = self.topics.thumb.clone();
        self.send(&topic, &payload)
    }

    /// Session status bypasses dedup.
    pub(crate) fn send_session_status(&mut self, status: SessionStatus) -> bool {
        let topic = self.topics.session.clone();
        let sent = self.send(&topic, &SessionStatusPayload::new(status, wall_clock_secs()));
        if sent {
            debug!("Session status {}", status.as_str());
        }
        sent
    }

    fn send<T: Serialize>(&mut self, topic: &str, payload: &T) -> bool {
        let outcome = serde_json::to_vec(payload)
            .map_err(PublishError::from)
            .and_then(|bytes| self.publisher.publish(topic, bytes));
        match outcome {
            Ok(()) => {
                metrics::counter!("thumb_publishes_total", "result" => "sent").increment(1);
                true
            }
            Err(err) => {
                error!("Failed to publish to {topic}: {err}");
                metrics::counter!("thumb_publishes_total", "result" => "failed").increment(1);
                false
            }
        }
    }

    pub(crate) fn flush(&mut self) {
        if let Err(err) = self.publisher.flush() {
            warn!("Failed to flush publisher: {err}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Publisher that records every message it is handed.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingPublisher {
        pub(crate) sent: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
        pub(crate) flushed: Arc<AtomicBool>,
        pub(crate) fail: bool,
    }

    impl RecordingPublisher {
        pub(crate) fn messages(&self) -> Vec<(String, serde_json::Value)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl StatePublisher for RecordingPublisher {
        fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Closed);
            }
            let value = serde_json::from_slice(&payload)?;
            self.sent.lock().unwrap().push((topic.to_string(), value));
            Ok(())
        }

        fn flush(&mut self) -> Result<(), PublishError> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn reporter() -> (StateReporter, RecordingPublisher) {
        let publisher = RecordingPublisher::default();
        let reporter = StateReporter::new(
            Box::new(publisher.clone()),
            Topics::new("gateA", "esp32-01"),
        );
        (reporter, publisher)
    }

    #[test]
    fn duplicate_state_is_published_once() {
        let (mut reporter, publisher) = reporter();
        reporter.report(HoldEvent::Started);
        reporter.report(HoldEvent::Started);
        let messages = publisher.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "gateA/esp32-01/ui/thumb");
        assert_eq!(messages[0].1["thumb"], true);
        assert_eq!(messages[0].1["progress"], 0.0);
    }

    #[test]
    fn completion_also_reports_session_status() {
        let (mut reporter, publisher) = reporter();
        reporter.report(HoldEvent::Completed);
        let messages = publisher.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].1["hold_complete"], true);
        assert_eq!(messages[0].1["progress"], 1.0);
        assert_eq!(messages[1].0, "gateA/esp32-01/ui/session_status");
        assert_eq!(messages[1].1["status"], "thumb_detected");
        assert_eq!(messages[1].1["camera"], "active");
    }

    #[test]
    fn release_clears_dedup() {
        let (mut reporter, publisher) = reporter();
        reporter.report(HoldEvent::Released);
        reporter.report(HoldEvent::Released);
        let messages = publisher.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|(_, v)| v["thumb"] == false));
    }

    #[test]
    fn session_status_is_never_deduplicated() {
        let (mut reporter, publisher) = reporter();
        assert!(reporter.send_session_status(SessionStatus::CameraReady));
        assert!(reporter.send_session_status(SessionStatus::CameraReady));
        assert_eq!(publisher.messages().len(), 2);
    }

    #[test]
    fn publisher_failures_are_swallowed() {
        let publisher = RecordingPublisher {
            fail: true,
            ..RecordingPublisher::default()
        };
        let mut reporter =
            StateReporter::new(Box::new(publisher), Topics::new("site", "device"));
        reporter.report(HoldEvent::Completed);
        assert!(!reporter.send_thumb_state(StatePayload::new(false, 0.0)));
    }

    #[test]
    fn flush_reaches_publisher() {
        let (mut reporter, publisher) = reporter();
        reporter.flush();
        assert!(publisher.flushed.load(Ordering::SeqCst));
    }
}

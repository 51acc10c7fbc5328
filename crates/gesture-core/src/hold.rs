//! Hold tracker turning noisy per-frame verdicts into one debounced completion.
//!
//! `Idle` counts consecutive positive frames; reaching the stability threshold
//! starts a hold. While `Holding`, progress is quantized into buckets so the
//! event rate does not depend on the frame rate. A gap longer than the release
//! grace window returns the tracker to `Idle` and wipes every hold field.

use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct HoldConfig {
    /// Time the posture must be held before completion.
    pub hold_duration_ms: u64,
    /// Longest tolerated gap between positive frames while holding.
    pub release_grace_ms: u64,
    /// Width of one progress bucket, in `(0, 1]`.
    pub progress_step: f64,
    /// Consecutive positive frames needed before a hold starts.
    pub stable_frames: u32,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            hold_duration_ms: 3_000,
            release_grace_ms: 600,
            progress_step: 0.05,
            stable_frames: 2,
        }
    }
}

impl HoldConfig {
    fn max_bucket(&self) -> u32 {
        ((1.0 / self.progress_step) + 1e-9).floor() as u32
    }
}

/// Classifier verdict for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionSample {
    pub detected: bool,
    pub timestamp_ms: i64,
}

impl DetectionSample {
    pub fn new(detected: bool, timestamp_ms: i64) -> Self {
        Self {
            detected,
            timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldPhase {
    Idle,
    Holding,
    Completed,
}

/// Outbound transitions produced by [`HoldTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HoldEvent {
    /// Stability threshold reached; progress is zero.
    Started,
    /// Progress entered a new bucket.
    Progress { progress: f64, bucket: u32 },
    /// Hold duration reached. Emitted once per hold.
    Completed,
    /// Hold state was cleared after having been observable.
    Released,
}

/// Mutable tracker fields. `hold_start_ms` is set only while holding or completed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HoldState {
    pub hold_start_ms: Option<i64>,
    pub last_detected_ms: Option<i64>,
    pub consecutive_detect_frames: u32,
    pub completed: bool,
    pub last_progress_bucket: Option<u32>,
    pub last_progress_sent: f64,
}

#[derive(Debug, Clone)]
pub struct HoldTracker {
    config: HoldConfig,
    state: HoldState,
}

impl HoldTracker {
    pub fn new(config: HoldConfig) -> Self {
        Self {
            config,
            state: HoldState::default(),
        }
    }

    pub fn config(&self) -> &HoldConfig {
        &self.config
    }

    pub fn state(&self) -> &HoldState {
        &self.state
    }

    pub fn phase(&self) -> HoldPhase {
        match (self.state.hold_start_ms, self.state.completed) {
            (None, _) => HoldPhase::Idle,
            (Some(_), false) => HoldPhase::Holding,
            (Some(_), true) => HoldPhase::Completed,
        }
    }

    /// Hold progress in `[0, 1]` at `now_ms`, or `None` when idle.
    pub fn progress_at(&self, now_ms: i64) -> Option<f64> {
        let start = self.state.hold_start_ms?;
        if self.state.completed {
            return Some(1.0);
        }
        let held = now_ms.saturating_sub(start).max(0) as f64;
        Some((held / self.config.hold_duration_ms as f64).min(1.0))
    }

    /// Feed one frame's verdict. At most one event is produced per sample.
    pub fn step(&mut self, sample: DetectionSample) -> Option<HoldEvent> {
        let now = sample.timestamp_ms;

        if sample.detected {
            self.state.consecutive_detect_frames =
                self.state.consecutive_detect_frames.saturating_add(1);
            self.state.last_detected_ms = Some(now);
        } else if self.state.hold_start_ms.is_none() {
            self.state.consecutive_detect_frames = 0;
            self.state.last_detected_ms = None;
        }

        let Some(start) = self.state.hold_start_ms else {
            if self.state.consecutive_detect_frames >= self.config.stable_frames {
                self.state.hold_start_ms = Some(now);
                self.state.last_progress_sent = 0.0;
                self.state.completed = false;
                self.state.last_progress_bucket = Some(0);
                debug!(at_ms = now, "Thumb hold started");
                return Some(HoldEvent::Started);
            }
            return None;
        };

        if let Some(last) = self.state.last_detected_ms {
            if now.saturating_sub(last) > self.config.release_grace_ms as i64 {
                debug!(gap_ms = now - last, "Thumb hold released (timeout)");
                return self.reset();
            }
        }

        if self.state.completed {
            return None;
        }

        let held = now.saturating_sub(start).max(0) as f64;
        let progress = (held / self.config.hold_duration_ms as f64).min(1.0);
        if progress >= 1.0 {
            self.state.completed = true;
            self.state.last_progress_sent = 1.0;
            self.state.last_progress_bucket = Some(self.config.max_bucket());
            return Some(HoldEvent::Completed);
        }

        let bucket = (progress / self.config.progress_step) as u32;
        if self.state.last_progress_bucket.is_none_or(|last| bucket > last) {
            self.state.last_progress_bucket = Some(bucket);
            self.state.last_progress_sent = progress;
            return Some(HoldEvent::Progress { progress, bucket });
        }
        None
    }

    /// Return to `Idle`. Yields [`HoldEvent::Released`] only if a hold had
    /// started or progress had been reported.
    pub fn reset(&mut self) -> Option<HoldEvent> {
        let had_state = self.state.hold_start_ms.is_some()
            || self.state.completed
            || self.state.last_progress_sent > 0.0;
        self.state = HoldState::default();
        had_state.then_some(HoldEvent::Released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK_MS: i64 = 33;

    fn tracker() -> HoldTracker {
        HoldTracker::new(HoldConfig::default())
    }

    fn feed(tracker: &mut HoldTracker, detected: bool, at: i64) -> Option<HoldEvent> {
        tracker.step(DetectionSample::new(detected, at))
    }

    #[test]
    fn single_positive_frame_does_not_start_hold() {
        let mut t = tracker();
        assert_eq!(feed(&mut t, true, 0), None);
        assert_eq!(feed(&mut t, false, 33), None);
        assert_eq!(feed(&mut t, true, 66), None);
        assert_eq!(t.phase(), HoldPhase::Idle);
        assert_eq!(t.state().consecutive_detect_frames, 1);
    }

    #[test]
    fn scenario_start_then_complete_once() {
        let mut t = tracker();
        assert_eq!(feed(&mut t, true, 0), None);
        assert_eq!(feed(&mut t, true, 33), Some(HoldEvent::Started));
        assert_eq!(t.phase(), HoldPhase::Holding);
        assert_eq!(t.state().hold_start_ms, Some(33));

        let mut completed_at = None;
        let mut completions = 0;
        let mut now = 33;
        while now < 4_000 {
            now += TICK_MS;
            if feed(&mut t, true, now) == Some(HoldEvent::Completed) {
                completions += 1;
                completed_at.get_or_insert(now);
            }
        }
        assert_eq!(completions, 1);
        let at = completed_at.unwrap();
        assert!(at - 33 >= 3_000);
        assert!(at - TICK_MS - 33 < 3_000);
        assert_eq!(t.phase(), HoldPhase::Completed);
        assert_eq!(t.state().last_progress_sent, 1.0);
    }

    #[test]
    fn progress_buckets_strictly_increase() {
        let mut t = tracker();
        feed(&mut t, true, 0);
        feed(&mut t, true, 10);
        let mut buckets = Vec::new();
        for now in (11..3_010).step_by(7) {
            if let Some(HoldEvent::Progress { bucket, progress }) = feed(&mut t, true, now) {
                assert!((0.0..1.0).contains(&progress));
                buckets.push(bucket);
            }
        }
        assert!(!buckets.is_empty());
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        assert!(!buckets.contains(&0));
        assert!(buckets.len() <= 19);
    }

    #[test]
    fn short_gap_keeps_progress() {
        let mut t = tracker();
        feed(&mut t, true, 0);
        feed(&mut t, true, 33);
        feed(&mut t, true, 1_000);
        for now in [1_100, 1_300, 1_500] {
            let event = feed(&mut t, false, now);
            assert!(matches!(event, None | Some(HoldEvent::Progress { .. })));
        }
        assert_eq!(t.phase(), HoldPhase::Holding);
        assert_eq!(t.state().hold_start_ms, Some(33));
        let event = feed(&mut t, true, 1_600);
        assert!(matches!(event, None | Some(HoldEvent::Progress { .. })));
        assert_eq!(t.state().hold_start_ms, Some(33));
    }

    #[test]
    fn long_gap_resets_hold() {
        let mut t = tracker();
        feed(&mut t, true, 0);
        feed(&mut t, true, 33);
        feed(&mut t, true, 1_000);
        assert_ne!(feed(&mut t, false, 1_500), Some(HoldEvent::Released));
        assert_eq!(feed(&mut t, false, 1_601), Some(HoldEvent::Released));
        assert_eq!(t.phase(), HoldPhase::Idle);
        assert_eq!(t.state(), &HoldState::default());
    }

    #[test]
    fn reset_is_silent_without_prior_state() {
        let mut t = tracker();
        feed(&mut t, true, 0);
        assert_eq!(t.reset(), None);
        assert_eq!(t.state().consecutive_detect_frames, 0);
    }

    #[test]
    fn second_hold_after_reset_completes_again() {
        let mut t = tracker();
        let mut completions = 0;
        for round in 0..2 {
            let base = round * 10_000;
            let mut now = base;
            while now <= base + 3_200 {
                if feed(&mut t, true, now) == Some(HoldEvent::Completed) {
                    completions += 1;
                }
                now += TICK_MS;
            }
            assert_eq!(t.phase(), HoldPhase::Completed);
            assert_eq!(t.reset(), Some(HoldEvent::Released));
            assert_eq!(t.state().last_progress_bucket, None);
        }
        assert_eq!(completions, 2);
    }

    #[test]
    fn completed_hold_releases_after_gap() {
        let mut t = tracker();
        let mut now = 0;
        while t.phase() != HoldPhase::Completed {
            feed(&mut t, true, now);
            now += TICK_MS;
        }
        assert_eq!(feed(&mut t, true, now), None);
        assert_eq!(feed(&mut t, false, now + 700), Some(HoldEvent::Released));
        assert_eq!(t.phase(), HoldPhase::Idle);
    }

    #[test]
    fn progress_at_reports_idle_as_none() {
        let mut t = tracker();
        assert_eq!(t.progress_at(0), None);
        feed(&mut t, true, 0);
        feed(&mut t, true, 0);
        assert_eq!(t.progress_at(1_500), Some(0.5));
    }
}

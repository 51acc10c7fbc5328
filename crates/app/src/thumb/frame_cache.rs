//! Broadcast cache holding only the latest encoded preview frame.
//!
//! One writer replaces the frame and bumps the sequence; any number of viewers
//! wait for the sequence to move past the one they last saw. Slow viewers skip
//! frames but never observe the sequence going backwards. Viewers wait as
//! async tasks on a `watch` signal, so a parked viewer holds no thread.

use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use actix_web::{rt::time, web::Bytes};
use tokio::sync::watch;

#[derive(Default)]
struct Slot {
    frame: Option<Bytes>,
    /// 0 means no frame has been published yet.
    sequence: u64,
    closed: bool,
}

impl Slot {
    fn has_update(&self, last_seen: Option<u64>) -> bool {
        self.frame.is_some() && last_seen != Some(self.sequence)
    }

    fn snapshot(&self, last_seen: Option<u64>) -> FrameWait {
        if self.closed {
            return FrameWait::Closed;
        }
        match (&self.frame, self.has_update(last_seen)) {
            (Some(bytes), true) => FrameWait::Frame {
                bytes: bytes.clone(),
                sequence: self.sequence,
            },
            _ => FrameWait::Timeout,
        }
    }
}

/// Outcome of [`FrameCache::wait_for_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameWait {
    Frame { bytes: Bytes, sequence: u64 },
    Timeout,
    Closed,
}

pub(crate) struct FrameCache {
    slot: Mutex<Slot>,
    changed: watch::Sender<u64>,
}

impl Default for FrameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCache {
    pub(crate) fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            slot: Mutex::new(Slot::default()),
            changed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the current frame and wake every waiting viewer. Returns the new sequence.
    pub(crate) fn update(&self, frame: impl Into<Bytes>) -> u64 {
        let sequence = {
            let mut slot = self.lock();
            slot.frame = Some(frame.into());
            slot.sequence += 1;
            slot.sequence
        };
        self.changed.send_replace(sequence);
        sequence
    }

    /// Wait up to `timeout` for a frame newer than `last_seen`.
    ///
    /// `last_seen == None` means the caller has never received a frame, in
    /// which case an existing frame is returned without waiting.
    pub(crate) async fn wait_for_frame(
        &self,
        last_seen: Option<u64>,
        timeout: Duration,
    ) -> FrameWait {
        // Subscribe before looking so an update racing the check still wakes us.
        let mut changes = self.changed.subscribe();
        let ready = self.lock().snapshot(last_seen);
        if ready != FrameWait::Timeout {
            return ready;
        }
        match time::timeout(timeout, changes.changed()).await {
            Ok(Ok(())) => self.lock().snapshot(last_seen),
            Ok(Err(_)) => FrameWait::Closed,
            Err(_) => FrameWait::Timeout,
        }
    }

    /// Mark the cache closed and release every waiting viewer.
    pub(crate) fn close(&self) {
        let sequence = {
            let mut slot = self.lock();
            slot.closed = true;
            slot.sequence
        };
        self.changed.send_replace(sequence);
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.lock().sequence
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        thread,
        time::Instant,
    };

    use super::*;

    #[test]
    fn sequence_starts_at_zero_and_increments() {
        let cache = FrameCache::new();
        assert_eq!(cache.sequence(), 0);
        assert_eq!(cache.update(vec![1]), 1);
        assert_eq!(cache.update(vec![2]), 2);
        assert_eq!(cache.sequence(), 2);
    }

    #[actix_web::test]
    async fn unseen_viewer_gets_existing_frame_immediately() {
        let cache = FrameCache::new();
        cache.update(vec![1, 2, 3]);
        let started = Instant::now();
        let wait = cache.wait_for_frame(None, Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            wait,
            FrameWait::Frame {
                bytes: Bytes::from(vec![1, 2, 3]),
                sequence: 1
            }
        );
    }

    #[actix_web::test]
    async fn times_out_without_new_frame() {
        let cache = FrameCache::new();
        assert_eq!(
            cache.wait_for_frame(None, Duration::from_millis(20)).await,
            FrameWait::Timeout
        );
        let sequence = cache.update(vec![0]);
        assert_eq!(
            cache
                .wait_for_frame(Some(sequence), Duration::from_millis(20))
                .await,
            FrameWait::Timeout
        );
    }

    #[actix_web::test]
    async fn update_from_producer_thread_wakes_waiting_viewer() {
        let cache = Arc::new(FrameCache::new());
        let first = cache.update(vec![0]);
        let producer = {
            let cache = cache.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cache.update(vec![9]);
            })
        };
        match cache.wait_for_frame(Some(first), Duration::from_secs(5)).await {
            FrameWait::Frame { bytes, sequence } => {
                assert_eq!(sequence, 2);
                assert_eq!(&bytes[..], &[9]);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        producer.join().unwrap();
    }

    #[actix_web::test]
    async fn close_releases_waiting_viewers() {
        let cache = Arc::new(FrameCache::new());
        let viewers: Vec<_> = (0..3)
            .map(|_| {
                let cache = cache.clone();
                actix_web::rt::spawn(async move {
                    cache.wait_for_frame(None, Duration::from_secs(10)).await
                })
            })
            .collect();
        time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        cache.close();
        for viewer in viewers {
            assert_eq!(viewer.await.unwrap(), FrameWait::Closed);
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[actix_web::test]
    async fn many_parked_viewers_do_not_need_threads() {
        let cache = Arc::new(FrameCache::new());
        let first = cache.update(vec![0]);
        let viewers: Vec<_> = (0..2_000)
            .map(|_| {
                let cache = cache.clone();
                actix_web::rt::spawn(async move {
                    cache.wait_for_frame(Some(first), Duration::from_secs(10)).await
                })
            })
            .collect();
        time::sleep(Duration::from_millis(50)).await;
        cache.update(vec![1]);
        for viewer in viewers {
            assert!(matches!(
                viewer.await.unwrap(),
                FrameWait::Frame { sequence: 2, .. }
            ));
        }
    }

    #[actix_web::test]
    async fn concurrent_viewers_never_see_sequence_decrease() {
        let cache = Arc::new(FrameCache::new());
        let viewers: Vec<_> = (0..2)
            .map(|_| {
                let cache = cache.clone();
                actix_web::rt::spawn(async move {
                    let mut cursor = None;
                    let mut seen = Vec::new();
                    loop {
                        let wait = cache.wait_for_frame(cursor, Duration::from_millis(200));
                        match wait.await {
                            FrameWait::Frame { sequence, .. } => {
                                seen.push(sequence);
                                cursor = Some(sequence);
                            }
                            FrameWait::Timeout => continue,
                            FrameWait::Closed => break,
                        }
                    }
                    seen
                })
            })
            .collect();

        let producer = {
            let cache = cache.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                for i in 0..500u32 {
                    cache.update(i.to_be_bytes().to_vec());
                    if i % 50 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                thread::sleep(Duration::from_millis(20));
                cache.close();
            })
        };

        for viewer in viewers {
            let seen = viewer.await.unwrap();
            assert!(!seen.is_empty());
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
        producer.join().unwrap();
    }
}

//! Job progress tracking
//!
//! [`ProgressState`] owns the counters of one job behind a single lock. Every
//! mutation may publish a [`ProgressSnapshot`] on a `watch` channel, throttled to
//! a minimum interval so UI consumers are not flooded; state transitions always
//! publish.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use super::models::{FailedSegment, JobState, SegmentState};

/// Failure entry carried in progress events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureNote {
    pub index: usize,
    pub kind: String,
    pub message: String,
}

/// Point-in-time view of a job, safe to hand to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub job_id: Uuid,
    pub state: JobState,
    pub segments_total: usize,
    pub segments_done: usize,
    pub segments_failed: usize,
    pub bytes_written: u64,
    /// Bytes per second since the job started
    pub speed: f64,
    pub failures: Vec<FailureNote>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            state: JobState::Idle,
            segments_total: 0,
            segments_done: 0,
            segments_failed: 0,
            bytes_written: 0,
            speed: 0.0,
            failures: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Fraction of segments settled (written or failed), 0.0 - 1.0
    pub fn fraction(&self) -> f64 {
        if self.segments_total == 0 {
            return 0.0;
        }
        ((self.segments_done + self.segments_failed) as f64 / self.segments_total as f64).min(1.0)
    }
}

struct Inner {
    snapshot: ProgressSnapshot,
    segment_states: Vec<SegmentState>,
    started: Instant,
    last_publish: Option<coarsetime::Instant>,
}

/// Counters and per-segment states of one job
pub struct ProgressState {
    inner: Mutex<Inner>,
    tx: watch::Sender<ProgressSnapshot>,
    min_interval: Duration,
}

impl ProgressState {
    pub fn new(job_id: Uuid, min_interval: Duration) -> Self {
        let snapshot = ProgressSnapshot::new(job_id);
        let (tx, _rx) = watch::channel(snapshot.clone());
        Self {
            inner: Mutex::new(Inner {
                snapshot,
                segment_states: Vec::new(),
                started: Instant::now(),
                last_publish: None,
            }),
            tx,
            min_interval,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.lock().snapshot.clone()
    }

    /// Reset the segment table once the work list is known
    pub fn set_total(&self, total: usize) {
        let mut inner = self.inner.lock();
        inner.snapshot.segments_total = total;
        inner.segment_states = vec![SegmentState::Pending; total];
        self.publish(&mut inner, true);
    }

    pub fn set_state(&self, state: JobState) {
        let mut inner = self.inner.lock();
        inner.snapshot.state = state;
        if state == JobState::Running {
            inner.started = Instant::now();
        }
        self.publish(&mut inner, true);
    }

    pub fn segment_state(&self, position: usize) -> Option<SegmentState> {
        self.inner.lock().segment_states.get(position).copied()
    }

    pub fn mark(&self, position: usize, state: SegmentState) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.segment_states.get_mut(position) {
            *slot = state;
        }
    }

    pub fn record_written(&self, position: usize, bytes: u64) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.segment_states.get_mut(position) {
            *slot = SegmentState::Written;
        }
        inner.snapshot.segments_done += 1;
        inner.snapshot.bytes_written += bytes;
        self.publish(&mut inner, false);
    }

    pub fn record_failed(&self, position: usize, failure: &FailedSegment) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.segment_states.get_mut(position) {
            *slot = SegmentState::Failed;
        }
        inner.snapshot.segments_failed += 1;
        inner.snapshot.failures.push(FailureNote {
            index: failure.index,
            kind: failure.error.kind().to_string(),
            message: failure.error.to_string(),
        });
        self.publish(&mut inner, true);
    }

    /// Count of segments currently in `state`
    pub fn count_in(&self, state: SegmentState) -> usize {
        self.inner
            .lock()
            .segment_states
            .iter()
            .filter(|s| **s == state)
            .count()
    }

    fn publish(&self, inner: &mut Inner, force: bool) {
        let now = coarsetime::Instant::now();
        if !force {
            if let Some(last) = inner.last_publish {
                let since = now.duration_since(last);
                if (since.as_millis() as u128) < self.min_interval.as_millis() {
                    return;
                }
            }
        }

        let elapsed = inner.started.elapsed().as_secs_f64();
        inner.snapshot.speed = if elapsed > 0.0 {
            inner.snapshot.bytes_written as f64 / elapsed
        } else {
            0.0
        };
        inner.snapshot.updated_at = Utc::now();
        inner.last_publish = Some(now);
        self.tx.send_replace(inner.snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error_handling::DownloadError;

    #[test]
    fn test_counters_and_states() {
        let progress = ProgressState::new(Uuid::new_v4(), Duration::ZERO);
        progress.set_total(3);
        progress.set_state(JobState::Running);

        progress.mark(0, SegmentState::Fetching);
        assert_eq!(progress.segment_state(0), Some(SegmentState::Fetching));

        progress.record_written(0, 100);
        progress.record_written(2, 50);
        progress.record_failed(
            1,
            &FailedSegment {
                index: 1,
                sequence: 1,
                uri: "https://example.com/1.ts".into(),
                error: DownloadError::decryption("bad padding"),
            },
        );

        let snapshot = progress.snapshot();
        assert_eq!(snapshot.segments_total, 3);
        assert_eq!(snapshot.segments_done, 2);
        assert_eq!(snapshot.segments_failed, 1);
        assert_eq!(snapshot.bytes_written, 150);
        assert_eq!(snapshot.failures[0].kind, "DecryptionError");
        assert!((snapshot.fraction() - 1.0).abs() < f64::EPSILON);
        assert_eq!(progress.count_in(SegmentState::Written), 2);
        assert_eq!(progress.segment_state(9), None);
    }

    #[test]
    fn test_unthrottled_updates_reach_subscribers() {
        let progress = ProgressState::new(Uuid::new_v4(), Duration::ZERO);
        let rx = progress.subscribe();
        progress.set_total(2);
        progress.record_written(0, 10);
        assert_eq!(rx.borrow().segments_done, 1);
    }

    #[test]
    fn test_throttle_holds_back_byte_updates() {
        let progress = ProgressState::new(Uuid::new_v4(), Duration::from_secs(3600));
        let rx = progress.subscribe();
        progress.set_total(4);
        for position in 0..4 {
            progress.record_written(position, 10);
        }
        // only the forced publish from set_total went out
        assert_eq!(rx.borrow().segments_done, 0);
        assert_eq!(progress.snapshot().segments_done, 4);

        progress.set_state(JobState::Completed);
        assert_eq!(rx.borrow().segments_done, 4);
        assert_eq!(rx.borrow().state, JobState::Completed);
    }
}

//! Attendance reconciler: turns recognition events into backend writes.
//!
//! Writes never block the recognition loop. Each event is submitted on its
//! own task; retryable failures land in the [`Outbox`] and are resubmitted
//! on a timer. Every failure is logged and counted in the session tally.
//!
//! Events enter through a [`RecognitionSink`], which counts them as
//! unsettled until they are written or queued. Ending a session waits for
//! that count to reach zero so no recognised student is backfilled absent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use rollcall_core::{
    confidence_from_distance, AttendanceStore, AttendanceSubmission, RecognitionEvent, SessionId,
    StoreError, StudentId, SubmitOutcome,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::outbox::{Outbox, OutboxError, PendingWrite};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("remote write failed: {0}")]
    RemoteWrite(#[from] StoreError),
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error("{pending} attendance write(s) for session {session_id} are still pending")]
    PendingWrites { session_id: SessionId, pending: usize },
}

/// Local per-session counts folded back from reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionTally {
    pub recognized: u32,
    pub recorded: u32,
    pub already_recorded: u32,
    /// Writes currently waiting in the outbox.
    pub queued: u32,
    /// Writes the store rejected permanently.
    pub failed: u32,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub device_id: Option<i64>,
    pub retry_interval: Duration,
    pub max_write_attempts: u32,
    /// How long ending a session waits for its unsettled writes.
    pub settle_timeout: Duration,
}

impl From<&crate::config::Config> for ReconcilerConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            device_id: config.device_id,
            retry_interval: config.retry_interval,
            max_write_attempts: config.max_write_attempts,
            settle_timeout: config.request_timeout * 2,
        }
    }
}

/// Outcome of ending a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionClosed {
    pub session_id: SessionId,
    /// Minutes from the recorded start time to now, if the session has one.
    pub duration_minutes: Option<i64>,
    pub tally: SessionTally,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub still_pending: usize,
}

/// Per-session count of recognitions sent but not yet written or queued.
#[derive(Clone)]
struct Unsettled(Arc<watch::Sender<HashMap<SessionId, usize>>>);

impl Unsettled {
    fn new() -> Self {
        Self(Arc::new(watch::channel(HashMap::new()).0))
    }

    fn add(&self, session_id: SessionId) {
        self.0.send_modify(|counts| *counts.entry(session_id).or_default() += 1);
    }

    fn settle(&self, session_id: SessionId) {
        self.0.send_modify(|counts| {
            if let Some(n) = counts.get_mut(&session_id) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    counts.remove(&session_id);
                }
            }
        });
    }

    fn count(&self, session_id: SessionId) -> usize {
        self.0.borrow().get(&session_id).copied().unwrap_or(0)
    }

    /// Wait until nothing is unsettled for the session. On timeout the
    /// remaining count is returned.
    async fn wait(&self, session_id: SessionId, timeout: Duration) -> Result<(), usize> {
        let mut rx = self.0.subscribe();
        let settled = tokio::time::timeout(timeout, async move {
            rx.wait_for(|counts| !counts.contains_key(&session_id))
                .await
                .is_ok()
        })
        .await;
        match settled {
            Ok(true) => Ok(()),
            _ => Err(self.count(session_id)),
        }
    }
}

/// Sending half of the recognition channel.
#[derive(Clone)]
pub struct RecognitionSink {
    tx: mpsc::UnboundedSender<RecognitionEvent>,
    unsettled: Unsettled,
}

impl RecognitionSink {
    /// Hand an event to the reconciler. Fails, returning the event, once
    /// the reconciler has stopped.
    pub fn send(&self, event: RecognitionEvent) -> Result<(), RecognitionEvent> {
        let session_id = event.session_id;
        self.unsettled.add(session_id);
        self.tx.send(event).map_err(|err| {
            self.unsettled.settle(session_id);
            err.0
        })
    }
}

#[cfg(test)]
impl RecognitionSink {
    /// A sink with no reconciler behind it.
    pub fn unbounded() -> (Self, mpsc::UnboundedReceiver<RecognitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, unsettled: Unsettled::new() }, rx)
    }
}

/// Cheap to clone; clones share the store, outbox and tallies.
pub struct Reconciler<S> {
    store: Arc<S>,
    outbox: Outbox,
    tallies: Arc<Mutex<HashMap<SessionId, SessionTally>>>,
    unsettled: Unsettled,
    config: ReconcilerConfig,
}

impl<S> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            outbox: self.outbox.clone(),
            tallies: Arc::clone(&self.tallies),
            unsettled: self.unsettled.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: AttendanceStore> Reconciler<S> {
    pub fn new(store: Arc<S>, outbox: Outbox, config: ReconcilerConfig) -> Self {
        Self {
            store,
            outbox,
            tallies: Arc::new(Mutex::new(HashMap::new())),
            unsettled: Unsettled::new(),
            config,
        }
    }

    /// A sink feeding this reconciler and the receiver to pass to [`run`].
    ///
    /// [`run`]: Reconciler::run
    pub fn channel(&self) -> (RecognitionSink, mpsc::UnboundedReceiver<RecognitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = RecognitionSink {
            tx,
            unsettled: self.unsettled.clone(),
        };
        (sink, rx)
    }

    fn update_tally(&self, session_id: SessionId, f: impl FnOnce(&mut SessionTally)) {
        let mut tallies = self.tallies.lock().unwrap_or_else(|p| p.into_inner());
        f(tallies.entry(session_id).or_default());
    }

    pub fn tally(&self, session_id: SessionId) -> SessionTally {
        let tallies = self.tallies.lock().unwrap_or_else(|p| p.into_inner());
        tallies.get(&session_id).cloned().unwrap_or_default()
    }

    pub fn tallies(&self) -> HashMap<SessionId, SessionTally> {
        self.tallies.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Submit a present record for one recognised student.
    ///
    /// A store that already holds the record counts as success. On failure
    /// the error is returned after being tallied and, when retryable,
    /// queued in the outbox.
    pub async fn record(
        &self,
        session_id: SessionId,
        student_id: StudentId,
        distance: f32,
    ) -> Result<SubmitOutcome, ReconcileError> {
        let submission = AttendanceSubmission {
            session_id,
            student_id,
            confidence: confidence_from_distance(distance),
            device_id: self.config.device_id,
        };

        match self.store.submit_attendance(submission.clone()).await {
            Ok(outcome) => {
                self.update_tally(session_id, |t| match outcome {
                    SubmitOutcome::Recorded => t.recorded += 1,
                    SubmitOutcome::AlreadyRecorded => t.already_recorded += 1,
                });
                tracing::info!(
                    session_id,
                    student_id,
                    confidence = submission.confidence,
                    ?outcome,
                    "attendance recorded"
                );
                Ok(outcome)
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(session_id, student_id, error = %err, "attendance write failed; queued for retry");
                self.outbox.enqueue(&submission, &err.to_string()).await?;
                self.update_tally(session_id, |t| t.queued += 1);
                Err(ReconcileError::RemoteWrite(err))
            }
            Err(err) => {
                tracing::warn!(session_id, student_id, error = %err, "attendance write rejected");
                self.update_tally(session_id, |t| t.failed += 1);
                Err(ReconcileError::RemoteWrite(err))
            }
        }
    }

    async fn handle_event(&self, event: RecognitionEvent) {
        self.update_tally(event.session_id, |t| t.recognized += 1);
        let result = self
            .record(event.session_id, event.student_id, event.distance)
            .await;
        self.unsettled.settle(event.session_id);
        match result {
            Ok(_) => {}
            Err(ReconcileError::Outbox(err)) => tracing::error!(
                scan_id = %event.scan_id,
                student_id = event.student_id,
                error = %err,
                "failed write could not be queued"
            ),
            Err(err) => tracing::debug!(
                scan_id = %event.scan_id,
                student_id = event.student_id,
                error = %err,
                "recognition not yet reconciled"
            ),
        }
    }

    /// Resubmit one queued write. Returns true once the store accepted it.
    async fn resubmit(&self, pending: PendingWrite) -> Result<bool, ReconcileError> {
        let (session_id, student_id) = (pending.session_id, pending.student_id);
        match self.store.submit_attendance(pending.submission()).await {
            Ok(outcome) => {
                // A concurrent pass may have delivered the same row already.
                if !self.outbox.remove(session_id, student_id).await? {
                    return Ok(true);
                }
                self.update_tally(session_id, |t| {
                    t.queued = t.queued.saturating_sub(1);
                    match outcome {
                        SubmitOutcome::Recorded => t.recorded += 1,
                        SubmitOutcome::AlreadyRecorded => t.already_recorded += 1,
                    }
                });
                tracing::info!(session_id, student_id, "queued attendance write delivered");
                Ok(true)
            }
            Err(err) if err.is_retryable() => {
                let attempts = self
                    .outbox
                    .record_failure(session_id, student_id, &err.to_string())
                    .await?;
                if attempts >= self.config.max_write_attempts {
                    tracing::warn!(
                        session_id,
                        student_id,
                        attempts,
                        error = %err,
                        "queued attendance write stalled; waiting for operator retry"
                    );
                } else {
                    tracing::debug!(session_id, student_id, attempts, error = %err, "retry failed");
                }
                Ok(false)
            }
            Err(err) => {
                tracing::warn!(session_id, student_id, error = %err, "queued attendance write rejected; dropped");
                if self.outbox.remove(session_id, student_id).await? {
                    self.update_tally(session_id, |t| {
                        t.queued = t.queued.saturating_sub(1);
                        t.failed += 1;
                    });
                }
                Ok(false)
            }
        }
    }

    async fn resubmit_all(&self, pending: Vec<PendingWrite>) -> Result<RetrySummary, ReconcileError> {
        let mut summary = RetrySummary {
            attempted: pending.len(),
            ..RetrySummary::default()
        };
        for write in pending {
            if self.resubmit(write).await? {
                summary.succeeded += 1;
            }
        }
        summary.still_pending = self.outbox.count(None).await?;
        Ok(summary)
    }

    /// Resubmit queued writes that have not exhausted their attempts.
    pub async fn retry_due(&self) -> Result<RetrySummary, ReconcileError> {
        let due = self.outbox.due(self.config.max_write_attempts).await?;
        if due.is_empty() {
            return Ok(RetrySummary {
                still_pending: self.outbox.count(None).await?,
                ..RetrySummary::default()
            });
        }
        self.resubmit_all(due).await
    }

    /// Operator-triggered retry: stalled writes become eligible again and
    /// everything queued is resubmitted now.
    pub async fn retry_pending(&self) -> Result<RetrySummary, ReconcileError> {
        self.outbox.reset_attempts().await?;
        let pending = self.outbox.list(None).await?;
        self.resubmit_all(pending).await
    }

    /// Complete a session remotely and have the store backfill absences.
    ///
    /// Recognitions still in flight are awaited and queued writes for the
    /// session delivered first. If any remain the session is left open so
    /// recognised students are never marked absent.
    pub async fn end_session(&self, session_id: SessionId) -> Result<SessionClosed, ReconcileError> {
        if let Err(pending) = self
            .unsettled
            .wait(session_id, self.config.settle_timeout)
            .await
        {
            return Err(ReconcileError::PendingWrites { session_id, pending });
        }
        for pending in self.outbox.list(Some(session_id)).await? {
            self.resubmit(pending).await?;
        }
        let pending = self.outbox.count(Some(session_id)).await?;
        if pending > 0 {
            return Err(ReconcileError::PendingWrites { session_id, pending });
        }

        let session = self.store.fetch_session(session_id).await?;
        if !session.is_active() {
            tracing::info!(session_id, "session already completed; re-running completion");
        }
        let duration_minutes = session.elapsed_minutes(Local::now().naive_local());

        self.store.end_session(session_id, duration_minutes).await?;
        tracing::info!(session_id, ?duration_minutes, "session ended");

        Ok(SessionClosed {
            session_id,
            duration_minutes,
            tally: self.tally(session_id),
        })
    }

    async fn timed_retry(&self) {
        match self.retry_due().await {
            Ok(summary) if summary.attempted > 0 => {
                tracing::info!(?summary, "outbox retry pass");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "outbox retry pass failed"),
        }
    }

    /// Consume recognition events until shutdown, retrying the outbox on a
    /// timer. Events already sent and in-flight writes are handled before
    /// returning.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<RecognitionEvent>,
        shutdown: CancellationToken,
    ) {
        let mut writes = JoinSet::new();
        let mut retry = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.retry_interval,
            self.config.retry_interval,
        );
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut retry_pass: Option<JoinHandle<()>> = None;

        tracing::info!("reconciler started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let this = self.clone();
                    writes.spawn(async move { this.handle_event(event).await });
                }
                Some(joined) = writes.join_next() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "attendance write task failed");
                    }
                }
                _ = retry.tick() => {
                    if retry_pass.as_ref().is_some_and(|pass| !pass.is_finished()) {
                        tracing::debug!("previous outbox retry pass still running");
                    } else {
                        let this = self.clone();
                        retry_pass = Some(tokio::spawn(async move { this.timed_retry().await }));
                    }
                }
            }
        }

        events.close();
        let mut drained = 0usize;
        while let Ok(event) = events.try_recv() {
            let this = self.clone();
            writes.spawn(async move { this.handle_event(event).await });
            drained += 1;
        }
        if drained > 0 {
            tracing::info!(drained, "writing recognitions received before shutdown");
        }

        while let Some(joined) = writes.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "attendance write task failed");
            }
        }
        if let Some(pass) = retry_pass {
            if let Err(err) = pass.await {
                tracing::error!(error = %err, "outbox retry task failed");
            }
        }
        tracing::info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{roster_entry, FakeStore};
    use chrono::Duration as ChronoDuration;
    use rollcall_core::{AttendanceSession, SessionStatus};

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            device_id: Some(2),
            retry_interval: Duration::from_millis(20),
            max_write_attempts: 3,
            settle_timeout: Duration::from_secs(2),
        }
    }

    async fn reconciler(store: Arc<FakeStore>) -> Reconciler<FakeStore> {
        let outbox = Outbox::open_in_memory().await.unwrap();
        Reconciler::new(store, outbox, config())
    }

    fn store_with_session(session_id: SessionId, enrolled: i64) -> Arc<FakeStore> {
        let store = FakeStore::new();
        let roster = (1..=enrolled)
            .map(|id| roster_entry(id, Some("[0, 0]")))
            .collect();
        store.add_course(1, roster);
        store.add_session(FakeStore::active_session(session_id, 1));
        Arc::new(store)
    }

    #[tokio::test]
    async fn duplicate_write_yields_one_record() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;

        let first = r.record(5, 2, 0.2).await.unwrap();
        let second = r.record(5, 2, 0.3).await.unwrap();

        assert_eq!(first, SubmitOutcome::Recorded);
        assert_eq!(second, SubmitOutcome::AlreadyRecorded);
        assert_eq!(store.present(5), vec![2]);
        let tally = r.tally(5);
        assert_eq!(tally.recorded, 1);
        assert_eq!(tally.already_recorded, 1);
    }

    #[tokio::test]
    async fn confidence_and_device_submitted() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;
        r.record(5, 1, 0.25).await.unwrap();

        let calls = store.submissions();
        assert_eq!(calls.len(), 1);
        assert!((calls[0].confidence - 0.75).abs() < 1e-6);
        assert_eq!(calls[0].device_id, Some(2));
    }

    #[tokio::test]
    async fn retryable_failure_is_queued_and_delivered_later() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;

        store.fail_next_submits(StoreError::Transport("connection refused".into()), 1);
        let err = r.record(5, 3, 0.1).await.unwrap_err();
        assert!(matches!(err, ReconcileError::RemoteWrite(StoreError::Transport(_))));
        assert_eq!(r.outbox().count(Some(5)).await.unwrap(), 1);
        assert_eq!(r.tally(5).queued, 1);
        assert!(store.present(5).is_empty());

        let summary = r.retry_due().await.unwrap();
        assert_eq!(summary, RetrySummary { attempted: 1, succeeded: 1, still_pending: 0 });
        assert_eq!(store.present(5), vec![3]);
        let tally = r.tally(5);
        assert_eq!(tally.queued, 0);
        assert_eq!(tally.recorded, 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_counted_not_queued() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;

        store.fail_next_submits(
            StoreError::Status { status: 400, message: "Invalid payload".into() },
            1,
        );
        assert!(r.record(5, 3, 0.1).await.is_err());
        assert_eq!(r.outbox().count(None).await.unwrap(), 0);
        assert_eq!(r.tally(5).failed, 1);
    }

    #[tokio::test]
    async fn stalled_writes_need_operator_retry() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;

        store.fail_next_submits(StoreError::Transport("down".into()), 3);
        assert!(r.record(5, 1, 0.1).await.is_err());
        r.retry_due().await.unwrap();
        r.retry_due().await.unwrap();

        // attempts == max_write_attempts: no longer picked up automatically
        let summary = r.retry_due().await.unwrap();
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.still_pending, 1);

        let summary = r.retry_pending().await.unwrap();
        assert_eq!(summary, RetrySummary { attempted: 1, succeeded: 1, still_pending: 0 });
        assert_eq!(store.present(5), vec![1]);
    }

    #[tokio::test]
    async fn end_session_backfills_absent_and_computes_duration() {
        let store = store_with_session(5, 10);
        let started = Local::now().naive_local() - ChronoDuration::minutes(30);
        store.add_session(AttendanceSession {
            date: Some(started.date()),
            start_time: Some(started.time()),
            ..FakeStore::active_session(5, 1)
        });
        let r = reconciler(store.clone()).await;
        for student in 1..=6 {
            r.record(5, student, 0.2).await.unwrap();
        }

        let closed = r.end_session(5).await.unwrap();

        assert_eq!(closed.duration_minutes, Some(30));
        assert_eq!(closed.tally.recorded, 6);
        assert_eq!(store.present(5).len(), 6);
        assert_eq!(store.absent(5), vec![7, 8, 9, 10]);
        assert_eq!(store.ended(), vec![(5, Some(30))]);
        assert_eq!(
            store.session_status(5),
            Some(SessionStatus::Completed)
        );
    }

    #[tokio::test]
    async fn end_session_delivers_queued_writes_first() {
        let store = store_with_session(5, 4);
        let r = reconciler(store.clone()).await;

        store.fail_next_submits(StoreError::Transport("down".into()), 1);
        assert!(r.record(5, 2, 0.2).await.is_err());

        r.end_session(5).await.unwrap();
        assert_eq!(store.present(5), vec![2]);
        assert_eq!(store.absent(5), vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn end_session_refuses_while_writes_pending() {
        let store = store_with_session(5, 4);
        let r = reconciler(store.clone()).await;

        store.fail_next_submits(StoreError::Transport("down".into()), 2);
        assert!(r.record(5, 2, 0.2).await.is_err());

        let err = r.end_session(5).await.unwrap_err();
        assert!(matches!(err, ReconcileError::PendingWrites { session_id: 5, pending: 1 }));
        assert!(store.ended().is_empty());
        assert_eq!(store.session_status(5), Some(SessionStatus::Active));
    }

    #[tokio::test]
    async fn end_session_waits_for_in_flight_recognition() {
        let store = store_with_session(5, 3);
        store.set_submit_delay(Duration::from_millis(200));
        let r = reconciler(store.clone()).await;
        let (tx, rx) = r.channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(r.clone().run(rx, shutdown.clone()));

        tx.send(FakeStore::event(5, 2, 0.1)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        r.end_session(5).await.unwrap();
        assert_eq!(store.present(5), vec![2]);
        assert_eq!(store.absent(5), vec![1, 3]);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn end_session_refuses_when_recognition_does_not_settle() {
        let store = store_with_session(5, 3);
        store.set_submit_delay(Duration::from_secs(5));
        let outbox = Outbox::open_in_memory().await.unwrap();
        let r = Reconciler::new(
            store.clone(),
            outbox,
            ReconcilerConfig {
                settle_timeout: Duration::from_millis(50),
                ..config()
            },
        );
        let (tx, rx) = r.channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(r.clone().run(rx, shutdown.clone()));

        tx.send(FakeStore::event(5, 2, 0.1)).unwrap();

        let err = r.end_session(5).await.unwrap_err();
        assert!(matches!(err, ReconcileError::PendingWrites { session_id: 5, pending: 1 }));
        assert!(store.ended().is_empty());
        assert_eq!(store.session_status(5), Some(SessionStatus::Active));

        task.abort();
    }

    #[tokio::test]
    async fn sink_send_after_stop_is_not_left_unsettled() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;
        let (tx, rx) = r.channel();
        drop(rx);

        assert!(tx.send(FakeStore::event(5, 2, 0.1)).is_err());
        let closed = r.end_session(5).await.unwrap();
        assert_eq!(closed.tally.recognized, 0);
        assert_eq!(store.absent(5), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn resubmitting_a_delivered_write_counts_once() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;

        store.fail_next_submits(StoreError::Transport("down".into()), 1);
        assert!(r.record(5, 2, 0.2).await.is_err());
        let pending = r.outbox().list(Some(5)).await.unwrap();
        assert_eq!(pending.len(), 1);

        // Two retry passes racing over the same row.
        assert!(r.resubmit(pending[0].clone()).await.unwrap());
        assert!(r.resubmit(pending[0].clone()).await.unwrap());

        let tally = r.tally(5);
        assert_eq!(tally.recorded, 1);
        assert_eq!(tally.already_recorded, 0);
        assert_eq!(tally.queued, 0);
    }

    #[tokio::test]
    async fn end_session_surfaces_store_failure() {
        let store = store_with_session(5, 2);
        let r = reconciler(store.clone()).await;
        let err = r.end_session(99).await.unwrap_err();
        assert!(matches!(err, ReconcileError::RemoteWrite(StoreError::SessionNotFound(99))));
    }

    #[tokio::test]
    async fn run_consumes_events_until_shutdown() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;
        let (tx, rx) = r.channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(r.clone().run(rx, shutdown.clone()));

        for student in [1, 3] {
            tx.send(FakeStore::event(5, student, 0.1)).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.present(5).len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("writes delivered");

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(store.present(5), vec![1, 3]);
        assert_eq!(r.tally(5).recognized, 2);
    }

    #[tokio::test]
    async fn run_writes_events_sent_before_shutdown() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;
        let (tx, rx) = r.channel();
        let shutdown = CancellationToken::new();

        for student in 1..=3 {
            tx.send(FakeStore::event(5, student, 0.1)).unwrap();
        }
        shutdown.cancel();
        r.clone().run(rx, shutdown).await;

        assert_eq!(store.present(5), vec![1, 2, 3]);
        assert_eq!(r.tally(5).recognized, 3);
        assert_eq!(r.outbox().count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn slow_retry_pass_does_not_hold_up_new_events() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;

        store.fail_next_submits(StoreError::Transport("down".into()), 1);
        assert!(r.record(5, 1, 0.1).await.is_err());
        store.set_submit_delay(Duration::from_millis(500));

        let (tx, rx) = r.channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(r.clone().run(rx, shutdown.clone()));

        // The first retry tick is now resubmitting student 1.
        tokio::time::sleep(Duration::from_millis(40)).await;
        tx.send(FakeStore::event(5, 2, 0.1)).unwrap();

        tokio::time::timeout(Duration::from_millis(750), async {
            while !store.present(5).contains(&2) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event written alongside the retry pass");

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(store.present(5), vec![1, 2]);
        assert_eq!(r.outbox().count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_retries_outbox_on_timer() {
        let store = store_with_session(5, 3);
        let r = reconciler(store.clone()).await;
        let (tx, rx) = r.channel();
        let shutdown = CancellationToken::new();
        store.fail_next_submits(StoreError::Transport("down".into()), 1);
        let task = tokio::spawn(r.clone().run(rx, shutdown.clone()));

        tx.send(FakeStore::event(5, 2, 0.1)).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.present(5).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queued write delivered by retry timer");

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(r.outbox().count(None).await.unwrap(), 0);
    }
}

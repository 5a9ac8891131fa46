//! Recognition loop: one scan task per attendance session.
//!
//! A scan owns the camera for its whole lifetime. Each tick moves the camera
//! into a blocking poll (capture + descriptor inference) and gets it back
//! with the result, so at most one poll is ever in flight. Ticks that arrive
//! while a poll runs are skipped. Recognitions are emitted once per student
//! per scan and handed to the reconciler over a channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rollcall_core::{
    AttendanceSession, AttendanceStore, CourseId, DescriptorError, DescriptorSource, Detection,
    MatchOutcome, RecognitionEvent, RosterError, RosterIndex, SessionId, StoreError, StudentId,
};
use rollcall_hw::{CameraError, CameraProvider, FrameSource};
use serde::Serialize;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::reconciler::RecognitionSink;

/// Consecutive capture failures after which a scan gives up the camera.
const MAX_CONSECUTIVE_CAPTURE_FAILURES: u32 = 10;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("session {session_id} is not active (status: {status})")]
    SessionNotActive {
        session_id: SessionId,
        status: &'static str,
    },
    #[error(transparent)]
    EmptyRoster(#[from] RosterError),
    #[error("camera unavailable: {0}")]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("scan worker failed: {0}")]
    Worker(String),
}

impl ScanError {
    /// Stable category reported to IPC callers.
    pub fn category(&self) -> String {
        match self {
            ScanError::SessionNotActive { .. } => "session-not-active".into(),
            ScanError::EmptyRoster(_) => "empty-roster".into(),
            ScanError::Camera(err) => format!("camera-{}", err.kind().as_str()),
            ScanError::Store(StoreError::SessionNotFound(_)) => "session-not-found".into(),
            ScanError::Store(_) => "store".into(),
            ScanError::Worker(_) => "internal".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub poll_interval: Duration,
    pub session_check_interval: Duration,
    pub match_threshold: f32,
    pub warmup_frames: usize,
    pub skip_dark_frames: bool,
}

impl From<&crate::config::Config> for ScannerConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            session_check_interval: config.session_check_interval,
            match_threshold: config.match_threshold,
            warmup_frames: config.warmup_frames,
            skip_dark_frames: config.skip_dark_frames,
        }
    }
}

/// Why a scan loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanExit {
    Stopped,
    SessionEnded,
    CameraLost,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub dark_frames: u64,
    pub faces: u64,
    pub inference_failures: u64,
}

#[derive(Debug, Default)]
struct ScanCounters {
    ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    dark_frames: AtomicU64,
    faces: AtomicU64,
    inference_failures: AtomicU64,
}

impl ScanCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ScanStats {
        ScanStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            dark_frames: self.dark_frames.load(Ordering::Relaxed),
            faces: self.faces.load(Ordering::Relaxed),
            inference_failures: self.inference_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedStudent {
    pub student_id: StudentId,
    pub name: String,
    pub distance: f32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanStarted {
    pub scan_id: Uuid,
    pub session_id: SessionId,
    pub course_id: CourseId,
    pub roster_size: usize,
}

/// Point-in-time view of one scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub scan_id: Uuid,
    pub session_id: SessionId,
    pub course_id: CourseId,
    pub roster_size: usize,
    pub started_at: DateTime<Utc>,
    /// Recognised students in recognition order.
    pub recognized: Vec<RecognizedStudent>,
    pub stats: ScanStats,
    pub exit: Option<ScanExit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannerStatus {
    pub state: &'static str,
    pub selected_session: Option<SessionId>,
    pub current: Option<ScanSummary>,
    pub last: Option<ScanSummary>,
}

/// State of one scan visible outside its task.
struct ScanShared {
    started: ScanStarted,
    started_at: DateTime<Utc>,
    counters: ScanCounters,
    recognized: Mutex<Vec<RecognizedStudent>>,
}

impl ScanShared {
    fn summary(&self, exit: Option<ScanExit>) -> ScanSummary {
        ScanSummary {
            scan_id: self.started.scan_id,
            session_id: self.started.session_id,
            course_id: self.started.course_id,
            roster_size: self.started.roster_size,
            started_at: self.started_at,
            recognized: self
                .recognized
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
            stats: self.counters.snapshot(),
            exit,
        }
    }
}

/// Identity and dedup set of one scan. Dropped with the scan, so nothing
/// leaks into the next one.
pub struct ScanSession {
    id: Uuid,
    session_id: SessionId,
    roster: Arc<RosterIndex>,
    seen: HashSet<StudentId>,
}

impl ScanSession {
    pub fn new(session_id: SessionId, roster: Arc<RosterIndex>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            roster,
            seen: HashSet::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Events for students recognised for the first time in this scan.
    pub fn resolve(&mut self, detections: &[Detection], at: DateTime<Utc>) -> Vec<RecognitionEvent> {
        let mut events = Vec::new();
        for detection in detections {
            let MatchOutcome::Matched(m) = self.roster.find_best_match(&detection.descriptor) else {
                continue;
            };
            if !self.seen.insert(m.student_id) {
                continue;
            }
            events.push(RecognitionEvent {
                scan_id: self.id,
                session_id: self.session_id,
                student_id: m.student_id,
                distance: m.distance,
                timestamp: at,
            });
        }
        events
    }
}

struct ActiveScan {
    shared: Arc<ScanShared>,
    cancel: CancellationToken,
    task: JoinHandle<ScanExit>,
}

#[derive(Default)]
struct ScannerState {
    active: Option<ActiveScan>,
    selected: Option<SessionId>,
    last: Option<ScanSummary>,
}

type SharedDescriptors = Arc<Mutex<Box<dyn DescriptorSource>>>;

/// Starts, stops and reports on scans. Clones control the same scanner.
pub struct Scanner<S> {
    store: Arc<S>,
    camera: Arc<dyn CameraProvider>,
    descriptors: SharedDescriptors,
    events: RecognitionSink,
    config: ScannerConfig,
    state: Arc<tokio::sync::Mutex<ScannerState>>,
}

impl<S> Clone for Scanner<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            camera: Arc::clone(&self.camera),
            descriptors: Arc::clone(&self.descriptors),
            events: self.events.clone(),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: AttendanceStore> Scanner<S> {
    pub fn new(
        store: Arc<S>,
        camera: Arc<dyn CameraProvider>,
        descriptors: Box<dyn DescriptorSource>,
        events: RecognitionSink,
        config: ScannerConfig,
    ) -> Self {
        Self {
            store,
            camera,
            descriptors: Arc::new(Mutex::new(descriptors)),
            events,
            config,
            state: Arc::new(tokio::sync::Mutex::new(ScannerState::default())),
        }
    }

    /// Begin scanning for `session_id`.
    ///
    /// A scan already running is fully stopped first. Session and roster
    /// preconditions are checked before the camera is touched.
    pub async fn start(&self, session_id: SessionId) -> Result<ScanStarted, ScanError> {
        let mut state = self.state.lock().await;
        if let Some(previous) = finish(&mut state).await {
            tracing::info!(
                scan_id = %previous.scan_id,
                session_id = previous.session_id,
                "previous scan stopped before restart"
            );
        }
        state.selected = Some(session_id);

        let session = self.store.fetch_session(session_id).await?;
        if !session.is_active() {
            return Err(ScanError::SessionNotActive {
                session_id,
                status: session.status.as_str(),
            });
        }
        let entries = self.store.fetch_roster(session.course_id).await?;
        let roster = Arc::new(RosterIndex::build(&entries, self.config.match_threshold)?);

        let camera = Arc::clone(&self.camera);
        let warmup_frames = self.config.warmup_frames;
        let source = tokio::task::spawn_blocking(move || open_camera(&*camera, warmup_frames))
            .await
            .map_err(|e| ScanError::Worker(e.to_string()))?
            .map_err(|err| {
                tracing::warn!(session_id, kind = err.kind().as_str(), error = %err, "camera acquisition failed");
                err
            })?;

        let scan = ScanSession::new(session_id, Arc::clone(&roster));
        let started = ScanStarted {
            scan_id: scan.id(),
            session_id,
            course_id: session.course_id,
            roster_size: roster.len(),
        };
        let shared = Arc::new(ScanShared {
            started: started.clone(),
            started_at: Utc::now(),
            counters: ScanCounters::default(),
            recognized: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        let ctx = LoopContext {
            store: Arc::clone(&self.store),
            session,
            descriptors: Arc::clone(&self.descriptors),
            events: self.events.clone(),
            config: self.config.clone(),
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(run_scan(ctx, scan, source, cancel.clone()));

        tracing::info!(
            scan_id = %started.scan_id,
            session_id,
            course_id = started.course_id,
            roster_size = started.roster_size,
            "scan started"
        );
        state.active = Some(ActiveScan {
            shared,
            cancel,
            task,
        });
        Ok(started)
    }

    /// Stop the current scan. Returns once the camera is released.
    pub async fn stop(&self) -> Option<ScanSummary> {
        let mut state = self.state.lock().await;
        finish(&mut state).await
    }

    /// Stop the current scan only if it belongs to `session_id`.
    pub async fn stop_session(&self, session_id: SessionId) -> Option<ScanSummary> {
        let mut state = self.state.lock().await;
        let matches = state
            .active
            .as_ref()
            .is_some_and(|a| a.shared.started.session_id == session_id);
        if matches {
            finish(&mut state).await
        } else {
            None
        }
    }

    /// Make `session_id` the operator's current session. A scan of any other
    /// session is stopped; returns whether one was.
    pub async fn select_session(&self, session_id: SessionId) -> bool {
        let mut state = self.state.lock().await;
        state.selected = Some(session_id);
        let other = state
            .active
            .as_ref()
            .is_some_and(|a| a.shared.started.session_id != session_id);
        if other {
            finish(&mut state).await.is_some()
        } else {
            false
        }
    }

    pub async fn status(&self) -> ScannerStatus {
        let mut state = self.state.lock().await;
        if state.active.as_ref().is_some_and(|a| a.task.is_finished()) {
            finish(&mut state).await;
        }
        let current = state.active.as_ref().map(|a| a.shared.summary(None));
        ScannerStatus {
            state: if current.is_some() { "scanning" } else { "idle" },
            selected_session: state.selected,
            current,
            last: state.last.clone(),
        }
    }
}

/// Cancel the active scan (if any), wait for its task and keep its summary.
async fn finish(state: &mut ScannerState) -> Option<ScanSummary> {
    let active = state.active.take()?;
    active.cancel.cancel();
    let exit = match active.task.await {
        Ok(exit) => exit,
        Err(err) => {
            tracing::error!(error = %err, "scan task failed");
            ScanExit::Failed
        }
    };
    let summary = active.shared.summary(Some(exit));
    tracing::info!(
        scan_id = %summary.scan_id,
        session_id = summary.session_id,
        recognized = summary.recognized.len(),
        ?exit,
        "scan finished"
    );
    state.last = Some(summary.clone());
    Some(summary)
}

fn open_camera(
    provider: &dyn CameraProvider,
    warmup_frames: usize,
) -> Result<Box<dyn FrameSource>, CameraError> {
    let mut source = provider.open()?;
    // Discard warmup frames for exposure stabilisation
    if warmup_frames > 0 {
        tracing::debug!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            let _ = source.capture();
        }
    }
    Ok(source)
}

enum PollOutcome {
    Dark,
    Faces(Vec<Detection>),
}

enum PollError {
    Capture(CameraError),
    Descriptor(DescriptorError),
}

/// The camera travels with the poll and comes back with its result.
type PollResult = (Box<dyn FrameSource>, Result<PollOutcome, PollError>);

fn poll_once(
    mut source: Box<dyn FrameSource>,
    descriptors: SharedDescriptors,
    skip_dark: bool,
) -> PollResult {
    let outcome = capture_and_detect(source.as_mut(), &descriptors, skip_dark);
    (source, outcome)
}

fn capture_and_detect(
    source: &mut dyn FrameSource,
    descriptors: &Mutex<Box<dyn DescriptorSource>>,
    skip_dark: bool,
) -> Result<PollOutcome, PollError> {
    let frame = source.capture().map_err(PollError::Capture)?;
    if skip_dark && frame.is_dark {
        return Ok(PollOutcome::Dark);
    }
    let mut descriptors = descriptors.lock().unwrap_or_else(|p| p.into_inner());
    let detections = descriptors
        .detect(&frame.data, frame.width, frame.height)
        .map_err(PollError::Descriptor)?;
    Ok(PollOutcome::Faces(detections))
}

async fn wait_poll(slot: &mut Option<JoinHandle<PollResult>>) -> Result<PollResult, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

struct LoopContext<S> {
    store: Arc<S>,
    session: AttendanceSession,
    descriptors: SharedDescriptors,
    events: RecognitionSink,
    config: ScannerConfig,
    shared: Arc<ScanShared>,
}

impl<S: AttendanceStore> LoopContext<S> {
    fn publish(&self, scan: &ScanSession, event: RecognitionEvent) {
        let name = scan
            .roster
            .get(event.student_id)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        tracing::info!(
            scan_id = %event.scan_id,
            session_id = event.session_id,
            student_id = event.student_id,
            distance = event.distance,
            "student recognized"
        );
        self.shared
            .recognized
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecognizedStudent {
                student_id: event.student_id,
                name,
                distance: event.distance,
                at: event.timestamp,
            });
        if self.events.send(event).is_err() {
            tracing::warn!("reconciler is gone; recognition not recorded");
        }
    }

    /// Whether the session is still open on the backend. Errors other than
    /// a missing session keep the scan running.
    async fn session_still_active(&self) -> bool {
        match self.store.fetch_session(self.session.id).await {
            Ok(session) => session.is_active(),
            Err(StoreError::SessionNotFound(_)) => false,
            Err(err) => {
                tracing::warn!(session_id = self.session.id, error = %err, "session check failed");
                true
            }
        }
    }
}

async fn run_scan<S: AttendanceStore>(
    ctx: LoopContext<S>,
    mut scan: ScanSession,
    source: Box<dyn FrameSource>,
    cancel: CancellationToken,
) -> ScanExit {
    let counters = &ctx.shared.counters;
    let mut camera = Some(source);
    let mut in_flight: Option<JoinHandle<PollResult>> = None;
    let mut capture_failures = 0u32;

    let mut ticker = interval(ctx.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let check_every = ctx.config.session_check_interval;
    let mut session_check = interval_at(Instant::now() + check_every, check_every);
    session_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let exit = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break ScanExit::Stopped,
            joined = wait_poll(&mut in_flight) => {
                in_flight = None;
                let (source, result) = match joined {
                    Ok(polled) => polled,
                    Err(err) => {
                        tracing::error!(scan_id = %scan.id, error = %err, "poll worker failed");
                        break ScanExit::Failed;
                    }
                };
                camera = Some(source);
                // Results that land after a stop belong to no scan.
                if cancel.is_cancelled() {
                    break ScanExit::Stopped;
                }
                match result {
                    Ok(PollOutcome::Dark) => {
                        capture_failures = 0;
                        ScanCounters::bump(&counters.dark_frames, 1);
                    }
                    Ok(PollOutcome::Faces(detections)) => {
                        capture_failures = 0;
                        ScanCounters::bump(&counters.faces, detections.len() as u64);
                        for event in scan.resolve(&detections, Utc::now()) {
                            ctx.publish(&scan, event);
                        }
                    }
                    Err(PollError::Descriptor(err)) => {
                        ScanCounters::bump(&counters.inference_failures, 1);
                        tracing::warn!(scan_id = %scan.id, error = %err, "descriptor inference failed");
                    }
                    Err(PollError::Capture(err)) => {
                        ScanCounters::bump(&counters.inference_failures, 1);
                        capture_failures += 1;
                        tracing::warn!(scan_id = %scan.id, error = %err, capture_failures, "frame capture failed");
                        if capture_failures >= MAX_CONSECUTIVE_CAPTURE_FAILURES {
                            break ScanExit::CameraLost;
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                ScanCounters::bump(&counters.ticks, 1);
                match camera.take() {
                    Some(source) => {
                        let descriptors = Arc::clone(&ctx.descriptors);
                        let skip_dark = ctx.config.skip_dark_frames;
                        in_flight = Some(tokio::task::spawn_blocking(move || {
                            poll_once(source, descriptors, skip_dark)
                        }));
                    }
                    None => {
                        ScanCounters::bump(&counters.skipped_ticks, 1);
                        tracing::trace!(scan_id = %scan.id, "poll still in flight; tick skipped");
                    }
                }
            }
            _ = session_check.tick() => {
                let active = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    active = ctx.session_still_active() => Some(active),
                };
                match active {
                    None => break ScanExit::Stopped,
                    Some(false) => {
                        tracing::info!(session_id = scan.session_id, "session completed remotely; stopping scan");
                        break ScanExit::SessionEnded;
                    }
                    Some(true) => {}
                }
            }
        }
    };

    // Wait out any in-flight poll; its result and the camera it carries are dropped.
    if let Some(handle) = in_flight.take() {
        let _ = handle.await;
    }
    drop(camera);
    tracing::debug!(scan_id = %scan.id, ?exit, "scan loop exited; camera released");
    exit
}

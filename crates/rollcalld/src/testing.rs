//! In-memory fakes for the store, the camera and the descriptor source.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rollcall_core::{
    AttendanceSession, AttendanceStore, AttendanceSubmission, BoundingBox, CourseId, Descriptor,
    DescriptorError, DescriptorSource, Detection, RecognitionEvent, RosterEntry, SessionId,
    SessionStatus, StoreError, StudentId, SubmitOutcome,
};
use rollcall_hw::{CameraError, CameraErrorKind, CameraProvider, Frame, FrameSource};
use uuid::Uuid;

pub fn roster_entry(id: StudentId, encoding: Option<&str>) -> RosterEntry {
    RosterEntry {
        id,
        name: format!("Student {id}"),
        photo_url: None,
        face_encoding: encoding.map(str::to_string),
    }
}

pub fn detection(values: &[f32]) -> Detection {
    Detection {
        descriptor: Descriptor::new(values.to_vec()),
        geometry: BoundingBox::default(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Present,
    Absent,
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<SessionId, AttendanceSession>,
    rosters: HashMap<CourseId, Vec<RosterEntry>>,
    records: BTreeMap<(SessionId, StudentId), Mark>,
    submissions: Vec<AttendanceSubmission>,
    failures: VecDeque<StoreError>,
    submit_delay: Duration,
    ended: Vec<(SessionId, Option<i64>)>,
}

/// Attendance backend held in memory. Upserts report `AlreadyRecorded`
/// for an existing (session, student) record.
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_session(id: SessionId, course_id: CourseId) -> AttendanceSession {
        AttendanceSession {
            id,
            course_id,
            status: SessionStatus::Active,
            date: None,
            start_time: None,
            end_time: None,
            duration_minutes: None,
        }
    }

    pub fn event(session_id: SessionId, student_id: StudentId, distance: f32) -> RecognitionEvent {
        RecognitionEvent {
            scan_id: Uuid::new_v4(),
            session_id,
            student_id,
            distance,
            timestamp: Utc::now(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    pub fn add_course(&self, course_id: CourseId, roster: Vec<RosterEntry>) {
        self.state().rosters.insert(course_id, roster);
    }

    pub fn add_session(&self, session: AttendanceSession) {
        self.state().sessions.insert(session.id, session);
    }

    pub fn set_session_status(&self, session_id: SessionId, status: SessionStatus) {
        if let Some(session) = self.state().sessions.get_mut(&session_id) {
            session.status = status;
        }
    }

    pub fn session_status(&self, session_id: SessionId) -> Option<SessionStatus> {
        self.state().sessions.get(&session_id).map(|s| s.status)
    }

    /// The next `count` submissions fail with `err`.
    pub fn fail_next_submits(&self, err: StoreError, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            state.failures.push_back(err.clone());
        }
    }

    /// Every later submit waits this long before reaching the records.
    pub fn set_submit_delay(&self, delay: Duration) {
        self.state().submit_delay = delay;
    }

    fn marked(&self, session_id: SessionId, mark: Mark) -> Vec<StudentId> {
        self.state()
            .records
            .iter()
            .filter(|((session, _), m)| *session == session_id && **m == mark)
            .map(|((_, student), _)| *student)
            .collect()
    }

    pub fn present(&self, session_id: SessionId) -> Vec<StudentId> {
        self.marked(session_id, Mark::Present)
    }

    pub fn absent(&self, session_id: SessionId) -> Vec<StudentId> {
        self.marked(session_id, Mark::Absent)
    }

    pub fn submissions(&self) -> Vec<AttendanceSubmission> {
        self.state().submissions.clone()
    }

    pub fn ended(&self) -> Vec<(SessionId, Option<i64>)> {
        self.state().ended.clone()
    }
}

impl AttendanceStore for FakeStore {
    async fn fetch_roster(&self, course_id: CourseId) -> Result<Vec<RosterEntry>, StoreError> {
        Ok(self.state().rosters.get(&course_id).cloned().unwrap_or_default())
    }

    async fn fetch_session(&self, session_id: SessionId) -> Result<AttendanceSession, StoreError> {
        self.state()
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or(StoreError::SessionNotFound(session_id))
    }

    async fn submit_attendance(
        &self,
        submission: AttendanceSubmission,
    ) -> Result<SubmitOutcome, StoreError> {
        let delay = self.state().submit_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.submissions.push(submission.clone());
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        let key = (submission.session_id, submission.student_id);
        if state.records.contains_key(&key) {
            return Ok(SubmitOutcome::AlreadyRecorded);
        }
        state.records.insert(key, Mark::Present);
        Ok(SubmitOutcome::Recorded)
    }

    async fn end_session(
        &self,
        session_id: SessionId,
        duration_minutes: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let course_id = match state.sessions.get_mut(&session_id) {
            Some(session) => {
                session.status = SessionStatus::Completed;
                session.duration_minutes = duration_minutes;
                session.course_id
            }
            None => return Err(StoreError::SessionNotFound(session_id)),
        };
        let enrolled: Vec<StudentId> = state
            .rosters
            .get(&course_id)
            .map(|r| r.iter().map(|e| e.id).collect())
            .unwrap_or_default();
        for student_id in enrolled {
            state
                .records
                .entry((session_id, student_id))
                .or_insert(Mark::Absent);
        }
        state.ended.push((session_id, duration_minutes));
        Ok(())
    }
}

/// Camera provider whose sources count themselves while open.
#[derive(Default)]
pub struct FakeCamera {
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
    failure: Mutex<Option<CameraErrorKind>>,
    dark: Mutex<bool>,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, kind: CameraErrorKind) {
        *self.failure.lock().unwrap() = Some(kind);
    }

    pub fn set_dark(&self, dark: bool) {
        *self.dark.lock().unwrap() = dark;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Sources currently open.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

impl CameraProvider for FakeCamera {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = *self.failure.lock().unwrap() {
            let detail = "/dev/video9".to_string();
            return Err(match kind {
                CameraErrorKind::Permission => CameraError::PermissionDenied(detail),
                CameraErrorKind::NotFound => CameraError::DeviceNotFound(detail),
                CameraErrorKind::DeviceBusy => CameraError::DeviceBusy(detail),
                CameraErrorKind::Unknown => CameraError::CaptureFailed(detail),
            });
        }
        let now_live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now_live, Ordering::SeqCst);
        Ok(Box::new(FakeFrames {
            sequence: 0,
            dark: *self.dark.lock().unwrap(),
            live: Arc::clone(&self.live),
        }))
    }
}

struct FakeFrames {
    sequence: u32,
    dark: bool,
    live: Arc<AtomicUsize>,
}

impl FrameSource for FakeFrames {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.sequence += 1;
        let level = if self.dark { 0 } else { 128 };
        Ok(Frame::from_gray(vec![level; 16], 4, 4, self.sequence))
    }
}

impl Drop for FakeFrames {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted detections shared between a test and its [`ScriptedDescriptors`].
#[derive(Default)]
pub struct DescriptorScript {
    queued: Mutex<VecDeque<Result<Vec<Detection>, DescriptorError>>>,
    fallback: Mutex<Vec<Detection>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl DescriptorScript {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returned once, before falling back to the steady answer.
    pub fn push(&self, result: Result<Vec<Detection>, DescriptorError>) {
        self.queued.lock().unwrap().push_back(result);
    }

    /// Returned for every call once the queue is empty.
    pub fn always(&self, detections: Vec<Detection>) {
        *self.fallback.lock().unwrap() = detections;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub struct ScriptedDescriptors(pub Arc<DescriptorScript>);

impl DescriptorSource for ScriptedDescriptors {
    fn detect(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Vec<Detection>, DescriptorError> {
        let script = &self.0;
        script.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *script.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(result) = script.queued.lock().unwrap().pop_front() {
            return result;
        }
        Ok(script.fallback.lock().unwrap().clone())
    }
}

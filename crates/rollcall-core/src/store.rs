//! The `AttendanceStore` trait: the backend operations the scanner consumes.
//!
//! The backend owns sessions, rosters and attendance records; this crate only
//! reads rosters and sessions and appends attendance. Implementations live in
//! the daemon (HTTP) and in tests (in-memory).

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AttendanceSession, CourseId, SessionId, StudentId};

/// One enrolled student as returned by the roster endpoint.
///
/// `face_encoding` is the serialised reference descriptor (a JSON array);
/// it is parsed and validated when the roster index is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: StudentId,
    pub name: String,
    pub photo_url: Option<String>,
    pub face_encoding: Option<String>,
}

/// A "present" write for one student in one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSubmission {
    pub session_id: SessionId,
    pub student_id: StudentId,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new present record was written.
    Recorded,
    /// The store already held a record for this (session, student).
    AlreadyRecorded,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("store returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("store rejected request: {0}")]
    Rejected(String),
    #[error("malformed store response: {0}")]
    Decode(String),
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
}

impl StoreError {
    /// Whether resubmitting the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            StoreError::Rejected(_) | StoreError::Decode(_) | StoreError::SessionNotFound(_) => {
                false
            }
        }
    }
}

/// Backend operations used by the recognition loop and the reconciler.
///
/// All methods return `Send` futures so implementations can be shared
/// across tokio tasks.
pub trait AttendanceStore: Send + Sync + 'static {
    /// Students enrolled in a course, with their serialised descriptors.
    fn fetch_roster(
        &self,
        course_id: CourseId,
    ) -> impl Future<Output = Result<Vec<RosterEntry>, StoreError>> + Send + '_;

    /// Current state of one attendance session.
    fn fetch_session(
        &self,
        session_id: SessionId,
    ) -> impl Future<Output = Result<AttendanceSession, StoreError>> + Send + '_;

    /// Upsert a present record keyed by (session, student).
    fn submit_attendance(
        &self,
        submission: AttendanceSubmission,
    ) -> impl Future<Output = Result<SubmitOutcome, StoreError>> + Send + '_;

    /// Complete the session and backfill absent records for everyone
    /// enrolled without a record.
    fn end_session(
        &self,
        session_id: SessionId,
        duration_minutes: Option<i64>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + '_;
}

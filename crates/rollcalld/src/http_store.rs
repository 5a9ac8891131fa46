//! [`HttpStore`]: the attendance backend reached over its JSON endpoints.
//!
//! The backend answers with loosely-typed JSON (ids as numbers or strings,
//! several spellings per field, localised status labels). Everything is
//! normalised into `rollcall_core` types here and nowhere else.

use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use reqwest::{Client, Response, StatusCode};
use rollcall_core::{
    AttendanceSession, AttendanceStore, AttendanceSubmission, CourseId, RosterEntry, SessionId,
    SessionStatus, StoreError, SubmitOutcome,
};
use serde::Deserialize;
use serde_json::Value;

/// HTTP client for the attendance backend. Cheap to clone.
#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn post_json(&self, endpoint: &str, body: &Value) -> Result<Response, StoreError> {
        self.client
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(format!("POST {endpoint}: {e}")))
    }
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RosterResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    students: Vec<StudentDto>,
}

#[derive(Debug, Deserialize)]
struct StudentDto {
    id: Value,
    #[serde(default, alias = "full_name")]
    name: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
    #[serde(default)]
    face_encoding: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SessionDto {
    id: Value,
    #[serde(default, alias = "courseId")]
    course_id: Option<Value>,
    #[serde(default, alias = "session_date")]
    date: Option<String>,
    #[serde(default, alias = "start_time")]
    time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default, alias = "duration_minutes")]
    duration: Option<Value>,
    #[serde(default)]
    status: Option<String>,
}

fn loose_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

impl StudentDto {
    fn into_entry(self) -> Option<RosterEntry> {
        let id = loose_i64(&self.id)?;
        let face_encoding = match self.face_encoding {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            Some(array @ Value::Array(_)) => Some(array.to_string()),
            _ => None,
        };
        Some(RosterEntry {
            id,
            name: self
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "Student".to_string()),
            photo_url: self.photo_url.filter(|p| !p.is_empty()),
            face_encoding,
        })
    }
}

impl SessionDto {
    fn into_session(self) -> Option<AttendanceSession> {
        Some(AttendanceSession {
            id: loose_i64(&self.id)?,
            course_id: self.course_id.as_ref().and_then(loose_i64).unwrap_or(0),
            status: self
                .status
                .as_deref()
                .map(SessionStatus::from_label)
                .unwrap_or(SessionStatus::Active),
            date: self.date.as_deref().and_then(parse_date),
            start_time: self.time.as_deref().and_then(parse_time),
            end_time: self.end_time.as_deref().and_then(parse_time),
            duration_minutes: self.duration.as_ref().and_then(loose_i64),
        })
    }
}

fn roster_from_response(body: RosterResponse) -> Result<Vec<RosterEntry>, StoreError> {
    if !body.ok {
        return Err(StoreError::Rejected(
            body.error.unwrap_or_else(|| "roster request failed".into()),
        ));
    }
    let total = body.students.len();
    let entries: Vec<RosterEntry> = body
        .students
        .into_iter()
        .filter_map(StudentDto::into_entry)
        .collect();
    if entries.len() != total {
        tracing::warn!(
            dropped = total - entries.len(),
            "roster rows without a numeric id ignored"
        );
    }
    Ok(entries)
}

fn session_from_rows(rows: Vec<SessionDto>, session_id: SessionId) -> Result<AttendanceSession, StoreError> {
    rows.into_iter()
        .filter_map(SessionDto::into_session)
        .find(|s| s.id == session_id)
        .ok_or(StoreError::SessionNotFound(session_id))
}

/// Map a non-success HTTP status onto a [`StoreError`], keeping the
/// backend's `error` message when the body carries one.
async fn status_error(resp: Response) -> StoreError {
    let status = resp.status().as_u16();
    let message = resp
        .json::<Envelope>()
        .await
        .ok()
        .and_then(|e| e.error)
        .unwrap_or_default();
    StoreError::Status { status, message }
}

async fn expect_ok(resp: Response, endpoint: &str) -> Result<(), StoreError> {
    if !resp.status().is_success() {
        return Err(status_error(resp).await);
    }
    let envelope: Envelope = resp
        .json()
        .await
        .map_err(|e| StoreError::Decode(format!("{endpoint}: {e}")))?;
    if envelope.ok {
        Ok(())
    } else {
        Err(StoreError::Rejected(
            envelope.error.unwrap_or_else(|| format!("{endpoint} failed")),
        ))
    }
}

impl AttendanceStore for HttpStore {
    async fn fetch_roster(&self, course_id: CourseId) -> Result<Vec<RosterEntry>, StoreError> {
        let resp = self
            .client
            .get(self.url("course_students.php"))
            .query(&[("course_id", course_id)])
            .send()
            .await
            .map_err(|e| StoreError::Transport(format!("GET course_students.php: {e}")))?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let body: RosterResponse = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(format!("course_students.php: {e}")))?;
        roster_from_response(body)
    }

    async fn fetch_session(&self, session_id: SessionId) -> Result<AttendanceSession, StoreError> {
        let resp = self
            .client
            .get(self.url("attendance.php"))
            .send()
            .await
            .map_err(|e| StoreError::Transport(format!("GET attendance.php: {e}")))?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }
        let rows: Vec<SessionDto> = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(format!("attendance.php: {e}")))?;
        session_from_rows(rows, session_id)
    }

    async fn submit_attendance(
        &self,
        submission: AttendanceSubmission,
    ) -> Result<SubmitOutcome, StoreError> {
        let body = serde_json::to_value(&submission)
            .map_err(|e| StoreError::Decode(format!("encoding submission: {e}")))?;
        let resp = self.post_json("record_attendance.php", &body).await?;

        if resp.status() == StatusCode::CONFLICT {
            return Ok(SubmitOutcome::AlreadyRecorded);
        }
        expect_ok(resp, "record_attendance.php").await?;
        Ok(SubmitOutcome::Recorded)
    }

    async fn end_session(
        &self,
        session_id: SessionId,
        duration_minutes: Option<i64>,
    ) -> Result<(), StoreError> {
        let body = serde_json::json!({
            "session_id": session_id,
            "duration": duration_minutes,
        });
        let resp = self.post_json("end_attendance_session.php", &body).await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::SessionNotFound(session_id));
        }
        expect_ok(resp, "end_attendance_session.php").await
    }
}

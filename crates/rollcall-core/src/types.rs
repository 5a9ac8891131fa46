use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type StudentId = i64;
pub type SessionId = i64;
pub type CourseId = i64;

/// Bounding box of a detected face. Carried along for diagnostics only;
/// matching never looks at it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default)]
    pub confidence: f32,
}

/// Face descriptor vector (128-dimensional for the deployed recognition model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Parse a descriptor serialised as a JSON array of numbers.
    ///
    /// Returns `None` for malformed JSON, an empty array or non-finite values.
    pub fn from_json(raw: &str) -> Option<Self> {
        let values: Vec<f32> = serde_json::from_str(raw.trim()).ok()?;
        let descriptor = Self { values };
        if descriptor.is_empty() || !descriptor.is_finite() {
            return None;
        }
        Some(descriptor)
    }

    /// Euclidean distance between two descriptors of equal length.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A student of the course roster with a usable reference descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledStudent {
    pub id: StudentId,
    pub name: String,
    pub photo_url: Option<String>,
    pub descriptor: Descriptor,
}

/// Emitted once per student per scan, the first time the student is matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionEvent {
    pub scan_id: Uuid,
    pub session_id: SessionId,
    pub student_id: StudentId,
    pub distance: f32,
    pub timestamp: DateTime<Utc>,
}

impl RecognitionEvent {
    pub fn confidence(&self) -> f32 {
        confidence_from_distance(self.distance)
    }
}

/// Map a descriptor distance onto a confidence score in [0, 1].
pub fn confidence_from_distance(distance: f32) -> f32 {
    (1.0 - distance).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    /// Normalise a backend status label.
    ///
    /// The backend reports completed sessions as `tamamlandi`/`Tamamlandi`;
    /// every other label (`aktif`, `Devam Ediyor`, ...) is an open session.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        if label.starts_with("tamam") || label == "completed" {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

/// Attendance session record as held by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSession {
    pub id: SessionId,
    pub course_id: CourseId,
    pub status: SessionStatus,
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub duration_minutes: Option<i64>,
}

impl AttendanceSession {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Start of the session; sessions without a date are taken to start on `today`.
    pub fn started_at(&self, today: NaiveDate) -> Option<NaiveDateTime> {
        let start = self.start_time?;
        Some(self.date.unwrap_or(today).and_time(start))
    }

    /// Whole minutes elapsed since the recorded start, rounded and never negative.
    pub fn elapsed_minutes(&self, now: NaiveDateTime) -> Option<i64> {
        let started = self.started_at(now.date())?;
        let secs = (now - started).num_seconds().max(0);
        Some((secs as f64 / 60.0).round() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(date: Option<&str>, start: Option<&str>) -> AttendanceSession {
        AttendanceSession {
            id: 1,
            course_id: 3,
            status: SessionStatus::Active,
            date: date.map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()),
            start_time: start.map(|t| NaiveTime::parse_from_str(t, "%H:%M").unwrap()),
            end_time: None,
            duration_minutes: None,
        }
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_descriptor_from_json() {
        let d = Descriptor::from_json("[0.1, -0.2, 0.3]").unwrap();
        assert_eq!(d.len(), 3);
        assert!(Descriptor::from_json("[]").is_none());
        assert!(Descriptor::from_json("not json").is_none());
        assert!(Descriptor::from_json("{\"a\": 1}").is_none());
        assert!(Descriptor::from_json("").is_none());
    }

    #[test]
    fn test_confidence_from_distance() {
        assert!((confidence_from_distance(0.1) - 0.9).abs() < 1e-6);
        assert_eq!(confidence_from_distance(0.0), 1.0);
        assert_eq!(confidence_from_distance(1.4), 0.0);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(SessionStatus::from_label("Tamamlandi"), SessionStatus::Completed);
        assert_eq!(SessionStatus::from_label("tamamlandi"), SessionStatus::Completed);
        assert_eq!(SessionStatus::from_label("completed"), SessionStatus::Completed);
        assert_eq!(SessionStatus::from_label("Devam Ediyor"), SessionStatus::Active);
        assert_eq!(SessionStatus::from_label("aktif"), SessionStatus::Active);
        assert_eq!(SessionStatus::from_label(""), SessionStatus::Active);
    }

    #[test]
    fn test_elapsed_minutes() {
        let s = session(Some("2026-03-02"), Some("09:00"));
        assert_eq!(s.elapsed_minutes(at("2026-03-02 09:50:00")), Some(50));
        assert_eq!(s.elapsed_minutes(at("2026-03-02 09:00:40")), Some(1));
    }

    #[test]
    fn test_elapsed_minutes_never_negative() {
        let s = session(Some("2026-03-02"), Some("09:00"));
        assert_eq!(s.elapsed_minutes(at("2026-03-02 08:00:00")), Some(0));
    }

    #[test]
    fn test_elapsed_minutes_without_date_uses_today() {
        let s = session(None, Some("10:15"));
        assert_eq!(s.elapsed_minutes(at("2026-03-02 10:45:00")), Some(30));
    }

    #[test]
    fn test_elapsed_minutes_without_start() {
        let s = session(Some("2026-03-02"), None);
        assert_eq!(s.elapsed_minutes(at("2026-03-02 10:45:00")), None);
    }
}

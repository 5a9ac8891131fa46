//! rollcall-core — Face-descriptor matching for classroom attendance.
//!
//! Holds the data model shared by the daemon and CLI, the per-session
//! roster index used to resolve probe descriptors to enrolled students,
//! and the traits at the two external seams: the descriptor source
//! (face model) and the attendance store (backend).

pub mod descriptor;
pub mod roster;
pub mod store;
pub mod types;

pub use descriptor::{DescriptorError, DescriptorSource, Detection};
pub use roster::{MatchOutcome, RosterError, RosterIndex, StudentMatch, DEFAULT_MATCH_THRESHOLD};
pub use store::{AttendanceStore, AttendanceSubmission, RosterEntry, StoreError, SubmitOutcome};
pub use types::{
    confidence_from_distance, AttendanceSession, BoundingBox, CourseId, Descriptor,
    EnrolledStudent, RecognitionEvent, SessionId, SessionStatus, StudentId,
};

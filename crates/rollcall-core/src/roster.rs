//! Per-session roster index: resolves probe descriptors to enrolled students.

use thiserror::Error;

use crate::store::RosterEntry;
use crate::types::{Descriptor, EnrolledStudent, StudentId};

/// Largest descriptor distance still accepted as the same person.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

/// Distances closer than this to the current best count as a tie.
const TIE_TOLERANCE: f32 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RosterError {
    #[error("no student has a usable face descriptor ({total} enrolled)")]
    Empty { total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StudentMatch {
    pub student_id: StudentId,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchOutcome {
    Matched(StudentMatch),
    NoMatch,
}

/// Immutable lookup of the students that can be recognised in one scan.
///
/// Every entry carries a finite, non-empty reference descriptor of the same
/// length. Entries are kept sorted by student id.
#[derive(Debug, Clone)]
pub struct RosterIndex {
    students: Vec<EnrolledStudent>,
    dimension: usize,
    threshold: f32,
}

impl RosterIndex {
    /// Build the index from the raw roster, dropping students without a
    /// usable descriptor.
    ///
    /// The descriptor length is fixed by the lowest student id with a valid
    /// descriptor; descriptors of any other length are treated as malformed.
    pub fn build(raw: &[RosterEntry], threshold: f32) -> Result<Self, RosterError> {
        let mut sorted: Vec<&RosterEntry> = raw.iter().collect();
        sorted.sort_by_key(|entry| entry.id);

        let mut students: Vec<EnrolledStudent> = Vec::with_capacity(sorted.len());
        let mut dimension = 0usize;

        for entry in sorted {
            if students.last().is_some_and(|s| s.id == entry.id) {
                tracing::warn!(student_id = entry.id, "duplicate roster entry ignored");
                continue;
            }
            let Some(descriptor) = entry.face_encoding.as_deref().and_then(Descriptor::from_json)
            else {
                tracing::debug!(student_id = entry.id, "no usable face descriptor; excluded");
                continue;
            };
            if dimension == 0 {
                dimension = descriptor.len();
            } else if descriptor.len() != dimension {
                tracing::warn!(
                    student_id = entry.id,
                    expected = dimension,
                    actual = descriptor.len(),
                    "descriptor length mismatch; excluded"
                );
                continue;
            }
            students.push(EnrolledStudent {
                id: entry.id,
                name: entry.name.clone(),
                photo_url: entry.photo_url.clone(),
                descriptor,
            });
        }

        if students.is_empty() {
            return Err(RosterError::Empty { total: raw.len() });
        }

        tracing::debug!(
            enrolled = raw.len(),
            usable = students.len(),
            dimension,
            threshold,
            "roster index built"
        );

        Ok(Self {
            students,
            dimension,
            threshold,
        })
    }

    /// Nearest enrolled student to `probe`, if within the threshold.
    ///
    /// Always visits every entry. Among equidistant candidates the lowest
    /// student id wins.
    pub fn find_best_match(&self, probe: &Descriptor) -> MatchOutcome {
        if probe.len() != self.dimension || !probe.is_finite() {
            return MatchOutcome::NoMatch;
        }

        let mut best: Option<StudentMatch> = None;
        for student in &self.students {
            let distance = probe.euclidean_distance(&student.descriptor);
            let better = match best {
                None => true,
                Some(prev) => distance < prev.distance - TIE_TOLERANCE,
            };
            if better {
                best = Some(StudentMatch {
                    student_id: student.id,
                    distance,
                });
            }
        }

        match best {
            Some(m) if m.distance <= self.threshold => MatchOutcome::Matched(m),
            _ => MatchOutcome::NoMatch,
        }
    }

    pub fn get(&self, id: StudentId) -> Option<&EnrolledStudent> {
        self.students
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|idx| &self.students[idx])
    }

    pub fn students(&self) -> &[EnrolledStudent] {
        &self.students
    }

    pub fn len(&self) -> usize {
        self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

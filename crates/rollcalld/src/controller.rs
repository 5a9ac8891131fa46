//! Operator-facing orchestration of the scanner and the reconciler.

use std::collections::BTreeMap;

use rollcall_core::{AttendanceStore, SessionId};
use serde::Serialize;

use crate::outbox::PendingWrite;
use crate::reconciler::{ReconcileError, Reconciler, RetrySummary, SessionClosed, SessionTally};
use crate::scanner::{ScanError, ScanStarted, ScanSummary, Scanner, ScannerStatus};

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub scanner: ScannerStatus,
    pub tallies: BTreeMap<SessionId, SessionTally>,
    pub pending_writes: Vec<PendingWrite>,
}

pub struct Controller<S> {
    scanner: Scanner<S>,
    reconciler: Reconciler<S>,
}

impl<S> Clone for Controller<S> {
    fn clone(&self) -> Self {
        Self {
            scanner: self.scanner.clone(),
            reconciler: self.reconciler.clone(),
        }
    }
}

impl<S: AttendanceStore> Controller<S> {
    pub fn new(scanner: Scanner<S>, reconciler: Reconciler<S>) -> Self {
        Self {
            scanner,
            reconciler,
        }
    }

    pub async fn start_scan(&self, session_id: SessionId) -> Result<ScanStarted, ScanError> {
        self.scanner.start(session_id).await
    }

    pub async fn stop_scan(&self) -> Option<ScanSummary> {
        self.scanner.stop().await
    }

    pub async fn select_session(&self, session_id: SessionId) -> bool {
        self.scanner.select_session(session_id).await
    }

    /// Stop any scan of the session, then complete it remotely.
    pub async fn end_session(&self, session_id: SessionId) -> Result<SessionClosed, ReconcileError> {
        if let Some(summary) = self.scanner.stop_session(session_id).await {
            tracing::info!(
                session_id,
                recognized = summary.recognized.len(),
                "scan stopped for session end"
            );
        }
        self.reconciler.end_session(session_id).await
    }

    pub async fn retry_pending(&self) -> Result<RetrySummary, ReconcileError> {
        self.reconciler.retry_pending().await
    }

    pub async fn status(&self) -> Result<StatusReport, ReconcileError> {
        Ok(StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            scanner: self.scanner.status().await,
            tallies: self.reconciler.tallies().into_iter().collect(),
            pending_writes: self.reconciler.outbox().list(None).await?,
        })
    }
}

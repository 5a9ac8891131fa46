use zbus::interface;

use crate::controller::Controller;
use crate::http_store::HttpStore;
use crate::reconciler::ReconcileError;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub controller: Controller<HttpStore>,
}

fn failed(category: &str, err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("{category}: {err}"))
}

fn reconcile_failed(err: ReconcileError) -> zbus::fdo::Error {
    let category = match &err {
        ReconcileError::RemoteWrite(_) => "remote-write",
        ReconcileError::Outbox(_) => "outbox",
        ReconcileError::PendingWrites { .. } => "pending-writes",
    };
    failed(category, err)
}

fn to_json(value: &impl serde::Serialize) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| failed("internal", e))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start scanning for a session. Returns the scan as JSON.
    async fn start_scan(&self, session_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(session_id, "start_scan requested");
        match self.controller.start_scan(session_id).await {
            Ok(started) => to_json(&started),
            Err(err) => {
                tracing::warn!(session_id, error = %err, "start_scan refused");
                Err(failed(&err.category(), err))
            }
        }
    }

    /// Stop the current scan. Returns false when nothing was scanning.
    async fn stop_scan(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop_scan requested");
        Ok(self.controller.stop_scan().await.is_some())
    }

    /// Select the operator's session; a scan of any other session stops.
    async fn select_session(&self, session_id: i64) -> zbus::fdo::Result<bool> {
        tracing::info!(session_id, "select_session requested");
        Ok(self.controller.select_session(session_id).await)
    }

    /// End a session and backfill absences. Returns a JSON summary.
    async fn end_session(&self, session_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(session_id, "end_session requested");
        let closed = self
            .controller
            .end_session(session_id)
            .await
            .map_err(|err| {
                tracing::warn!(session_id, error = %err, "end_session failed");
                reconcile_failed(err)
            })?;
        to_json(&closed)
    }

    /// Resubmit every queued attendance write. Returns how many succeeded.
    async fn retry_pending(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("retry_pending requested");
        let summary = self
            .controller
            .retry_pending()
            .await
            .map_err(reconcile_failed)?;
        Ok(summary.succeeded as u32)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let report = self.controller.status().await.map_err(reconcile_failed)?;
        to_json(&report)
    }
}

//! Client side of the attendance REST API.

pub mod http;

pub use http::HttpAttendanceApi;

use crate::database::models::{AttendanceEntry, Session};
use crate::error::ScanError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The subset of the REST API the scan engine depends on.
#[async_trait]
pub trait AttendanceApi: Send + Sync {
    async fn list_active_sessions(&self) -> Result<Vec<Session>, ScanError>;

    async fn session_attendance(&self, session_id: i64) -> Result<Vec<AttendanceEntry>, ScanError>;

    /// Submits a batch of offline scans. The server deduplicates identical records,
    /// so resubmitting a batch is safe.
    async fn sync_records(&self, records: &[SyncRecord]) -> Result<SyncResponse, ScanError>;

    async fn create_session(&self, new_session: &NewSession) -> Result<Session, ScanError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub session_id: i64,
    pub qr_code: String,
    pub scanned_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SyncRequest<'a> {
    pub records: &'a [SyncRecord],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    #[serde(default)]
    pub success_count: Option<u64>,
    #[serde(default)]
    pub results: Option<Vec<SyncRecordResult>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Per-record outcome. Entries line up with the submitted records by position
/// unless `index` says otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecordResult {
    #[serde(default)]
    pub index: Option<usize>,
    pub success: bool,
    /// Set when the server already held an identical record.
    #[serde(default)]
    pub duplicate: bool,
    #[serde(default)]
    pub attendance_id: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SyncRecordResult {
    pub fn acknowledged(&self) -> bool {
        self.success || self.duplicate
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub name: String,
    pub date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_request_uses_wire_names() {
        let records = vec![SyncRecord {
            session_id: 42,
            qr_code: "STU-001".to_string(),
            scanned_at: "2025-03-01T09:00:00Z".parse().unwrap(),
        }];
        let body = serde_json::to_value(SyncRequest { records: &records }).unwrap();
        assert_eq!(body["records"][0]["sessionId"], 42);
        assert_eq!(body["records"][0]["qrCode"], "STU-001");
        assert!(body["records"][0]["scannedAt"].is_string());
    }

    #[test]
    fn sync_response_tolerates_missing_results() {
        let response: SyncResponse =
            serde_json::from_str(r#"{"success": true, "successCount": 3}"#).unwrap();
        assert!(response.success);
        assert_eq!(response.success_count, Some(3));
        assert!(response.results.is_none());

        let response: SyncResponse = serde_json::from_str(
            r#"{"success": true, "successCount": 1, "results": [
                {"success": true, "attendanceId": 17},
                {"success": false, "duplicate": true},
                {"success": false, "error": "unknown QR code"}
            ]}"#,
        )
        .unwrap();
        let results = response.results.unwrap();
        assert!(results[0].acknowledged());
        assert_eq!(results[0].attendance_id, Some(17));
        assert!(results[1].acknowledged());
        assert!(!results[2].acknowledged());
    }
}

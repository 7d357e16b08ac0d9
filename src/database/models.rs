use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub local_id: i64,
    pub session_id: i64,
    pub code: String,
    pub scanned_at: DateTime<Utc>,
    pub sync_state: SyncState,
    pub server_id: Option<i64>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl ScanRecord {
    pub fn is_pending(&self) -> bool {
        self.sync_state == SyncState::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
        }
    }
}

impl FromStr for SyncState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncState::Pending),
            "synced" => Ok(SyncState::Synced),
            _ => Err(anyhow::anyhow!("Invalid sync state: {}", s)),
        }
    }
}

/// An attendance session as served by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: i64,
    pub name: String,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub status: SessionStatus,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Server-side attendance entry, the source of truth for who has checked in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceEntry {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub student_id: Option<i64>,
    #[serde(default)]
    pub student: Option<StudentSummary>,
    pub scanned_at: DateTime<Utc>,
    #[serde(default)]
    pub is_offline: bool,
}

impl AttendanceEntry {
    pub fn display_name(&self) -> String {
        match &self.student {
            Some(student) => student
                .full_name_english
                .clone()
                .unwrap_or_else(|| student.username.clone()),
            None => match self.student_id {
                Some(id) => format!("student #{}", id),
                None => "unknown student".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub id: i64,
    #[serde(default)]
    pub full_name_english: Option<String>,
    pub username: String,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("session {0} not found")]
    SessionNotFound(i64),
    #[error("identity {0:?} not found")]
    IdentityNotFound(String),
    #[error("invalid stored value: {0}")]
    InvalidDbValue(String),
}

/// Attendance status for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Absent,
    Late,
    Excused,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
            Self::Late => "late",
            Self::Excused => "excused",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "present" => Ok(Self::Present),
            "absent" => Ok(Self::Absent),
            "late" => Ok(Self::Late),
            "excused" => Ok(Self::Excused),
            _ => Err(StoreError::InvalidDbValue(format!(
                "unknown attendance status: {value}"
            ))),
        }
    }
}

/// How a record was checked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInMethod {
    FaceRecognition,
    Manual,
}

impl CheckInMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FaceRecognition => "face_recognition",
            Self::Manual => "manual",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "face_recognition" => Ok(Self::FaceRecognition),
            "manual" => Ok(Self::Manual),
            _ => Err(StoreError::InvalidDbValue(format!(
                "unknown check-in method: {value}"
            ))),
        }
    }
}

/// One attendance record; at most one per (session, student).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub session_id: i64,
    pub student_id: String,
    pub status: AttendanceStatus,
    pub check_in_time: DateTime<Utc>,
    pub method: CheckInMethod,
    pub confidence: f32,
    pub liveness_verified: bool,
    pub recorded_by: Option<String>,
}

/// A course sitting during which recognition attempts are valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: i64,
    pub course: String,
    pub date: String,
    pub starts_at: String,
    pub ends_at: String,
}

/// Result of one `mark` call.
///
/// `AlreadyExists` is a success, not an error: it carries the record the
/// first caller created, unmutated.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    Created(AttendanceRecord),
    AlreadyExists(AttendanceRecord),
}

impl MarkOutcome {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            Self::Created(r) | Self::AlreadyExists(r) => r,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            AttendanceStatus::Present,
            AttendanceStatus::Absent,
            AttendanceStatus::Late,
            AttendanceStatus::Excused,
        ] {
            assert_eq!(AttendanceStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_status_rejects_unknown() {
        assert!(matches!(
            AttendanceStatus::parse("tardy"),
            Err(StoreError::InvalidDbValue(_))
        ));
    }

    #[test]
    fn test_method_round_trip() {
        for method in [CheckInMethod::FaceRecognition, CheckInMethod::Manual] {
            assert_eq!(CheckInMethod::parse(method.as_str()).unwrap(), method);
        }
    }
}

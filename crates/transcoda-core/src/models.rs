//! Domain models for the conversion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// AUDIO
// =============================================================================

/// An immutable record of one physical media artifact.
///
/// `location` is the stem of the object key; the object itself lives at
/// `"{location}.{format}"` (see [`object_key`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audio {
    pub id: Uuid,
    pub name: String,
    pub format: String,
    pub location: String,
}

impl Audio {
    /// Object store key for this artifact.
    pub fn object_key(&self) -> String {
        object_key(&self.location, &self.format)
    }
}

/// Build the object store key for a file id and format.
pub fn object_key(id: &str, format: &str) -> String {
    format!("{}.{}", id, format)
}

// =============================================================================
// REQUEST
// =============================================================================

/// Lifecycle status of a conversion request.
///
/// `queued → processing → {done | failed}`. `done` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 4] = [
        RequestStatus::Queued,
        RequestStatus::Processing,
        RequestStatus::Done,
        RequestStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Done => "done",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Done | RequestStatus::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Queued, RequestStatus::Processing)
                | (RequestStatus::Processing, RequestStatus::Done)
                | (RequestStatus::Processing, RequestStatus::Failed)
        )
    }

    /// States from which `self` may be entered.
    pub fn allowed_predecessors(&self) -> &'static [RequestStatus] {
        match self {
            RequestStatus::Queued => &[],
            RequestStatus::Processing => &[RequestStatus::Queued],
            RequestStatus::Done | RequestStatus::Failed => &[RequestStatus::Processing],
        }
    }

    /// Whether this status requires a target id to be present.
    pub fn requires_target(&self) -> bool {
        matches!(self, RequestStatus::Done)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

/// One conversion job with a persisted lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub user_id: Uuid,
    pub audio_name: String,
    pub source_id: Uuid,
    pub source_format: String,
    /// Set if and only if `status == Done`.
    pub target_id: Option<Uuid>,
    pub target_format: String,
    pub status: RequestStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// A row of a user's conversion history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub audio_name: String,
    pub source_format: String,
    pub target_format: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub status: RequestStatus,
}

/// Input for creating a conversion request and its source audio row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub source_format: String,
    pub target_format: String,
    /// Object key stem of the already-uploaded source.
    pub source_location: String,
    pub user_id: Uuid,
}

// =============================================================================
// QUEUE PAYLOAD
// =============================================================================

/// Job description carried on the queue.
///
/// Serialized with PascalCase keys so producers and consumers written against
/// the existing wire format keep working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionJob {
    #[serde(rename = "FileID")]
    pub file_id: String,
    #[serde(rename = "Filename")]
    pub filename: String,
    #[serde(rename = "SourceFormat")]
    pub source_format: String,
    #[serde(rename = "TargetFormat")]
    pub target_format: String,
    #[serde(rename = "RequestID")]
    pub request_id: Uuid,
}

impl ConversionJob {
    /// Object key of the uploaded source.
    pub fn source_key(&self) -> String {
        object_key(&self.file_id, &self.source_format)
    }

    /// Encode as a queue message body.
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a queue message body.
    pub fn from_bytes(body: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

// =============================================================================
// USERS
// =============================================================================

/// Stored login credentials for a user. The password is already hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredentials {
    pub id: Uuid,
    pub password_hash: String,
}

// =============================================================================
// QUEUE STATS
// =============================================================================

/// Message counts for a named queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Messages waiting to be claimed (including expired leases).
    pub ready: i64,
    /// Messages claimed but not yet acknowledged.
    pub in_flight: i64,
}

impl QueueDepth {
    pub fn total(&self) -> i64 {
        self.ready + self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_str() {
        for status in RequestStatus::ALL {
            let parsed: RequestStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_status_from_str_case_insensitive() {
        assert_eq!(
            "PROCESSING".parse::<RequestStatus>().unwrap(),
            RequestStatus::Processing
        );
        assert!("finished".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&RequestStatus::Done).unwrap();
        assert_eq!(json, "\"done\"");
    }

    #[test]
    fn test_legal_transitions() {
        use RequestStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Failed));
    }

    #[test]
    fn test_terminal_states_never_move() {
        for from in [RequestStatus::Done, RequestStatus::Failed] {
            assert!(from.is_terminal());
            for to in RequestStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_no_skipping_processing() {
        assert!(!RequestStatus::Queued.can_transition_to(RequestStatus::Done));
        assert!(!RequestStatus::Queued.can_transition_to(RequestStatus::Failed));
        assert!(!RequestStatus::Processing.can_transition_to(RequestStatus::Queued));
    }

    #[test]
    fn test_predecessors_match_transition_table() {
        for to in RequestStatus::ALL {
            for from in RequestStatus::ALL {
                assert_eq!(
                    to.allowed_predecessors().contains(&from),
                    from.can_transition_to(to),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_only_done_requires_target() {
        assert!(RequestStatus::Done.requires_target());
        assert!(!RequestStatus::Failed.requires_target());
        assert!(!RequestStatus::Processing.requires_target());
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key("abc", "mp3"), "abc.mp3");
        let audio = Audio {
            id: Uuid::nil(),
            name: "track.mp3".into(),
            format: "wav".into(),
            location: "f00".into(),
        };
        assert_eq!(audio.object_key(), "f00.wav");
    }

    #[test]
    fn test_conversion_job_wire_format() {
        let job = ConversionJob {
            file_id: "file-1".into(),
            filename: "track.mp3".into(),
            source_format: "mp3".into(),
            target_format: "wav".into(),
            request_id: Uuid::nil(),
        };
        let value: serde_json::Value = serde_json::from_slice(&job.to_bytes().unwrap()).unwrap();
        assert_eq!(value["FileID"], "file-1");
        assert_eq!(value["Filename"], "track.mp3");
        assert_eq!(value["SourceFormat"], "mp3");
        assert_eq!(value["TargetFormat"], "wav");
        assert_eq!(value["RequestID"], Uuid::nil().to_string());
        assert_eq!(job.source_key(), "file-1.mp3");
    }

    #[test]
    fn test_conversion_job_rejects_malformed_body() {
        let err = ConversionJob::from_bytes(b"{\"FileID\": 3}").unwrap_err();
        assert!(matches!(err, crate::Error::Serialization(_)));
    }

    #[test]
    fn test_queue_depth_total() {
        let depth = QueueDepth {
            ready: 3,
            in_flight: 2,
        };
        assert_eq!(depth.total(), 5);
    }
}

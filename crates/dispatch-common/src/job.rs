use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Metadata key holding the external delivery id a job was created from.
pub const DELIVERY_ID_KEY: &str = "delivery_id";

/// Metadata key holding the external board card a job is linked to.
pub const BOARD_CARD_KEY: &str = "board_card_id";

/// Current time truncated to millisecond precision, the resolution every
/// backend persists.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Time-ordered job identifier (UUIDv7).
///
/// The textual form sorts in creation order, which the file backend relies
/// on for FIFO ordering of `pending/` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid job id '{}': {}", s, e))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
        }
    }

    /// Directory / set name used by backends that partition jobs by status.
    pub fn bucket(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Forward-only lifecycle. Crash recovery (PROCESSING back to PENDING)
    /// is a separate explicit path and is not a regular transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Processing) => true,
            (Self::Processing, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "TIMED_OUT" => Ok(Self::TimedOut),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("Field '{field}' must not be empty")]
    EmptyField { field: &'static str },

    #[error("Field '{field}' must be a positive number")]
    NonPositive { field: &'static str },
}

/// Typed job payload, one variant per supported source event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    IssueOpened {
        repository: String,
        issue_number: u64,
        title: String,
        #[serde(default)]
        body: String,
    },
    IssueComment {
        repository: String,
        issue_number: u64,
        author: String,
        body: String,
    },
    PullRequest {
        repository: String,
        number: u64,
        action: String,
        head_ref: String,
        title: String,
    },
    BoardCard {
        board_id: String,
        card_id: String,
        list_name: String,
        title: String,
        #[serde(default)]
        description: String,
    },
    Manual {
        prompt: String,
        #[serde(default)]
        repository: Option<String>,
    },
}

fn require(value: &str, field: &'static str) -> Result<(), PayloadError> {
    if value.trim().is_empty() {
        return Err(PayloadError::EmptyField { field });
    }
    Ok(())
}

fn positive(value: u64, field: &'static str) -> Result<(), PayloadError> {
    if value == 0 {
        return Err(PayloadError::NonPositive { field });
    }
    Ok(())
}

impl JobPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IssueOpened { .. } => "issue_opened",
            Self::IssueComment { .. } => "issue_comment",
            Self::PullRequest { .. } => "pull_request",
            Self::BoardCard { .. } => "board_card",
            Self::Manual { .. } => "manual",
        }
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            Self::IssueOpened {
                repository,
                issue_number,
                title,
                ..
            } => {
                require(repository, "repository")?;
                positive(*issue_number, "issue_number")?;
                require(title, "title")
            }
            Self::IssueComment {
                repository,
                issue_number,
                body,
                ..
            } => {
                require(repository, "repository")?;
                positive(*issue_number, "issue_number")?;
                require(body, "body")
            }
            Self::PullRequest {
                repository,
                number,
                head_ref,
                ..
            } => {
                require(repository, "repository")?;
                positive(*number, "number")?;
                require(head_ref, "head_ref")
            }
            Self::BoardCard {
                card_id,
                list_name,
                title,
                ..
            } => {
                require(card_id, "card_id")?;
                require(list_name, "list_name")?;
                require(title, "title")
            }
            Self::Manual { prompt, .. } => require(prompt, "prompt"),
        }
    }

    /// Short human-readable title, used for commit messages and PR titles.
    pub fn title(&self) -> String {
        match self {
            Self::IssueOpened {
                issue_number,
                title,
                ..
            } => format!("#{} {}", issue_number, title),
            Self::IssueComment { issue_number, .. } => {
                format!("Follow-up on #{}", issue_number)
            }
            Self::PullRequest { number, title, .. } => format!("PR #{} {}", number, title),
            Self::BoardCard { title, .. } => title.clone(),
            Self::Manual { prompt, .. } => prompt.lines().next().unwrap_or_default().to_string(),
        }
    }

    /// Instruction text handed to the agent.
    pub fn prompt(&self) -> String {
        match self {
            Self::IssueOpened {
                repository,
                issue_number,
                title,
                body,
            } => format!(
                "Resolve issue #{} in {}.\n\nTitle: {}\n\n{}",
                issue_number, repository, title, body
            ),
            Self::IssueComment {
                repository,
                issue_number,
                author,
                body,
            } => format!(
                "Address the comment by {} on issue #{} in {}.\n\n{}",
                author, issue_number, repository, body
            ),
            Self::PullRequest {
                repository,
                number,
                action,
                head_ref,
                title,
            } => format!(
                "Pull request #{} ({}) in {} was {}. Branch: {}.\n\nReview and update the change as needed.",
                number, title, repository, action, head_ref
            ),
            Self::BoardCard {
                title, description, ..
            } => format!("{}\n\n{}", title, description),
            Self::Manual { prompt, .. } => prompt.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    #[serde(default)]
    pub delivery_id: Option<String>,
    pub source: String,
    pub event_type: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sandbox_path: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: JobId::new(),
            delivery_id: None,
            source: source.into(),
            event_type: event_type.into(),
            payload,
            status: JobStatus::Pending,
            created_at: now(),
            started_at: None,
            completed_at: None,
            sandbox_path: None,
            metadata: BTreeMap::new(),
            result: None,
            error_message: None,
        }
    }

    /// Attach the external dedup key, mirrored into metadata.
    pub fn with_delivery_id(mut self, delivery_id: impl Into<String>) -> Self {
        let delivery_id = delivery_id.into();
        self.metadata
            .insert(DELIVERY_ID_KEY.to_string(), delivery_id.clone());
        self.delivery_id = Some(delivery_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn board_card_ref(&self) -> Option<&str> {
        self.metadata.get(BOARD_CARD_KEY).map(String::as_str)
    }

    /// Seconds from creation to completion, for terminal jobs.
    pub fn latency_secs(&self) -> Option<f64> {
        let completed = self.completed_at?;
        let millis = (completed - self.created_at).num_milliseconds();
        Some(millis.max(0) as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue_payload() -> JobPayload {
        JobPayload::IssueOpened {
            repository: "acme/widgets".into(),
            issue_number: 1,
            title: "Crash on start".into(),
            body: "Stack trace attached".into(),
        }
    }

    #[test]
    fn test_job_status_roundtrip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_serializes_screaming_case() {
        let json = serde_json::to_string(&JobStatus::TimedOut).unwrap();
        assert_eq!(json, "\"TIMED_OUT\"");
    }

    #[test]
    fn test_transitions_are_forward_only() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::TimedOut));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_job_ids_sort_in_creation_order() {
        let ids: Vec<JobId> = (0..5)
            .map(|_| {
                std::thread::sleep(std::time::Duration::from_millis(2));
                JobId::new()
            })
            .collect();
        let mut texts: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let original = texts.clone();
        texts.sort();
        assert_eq!(texts, original);
    }

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_payload_tagged_serialization() {
        let json = serde_json::to_value(issue_payload()).unwrap();
        assert_eq!(json["kind"], "issue_opened");
        assert_eq!(json["issue_number"], 1);
    }

    #[test]
    fn test_payload_validation_rejects_empty_fields() {
        let payload = JobPayload::Manual {
            prompt: "   ".into(),
            repository: None,
        };
        assert_eq!(
            payload.validate(),
            Err(PayloadError::EmptyField { field: "prompt" })
        );

        let payload = JobPayload::IssueOpened {
            repository: "acme/widgets".into(),
            issue_number: 0,
            title: "x".into(),
            body: String::new(),
        };
        assert_eq!(
            payload.validate(),
            Err(PayloadError::NonPositive {
                field: "issue_number"
            })
        );
        assert!(issue_payload().validate().is_ok());
    }

    #[test]
    fn test_with_delivery_id_mirrors_into_metadata() {
        let job = Job::new("github", "issues", issue_payload()).with_delivery_id("d1");
        assert_eq!(job.delivery_id.as_deref(), Some("d1"));
        assert_eq!(job.metadata.get(DELIVERY_ID_KEY).map(String::as_str), Some("d1"));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_board_card_ref() {
        let job = Job::new("board", "card_moved", issue_payload()).with_metadata(BOARD_CARD_KEY, "card-9");
        assert_eq!(job.board_card_ref(), Some("card-9"));
    }

    #[test]
    fn test_latency_secs() {
        let mut job = Job::new("manual", "task", issue_payload());
        assert!(job.latency_secs().is_none());
        job.completed_at = Some(job.created_at + chrono::Duration::milliseconds(1500));
        assert_eq!(job.latency_secs(), Some(1.5));
    }

    #[test]
    fn test_job_json_roundtrip_preserves_fields() {
        let job = Job::new("github", "issues", issue_payload()).with_delivery_id("abc");
        let text = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&text).unwrap();
        assert_eq!(back, job);
    }
}

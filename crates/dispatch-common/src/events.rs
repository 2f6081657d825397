use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, now};

/// Internal phases of a PROCESSING job. Emitted as events, never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    SandboxAcquired,
    SnapshotCaptured,
    AgentInvoked,
    Validated,
    Finalized,
}

impl JobPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SandboxAcquired => "sandbox_acquired",
            Self::SnapshotCaptured => "snapshot_captured",
            Self::AgentInvoked => "agent_invoked",
            Self::Validated => "validated",
            Self::Finalized => "finalized",
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    Started,
    Phase { phase: JobPhase },
    Completed,
    Failed { error: String },
    TimedOut { error: String },
}

impl JobEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Phase { .. } => "phase",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::TimedOut { .. } => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed { .. } | Self::TimedOut { .. }
        )
    }
}

/// A lifecycle notification for one job, scoped to its workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    pub workspace_id: String,
    pub job_id: JobId,
    #[serde(default)]
    pub card_ref: Option<String>,
    pub kind: JobEventKind,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(workspace_id: impl Into<String>, job_id: JobId, kind: JobEventKind) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            job_id,
            card_ref: None,
            kind,
            at: now(),
        }
    }

    pub fn with_card_ref(mut self, card_ref: Option<String>) -> Self {
        self.card_ref = card_ref;
        self
    }
}

//! Board list mapping and the board sync notifier.
//!
//! The board sync service is external. Dispatch only knows which board lists
//! mean what (`[board.lists]`) and tells the service where a linked card
//! should move when its job changes state. Any list or status without a
//! mapping is an error; there is no fallback list.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use dispatch_common::{JobEvent, JobEventKind, JobStatus};
use serde::Serialize;

use crate::config::{BoardConfig, BoardRole};
use crate::errors::BoardError;
use crate::events::JobObserver;

#[derive(Debug, Clone, Default)]
pub struct BoardListMapping {
    lists: BTreeMap<String, BoardRole>,
}

impl BoardListMapping {
    pub fn new(lists: BTreeMap<String, BoardRole>) -> Self {
        Self { lists }
    }

    pub fn from_config(config: &BoardConfig) -> Self {
        Self::new(config.lists.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Role of a board list. List names compare case-insensitively.
    pub fn role_of(&self, list_name: &str) -> Result<BoardRole, BoardError> {
        let wanted = list_name.trim();
        self.lists
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, role)| *role)
            .ok_or_else(|| BoardError::UnmappedList(list_name.to_string()))
    }

    /// Board list a card should sit in for a job status.
    pub fn list_for(&self, status: JobStatus) -> Result<&str, BoardError> {
        let role = match status {
            JobStatus::Pending => BoardRole::Queue,
            JobStatus::Processing => BoardRole::InProgress,
            JobStatus::Completed => BoardRole::Done,
            JobStatus::Failed | JobStatus::TimedOut => BoardRole::Failed,
        };
        self.lists
            .iter()
            .find(|(_, r)| **r == role)
            .map(|(name, _)| name.as_str())
            .ok_or(BoardError::UnmappedStatus(status))
    }
}

#[derive(Debug, Serialize)]
struct CardMove<'a> {
    workspace_id: &'a str,
    card_id: &'a str,
    list_name: &'a str,
    job_id: String,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Posts card moves to the board sync service.
pub struct BoardNotifier {
    client: reqwest::Client,
    url: String,
    mapping: BoardListMapping,
}

impl BoardNotifier {
    pub fn new(url: impl Into<String>, mapping: BoardListMapping) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            mapping,
        })
    }

    /// `None` when no notify URL is configured.
    pub fn from_config(config: &BoardConfig) -> anyhow::Result<Option<Self>> {
        match &config.notify_url {
            Some(url) => Ok(Some(Self::new(url, BoardListMapping::from_config(config))?)),
            None => Ok(None),
        }
    }
}

fn status_for(kind: &JobEventKind) -> Option<(JobStatus, Option<&str>)> {
    match kind {
        JobEventKind::Started => Some((JobStatus::Processing, None)),
        JobEventKind::Completed => Some((JobStatus::Completed, None)),
        JobEventKind::Failed { error } => Some((JobStatus::Failed, Some(error.as_str()))),
        JobEventKind::TimedOut { error } => Some((JobStatus::TimedOut, Some(error.as_str()))),
        JobEventKind::Created | JobEventKind::Phase { .. } => None,
    }
}

#[async_trait]
impl JobObserver for BoardNotifier {
    fn name(&self) -> &str {
        "board"
    }

    async fn on_event(&self, event: &JobEvent) -> anyhow::Result<()> {
        let Some(card_id) = event.card_ref.as_deref() else {
            return Ok(());
        };
        let Some((status, error)) = status_for(&event.kind) else {
            return Ok(());
        };
        let list_name = self.mapping.list_for(status)?;
        let body = CardMove {
            workspace_id: &event.workspace_id,
            card_id,
            list_name,
            job_id: event.job_id.to_string(),
            status,
            error,
        };
        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BoardError::Notify(e.to_string()))?
            .error_for_status()
            .map_err(|e| BoardError::Notify(e.to_string()))?;
        tracing::debug!(card_id, list_name, job_id = %event.job_id, "Moved board card");
        Ok(())
    }
}

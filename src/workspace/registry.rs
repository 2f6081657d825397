//! Lazily opened, cached job queues keyed by workspace id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::Workspace;
use crate::config::QueueConfig;
use crate::errors::QueueError;
use crate::queue::{self, JobQueue};

pub struct QueueRegistry {
    config: QueueConfig,
    queues: Mutex<HashMap<String, Arc<dyn JobQueue>>>,
}

impl QueueRegistry {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Queue bound to `workspace`, opened on first use. The lock is held
    /// while opening so a workspace never gets two live handles.
    pub async fn get(&self, workspace: &Workspace) -> Result<Arc<dyn JobQueue>, QueueError> {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get(workspace.id.as_str()) {
            return Ok(queue.clone());
        }
        let queue = queue::open(&self.config, &workspace.data_dir(), workspace.id.as_str()).await?;
        queues.insert(workspace.id.to_string(), queue.clone());
        Ok(queue)
    }
}

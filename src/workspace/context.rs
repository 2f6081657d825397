//! Ambient access to the workspace a task is running for.
//!
//! The value is bound per task with [`scope`]; it is never global, and
//! spawned tasks do not inherit it unless they are scoped themselves.

use std::future::Future;

use super::{Workspace, WorkspaceId};

tokio::task_local! {
    static CURRENT_WORKSPACE: Workspace;
}

/// Run `fut` with `workspace` as the current workspace.
pub async fn scope<F>(workspace: Workspace, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_WORKSPACE.scope(workspace, fut).await
}

/// The workspace bound to the running task, if any.
pub fn get_current_workspace() -> Option<Workspace> {
    CURRENT_WORKSPACE.try_with(Clone::clone).ok()
}

pub fn current_workspace_id() -> Option<WorkspaceId> {
    CURRENT_WORKSPACE.try_with(|ws| ws.id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn workspace(id: &str) -> Workspace {
        Workspace {
            id: WorkspaceId::parse(id).unwrap(),
            name: id.to_string(),
            description: None,
            dir: PathBuf::from("/tmp").join(id),
            created_at: dispatch_common::now(),
        }
    }

    #[tokio::test]
    async fn test_unscoped_has_no_workspace() {
        assert!(get_current_workspace().is_none());
    }

    #[tokio::test]
    async fn test_scope_binds_workspace() {
        let id = scope(workspace("acme"), async { current_workspace_id() }).await;
        assert_eq!(id.unwrap().as_str(), "acme");
        assert!(get_current_workspace().is_none());
    }

    #[tokio::test]
    async fn test_nested_scopes_do_not_leak() {
        scope(workspace("outer"), async {
            let inner = scope(workspace("inner"), async { current_workspace_id() }).await;
            assert_eq!(inner.unwrap().as_str(), "inner");
            assert_eq!(current_workspace_id().unwrap().as_str(), "outer");
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawned_tasks_do_not_inherit() {
        let seen = scope(workspace("acme"), async {
            tokio::spawn(async { current_workspace_id() }).await.unwrap()
        })
        .await;
        assert!(seen.is_none());
    }
}

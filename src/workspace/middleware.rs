//! Per-request workspace resolution.
//!
//! Reads `X-Workspace-Id` (falling back to the configured default id),
//! resolves it through [`WorkspaceService`] and makes the result available
//! both as a request extension and as the task-local current workspace.
//! Unknown, invalid and disabled ids are rejected with 404.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use super::{Workspace, WorkspaceService, context};
use crate::api::ApiError;
use crate::errors::WorkspaceError;

pub const WORKSPACE_HEADER: &str = "x-workspace-id";

/// Workspace id a request asks for.
pub fn requested_workspace_id<'a>(
    headers: &'a HeaderMap,
    default_id: &'a str,
) -> Result<&'a str, WorkspaceError> {
    match headers.get(WORKSPACE_HEADER) {
        None => Ok(default_id),
        Some(value) => value
            .to_str()
            .map(str::trim)
            .map_err(|_| WorkspaceError::NotFound("<non-utf8>".into())),
    }
}

/// Resolve the request's workspace or fail closed.
pub async fn resolve(
    service: &WorkspaceService,
    headers: &HeaderMap,
) -> Result<Workspace, WorkspaceError> {
    let id = requested_workspace_id(headers, service.default_id())?;
    service.resolve(id).await
}

pub async fn resolve_workspace(
    State(service): State<Arc<WorkspaceService>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let workspace = match resolve(&service, request.headers()).await {
        Ok(workspace) => workspace,
        Err(e) => {
            tracing::warn!(
                path = %request.uri().path(),
                error = %e,
                "Rejected request for unresolvable workspace"
            );
            return Err(e.into());
        }
    };
    request.extensions_mut().insert(workspace.clone());
    Ok(context::scope(workspace, next.run(request)).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_missing_header_uses_default() {
        let headers = HeaderMap::new();
        assert_eq!(requested_workspace_id(&headers, "default").unwrap(), "default");
    }

    #[test]
    fn test_header_wins_over_default() {
        let mut headers = HeaderMap::new();
        headers.insert(WORKSPACE_HEADER, HeaderValue::from_static(" acme "));
        assert_eq!(requested_workspace_id(&headers, "default").unwrap(), "acme");
    }

    #[test]
    fn test_non_utf8_header_is_not_found() {
        let mut headers = HeaderMap::new();
        headers.insert(
            WORKSPACE_HEADER,
            HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap(),
        );
        assert!(matches!(
            requested_workspace_id(&headers, "default").unwrap_err(),
            WorkspaceError::NotFound(_)
        ));
    }
}

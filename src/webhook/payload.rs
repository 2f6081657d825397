//! Source payload parsing into typed [`JobPayload`]s.
//!
//! Supported sources:
//!
//! | Source   | Event           | Actions that create work             |
//! |----------|-----------------|--------------------------------------|
//! | `github` | `issues`        | `opened`, `reopened`                 |
//! | `github` | `issue_comment` | `created`                            |
//! | `github` | `pull_request`  | `opened`, `reopened`, `synchronize`  |
//! | `board`  | `card_moved`    | card moved into a `queue` list       |
//! | `manual` | any             | always                               |
//!
//! Known events with other actions parse to [`ParsedEvent::Skip`].

use dispatch_common::JobPayload;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::board::BoardListMapping;
use crate::config::BoardRole;
use crate::errors::ValidationError;

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Job {
        payload: JobPayload,
        card_ref: Option<String>,
    },
    Skip {
        reason: String,
    },
}

impl ParsedEvent {
    fn job(payload: JobPayload) -> Result<Self, ValidationError> {
        payload.validate()?;
        Ok(Self::Job {
            payload,
            card_ref: None,
        })
    }

    fn skip(reason: impl Into<String>) -> Result<Self, ValidationError> {
        Ok(Self::Skip {
            reason: reason.into(),
        })
    }
}

// ── GitHub ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Comment {
    body: String,
    user: User,
}

#[derive(Debug, Deserialize)]
struct PullRequestRef {
    #[serde(rename = "ref")]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
    title: String,
    head: PullRequestRef,
}

#[derive(Debug, Deserialize)]
struct IssuesEvent {
    action: String,
    issue: Issue,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct IssueCommentEvent {
    action: String,
    issue: Issue,
    comment: Comment,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    pull_request: PullRequest,
    repository: Repository,
}

// ── Board / manual ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CardMovedEvent {
    board_id: String,
    card_id: String,
    list_name: String,
    title: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ManualEvent {
    prompt: String,
    #[serde(default)]
    repository: Option<String>,
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, ValidationError> {
    T::deserialize(value).map_err(|e| ValidationError::MalformedPayload(e.to_string()))
}

fn unsupported(source: &str, event_type: &str) -> ValidationError {
    ValidationError::UnsupportedEvent {
        source_name: source.to_string(),
        event_type: event_type.to_string(),
    }
}

/// Parse one webhook body. Board events need the workspace's list mapping.
pub fn parse(
    source: &str,
    event_type: &str,
    body: &Value,
    board: &BoardListMapping,
) -> Result<ParsedEvent, ValidationError> {
    match source {
        "github" => parse_github(event_type, body),
        "board" => parse_board(event_type, body, board),
        "manual" => {
            let event: ManualEvent = decode(body)?;
            ParsedEvent::job(JobPayload::Manual {
                prompt: event.prompt,
                repository: event.repository,
            })
        }
        _ => Err(unsupported(source, event_type)),
    }
}

fn parse_github(event_type: &str, body: &Value) -> Result<ParsedEvent, ValidationError> {
    match event_type {
        "ping" => ParsedEvent::skip("ping"),
        "issues" => {
            let event: IssuesEvent = decode(body)?;
            if !matches!(event.action.as_str(), "opened" | "reopened") {
                return ParsedEvent::skip(format!("issues.{}", event.action));
            }
            ParsedEvent::job(JobPayload::IssueOpened {
                repository: event.repository.full_name,
                issue_number: event.issue.number,
                title: event.issue.title,
                body: event.issue.body.unwrap_or_default(),
            })
        }
        "issue_comment" => {
            let event: IssueCommentEvent = decode(body)?;
            if event.action != "created" {
                return ParsedEvent::skip(format!("issue_comment.{}", event.action));
            }
            ParsedEvent::job(JobPayload::IssueComment {
                repository: event.repository.full_name,
                issue_number: event.issue.number,
                author: event.comment.user.login,
                body: event.comment.body,
            })
        }
        "pull_request" => {
            let event: PullRequestEvent = decode(body)?;
            if !matches!(
                event.action.as_str(),
                "opened" | "reopened" | "synchronize"
            ) {
                return ParsedEvent::skip(format!("pull_request.{}", event.action));
            }
            ParsedEvent::job(JobPayload::PullRequest {
                repository: event.repository.full_name,
                number: event.pull_request.number,
                action: event.action,
                head_ref: event.pull_request.head.ref_name,
                title: event.pull_request.title,
            })
        }
        _ => Err(unsupported("github", event_type)),
    }
}

fn parse_board(
    event_type: &str,
    body: &Value,
    board: &BoardListMapping,
) -> Result<ParsedEvent, ValidationError> {
    if event_type != "card_moved" {
        return Err(unsupported("board", event_type));
    }
    let event: CardMovedEvent = decode(body)?;
    match board.role_of(&event.list_name)? {
        BoardRole::Queue => {
            let card_ref = event.card_id.clone();
            let payload = JobPayload::BoardCard {
                board_id: event.board_id,
                card_id: event.card_id,
                list_name: event.list_name,
                title: event.title,
                description: event.description,
            };
            payload.validate()?;
            Ok(ParsedEvent::Job {
                payload,
                card_ref: Some(card_ref),
            })
        }
        role => ParsedEvent::skip(format!("card moved to {:?} list", role)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoardError;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn board() -> BoardListMapping {
        BoardListMapping::new(BTreeMap::from([
            ("Ready".to_string(), BoardRole::Queue),
            ("Done".to_string(), BoardRole::Done),
        ]))
    }

    fn issue_body(action: &str) -> Value {
        json!({
            "action": action,
            "issue": {"number": 42, "title": "Crash on start", "body": null},
            "repository": {"full_name": "acme/widgets"}
        })
    }

    #[test]
    fn test_issue_opened() {
        let parsed = parse("github", "issues", &issue_body("opened"), &board()).unwrap();
        assert_eq!(
            parsed,
            ParsedEvent::Job {
                payload: JobPayload::IssueOpened {
                    repository: "acme/widgets".into(),
                    issue_number: 42,
                    title: "Crash on start".into(),
                    body: String::new(),
                },
                card_ref: None,
            }
        );
    }

    #[test]
    fn test_issue_closed_is_skipped() {
        let parsed = parse("github", "issues", &issue_body("closed"), &board()).unwrap();
        assert!(matches!(parsed, ParsedEvent::Skip { reason } if reason == "issues.closed"));
    }

    #[test]
    fn test_issue_comment() {
        let body = json!({
            "action": "created",
            "issue": {"number": 7, "title": "t"},
            "comment": {"body": "please retry", "user": {"login": "octo"}},
            "repository": {"full_name": "acme/widgets"}
        });
        let parsed = parse("github", "issue_comment", &body, &board()).unwrap();
        let ParsedEvent::Job { payload, .. } = parsed else {
            panic!("expected job");
        };
        assert_eq!(payload.kind(), "issue_comment");
    }

    #[test]
    fn test_pull_request_synchronize() {
        let body = json!({
            "action": "synchronize",
            "pull_request": {"number": 3, "title": "Fix", "head": {"ref": "fix-branch"}},
            "repository": {"full_name": "acme/widgets"}
        });
        let parsed = parse("github", "pull_request", &body, &board()).unwrap();
        let ParsedEvent::Job { payload, .. } = parsed else {
            panic!("expected job");
        };
        assert!(matches!(
            payload,
            JobPayload::PullRequest { ref head_ref, .. } if head_ref == "fix-branch"
        ));
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let body = json!({"action": "opened"});
        let err = parse("github", "issues", &body, &board()).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedPayload(_)));
    }

    #[test]
    fn test_empty_title_is_invalid() {
        let mut body = issue_body("opened");
        body["issue"]["title"] = json!("  ");
        let err = parse("github", "issues", &body, &board()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPayload(_)));
    }

    #[test]
    fn test_unknown_source_and_event() {
        assert!(matches!(
            parse("gitlab", "push", &json!({}), &board()).unwrap_err(),
            ValidationError::UnsupportedEvent { .. }
        ));
        assert!(matches!(
            parse("github", "push", &json!({}), &board()).unwrap_err(),
            ValidationError::UnsupportedEvent { .. }
        ));
    }

    fn card(list: &str) -> Value {
        json!({
            "board_id": "b1",
            "card_id": "c9",
            "list_name": list,
            "title": "Add dark mode"
        })
    }

    #[test]
    fn test_card_moved_to_queue_list() {
        let parsed = parse("board", "card_moved", &card("Ready"), &board()).unwrap();
        let ParsedEvent::Job { card_ref, payload } = parsed else {
            panic!("expected job");
        };
        assert_eq!(card_ref.as_deref(), Some("c9"));
        assert_eq!(payload.kind(), "board_card");
    }

    #[test]
    fn test_card_moved_to_other_mapped_list_is_skipped() {
        let parsed = parse("board", "card_moved", &card("Done"), &board()).unwrap();
        assert!(matches!(parsed, ParsedEvent::Skip { .. }));
    }

    #[test]
    fn test_card_moved_to_unmapped_list_is_error() {
        let err = parse("board", "card_moved", &card("Someday"), &board()).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::Board(BoardError::UnmappedList(ref name)) if name == "Someday"
        ));
    }

    #[test]
    fn test_manual_job() {
        let parsed = parse("manual", "job", &json!({"prompt": "Bump deps"}), &board()).unwrap();
        assert!(matches!(parsed, ParsedEvent::Job { .. }));
        assert!(parse("manual", "job", &json!({"prompt": ""}), &board()).is_err());
    }
}

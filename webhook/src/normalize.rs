//! Turns one source's raw JSON payload into the `{context, systemMessage}`
//! pair §6 asks for, plus the `eventType`/idempotency key the Event Queue
//! needs. Each source gets its own best-effort summary; anything not listed
//! here passes the raw payload through untouched.

use axum::http::HeaderMap;
use serde_json::Value;
use serde_json::json;

/// Result of normalizing one inbound webhook delivery.
pub struct NormalizedEvent {
    pub event_type: String,
    pub context: Value,
    pub system_message: Option<String>,
    pub idempotency_key: Option<String>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Wraps the raw payload with the endpoint's configured `participant_id`
/// (when present) so downstream consumers can see who a push event is
/// scoped to without re-parsing source-specific fields.
fn context_of(participant_id: Option<&str>, raw: Value) -> Value {
    match participant_id {
        Some(participant_id) => json!({"participantId": participant_id, "raw": raw}),
        None => raw,
    }
}

pub fn normalize(source: &str, participant_id: Option<&str>, headers: &HeaderMap, raw: Value) -> NormalizedEvent {
    match source {
        "gitlab" => normalize_gitlab(participant_id, headers, raw),
        "github" => normalize_github(participant_id, headers, raw),
        _ => NormalizedEvent {
            event_type: source.to_string(),
            context: context_of(participant_id, raw),
            system_message: None,
            idempotency_key: None,
        },
    }
}

fn normalize_gitlab(participant_id: Option<&str>, headers: &HeaderMap, raw: Value) -> NormalizedEvent {
    let event_type = header(headers, "x-gitlab-event").unwrap_or_else(|| "GitLab Event".to_string());
    let idempotency_key = header(headers, "x-gitlab-event-uuid");

    let project = raw.get("project").and_then(|p| p.get("name")).and_then(Value::as_str);
    let user = raw.get("user_name").and_then(Value::as_str);
    let ref_name = raw.get("ref").and_then(Value::as_str);
    let commit_count = raw.get("total_commits_count").and_then(Value::as_u64);

    let system_message = match (project, user) {
        (Some(project), Some(user)) => {
            let mut summary = format!("{event_type} on {project} by {user}");
            if let Some(ref_name) = ref_name {
                summary.push_str(&format!(" ({ref_name})"));
            }
            if let Some(commit_count) = commit_count {
                summary.push_str(&format!(", {commit_count} commit(s)"));
            }
            Some(summary)
        }
        _ => None,
    };

    NormalizedEvent {
        event_type,
        context: context_of(participant_id, raw),
        system_message,
        idempotency_key,
    }
}

fn normalize_github(participant_id: Option<&str>, headers: &HeaderMap, raw: Value) -> NormalizedEvent {
    let event_type = header(headers, "x-github-event").unwrap_or_else(|| "github".to_string());
    let idempotency_key = header(headers, "x-github-delivery");

    let repo = raw.get("repository").and_then(|r| r.get("full_name")).and_then(Value::as_str);
    let sender = raw.get("sender").and_then(|s| s.get("login")).and_then(Value::as_str);
    let action = raw.get("action").and_then(Value::as_str);

    let system_message = match (repo, sender) {
        (Some(repo), Some(sender)) => {
            let mut summary = format!("{event_type} on {repo} by {sender}");
            if let Some(action) = action {
                summary.push_str(&format!(" ({action})"));
            }
            Some(summary)
        }
        _ => None,
    };

    NormalizedEvent {
        event_type,
        context: context_of(participant_id, raw),
        system_message,
        idempotency_key,
    }
}

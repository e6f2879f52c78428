//! Crate-level error type.
//!
//! Mirrors the backend's error taxonomy: field validation, authorization,
//! not-found, domain rejection and transport/channel failure. Backend error
//! bodies have the shape `{"details": "..."}` or
//! `{"details": [{"field": "message"}, ...]}`; [`SyncError::from_response`]
//! turns either into the matching variant.

use std::collections::BTreeMap;

use serde_json::Value;

/// Request paths that never force a sign-in redirect.
pub const PUBLIC_ROUTES: &[&str] = &["sign-in", "sign-up", "reset-password"];

/// Message the backend middleware returns on a CSRF failure (HTTP 403).
pub const CSRF_REJECTION: &str = "CSRF token is invalid or not provided.";

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Field-scoped validation failure. `fields` maps a form field to its
    /// message; anything the form does not know about lands in `non_field`.
    #[error("validation failed: {}", summarize(.fields, .non_field))]
    Validation {
        fields: BTreeMap<String, String>,
        non_field: Vec<String>,
    },

    #[error("not authorized (HTTP {status}): {details}")]
    Unauthorized { status: u16, details: String },

    #[error("{what} was not found")]
    NotFound { what: String },

    /// Domain rejection (wrong key, room full, duplicate tag, ...). `reason`
    /// is the backend's own wording and is shown to the user verbatim.
    #[error("{reason}")]
    Rejected { reason: String },

    #[error("transport error on {url}: {detail}")]
    Transport { url: String, detail: String },

    #[error("channel error: {0}")]
    Channel(String),

    #[error("unexpected response body from {url}: {detail}")]
    Decode { url: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),
}

fn summarize(fields: &BTreeMap<String, String>, non_field: &[String]) -> String {
    let mut parts: Vec<String> = fields.iter().map(|(k, v)| format!("{k}: {v}")).collect();
    parts.extend(non_field.iter().cloned());
    parts.join("; ")
}

impl SyncError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        SyncError::Rejected { reason: reason.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        SyncError::NotFound { what: what.into() }
    }

    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(field.into(), message.into());
        SyncError::Validation { fields, non_field: Vec::new() }
    }

    /// Build an error from a non-2xx status and its (possibly empty) body.
    ///
    /// `known_fields` lists the fields of the form that was submitted; list
    /// entries naming other fields are reported as non-field messages.
    pub fn from_response(status: u16, body: &str, what: &str, known_fields: &[&str]) -> Self {
        let details = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("details").cloned());

        match status {
            401 => SyncError::Unauthorized {
                status,
                details: details_text(details.as_ref()).unwrap_or_else(|| "unauthorized".into()),
            },
            404 => SyncError::not_found(what),
            403 => {
                let text = details_text(details.as_ref()).unwrap_or_else(|| "forbidden".into());
                if text == CSRF_REJECTION {
                    SyncError::Unauthorized { status, details: text }
                } else {
                    SyncError::Rejected { reason: text }
                }
            }
            400 => match details {
                Some(Value::Array(entries)) => split_fields(&entries, known_fields),
                Some(other) => match details_text(Some(&other)) {
                    Some(reason) => SyncError::Rejected { reason },
                    None => SyncError::rejected("request was rejected"),
                },
                None => field_map_body(body, known_fields)
                    .unwrap_or_else(|| SyncError::rejected("request was rejected")),
            },
            _ => SyncError::Transport {
                url: what.to_string(),
                detail: format!(
                    "HTTP {status}{}",
                    details_text(details.as_ref())
                        .map(|d| format!(": {d}"))
                        .unwrap_or_default()
                ),
            },
        }
    }

    /// Whether the error should bounce the user to the sign-in page when it
    /// occurred on `path`.
    pub fn requires_sign_in(&self, path: &str) -> bool {
        match self {
            SyncError::Unauthorized { .. } => {
                !PUBLIC_ROUTES.iter().any(|route| path.contains(&format!("/{route}/")))
            }
            _ => false,
        }
    }

    /// Whether the error is absorbed and rendered by the component that hit
    /// it, rather than propagated to a redirect.
    pub fn is_component_local(&self) -> bool {
        matches!(
            self,
            SyncError::Validation { .. } | SyncError::NotFound { .. } | SyncError::Rejected { .. }
        )
    }
}

fn details_text(details: Option<&Value>) -> Option<String> {
    match details? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let msgs: Vec<String> = items
                .iter()
                .flat_map(|item| match item {
                    Value::Object(map) => map.values().filter_map(value_message).collect::<Vec<_>>(),
                    other => value_message(other).into_iter().collect::<Vec<_>>(),
                })
                .collect();
            (!msgs.is_empty()).then(|| msgs.join(" "))
        }
        other => value_message(other),
    }
}

fn value_message(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(value_message),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn split_fields(entries: &[Value], known_fields: &[&str]) -> SyncError {
    let mut fields = BTreeMap::new();
    let mut non_field = Vec::new();
    for entry in entries {
        match entry {
            Value::Object(map) => {
                for (field, msg) in map {
                    let Some(msg) = value_message(msg) else { continue };
                    if known_fields.contains(&field.as_str()) {
                        fields.insert(field.clone(), msg);
                    } else {
                        non_field.push(msg);
                    }
                }
            }
            other => non_field.extend(value_message(other)),
        }
    }
    if fields.is_empty() && non_field.len() == 1 {
        return SyncError::Rejected { reason: non_field.remove(0) };
    }
    SyncError::Validation { fields, non_field }
}

// Plain DRF serializer errors: `{"field": ["message"]}` without a details key.
fn field_map_body(body: &str, known_fields: &[&str]) -> Option<SyncError> {
    let Value::Object(map) = serde_json::from_str::<Value>(body).ok()? else {
        return None;
    };
    Some(split_fields(&[Value::Object(map)], known_fields))
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Transport {
            url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            detail: err.to_string(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Channel(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_response_401_is_unauthorized() {
        let err = SyncError::from_response(
            401,
            r#"{"details":"Token is invalid or expired."}"#,
            "room",
            &[],
        );
        assert!(matches!(err, SyncError::Unauthorized { status: 401, .. }));
        assert!(err.to_string().contains("Token is invalid"));
    }

    #[test]
    fn from_response_404_is_not_found() {
        let err = SyncError::from_response(404, "", "room «lobby»", &[]);
        assert!(matches!(err, SyncError::NotFound { .. }));
        assert_eq!(err.to_string(), "room «lobby» was not found");
    }

    #[test]
    fn from_response_403_room_full_is_rejection_with_server_reason() {
        let err = SyncError::from_response(403, r#"{"details":"Room is full."}"#, "room", &[]);
        match err {
            SyncError::Rejected { reason } => assert_eq!(reason, "Room is full."),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn from_response_403_csrf_is_unauthorized() {
        let body = format!(r#"{{"details":"{CSRF_REJECTION}"}}"#);
        let err = SyncError::from_response(403, &body, "room", &[]);
        assert!(matches!(err, SyncError::Unauthorized { status: 403, .. }));
    }

    #[test]
    fn from_response_400_splits_known_and_unknown_fields() {
        let body = r#"{"details":[{"title":"Room with this title already exists."},{"room":"Room cannot have more than 5 tags."}]}"#;
        let err = SyncError::from_response(400, body, "room", &["title", "key"]);
        match err {
            SyncError::Validation { fields, non_field } => {
                assert_eq!(fields.get("title").unwrap(), "Room with this title already exists.");
                assert_eq!(non_field, vec!["Room cannot have more than 5 tags.".to_string()]);
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn from_response_400_single_unknown_message_is_rejection() {
        let body = r#"{"details":[{"non_field_errors":["The fields room, name must make a unique set."]}]}"#;
        let err = SyncError::from_response(400, body, "tag", &["name"]);
        assert!(matches!(err, SyncError::Rejected { .. }));
    }

    #[test]
    fn from_response_400_plain_serializer_body() {
        let body = r#"{"key":["Ensure this field has no more than 16 characters."]}"#;
        let err = SyncError::from_response(400, body, "room", &["key"]);
        match err {
            SyncError::Validation { fields, .. } => assert!(fields.contains_key("key")),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn from_response_500_is_transport() {
        let err = SyncError::from_response(500, "oops", "/api/rooms/", &[]);
        assert!(matches!(err, SyncError::Transport { .. }));
    }

    #[test]
    fn requires_sign_in_respects_public_routes() {
        let err = SyncError::Unauthorized { status: 401, details: "x".into() };
        assert!(err.requires_sign_in("/api/rooms/"));
        assert!(!err.requires_sign_in("/api/sign-in/"));
        assert!(!err.requires_sign_in("/api/reset-password/"));
        assert!(!SyncError::not_found("room").requires_sign_in("/api/rooms/"));
    }

    #[test]
    fn component_local_classification() {
        assert!(SyncError::rejected("Key mismatch.").is_component_local());
        assert!(SyncError::not_found("room").is_component_local());
        assert!(SyncError::field("title", "required").is_component_local());
        assert!(!SyncError::Channel("closed".into()).is_component_local());
        assert!(!SyncError::Unauthorized { status: 401, details: String::new() }.is_component_local());
    }
}

//! Core domain model shared by the Threadline sync engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "threadline-core";

/// Default path prefix identifying a conversation thread URL.
pub const DEFAULT_THREAD_PATH_PREFIX: &str = "/messaging/thread/";

pub type EventPayload = Map<String, Value>;

/// One pending ingestion event. `key` is the dedup identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub key: String,
    pub payload: EventPayload,
    /// Number of retries already consumed by this item.
    #[serde(default)]
    pub attempt: u32,
}

impl QueueItem {
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            attempt: 0,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub name: Option<String>,
    pub profile_url: Option<String>,
}

impl Participant {
    pub fn has_identity(&self) -> bool {
        non_blank(self.name.as_deref()) || non_blank(self.profile_url.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Option<String>,
    pub text: String,
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub from_me: bool,
}

/// Conversation snapshot produced by an extractor for one thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPayload {
    pub candidate: Participant,
    pub me: Participant,
    pub messages: Vec<Message>,
}

impl ExtractedPayload {
    /// Both identities are present and at least one message was extracted.
    pub fn is_usable(&self) -> bool {
        self.candidate.has_identity() && self.me.has_identity() && !self.messages.is_empty()
    }
}

/// Credentials supplied by the auth collaborator. Every field is optional;
/// a context is usable when it carries a token or a user id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub access_token: Option<String>,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
}

impl AuthContext {
    pub fn bearer_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.trim().is_empty())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|u| !u.trim().is_empty())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    pub fn is_usable(&self) -> bool {
        self.bearer_token().is_some() || self.user_id().is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Error,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Point-in-time engine snapshot for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub queue_length: usize,
    pub breaker_open: bool,
    pub rate_window_length: usize,
    pub controller_state: ControllerState,
}

/// Extract the conversation id from a thread URL such as
/// `https://www.linkedin.com/messaging/thread/2-abc==/?mini=true`.
pub fn thread_key_from_url(url: &str, path_prefix: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path_start = without_scheme.find('/')?;
    let path = &without_scheme[path_start..];
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let rest = path.strip_prefix(path_prefix)?;
    let key = rest.split('/').next().unwrap_or_default().trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

pub fn is_thread_url(url: &str, path_prefix: &str) -> bool {
    thread_key_from_url(url, path_prefix).is_some()
}

fn non_blank(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> Message {
        Message {
            sender: Some("Ada".into()),
            text: text.into(),
            sent_at: None,
            from_me: false,
        }
    }

    #[test]
    fn thread_key_is_taken_from_the_path_segment() {
        let url = "https://www.linkedin.com/messaging/thread/2-YmFzZTY0==/?mini=true#top";
        assert_eq!(
            thread_key_from_url(url, DEFAULT_THREAD_PATH_PREFIX).as_deref(),
            Some("2-YmFzZTY0==")
        );
        assert!(is_thread_url(url, DEFAULT_THREAD_PATH_PREFIX));
    }

    #[test]
    fn non_thread_urls_have_no_key() {
        for url in [
            "https://www.linkedin.com/messaging/",
            "https://www.linkedin.com/messaging/thread/",
            "https://www.linkedin.com/in/someone/",
            "not a url",
        ] {
            assert_eq!(thread_key_from_url(url, DEFAULT_THREAD_PATH_PREFIX), None, "{url}");
        }
    }

    #[test]
    fn payload_usability_requires_identities_and_messages() {
        let mut payload = ExtractedPayload {
            candidate: Participant {
                name: Some("Ada Lovelace".into()),
                profile_url: None,
            },
            me: Participant {
                name: None,
                profile_url: Some("https://www.linkedin.com/in/me/".into()),
            },
            messages: vec![message("hello")],
        };
        assert!(payload.is_usable());

        payload.messages.clear();
        assert!(!payload.is_usable());

        payload.messages.push(message("hi"));
        payload.candidate.name = Some("   ".into());
        assert!(!payload.is_usable());
    }

    #[test]
    fn auth_context_prefers_non_blank_values() {
        let ctx = AuthContext {
            access_token: Some(" ".into()),
            user_id: Some("u-1".into()),
            api_key: None,
        };
        assert_eq!(ctx.bearer_token(), None);
        assert_eq!(ctx.user_id(), Some("u-1"));
        assert!(ctx.is_usable());
        assert!(!AuthContext::default().is_usable());
    }

    #[test]
    fn controller_state_serializes_upper_case() {
        let json = serde_json::to_string(&ControllerState::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
        assert_eq!(ControllerState::Paused.to_string(), "PAUSED");
    }
}

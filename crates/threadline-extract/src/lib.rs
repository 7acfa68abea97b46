//! Extractor contracts plus snapshot-backed extractor implementations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use threadline_core::{
    thread_key_from_url, EventPayload, ExtractedPayload, Message, Participant,
    DEFAULT_THREAD_PATH_PREFIX,
};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "threadline-extract";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid selector `{0}`")]
    Selector(String),
    #[error("extraction aborted")]
    Aborted,
}

/// Cooperative cancellation probe handed to extraction work.
///
/// Work polls [`AbortSignal::should_abort`] at safe points and returns early;
/// nothing is preempted.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_abort(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    /// A signal that aborts with this one but can also be aborted alone.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub async fn aborted(&self) {
        self.token.cancelled().await;
    }

    pub fn check(&self) -> Result<(), ExtractError> {
        if self.should_abort() {
            Err(ExtractError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Handle to the document an extractor works against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootHandle {
    pub url: String,
    pub thread_key: Option<String>,
    pub document: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Back-fill message timestamps the page did not render.
    pub fill_missing_time: bool,
    pub signal: AbortSignal,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn root_handle(&self, url: &str) -> Result<RootHandle, ExtractError>;

    async fn extract(
        &self,
        handle: &RootHandle,
        options: &ExtractOptions,
    ) -> Result<Option<ExtractedPayload>, ExtractError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub key: String,
    pub payload: EventPayload,
}

#[async_trait]
pub trait ProfileExtractor: Send + Sync {
    async fn extract_profiles(&self, signal: &AbortSignal)
        -> Result<Vec<ProfileRecord>, ExtractError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadSelectors {
    pub candidate_name: String,
    pub candidate_link: String,
    pub me_name: String,
    pub me_name_attr: String,
    pub message_item: String,
    pub message_sender: String,
    pub message_body: String,
    pub message_time: String,
}

impl Default for ThreadSelectors {
    fn default() -> Self {
        Self {
            candidate_name: ".msg-entity-lockup__entity-title".into(),
            candidate_link: "a.msg-thread__link-to-profile".into(),
            me_name: "img.global-nav__me-photo".into(),
            me_name_attr: "alt".into(),
            message_item: "li.msg-s-message-list__event".into(),
            message_sender: ".msg-s-message-group__name".into(),
            message_body: ".msg-s-event-listitem__body".into(),
            message_time: "time[datetime]".into(),
        }
    }
}

/// Reads captured conversation HTML from `<dir>/<thread key>.html`.
#[derive(Debug, Clone)]
pub struct HtmlSnapshotExtractor {
    dir: PathBuf,
    thread_path_prefix: String,
    selectors: ThreadSelectors,
}

impl HtmlSnapshotExtractor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            thread_path_prefix: DEFAULT_THREAD_PATH_PREFIX.to_string(),
            selectors: ThreadSelectors::default(),
        }
    }

    pub fn with_thread_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_path_prefix = prefix.into();
        self
    }

    pub fn with_selectors(mut self, selectors: ThreadSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn snapshot_path(&self, thread_key: &str) -> PathBuf {
        self.dir.join(format!("{}.html", file_safe(thread_key)))
    }
}

#[async_trait]
impl Extractor for HtmlSnapshotExtractor {
    async fn root_handle(&self, url: &str) -> Result<RootHandle, ExtractError> {
        let thread_key = thread_key_from_url(url, &self.thread_path_prefix);
        let document = match &thread_key {
            Some(key) => read_optional(&self.snapshot_path(key)).await?,
            None => None,
        };
        Ok(RootHandle {
            url: url.to_string(),
            thread_key,
            document,
        })
    }

    async fn extract(
        &self,
        handle: &RootHandle,
        options: &ExtractOptions,
    ) -> Result<Option<ExtractedPayload>, ExtractError> {
        options.signal.check()?;
        let Some(document) = &handle.document else {
            debug!(url = %handle.url, "no captured document for thread");
            return Ok(None);
        };
        parse_thread_html(document, &self.selectors, options).map(Some)
    }
}

/// Parse a captured conversation document into an [`ExtractedPayload`].
pub fn parse_thread_html(
    document: &str,
    selectors: &ThreadSelectors,
    options: &ExtractOptions,
) -> Result<ExtractedPayload, ExtractError> {
    let html = Html::parse_document(document);
    let root = html.root_element();

    let candidate = Participant {
        name: select_first_text(root, &selectors.candidate_name)?,
        profile_url: select_first_attr(root, &selectors.candidate_link, "href")?,
    };
    let me = Participant {
        name: select_first_attr(root, &selectors.me_name, &selectors.me_name_attr)?,
        profile_url: None,
    };

    let item_sel = parse_selector(&selectors.message_item)?;
    let mut messages = Vec::new();
    let mut last_sender: Option<String> = None;
    for item in root.select(&item_sel) {
        options.signal.check()?;
        let Some(text) = select_first_text(item, &selectors.message_body)? else {
            continue;
        };
        // Grouped messages only render the sender on the first bubble.
        let sender = select_first_text(item, &selectors.message_sender)?.or(last_sender.clone());
        last_sender.clone_from(&sender);
        let sent_at = select_first_attr(item, &selectors.message_time, "datetime")?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc));
        let from_me = match (&sender, &me.name) {
            (Some(sender), Some(me_name)) => sender.eq_ignore_ascii_case(me_name),
            _ => false,
        };
        messages.push(Message {
            sender,
            text,
            sent_at,
            from_me,
        });
    }

    if options.fill_missing_time {
        fill_missing_times(&mut messages);
    }

    Ok(ExtractedPayload {
        candidate,
        me,
        messages,
    })
}

/// Carry the last known timestamp forward; leading gaps take the first known one.
pub fn fill_missing_times(messages: &mut [Message]) {
    let Some(first_known) = messages.iter().find_map(|m| m.sent_at) else {
        return;
    };
    let mut current = first_known;
    for message in messages.iter_mut() {
        match message.sent_at {
            Some(ts) => current = ts,
            None => message.sent_at = Some(current),
        }
    }
}

/// Reads captured profile events from every `*.json` file in a directory.
///
/// A file holds either one object or an array of objects; each object needs a
/// `key` (or `profile_id`) string.
#[derive(Debug, Clone)]
pub struct JsonProfileExtractor {
    dir: PathBuf,
}

impl JsonProfileExtractor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn json_files(&self) -> Result<Vec<PathBuf>, ExtractError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(ExtractError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| ExtractError::Io {
            path: self.dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ProfileExtractor for JsonProfileExtractor {
    async fn extract_profiles(
        &self,
        signal: &AbortSignal,
    ) -> Result<Vec<ProfileRecord>, ExtractError> {
        let mut records = Vec::new();
        for path in self.json_files().await? {
            signal.check()?;
            let text = fs::read_to_string(&path)
                .await
                .map_err(|source| ExtractError::Io {
                    path: path.clone(),
                    source,
                })?;
            let value: JsonValue =
                serde_json::from_str(&text).map_err(|err| ExtractError::Parse {
                    path: path.clone(),
                    message: err.to_string(),
                })?;
            let objects = match value {
                JsonValue::Array(items) => items,
                other => vec![other],
            };
            for object in objects {
                match profile_record(object) {
                    Some(record) => records.push(record),
                    None => warn!(path = %path.display(), "skipping profile without key"),
                }
            }
        }
        Ok(records)
    }
}

fn profile_record(value: JsonValue) -> Option<ProfileRecord> {
    let JsonValue::Object(payload) = value else {
        return None;
    };
    let key = ["key", "profile_id"]
        .iter()
        .find_map(|field| payload.get(*field).and_then(JsonValue::as_str))
        .and_then(|k| text_or_none(k.to_string()))?;
    Some(ProfileRecord { key, payload })
}

async fn read_optional(path: &Path) -> Result<Option<String>, ExtractError> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ExtractError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn file_safe(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '=' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|_| ExtractError::Selector(selector.to_string()))
}

fn select_first_text(scope: ElementRef<'_>, selector: &str) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    scope: ElementRef<'_>,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(scope
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

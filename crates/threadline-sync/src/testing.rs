//! In-memory collaborators for engine tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use threadline_core::{ExtractedPayload, Message, Participant};
use threadline_extract::{ExtractError, ExtractOptions, Extractor, RootHandle};
use threadline_transport::header::HeaderMap;
use threadline_transport::{ResponseBody, Transport, TransportError, TransportResponse};

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Records every request and answers from a script, then from a default.
pub(crate) struct RecordingTransport {
    calls: Mutex<Vec<RecordedCall>>,
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    fallback: Result<TransportResponse, TransportError>,
}

impl RecordingTransport {
    pub fn ok() -> Arc<Self> {
        Self::with_fallback(Ok(response(200)))
    }

    pub fn with_fallback(fallback: Result<TransportResponse, TransportError>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback,
        })
    }

    pub fn push(&self, reply: Result<TransportResponse, TransportError>) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn batches(&self) -> Vec<Vec<Value>> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.body.as_array().cloned())
            .collect()
    }

    pub fn batch_keys(&self) -> Vec<Vec<String>> {
        self.batches()
            .into_iter()
            .map(|batch| {
                batch
                    .iter()
                    .filter_map(|event| event["key"].as_str().map(str::to_owned))
                    .collect()
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post_json(
        &self,
        url: &str,
        headers: HeaderMap,
        body: &Value,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.lock().unwrap().push(RecordedCall {
            url: url.to_string(),
            headers,
            body: body.clone(),
        });
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

pub(crate) fn response(status: u16) -> TransportResponse {
    TransportResponse {
        status,
        body: ResponseBody::Json(json!({ "status": status })),
    }
}

pub(crate) fn network_error() -> TransportError {
    TransportError::Network("connection refused".into())
}

pub(crate) fn usable_payload() -> ExtractedPayload {
    ExtractedPayload {
        candidate: Participant {
            name: Some("Sam Candidate".into()),
            profile_url: Some("https://www.linkedin.com/in/sam/".into()),
        },
        me: Participant {
            name: Some("Jordan Recruiter".into()),
            profile_url: None,
        },
        messages: vec![Message {
            sender: Some("Sam Candidate".into()),
            text: "Hello".into(),
            sent_at: None,
            from_me: false,
        }],
    }
}

/// Returns a fixed payload and counts extractions.
pub(crate) struct StubExtractor {
    payload: Option<ExtractedPayload>,
    extractions: AtomicUsize,
}

impl StubExtractor {
    pub fn returning(payload: Option<ExtractedPayload>) -> Arc<Self> {
        Arc::new(Self {
            payload,
            extractions: AtomicUsize::new(0),
        })
    }

    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for StubExtractor {
    async fn root_handle(&self, url: &str) -> Result<RootHandle, ExtractError> {
        Ok(RootHandle {
            url: url.to_string(),
            thread_key: None,
            document: None,
        })
    }

    async fn extract(
        &self,
        _handle: &RootHandle,
        options: &ExtractOptions,
    ) -> Result<Option<ExtractedPayload>, ExtractError> {
        assert!(options.fill_missing_time);
        self.extractions.fetch_add(1, Ordering::SeqCst);
        Ok(self.payload.clone())
    }
}

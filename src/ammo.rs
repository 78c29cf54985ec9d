//! Per-request context.
//!
//! [`Ammo`] is what handlers and middleware receive: the parsed request head,
//! the merged payload, and the response channel. Clones share state, so a
//! step can hold its own handle while the dispatcher keeps the original. The
//! `sent` latch is atomic: whichever send lands first wins, every later send
//! is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::Method;
use serde_json::{Map, Value};

use crate::error::HttpError;
use crate::status::infer_content_type;

/// Immutable request head, shared by every clone of one request's [`Ammo`].
#[derive(Debug)]
pub struct RequestInfo {
    pub method: Method,
    /// Path including the query string, as received.
    pub path: String,
    /// Path with the query string stripped.
    pub endpoint: String,
    pub ip: String,
    pub protocol: String,
    pub hostname: String,
    pub full_url: String,
    pub headers: Vec<(String, String)>,
}

impl RequestInfo {
    /// Case-insensitive header lookup, first occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The materialized response, extracted by the dispatcher after the chain.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub content_type: String,
    pub body: Bytes,
    pub headers: Vec<(String, String)>,
}

#[derive(Default)]
struct ResponderInner {
    sent: AtomicBool,
    headers: Mutex<Vec<(String, String)>>,
    reply: Mutex<Option<Reply>>,
    dispatched: Mutex<Option<Value>>,
}

/// Response channel with a write-once latch.
#[derive(Clone, Default)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

impl Responder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> bool {
        self.inner.sent.load(Ordering::SeqCst)
    }

    /// Queues a header for the eventual response. Ignored once sent.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        if self.sent() {
            return;
        }
        let mut headers = self.inner.headers.lock().expect("responder lock poisoned");
        headers.push((name.into(), value.into()));
    }

    /// Sends a value with an inferred content type. Returns `false` when the
    /// latch was already set and nothing was written.
    pub fn send(&self, status: u16, value: Value) -> bool {
        let content_type = infer_content_type(&value).to_string();
        let body = match &value {
            Value::String(s) => Bytes::from(s.clone()),
            other => match serde_json::to_vec(other) {
                Ok(bytes) => Bytes::from(bytes),
                Err(_) => return self.send_text(500, "Internal Server Error"),
            },
        };
        self.finish(status, content_type, body, Some(value))
    }

    /// Sends a plain-text body.
    pub fn send_text(&self, status: u16, text: &str) -> bool {
        self.finish(
            status,
            "text/plain".to_string(),
            Bytes::from(text.to_string()),
            Some(Value::String(text.to_string())),
        )
    }

    /// Sends an HTML body.
    pub fn send_html(&self, status: u16, html: &str) -> bool {
        self.finish(
            status,
            "text/html".to_string(),
            Bytes::from(html.to_string()),
            Some(Value::String(html.to_string())),
        )
    }

    /// Resolves an error and sends its plain-text reply.
    pub fn send_error(&self, error: &HttpError) -> bool {
        let (status, message) = error.resolve();
        self.send_text(status, &message)
    }

    /// Atomically claims the latch, then materializes the reply.
    fn finish(&self, status: u16, content_type: String, body: Bytes, value: Option<Value>) -> bool {
        if self
            .inner
            .sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let headers = {
            let mut queued = self.inner.headers.lock().expect("responder lock poisoned");
            std::mem::take(&mut *queued)
        };
        *self.inner.reply.lock().expect("responder lock poisoned") = Some(Reply {
            status,
            content_type,
            body,
            headers,
        });
        *self.inner.dispatched.lock().expect("responder lock poisoned") = value;
        true
    }

    /// Last dispatched body, for the access log.
    pub fn dispatched_data(&self) -> Option<Value> {
        self.inner
            .dispatched
            .lock()
            .expect("responder lock poisoned")
            .clone()
    }

    pub(crate) fn take_reply(&self) -> Option<Reply> {
        self.inner.reply.lock().expect("responder lock poisoned").take()
    }
}

/// The request context handed to every chain step.
#[derive(Clone)]
pub struct Ammo {
    info: Arc<RequestInfo>,
    payload: Arc<Mutex<Map<String, Value>>>,
    responder: Responder,
}

impl Ammo {
    pub(crate) fn new(info: RequestInfo, payload: Map<String, Value>) -> Self {
        Self {
            info: Arc::new(info),
            payload: Arc::new(Mutex::new(payload)),
            responder: Responder::new(),
        }
    }

    pub fn request(&self) -> &Arc<RequestInfo> {
        &self.info
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    pub fn method(&self) -> &Method {
        &self.info.method
    }

    pub fn is_get(&self) -> bool {
        self.info.method == Method::GET
    }

    pub fn is_post(&self) -> bool {
        self.info.method == Method::POST
    }

    pub fn is_put(&self) -> bool {
        self.info.method == Method::PUT
    }

    pub fn is_delete(&self) -> bool {
        self.info.method == Method::DELETE
    }

    pub fn is_patch(&self) -> bool {
        self.info.method == Method::PATCH
    }

    pub fn is_head(&self) -> bool {
        self.info.method == Method::HEAD
    }

    pub fn is_options(&self) -> bool {
        self.info.method == Method::OPTIONS
    }

    pub fn path(&self) -> &str {
        &self.info.path
    }

    pub fn endpoint(&self) -> &str {
        &self.info.endpoint
    }

    pub fn ip(&self) -> &str {
        &self.info.ip
    }

    pub fn protocol(&self) -> &str {
        &self.info.protocol
    }

    pub fn hostname(&self) -> &str {
        &self.info.hostname
    }

    pub fn full_url(&self) -> &str {
        &self.info.full_url
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.info.header(name).map(str::to_string)
    }

    /// One payload field: query, body and route params merged.
    pub fn field(&self, name: &str) -> Option<Value> {
        self.payload
            .lock()
            .expect("payload lock poisoned")
            .get(name)
            .cloned()
    }

    /// Snapshot of the whole payload.
    pub fn payload(&self) -> Map<String, Value> {
        self.payload.lock().expect("payload lock poisoned").clone()
    }

    pub fn set_field(&self, name: impl Into<String>, value: Value) {
        self.payload
            .lock()
            .expect("payload lock poisoned")
            .insert(name.into(), value);
    }

    pub fn sent(&self) -> bool {
        self.responder.sent()
    }

    /// Sends a 200 with an inferred content type.
    pub fn send(&self, value: Value) -> bool {
        self.responder.send(200, value)
    }

    pub fn send_status(&self, status: u16, value: Value) -> bool {
        self.responder.send(status, value)
    }

    /// Routes an error through the error-sender. Idempotent: a latched
    /// response swallows the throw.
    pub fn throw(&self, error: impl Into<HttpError>) -> bool {
        self.responder.send_error(&error.into())
    }
}

//! Per-exchange recording to disk.
//!
//! Every exchange gets an id and up to four files under the recording
//! directory:
//!
//! - `{id}.start.json`: request metadata, written as soon as the request arrives
//! - `{id}.request`: the raw request body
//! - `{id}.response`: the raw response body, spooled while it streams
//! - `{id}.json`: the final record with both sides, previews, and timing
//!
//! Streamed bodies go through a [`ResponseTap`], which hands chunks to a
//! background writer task over an unbounded channel so the client stream never
//! waits on the disk. The final record is written exactly once per exchange.
//! Recording failures are logged and otherwise ignored.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, Method, StatusCode, Uri};
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::RecordingConfig;

const REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
];

pub const CLIENT_CLOSED_NOTE: &str = "client connection closed";

/// Header list with secrets masked.
pub fn redact_headers(headers: &HeaderMap) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, value) in headers {
        let key = name.as_str().to_ascii_lowercase();
        let shown = if REDACTED_HEADERS.contains(&key.as_str()) {
            "[redacted]".to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        match out.get_mut(&key) {
            Some(Value::Array(values)) => values.push(Value::String(shown)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(shown)]);
            }
            None => {
                out.insert(key, Value::String(shown));
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Map<String, Value>,
    pub content_type: Option<String>,
    /// `"direct"` or `"proxy"`.
    pub mode: &'static str,
}

impl RequestMeta {
    pub fn new(method: &Method, uri: &Uri, headers: &HeaderMap, mode: &'static str) -> Self {
        Self {
            method: method.to_string(),
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers: redact_headers(headers),
            content_type: content_type(headers),
            mode,
        }
    }

    fn to_json(&self) -> Value {
        json!({
            "method": self.method,
            "path": self.path,
            "query": self.query,
            "headers": self.headers,
            "mode": self.mode,
        })
    }
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// A body plus its content type, for previews.
#[derive(Debug, Clone, Default)]
pub struct CapturedBody {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl CapturedBody {
    pub fn new(content_type: Option<String>, bytes: Bytes) -> Self {
        Self {
            content_type,
            bytes,
        }
    }

    /// Preview capped at `limit` bytes: parsed JSON for JSON bodies, text for
    /// text-like bodies, base64 for everything else.
    pub fn preview(&self, limit: usize) -> Value {
        preview_bytes(self.content_type.as_deref(), &self.bytes, self.bytes.len(), limit)
    }
}

fn preview_bytes(content_type: Option<&str>, bytes: &[u8], total: usize, limit: usize) -> Value {
    let ct = content_type.unwrap_or("").to_ascii_lowercase();
    let shown = &bytes[..bytes.len().min(limit)];
    let truncated = total > shown.len();

    if ct.contains("json") && !ct.contains("ndjson") && !truncated {
        if let Ok(value) = serde_json::from_slice::<Value>(shown) {
            return json!({ "encoding": "json", "size": total, "truncated": false, "content": value });
        }
    }

    let textual = ct.starts_with("text/")
        || ct.contains("json")
        || ct.contains("event-stream")
        || ct.contains("ndjson")
        || (ct.is_empty() && std::str::from_utf8(shown).is_ok());

    if textual {
        json!({
            "encoding": "text",
            "size": total,
            "truncated": truncated,
            "content": String::from_utf8_lossy(shown),
        })
    } else {
        json!({
            "encoding": "base64",
            "size": total,
            "truncated": truncated,
            "content": base64::engine::general_purpose::STANDARD.encode(shown),
        })
    }
}

/// Status and headers of a response, as recorded.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Map<String, Value>,
    pub content_type: Option<String>,
}

impl ResponseHead {
    pub fn new(status: StatusCode, headers: &HeaderMap) -> Self {
        Self {
            status: status.as_u16(),
            headers: redact_headers(headers),
            content_type: content_type(headers),
        }
    }

    pub fn with_content_type(status: StatusCode, content_type: &str) -> Self {
        let mut headers = Map::new();
        headers.insert("content-type".to_string(), Value::String(content_type.to_string()));
        Self {
            status: status.as_u16(),
            headers,
            content_type: Some(content_type.to_string()),
        }
    }
}

/// How an exchange ended.
#[derive(Debug, Clone, Default)]
pub struct ExchangeOutcome {
    pub status: Option<u16>,
    pub headers: Map<String, Value>,
    pub body: Option<Value>,
    pub body_file: Option<PathBuf>,
    pub body_bytes: Option<u64>,
    pub error: Option<String>,
    pub note: Option<String>,
}

impl ExchangeOutcome {
    /// A fully buffered response.
    pub fn buffered(head: ResponseHead, body: &[u8], preview_limit: usize) -> Self {
        Self {
            status: Some(head.status),
            body: Some(preview_bytes(head.content_type.as_deref(), body, body.len(), preview_limit)),
            body_bytes: Some(body.len() as u64),
            headers: head.headers,
            ..Self::default()
        }
    }

    /// The request failed before any response head existed.
    pub fn failed(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status: Some(status.as_u16()),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// State for one in-flight exchange, shared by every party that may end it.
#[derive(Debug)]
pub struct ExchangeContext {
    pub id: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    meta: RequestMeta,
    request_body: Option<Value>,
    request_file: Option<PathBuf>,
    finalized: AtomicBool,
}

impl ExchangeContext {
    /// True for exactly one caller.
    pub fn try_claim_finalize(&self) -> bool {
        self.finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

pub fn generate_exchange_id() -> String {
    let token = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"), &token[..8])
}

#[derive(Debug)]
struct RecorderInner {
    dir: PathBuf,
    preview_bytes: usize,
    capture_request_body: bool,
}

/// Cheap to clone; disabled recorders never touch the filesystem.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRecorder {
    inner: Option<Arc<RecorderInner>>,
}

impl ExchangeRecorder {
    pub fn new(config: &RecordingConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        Self {
            inner: Some(Arc::new(RecorderInner {
                dir: config.dir.clone(),
                preview_bytes: config.preview_bytes,
                capture_request_body: config.capture_request_body,
            })),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn preview_limit(&self) -> usize {
        self.inner.as_ref().map_or(0, |i| i.preview_bytes)
    }

    /// Open an exchange: writes `{id}.start.json` and, when configured,
    /// `{id}.request`.
    pub async fn begin(&self, meta: RequestMeta, body: &Bytes) -> Arc<ExchangeContext> {
        let id = generate_exchange_id();
        let started_at = Utc::now();

        let Some(inner) = self.inner.as_ref() else {
            return Arc::new(ExchangeContext {
                id,
                started_at,
                started: Instant::now(),
                meta,
                request_body: None,
                request_file: None,
                finalized: AtomicBool::new(false),
            });
        };

        if let Err(e) = tokio::fs::create_dir_all(&inner.dir).await {
            tracing::warn!(dir = %inner.dir.display(), error = %e, "Cannot create recording directory");
        }

        let start = json!({
            "id": id,
            "started_at": started_at.to_rfc3339(),
            "request": meta.to_json(),
        });
        write_json(&inner.dir.join(format!("{id}.start.json")), &start).await;

        let mut request_file = None;
        if inner.capture_request_body && !body.is_empty() {
            let path = inner.dir.join(format!("{id}.request"));
            match tokio::fs::write(&path, body).await {
                Ok(()) => request_file = Some(path),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to write request body"),
            }
        }

        let request_body = CapturedBody::new(meta.content_type.clone(), body.clone())
            .preview(inner.preview_bytes);

        Arc::new(ExchangeContext {
            id,
            started_at,
            started: Instant::now(),
            meta,
            request_body: Some(request_body),
            request_file,
            finalized: AtomicBool::new(false),
        })
    }

    /// Write `{id}.json`. Only the first call per exchange has any effect;
    /// returns whether this call was it.
    pub async fn finalize(&self, ctx: &ExchangeContext, outcome: ExchangeOutcome) -> bool {
        if !ctx.try_claim_finalize() {
            return false;
        }

        let elapsed_ms = ctx.started.elapsed().as_millis() as u64;
        tracing::info!(
            exchange = %ctx.id,
            method = %ctx.meta.method,
            path = %ctx.meta.path,
            status = ?outcome.status,
            elapsed_ms,
            error = ?outcome.error,
            note = ?outcome.note,
            "Exchange finished"
        );

        let Some(inner) = self.inner.as_ref() else {
            return true;
        };

        let record = json!({
            "id": ctx.id,
            "started_at": ctx.started_at.to_rfc3339(),
            "finished_at": Utc::now().to_rfc3339(),
            "duration_ms": elapsed_ms,
            "request": {
                "method": ctx.meta.method,
                "path": ctx.meta.path,
                "query": ctx.meta.query,
                "headers": ctx.meta.headers,
                "mode": ctx.meta.mode,
                "body": ctx.request_body,
                "body_file": ctx.request_file.as_deref().map(file_name),
            },
            "response": {
                "status": outcome.status,
                "headers": outcome.headers,
                "body": outcome.body,
                "body_bytes": outcome.body_bytes,
                "body_file": outcome.body_file.as_deref().map(file_name),
            },
            "error": outcome.error,
            "note": outcome.note,
        });

        write_json(&inner.dir.join(format!("{}.json", ctx.id)), &record).await;
        true
    }

    /// Start spooling a streamed response body.
    pub fn tap(&self, ctx: Arc<ExchangeContext>, head: ResponseHead) -> ResponseTap {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = self.clone();
        let spool_path = self
            .inner
            .as_ref()
            .map(|inner| inner.dir.join(format!("{}.response", ctx.id)));

        tokio::spawn(spool_response(recorder, ctx, head, spool_path, rx));

        ResponseTap {
            tx: Some(tx),
            closed: false,
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn write_json(path: &Path, value: &Value) {
    let rendered = match serde_json::to_vec_pretty(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize exchange record");
            return;
        }
    };
    // readers never see a half-written record
    let staging = path.with_extension("tmp");
    let result = match tokio::fs::write(&staging, rendered).await {
        Ok(()) => tokio::fs::rename(&staging, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "Failed to write exchange record");
    }
}

#[derive(Debug)]
enum TapMessage {
    Chunk(Bytes),
    Close {
        error: Option<String>,
        note: Option<String>,
    },
}

async fn spool_response(
    recorder: ExchangeRecorder,
    ctx: Arc<ExchangeContext>,
    head: ResponseHead,
    spool_path: Option<PathBuf>,
    rx: mpsc::UnboundedReceiver<TapMessage>,
) {
    let preview_limit = recorder.preview_limit();
    let mut file = match spool_path.as_ref() {
        Some(path) => match tokio::fs::File::create(path).await {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to open response spool");
                None
            }
        },
        None => None,
    };
    let mut write_ok = file.is_some();
    let mut preview = Vec::new();
    let mut total: u64 = 0;
    let mut closing = (None, Some(CLIENT_CLOSED_NOTE.to_string()));

    let mut messages = UnboundedReceiverStream::new(rx);
    while let Some(message) = messages.next().await {
        match message {
            TapMessage::Chunk(chunk) => {
                total += chunk.len() as u64;
                if preview.len() < preview_limit {
                    let take = chunk.len().min(preview_limit - preview.len());
                    preview.extend_from_slice(&chunk[..take]);
                }
                if let Some(f) = file.as_mut() {
                    if let Err(e) = f.write_all(&chunk).await {
                        tracing::warn!(exchange = %ctx.id, error = %e, "Response spool write failed");
                        write_ok = false;
                        file = None;
                    }
                }
            }
            TapMessage::Close { error, note } => {
                closing = (error, note);
                break;
            }
        }
    }

    if let Some(mut f) = file.take() {
        if let Err(e) = f.flush().await {
            tracing::warn!(exchange = %ctx.id, error = %e, "Response spool flush failed");
            write_ok = false;
        }
    }

    let (error, note) = closing;
    let outcome = ExchangeOutcome {
        status: Some(head.status),
        body: recorder.is_enabled().then(|| {
            preview_bytes(head.content_type.as_deref(), &preview, total as usize, preview_limit)
        }),
        headers: head.headers,
        body_file: spool_path.filter(|_| write_ok),
        body_bytes: Some(total),
        error,
        note,
    };
    recorder.finalize(&ctx, outcome).await;
}

/// Sink for a streamed response body. Dropping it without [`close`](Self::close)
/// records the exchange as ended by the client.
#[derive(Debug)]
pub struct ResponseTap {
    tx: Option<mpsc::UnboundedSender<TapMessage>>,
    closed: bool,
}

impl ResponseTap {
    pub fn push(&self, chunk: &Bytes) {
        if let Some(tx) = self.tx.as_ref() {
            let _ = tx.send(TapMessage::Chunk(chunk.clone()));
        }
    }

    /// Normal end (`error == None`) or upstream failure mid-stream.
    pub fn close(mut self, error: Option<String>) {
        self.send_close(error, None);
    }

    fn send_close(&mut self, error: Option<String>, note: Option<String>) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(TapMessage::Close { error, note });
        }
    }
}

impl Drop for ResponseTap {
    fn drop(&mut self) {
        self.send_close(None, Some(CLIENT_CLOSED_NOTE.to_string()));
    }
}

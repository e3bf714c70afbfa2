use crate::bridge;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::models;
use crate::recorder::{ExchangeContext, ExchangeOutcome, ExchangeRecorder, RequestMeta, ResponseHead, ResponseTap};
use crate::translate::model_name::ModelMapper;
use crate::translate::request::{build_upstream_request, parse_body, InboundRequest};
use crate::translate::response::render_completion;
use crate::translate::streaming::StreamTranscoder;
use crate::translate::types::{ClientApi, UpstreamCompletion};
use crate::upstream::{UpstreamDispatcher, UpstreamStream};

use axum::body::Body;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const ALLOWED_METHODS: [Method; 6] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::OPTIONS,
];

const ALLOWED_HEADERS: [HeaderName; 5] = [
    header::CONTENT_TYPE,
    header::AUTHORIZATION,
    HeaderName::from_static("x-requested-with"),
    header::ACCEPT,
    header::ORIGIN,
];

pub struct AppState {
    pub config: GatewayConfig,
    pub dispatcher: UpstreamDispatcher,
    pub mapper: ModelMapper,
    pub recorder: ExchangeRecorder,
    /// For proxy mode; no overall timeout so long-lived streams survive.
    pub proxy_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let proxy_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            dispatcher: UpstreamDispatcher::new(&config.upstream)?,
            mapper: ModelMapper::from_config(&config.upstream),
            recorder: ExchangeRecorder::new(&config.recording),
            proxy_client,
            config,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(ALLOWED_METHODS)
        .allow_headers(ALLOWED_HEADERS);

    let mut router = Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/responses", post(handle_responses))
        .route("/api/version", get(models::handle_version))
        .route("/api/tags", get(models::handle_tags))
        .route("/api/show", post(models::handle_show))
        .route("/health", get(handle_health));

    if state.config.proxy.enabled {
        router = router.fallback(bridge::forward);
    }

    router
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(cors)
        .layer(middleware::map_response(complete_cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn allow_list<'a>(items: impl Iterator<Item = &'a str>) -> Option<HeaderValue> {
    HeaderValue::from_str(&items.collect::<Vec<_>>().join(",")).ok()
}

/// `CorsLayer` answers every `OPTIONS` itself with 200 and only puts the
/// allow-lists on that preflight answer. Preflight becomes 204 here, and the
/// allow-lists go on every other response too.
async fn complete_cors(method: Method, mut response: Response) -> Response {
    if method == Method::OPTIONS {
        *response.status_mut() = StatusCode::NO_CONTENT;
        return response;
    }

    let headers = response.headers_mut();
    if let Some(methods) = allow_list(ALLOWED_METHODS.iter().map(Method::as_str)) {
        headers
            .entry(header::ACCESS_CONTROL_ALLOW_METHODS)
            .or_insert(methods);
    }
    if let Some(names) = allow_list(ALLOWED_HEADERS.iter().map(HeaderName::as_str)) {
        headers
            .entry(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .or_insert(names);
    }
    response
}

/// Unwrap a buffered body, turning axum's plain-text rejection into a
/// [`GatewayError`] so oversized bodies still get the JSON error shape.
pub(crate) fn read_body(
    body: std::result::Result<Bytes, BytesRejection>,
    limit: usize,
) -> Result<Bytes> {
    body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            GatewayError::PayloadTooLarge { limit }
        } else {
            GatewayError::validation_with_detail("Failed to read request body", rejection.body_text())
        }
    })
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    dispatch(state, ClientApi::ChatCompletions, method, uri, headers, body).await
}

async fn handle_responses(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    dispatch(state, ClientApi::Responses, method, uri, headers, body).await
}

async fn dispatch(
    state: Arc<AppState>,
    api: ClientApi,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let body = read_body(body, state.config.max_body_bytes);
    let ctx = state
        .recorder
        .begin(
            RequestMeta::new(&method, &uri, &headers, "direct"),
            body.as_ref().unwrap_or(&Bytes::new()),
        )
        .await;
    let body = match body {
        Ok(body) => body,
        Err(e) => return error_response(&state, &ctx, e).await,
    };

    let inbound = match parse_body(&body)
        .and_then(|value| build_upstream_request(&value, api, &state.mapper))
    {
        Ok(inbound) => inbound,
        Err(e) => return error_response(&state, &ctx, e).await,
    };

    tracing::info!(
        exchange = %ctx.id,
        model = %inbound.requested_model,
        target = %inbound.upstream.model,
        stream = inbound.stream,
        messages = inbound.upstream.messages.len(),
        "Request"
    );

    if inbound.stream {
        stream_completion(state, ctx, api, inbound).await
    } else {
        buffered_completion(state, ctx, api, inbound).await
    }
}

async fn buffered_completion(
    state: Arc<AppState>,
    ctx: Arc<ExchangeContext>,
    api: ClientApi,
    inbound: InboundRequest,
) -> Response {
    let completion = match state.dispatcher.complete(&inbound.upstream).await {
        Ok(c) => c,
        Err(e) => return error_response(&state, &ctx, e).await,
    };

    let body = render_completion(&completion, api, &inbound.requested_model);
    let bytes = serde_json::to_vec(&body).unwrap_or_default();

    state
        .recorder
        .finalize(
            &ctx,
            ExchangeOutcome::buffered(
                ResponseHead::with_content_type(StatusCode::OK, "application/json"),
                &bytes,
                state.recorder.preview_limit(),
            ),
        )
        .await;

    Json(body).into_response()
}

async fn stream_completion(
    state: Arc<AppState>,
    ctx: Arc<ExchangeContext>,
    api: ClientApi,
    inbound: InboundRequest,
) -> Response {
    let opened = match state.dispatcher.open_stream(&inbound.upstream).await {
        Ok(s) => s,
        Err(e) => return error_response(&state, &ctx, e).await,
    };

    let tap = state.recorder.tap(
        ctx.clone(),
        ResponseHead::with_content_type(StatusCode::OK, "text/event-stream"),
    );
    let transcoder = StreamTranscoder::new(api, inbound.requested_model);

    let body = match opened {
        UpstreamStream::Sse(response) => Body::from_stream(transcode_stream(
            response.bytes_stream(),
            transcoder,
            tap,
            ctx.id.clone(),
        )),
        UpstreamStream::Buffered(completion) => {
            Body::from_stream(replay_stream(completion, transcoder, tap))
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Re-frame an upstream SSE byte stream for the client, teeing every emitted
/// frame into the recorder.
fn transcode_stream(
    upstream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
    mut transcoder: StreamTranscoder,
    tap: ResponseTap,
    exchange: String,
) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        tokio::pin!(upstream);
        let mut failure = None;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    for frame in transcoder.push_bytes(&chunk) {
                        let bytes = frame.to_sse();
                        tap.push(&bytes);
                        yield Ok(bytes);
                    }
                }
                Err(e) => {
                    tracing::warn!(exchange = %exchange, error = %e, "Upstream stream failed");
                    failure = Some(format!("upstream stream error: {e}"));
                    break;
                }
            }
        }

        for frame in transcoder.finish() {
            let bytes = frame.to_sse();
            tap.push(&bytes);
            yield Ok(bytes);
        }

        tracing::debug!(exchange = %exchange, state = ?transcoder.state(), "Stream completed");
        tap.close(failure);
    }
}

fn replay_stream(
    completion: UpstreamCompletion,
    mut transcoder: StreamTranscoder,
    tap: ResponseTap,
) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        let mut frames = transcoder.replay_completion(&completion);
        frames.extend(transcoder.finish());

        for frame in frames {
            let bytes = frame.to_sse();
            tap.push(&bytes);
            yield Ok(bytes);
        }
        tap.close(None);
    }
}

pub(crate) async fn error_response(state: &AppState, ctx: &ExchangeContext, err: GatewayError) -> Response {
    let status = err.status();
    if status.is_server_error() {
        tracing::error!(exchange = %ctx.id, error = %err, "Request failed");
    } else {
        tracing::warn!(exchange = %ctx.id, error = %err, "Rejected request");
    }

    let body = err.body();
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    let mut outcome = ExchangeOutcome::buffered(
        ResponseHead::with_content_type(status, "application/json"),
        &bytes,
        state.recorder.preview_limit(),
    );
    outcome.error = Some(err.to_string());
    state.recorder.finalize(ctx, outcome).await;

    (status, Json(body)).into_response()
}

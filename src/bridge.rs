//! Transparent reverse proxy for everything direct dispatch does not handle.
//!
//! Requests are forwarded to `proxy.target` unchanged apart from hop-by-hop
//! headers; the response body is streamed back chunk by chunk and teed into
//! the exchange recorder.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;

use crate::error::ErrorBody;
use crate::recorder::{ExchangeOutcome, RequestMeta, ResponseHead};
use crate::server::{error_response, read_body, AppState};

/// Never forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

fn forwardable_request_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !is_hop_by_hop(&lower) && lower != "host" && lower != "content-length"
}

fn forwardable_response_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !is_hop_by_hop(&lower) && lower != "content-length"
}

pub fn target_url(target: &str, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    format!("{}{}", target.trim_end_matches('/'), path_and_query)
}

/// Router fallback when proxy mode is on.
pub async fn forward(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let body = read_body(body, state.config.max_body_bytes);
    let ctx = state
        .recorder
        .begin(
            RequestMeta::new(&method, &uri, &headers, "proxy"),
            body.as_ref().unwrap_or(&Bytes::new()),
        )
        .await;
    let body = match body {
        Ok(body) => body,
        Err(e) => return error_response(&state, &ctx, e).await,
    };
    let url = target_url(&state.config.proxy.target, &uri);

    tracing::info!(exchange = %ctx.id, %method, %url, "Forwarding to proxy target");

    let mut outbound = HeaderMap::new();
    for (name, value) in &headers {
        if forwardable_request_header(name.as_str()) {
            outbound.append(name.clone(), value.clone());
        }
    }
    outbound.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));

    let sent = state
        .proxy_client
        .request(method, &url)
        .headers(outbound)
        .body(body)
        .send()
        .await;

    let upstream = match sent {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(exchange = %ctx.id, error = %e, "Proxy target unreachable");
            let body = ErrorBody::with_detail("Proxy error", e.to_string());
            state
                .recorder
                .finalize(&ctx, ExchangeOutcome::failed(StatusCode::BAD_GATEWAY, e.to_string()))
                .await;
            return (StatusCode::BAD_GATEWAY, Json(body)).into_response();
        }
    };

    let status = upstream.status();
    let is_event_stream = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if forwardable_response_header(name.as_str()) {
            response_headers.append(name.clone(), value.clone());
        }
    }
    if is_event_stream {
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        response_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        response_headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    }

    let tap = state
        .recorder
        .tap(ctx.clone(), ResponseHead::new(status, upstream.headers()));
    let exchange = ctx.id.clone();
    let chunks = upstream.bytes_stream();

    let body = async_stream::stream! {
        tokio::pin!(chunks);
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    tap.push(&chunk);
                    yield Ok::<Bytes, std::io::Error>(chunk);
                }
                Err(e) => {
                    tracing::warn!(exchange = %exchange, error = %e, "Proxy target stream failed");
                    tap.close(Some(format!("upstream stream error: {e}")));
                    yield Err(std::io::Error::other(e));
                    return;
                }
            }
        }
        tap.close(None);
    };

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

//! Axum surface for the proxy: the vendor path table routes into the
//! dispatch engine, and engine responses (buffered or streaming) translate
//! back into axum responses.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use ccload_core::{ProxyEngine, ProxyRequest, ProxyResponse};

#[derive(Clone)]
struct RouterState {
    engine: Arc<ProxyEngine>,
}

pub fn proxy_router(engine: Arc<ProxyEngine>) -> Router {
    let state = RouterState { engine };

    Router::new()
        .route("/v1/messages", post(proxy))
        .route("/v1/messages/{*rest}", post(proxy))
        .route("/v1/responses", post(proxy))
        .route("/v1/responses/{*rest}", post(proxy))
        .route("/v1/chat/completions", post(proxy))
        .route("/v1/completions", post(proxy))
        .route("/v1/embeddings", post(proxy))
        .route("/v1/images/{*rest}", post(proxy))
        // Gemini paths match on `contains /v1beta/`, which axum's router
        // cannot express; the fallback re-checks the raw path.
        .fallback(fallback)
        .with_state(state)
}

async fn proxy(
    State(state): State<RouterState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, uri, headers, body).await
}

async fn fallback(
    State(state): State<RouterState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !uri.path().contains("/v1beta/") {
        return (StatusCode::NOT_FOUND, "unknown path").into_response();
    }
    dispatch(state, uri, headers, body).await
}

async fn dispatch(state: RouterState, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let request = ProxyRequest {
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers,
        body,
    };
    to_axum_response(state.engine.dispatch(request).await)
}

fn to_axum_response(response: ProxyResponse) -> Response {
    match response {
        ProxyResponse::Full {
            status,
            headers,
            body,
        } => build_response(status, &headers, false, Body::from(body)),
        ProxyResponse::Stream {
            status,
            headers,
            body,
        } => {
            let stream = ReceiverStream::new(body).map(Ok::<_, Infallible>);
            build_response(status, &headers, true, Body::from_stream(stream))
        }
    }
}

fn build_response(
    status: u16,
    headers: &[(String, String)],
    is_stream: bool,
    body: Body,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(map) = builder.headers_mut() {
        for (name, value) in headers {
            // Hop-by-hop and framing headers are hyper's business.
            if is_hop_by_hop_or_framing_header(name) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        if is_stream {
            // Hint intermediate proxies not to buffer SSE.
            map.entry(header::CACHE_CONTROL)
                .or_insert(HeaderValue::from_static("no-cache"));
            map.entry(HeaderName::from_static("x-accel-buffering"))
                .or_insert(HeaderValue::from_static("no"));
        }
    }
    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response build failed").into_response()
    })
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        assert!(is_hop_by_hop_or_framing_header("Content-Length"));
        assert!(is_hop_by_hop_or_framing_header("transfer-encoding"));
        assert!(!is_hop_by_hop_or_framing_header("content-type"));
        assert!(!is_hop_by_hop_or_framing_header("anthropic-version"));
    }

    #[test]
    fn full_response_translates_status_and_headers() {
        let response = to_axum_response(ProxyResponse::Full {
            status: 429,
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("connection".to_string(), "close".to_string()),
            ],
            body: Bytes::from_static(b"{}"),
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert!(response.headers().get(header::CONNECTION).is_none());
    }

    #[tokio::test]
    async fn stream_response_carries_sse_hints() {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(tx);
        let response = to_axum_response(ProxyResponse::Stream {
            status: 200,
            headers: vec![(
                "content-type".to_string(),
                "text/event-stream".to_string(),
            )],
            body: rx,
        });
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");
    }
}

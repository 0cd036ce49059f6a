//! Maps an incoming proxy request onto a channel type, a model, and a
//! stream flag. Paths follow the client surface: `/v1/messages*` is
//! Anthropic, `/v1/responses*` is Codex, the OpenAI completion/embedding/
//! image prefixes are OpenAI, and anything containing `/v1beta/` is Gemini.

use http::HeaderMap;

use ccload_common::ChannelType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub channel_type: ChannelType,
    pub model: String,
    pub is_stream: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("unknown proxy path")]
    UnknownPath,
    #[error("request body carries no model")]
    MissingModel,
    #[error("invalid request body: {0}")]
    InvalidBody(String),
}

impl RouteError {
    pub fn status(&self) -> u16 {
        match self {
            RouteError::UnknownPath => 404,
            RouteError::MissingModel | RouteError::InvalidBody(_) => 400,
        }
    }
}

const OPENAI_PREFIXES: [&str; 4] = [
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/images/",
];

pub fn classify_route(
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Route, RouteError> {
    if path.contains("/v1beta/") {
        return classify_gemini(path, query, headers);
    }

    let channel_type = if path.starts_with("/v1/messages") {
        ChannelType::Anthropic
    } else if path.starts_with("/v1/responses") {
        ChannelType::Codex
    } else if OPENAI_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        ChannelType::Openai
    } else {
        return Err(RouteError::UnknownPath);
    };

    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|err| RouteError::InvalidBody(err.to_string()))?;
    let model = value
        .get("model")
        .and_then(|model| model.as_str())
        .filter(|model| !model.is_empty())
        .ok_or(RouteError::MissingModel)?
        .to_string();
    let is_stream = value
        .get("stream")
        .and_then(|stream| stream.as_bool())
        .unwrap_or(false)
        || accepts_sse(headers);

    Ok(Route {
        channel_type,
        model,
        is_stream,
    })
}

fn classify_gemini(
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
) -> Result<Route, RouteError> {
    const MARKER: &str = "/models/";
    let start = path.find(MARKER).ok_or(RouteError::UnknownPath)? + MARKER.len();
    let rest = &path[start..];
    let (model, action) = match rest.split_once(':') {
        Some((model, action)) => (model, Some(action)),
        None => (rest, None),
    };
    if model.is_empty() {
        return Err(RouteError::MissingModel);
    }
    let is_stream = action == Some("streamGenerateContent")
        || query.unwrap_or("").split('&').any(|pair| pair == "alt=sse")
        || accepts_sse(headers);

    Ok(Route {
        channel_type: ChannelType::Gemini,
        model: model.to_string(),
        is_stream,
    })
}

fn accepts_sse(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

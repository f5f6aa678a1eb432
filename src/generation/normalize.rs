//! Model Response Normalizer.
//!
//! Backends answer with a URL string, a list, a keyed object, or raw bytes. The
//! normalizer collapses all of them into one [`GeneratedImage`] before anything
//! downstream sees the result, persisting byte output through the Blob Sink.
//!
//! Checks run in a fixed order and the first match wins:
//! 1. a string that starts with `http` is the URL;
//! 2. a sequence is judged by its first element only;
//! 3. a byte stream is drained in arrival order and stored;
//! 4. a mapping is scanned in delivery order for the first URL string, object
//!    exposing `url`, or byte stream. An empty mapping means the backend
//!    silently declined to generate.

use super::{ByteStream, RawModelOutput};
use crate::storage::{BlobSink, StorageError};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_CONTENT_TYPE: &str = "image/png";

/// A fetchable reference to a generated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct GeneratedImage(String);

impl GeneratedImage {
    pub fn parse(candidate: &str) -> Result<Self, NormalizeError> {
        let trimmed = candidate.trim();
        let parsed =
            Url::parse(trimmed).map_err(|_| NormalizeError::InvalidUrl(trimmed.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(NormalizeError::InvalidUrl(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn url(&self) -> &str {
        &self.0
    }

    pub fn into_url(self) -> String {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("model returned an empty response; generation likely failed or was rejected")]
    EmptyResponse,
    #[error("unrecognized response shape: {0}")]
    UnrecognizedShape(String),
    #[error("Invalid image URL: {0}")]
    InvalidUrl(String),
    #[error("byte stream interrupted: {0}")]
    Stream(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

enum Located {
    Url(String),
    Stream(ByteStream),
}

#[derive(Clone)]
pub struct Normalizer {
    sink: Arc<dyn BlobSink>,
}

impl Normalizer {
    pub fn new(sink: Arc<dyn BlobSink>) -> Self {
        Self { sink }
    }

    /// `prefix` names the stored object for traceability (e.g. `flux-logo`).
    pub async fn normalize(
        &self,
        raw: RawModelOutput,
        content_type: &str,
        prefix: &str,
    ) -> Result<GeneratedImage, NormalizeError> {
        let shape = raw.shape();
        match locate(raw)? {
            Located::Url(url) => {
                debug!(target = "studio.pipeline", shape, %url, "model_output_url");
                GeneratedImage::parse(&url)
            }
            Located::Stream(stream) => {
                let bytes = drain(stream)
                    .await
                    .map_err(|err| NormalizeError::Stream(err.to_string()))?;
                if bytes.is_empty() {
                    return Err(NormalizeError::EmptyResponse);
                }
                let size = bytes.len();
                let url = self.sink.store(bytes, content_type, prefix).await?;
                info!(target = "studio.pipeline", shape, size, %url, "model_output_persisted");
                GeneratedImage::parse(&url)
            }
        }
    }
}

/// Reads a stream to its end, appending chunks in arrival order.
pub async fn drain(mut stream: ByteStream) -> Result<Bytes, std::io::Error> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

fn locate(raw: RawModelOutput) -> Result<Located, NormalizeError> {
    match raw {
        RawModelOutput::Text(text) if looks_like_url(&text) => Ok(Located::Url(text)),
        RawModelOutput::Text(text) => Err(NormalizeError::UnrecognizedShape(format!(
            "text is not a URL: {}",
            preview(&text)
        ))),
        RawModelOutput::Sequence(items) => match items.into_iter().next() {
            Some(first) => locate(first),
            None => Err(NormalizeError::EmptyResponse),
        },
        RawModelOutput::Stream(stream) => Ok(Located::Stream(stream)),
        RawModelOutput::Mapping(entries) => scan_mapping(entries),
        RawModelOutput::Other(value) => Err(NormalizeError::UnrecognizedShape(describe(&value))),
    }
}

fn scan_mapping(entries: Vec<(String, RawModelOutput)>) -> Result<Located, NormalizeError> {
    if entries.is_empty() {
        return Err(NormalizeError::EmptyResponse);
    }
    let mut keys = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        match value {
            RawModelOutput::Text(text) if looks_like_url(&text) || key == "url" => {
                return Ok(Located::Url(text));
            }
            RawModelOutput::Mapping(inner) => {
                if let Some(url) = url_field(inner) {
                    return Ok(Located::Url(url));
                }
            }
            RawModelOutput::Stream(stream) => return Ok(Located::Stream(stream)),
            _ => {}
        }
        keys.push(key);
    }
    Err(NormalizeError::UnrecognizedShape(format!(
        "no URL or byte stream among entries [{}]",
        keys.join(", ")
    )))
}

fn url_field(entries: Vec<(String, RawModelOutput)>) -> Option<String> {
    entries.into_iter().find_map(|(key, value)| match value {
        RawModelOutput::Text(text) if key == "url" => Some(text),
        _ => None,
    })
}

fn looks_like_url(text: &str) -> bool {
    text.trim_start()
        .get(..4)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http"))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        other => preview(&other.to_string()),
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(80).collect();
    if text.chars().count() > 80 {
        out.push_str("...");
    }
    out
}

//! Image-generation backends and the raw shapes they answer with.

pub mod normalize;
pub mod replicate;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use futures_util::{Stream, stream};
use serde_json::{Map, Value};
use std::{fmt, pin::Pin};
use thiserror::Error;

pub use normalize::{GeneratedImage, NormalizeError, Normalizer};
pub use replicate::ReplicateClient;

/// Undifferentiated image bytes, delivered in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Whatever a generation backend handed back, classified by its runtime shape.
/// Only the [`Normalizer`] consumes this.
pub enum RawModelOutput {
    Text(String),
    Sequence(Vec<RawModelOutput>),
    /// Entries in the order the backend delivered them.
    Mapping(Vec<(String, RawModelOutput)>),
    Stream(ByteStream),
    Other(Value),
}

impl RawModelOutput {
    /// Maps parsed JSON onto the variants; `data:` URIs carry their bytes inline
    /// and become single-chunk streams.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(text) => match decode_data_uri(&text) {
                Some(bytes) => Self::from_bytes(bytes),
                None => Self::Text(text),
            },
            Value::Array(items) => Self::Sequence(items.into_iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Mapping(
                map.into_iter()
                    .map(|(key, value)| (key, Self::from_json(value)))
                    .collect(),
            ),
            other => Self::Other(other),
        }
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self::from_chunks(vec![bytes])
    }

    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Self::Stream(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Sequence(_) => "sequence",
            Self::Mapping(_) => "mapping",
            Self::Stream(_) => "byte_stream",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Debug for RawModelOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Sequence(items) => f.debug_tuple("Sequence").field(items).finish(),
            Self::Mapping(entries) => f.debug_tuple("Mapping").field(entries).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Other(value) => f.debug_tuple("Other").field(value).finish(),
        }
    }
}

fn decode_data_uri(text: &str) -> Option<Bytes> {
    let rest = text.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    if !meta.ends_with(";base64") {
        return None;
    }
    BASE64.decode(payload.trim()).ok().map(Bytes::from)
}

/// How a model expects the ordered image list in its input object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageBinding {
    /// All images as one array field.
    List(&'static str),
    /// `{prefix}1`, `{prefix}2`, ... in list order.
    Numbered(&'static str),
    /// First image only.
    Single(&'static str),
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub id: String,
    pub binding: ImageBinding,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>, binding: ImageBinding) -> Self {
        Self {
            id: id.into(),
            binding,
        }
    }
}

/// One call to a generation backend. `images` order is meaningful to the model
/// and is never permuted.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub model: ModelSpec,
    pub instruction: Option<String>,
    pub images: Vec<String>,
    pub parameters: Map<String, Value>,
}

impl ImageRequest {
    pub fn new(model: ModelSpec, images: Vec<String>) -> Self {
        Self {
            model,
            instruction: None,
            images,
            parameters: Map::new(),
        }
    }

    pub fn instruction(mut self, text: impl Into<String>) -> Self {
        self.instruction = Some(text.into());
        self
    }

    pub fn parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Model input object: prompt, bound images, then free-form parameters.
    pub fn to_input(&self) -> Map<String, Value> {
        let mut input = Map::new();
        if let Some(text) = &self.instruction {
            input.insert("prompt".into(), Value::String(text.clone()));
        }
        match self.model.binding {
            ImageBinding::List(field) => {
                input.insert(
                    field.into(),
                    Value::Array(self.images.iter().cloned().map(Value::String).collect()),
                );
            }
            ImageBinding::Numbered(prefix) => {
                for (idx, url) in self.images.iter().enumerate() {
                    input.insert(format!("{prefix}{}", idx + 1), Value::String(url.clone()));
                }
            }
            ImageBinding::Single(field) => {
                if let Some(url) = self.images.first() {
                    input.insert(field.into(), Value::String(url.clone()));
                }
            }
        }
        for (key, value) in &self.parameters {
            input.entry(key.clone()).or_insert_with(|| value.clone());
        }
        input
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("authentication failed: missing credentials for {0}")]
    MissingCredentials(&'static str),
    #[error("request timeout: {0}")]
    Timeout(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("http error: {0}")]
    Http(String),
    #[error("prediction {status}: {detail}")]
    Prediction { status: String, detail: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Request URLs carry prediction ids whose digits can read like status codes,
/// so they are dropped before the message is classified.
impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        let err = err.without_url();
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Self::Http(err.to_string())
        }
    }
}

#[async_trait]
pub trait ImageModel: Send + Sync {
    async fn run(&self, request: ImageRequest) -> Result<RawModelOutput, BackendError>;
}

//! Blob Sink: durable storage for generated bytes.
//!
//! Every stage that receives raw image bytes from a backend persists them here
//! and forwards only the returned URL. Object names combine a millisecond
//! timestamp with a random suffix, so concurrent runs never need to coordinate.

pub mod memory;
pub mod supabase;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rand::{Rng, distr::Alphanumeric};
use thiserror::Error;

pub use memory::MemoryBlobSink;
pub use supabase::SupabaseStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("storage rejected object: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Persists `bytes` and returns a URL that is fetchable as soon as this returns.
    async fn store(
        &self,
        bytes: Bytes,
        content_type: &str,
        prefix: &str,
    ) -> Result<String, StorageError>;
}

/// `{namespace}/{prefix}-{unix_millis}-{suffix}.{ext}`
pub fn object_name(namespace: &str, prefix: &str, content_type: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(13)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    let prefix = sanitize_segment(prefix);
    format!(
        "{namespace}/{prefix}-{millis}-{suffix}.{ext}",
        namespace = namespace.trim_matches('/'),
        millis = Utc::now().timestamp_millis(),
        ext = extension_for(content_type),
    )
}

pub fn extension_for(content_type: &str) -> &'static str {
    match content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

fn sanitize_segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "object".to_string()
    } else {
        trimmed.to_string()
    }
}

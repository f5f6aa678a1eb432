use super::{BlobSink, StorageError, object_name};
use crate::config::StorageConfig;
use crate::http::build_client;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

/// Supabase Storage bucket used as the durable Blob Sink.
#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    base_url: String,
    service_key: String,
    bucket: String,
    namespace: String,
    http: Client,
}

impl SupabaseStorage {
    pub fn from_config(config: &StorageConfig, connect_timeout: Duration) -> Option<Self> {
        let base_url = config.supabase_url.clone()?;
        let service_key = config.supabase_key.clone()?;
        Some(Self {
            base_url,
            service_key,
            bucket: config.bucket.clone(),
            namespace: config.namespace.clone(),
            http: build_client(Duration::from_secs(60), connect_timeout),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            self.bucket,
            encode_path(key)
        )
    }

    pub fn public_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url,
            self.bucket,
            encode_path(key)
        )
    }
}

#[async_trait]
impl BlobSink for SupabaseStorage {
    async fn store(
        &self,
        bytes: Bytes,
        content_type: &str,
        prefix: &str,
    ) -> Result<String, StorageError> {
        let key = object_name(&self.namespace, prefix, content_type);
        let size = bytes.len();
        let response = self
            .http
            .post(self.object_url(&key))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", content_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await
            .map_err(|err| StorageError::Upload(err.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(target = "studio.storage", %key, status = status.as_u16(), "supabase_upload_rejected");
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let url = self.public_url(&key);
        info!(target = "studio.storage", %url, size, "supabase_blob_stored");
        Ok(url)
    }
}

fn encode_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

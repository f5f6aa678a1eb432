use super::{BlobSink, StorageError, object_name};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::info;

/// In-process sink for local development; objects are served back by the API
/// under `/blobs/`. Nothing is evicted, so every URL stays fetchable until the
/// process exits. Deployments configure Supabase instead.
#[derive(Clone)]
pub struct MemoryBlobSink {
    public_base_url: String,
    namespace: String,
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: String,
    pub bytes: Bytes,
}

impl MemoryBlobSink {
    pub fn new(public_base_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }
}

#[async_trait]
impl BlobSink for MemoryBlobSink {
    async fn store(
        &self,
        bytes: Bytes,
        content_type: &str,
        prefix: &str,
    ) -> Result<String, StorageError> {
        let key = object_name(&self.namespace, prefix, content_type);
        let size = bytes.len();
        self.objects.write().await.insert(
            key.clone(),
            StoredObject {
                content_type: content_type.to_string(),
                bytes,
            },
        );
        let url = format!("{}/blobs/{key}", self.public_base_url);
        info!(target = "studio.storage", %url, size, "memory_blob_stored");
        Ok(url)
    }
}

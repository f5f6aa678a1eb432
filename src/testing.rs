//! Scripted stand-ins for the chat, image and storage backends.

use crate::config::CallPolicy;
use crate::generation::{BackendError, ImageModel, ImageRequest, RawModelOutput};
use crate::llm::{ChatModel, LlmError, LlmMessage, LlmResponse};
use crate::storage::{BlobSink, MemoryBlobSink, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub fn policy() -> CallPolicy {
    CallPolicy {
        timeout: Duration::from_secs(5),
        max_retries: 0,
    }
}

/// Answers chat calls from a queue; an exhausted queue yields an error.
#[derive(Default)]
pub struct StubChat {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    seen: Mutex<Vec<Vec<LlmMessage>>>,
    calls: AtomicUsize,
}

impl StubChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(Ok(text.into()));
        self
    }

    pub fn fail(self, err: LlmError) -> Self {
        self.replies.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<LlmMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for StubChat {
    async fn chat(
        &self,
        messages: &[LlmMessage],
        _policy: CallPolicy,
    ) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(LlmResponse { text, usage: None }),
            Some(Err(err)) => Err(err),
            None => Err(LlmError::InvalidResponse("no scripted reply".into())),
        }
    }
}

enum Scripted {
    Json(Value),
    Chunks(Vec<Bytes>),
    Fail(BackendError),
}

/// Image backend that plays back scripted outputs in order.
#[derive(Default)]
pub struct StubImageModel {
    outputs: Mutex<VecDeque<Scripted>>,
    seen: Mutex<Vec<ImageRequest>>,
    calls: AtomicUsize,
}

impl StubImageModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, output: Scripted) -> Self {
        self.outputs.lock().unwrap().push_back(output);
        self
    }

    pub fn returning_json(self, value: Value) -> Self {
        self.push(Scripted::Json(value))
    }

    pub fn returning_bytes(self, chunks: Vec<Bytes>) -> Self {
        self.push(Scripted::Chunks(chunks))
    }

    pub fn failing(self, err: BackendError) -> Self {
        self.push(Scripted::Fail(err))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ImageRequest> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageModel for StubImageModel {
    async fn run(&self, request: ImageRequest) -> Result<RawModelOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request);
        let next = self.outputs.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Json(value)) => Ok(RawModelOutput::from_json(value)),
            Some(Scripted::Chunks(chunks)) => Ok(RawModelOutput::from_chunks(chunks)),
            Some(Scripted::Fail(err)) => Err(err),
            None => Err(BackendError::InvalidResponse("no scripted output".into())),
        }
    }
}

/// Memory sink that counts uploads and can be told to reject them.
pub struct RecordingSink {
    inner: MemoryBlobSink,
    stores: AtomicUsize,
    reject: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            inner: MemoryBlobSink::new("http://blobs.test", "studio-images"),
            stores: AtomicUsize::new(0),
            reject: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            reject: true,
            ..Self::new()
        }
    }

    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryBlobSink {
        &self.inner
    }
}

#[async_trait]
impl BlobSink for RecordingSink {
    async fn store(
        &self,
        bytes: Bytes,
        content_type: &str,
        prefix: &str,
    ) -> Result<String, StorageError> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(StorageError::Upload("bucket unavailable".into()));
        }
        self.inner.store(bytes, content_type, prefix).await
    }
}

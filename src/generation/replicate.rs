use super::{BackendError, ByteStream, ImageModel, ImageRequest, RawModelOutput};
use crate::config::ReplicateConfig;
use crate::http::{build_client, build_unbounded_client};
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{io, time::Duration};
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, info, warn};

/// Replicate predictions API. Image calls are never retried here: a second
/// attempt bills a second generation.
#[derive(Clone)]
pub struct ReplicateClient {
    api: Client,
    files: Client,
    config: ReplicateConfig,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    #[serde(default)]
    get: Option<String>,
}

impl Prediction {
    fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "succeeded" | "failed" | "canceled" | "aborted"
        )
    }
}

impl ReplicateClient {
    pub fn new(config: ReplicateConfig, connect_timeout: Duration) -> Self {
        Self {
            api: build_client(Duration::from_secs(70), connect_timeout),
            files: build_unbounded_client(connect_timeout),
            config,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, BackendError> {
        let token = self
            .config
            .api_token
            .as_deref()
            .ok_or(BackendError::MissingCredentials("replicate"))?;
        Ok(request.bearer_auth(token))
    }

    async fn create_prediction(&self, request: &ImageRequest) -> Result<Prediction, BackendError> {
        let (url, body) = prediction_endpoint(&self.config.base_url, &request.model.id, request);
        let wait = self.config.generation_timeout.as_secs().clamp(1, 60);
        let response = self
            .authorize(self.api.post(url))?
            .header("Prefer", format!("wait={wait}"))
            .json(&body)
            .send()
            .await?;
        read_prediction(response).await
    }

    async fn refresh(&self, prediction: &Prediction) -> Result<Prediction, BackendError> {
        let url = prediction
            .urls
            .as_ref()
            .and_then(|urls| urls.get.clone())
            .unwrap_or_else(|| format!("{}/v1/predictions/{}", self.config.base_url, prediction.id));
        let response = self.authorize(self.api.get(url))?.send().await?;
        read_prediction(response).await
    }

    async fn run_to_completion(&self, request: &ImageRequest) -> Result<Prediction, BackendError> {
        let mut prediction = self.create_prediction(request).await?;
        info!(
            target = "studio.replicate",
            model = %request.model.id,
            prediction = %prediction.id,
            status = %prediction.status,
            "prediction_created"
        );
        while !prediction.is_terminal() {
            sleep(self.config.poll_interval).await;
            prediction = self.refresh(&prediction).await?;
            debug!(target = "studio.replicate", prediction = %prediction.id, status = %prediction.status, "prediction_polled");
        }
        Ok(prediction)
    }

    async fn into_raw(&self, output: Value, deadline: Instant) -> Result<RawModelOutput, BackendError> {
        if self.config.fetch_file_outputs
            && let Some(url) = file_output_url(&output)
        {
            return self.fetch_stream(&url, deadline).await;
        }
        Ok(RawModelOutput::from_json(output))
    }

    /// The download shares the prediction's deadline, including the body chunks
    /// drained later by the normalizer.
    async fn fetch_stream(&self, url: &str, deadline: Instant) -> Result<RawModelOutput, BackendError> {
        let mut request = self.files.get(url);
        if url.starts_with(&self.config.base_url) {
            request = self.authorize(request)?;
        }
        let limit = self.config.generation_timeout.as_secs();
        let response = timeout_at(deadline, request.send())
            .await
            .map_err(|_| BackendError::Timeout(format!("file output not received within {limit}s")))??;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: format!("fetching file output {url}"),
            });
        }
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| io::Error::other(err.without_url())));
        Ok(RawModelOutput::Stream(until_deadline(
            Box::pin(body),
            deadline,
            limit,
        )))
    }
}

#[async_trait]
impl ImageModel for ReplicateClient {
    async fn run(&self, request: ImageRequest) -> Result<RawModelOutput, BackendError> {
        let started = Instant::now();
        let deadline = self.config.generation_timeout;
        let prediction = timeout(deadline, self.run_to_completion(&request))
            .await
            .map_err(|_| {
                BackendError::Timeout(format!(
                    "{} did not finish within {}s",
                    request.model.id,
                    deadline.as_secs()
                ))
            })??;

        if prediction.status != "succeeded" {
            let detail = prediction
                .error
                .as_ref()
                .map(|value| match value {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "no error detail".into());
            warn!(
                target = "studio.replicate",
                model = %request.model.id,
                prediction = %prediction.id,
                status = %prediction.status,
                %detail,
                "prediction_unsuccessful"
            );
            return Err(BackendError::Prediction {
                status: prediction.status,
                detail,
            });
        }

        info!(
            target = "studio.replicate",
            model = %request.model.id,
            prediction = %prediction.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "prediction_succeeded"
        );
        self.into_raw(prediction.output, started + deadline).await
    }
}

/// Ends the stream with a `TimedOut` error if the body is still open at `deadline`.
fn until_deadline(body: ByteStream, deadline: Instant, limit_secs: u64) -> ByteStream {
    Box::pin(stream::unfold(Some(body), move |body| async move {
        let mut body = body?;
        match timeout_at(deadline, body.next()).await {
            Ok(Some(chunk)) => Some((chunk, Some(body))),
            Ok(None) => None,
            Err(_) => Some((
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("file output download timeout after {limit_secs}s"),
                )),
                None,
            )),
        }
    }))
}

/// Versioned ids (`owner/name:version`) go to `/v1/predictions`, bare model
/// names to the model-scoped endpoint.
fn prediction_endpoint(base: &str, model: &str, request: &ImageRequest) -> (String, Value) {
    let input = Value::Object(request.to_input());
    match model.split_once(':') {
        Some((_, version)) => (
            format!("{base}/v1/predictions"),
            json!({ "version": version, "input": input }),
        ),
        None => (
            format!("{base}/v1/models/{model}/predictions"),
            json!({ "input": input }),
        ),
    }
}

fn file_output_url(output: &Value) -> Option<String> {
    let candidate = match output {
        Value::String(url) => Some(url.as_str()),
        Value::Array(items) => items.first().and_then(Value::as_str),
        _ => None,
    }?;
    candidate
        .starts_with("http")
        .then(|| candidate.to_string())
}

async fn read_prediction(response: reqwest::Response) -> Result<Prediction, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<Prediction>()
        .await
        .map_err(|err| BackendError::InvalidResponse(err.to_string()))
}

use super::{ChatModel, LlmError, LlmMessage, LlmResponse, LlmUsage};
use crate::config::{CallPolicy, OpenAiConfig};
use crate::http::build_unbounded_client;
use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// OpenAI-compatible chat completions, used for text and vision queries.
pub struct OpenAiClient {
    http: Client,
    config: OpenAiConfig,
    backoff_base: Duration,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig, connect_timeout: Duration) -> Self {
        Self {
            http: build_unbounded_client(connect_timeout),
            config,
            backoff_base: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    async fn attempt(
        &self,
        api_key: &str,
        body: &ChatRequest<'_>,
        timeout: Duration,
    ) -> Result<LlmResponse, LlmError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|err| {
                let err = err.without_url();
                if err.is_timeout() {
                    LlmError::Timeout(err.to_string())
                } else {
                    LlmError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let payload: ChatCompletion = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let choice = payload
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("missing choices".into()))?;
        Ok(LlmResponse {
            text: choice.message.content.unwrap_or_default(),
            usage: payload.usage,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_base * 2u32.saturating_pow(attempt);
        let jitter_ms = rand::rng().random_range(0..=self.backoff_base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn chat(
        &self,
        messages: &[LlmMessage],
        policy: CallPolicy,
    ) -> Result<LlmResponse, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey)?;
        let body = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let mut attempt = 0;
        loop {
            match self.attempt(api_key, &body, policy.timeout).await {
                Ok(response) => {
                    if let Some(usage) = &response.usage {
                        debug!(
                            target = "studio.llm",
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "chat_completed"
                        );
                    }
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(
                        target = "studio.llm",
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chat_retry"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [LlmMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use serde_json::{Value, json};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Clone)]
    struct Fake {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
        fail_status: StatusCode,
    }

    async fn completions(
        State(fake): State<Fake>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let seen = fake.calls.fetch_add(1, Ordering::SeqCst);
        if seen < fake.fail_first {
            return (fake.fail_status, Json(json!({"error": {"message": "overloaded"}})));
        }
        assert_eq!(body["model"], json!("gpt-4o"));
        (
            StatusCode::OK,
            Json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Soft key light."}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 4}
            })),
        )
    }

    async fn client_against(fail_first: usize, fail_status: StatusCode) -> (OpenAiClient, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(Fake {
                calls: calls.clone(),
                fail_first,
                fail_status,
            });
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let config = OpenAiConfig {
            base_url: base,
            api_key: Some("sk-test".into()),
            model: "gpt-4o".into(),
            temperature: 0.7,
            max_tokens: 1500,
        };
        let client =
            OpenAiClient::new(config, Duration::from_secs(2)).with_backoff(Duration::from_millis(5));
        (client, calls)
    }

    fn policy(max_retries: u32) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_secs(5),
            max_retries,
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let (client, calls) = client_against(2, StatusCode::SERVICE_UNAVAILABLE).await;
        let response = client
            .chat(&[LlmMessage::user("hi")], policy(3))
            .await
            .expect("chat");
        assert_eq!(response.text, "Soft key light.");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let (client, calls) = client_against(10, StatusCode::TOO_MANY_REQUESTS).await;
        let err = client
            .chat(&[LlmMessage::user("hi")], policy(2))
            .await
            .expect_err("exhausted");
        assert!(matches!(err, LlmError::Http { status: 429, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let (client, calls) = client_against(10, StatusCode::UNAUTHORIZED).await;
        let err = client
            .chat(&[LlmMessage::user("hi")], policy(3))
            .await
            .expect_err("unauthorized");
        assert!(err.to_string().contains("401"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

use crate::generation::{ImageBinding, ModelSpec};
use std::{env, time::Duration};

/// Process-wide settings, read once at startup and handed to each client.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub body_limit: usize,
    pub public_base_url: String,
    pub connect_timeout: Duration,
    pub openai: OpenAiConfig,
    pub style_call: CallPolicy,
    pub classify_call: CallPolicy,
    pub replicate: ReplicateConfig,
    pub models: ModelCatalog,
    pub storage: StorageConfig,
    pub jobs: JobsConfig,
    pub idempotency_ttl_secs: u64,
    pub redis_url: Option<String>,
    pub metrics_key: Option<String>,
    pub openapi_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port: u16 = env_parse("PORT").unwrap_or(8000);
        let public_base_url = env_string("PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://localhost:{port}"))
            .trim_end_matches('/')
            .to_string();
        let openai = OpenAiConfig::from_env();
        let models = ModelCatalog::from_env(openai.api_key.clone());
        Self {
            port,
            body_limit: env_parse::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(256 * 1024),
            public_base_url,
            connect_timeout: Duration::from_secs(
                env_parse("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(5),
            ),
            openai,
            style_call: CallPolicy::from_env("STYLE", 60, 3),
            classify_call: CallPolicy::from_env("CLASSIFY", 30, 2),
            replicate: ReplicateConfig::from_env(),
            models,
            storage: StorageConfig::from_env(),
            jobs: JobsConfig::from_env(),
            idempotency_ttl_secs: env_parse("IDEMPOTENCY_TTL_SECS").unwrap_or(3600),
            redis_url: env_string("REDIS_URL"),
            metrics_key: env_string("METRICS_KEY"),
            openapi_key: env_string("OPENAPI_KEY"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl OpenAiConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".into())
                .trim_end_matches('/')
                .to_string(),
            api_key: env_string("OPENAI_API_KEY"),
            model: env_string("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".into()),
            temperature: env_parse("OPENAI_TEMPERATURE").unwrap_or(0.7),
            max_tokens: env_parse("OPENAI_MAX_TOKENS").unwrap_or(1500),
        }
    }
}

/// Timeout and retry budget for one family of chat calls.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
}

impl CallPolicy {
    fn from_env(prefix: &str, timeout_secs: u64, max_retries: u32) -> Self {
        Self {
            timeout: Duration::from_secs(
                env_parse(&format!("{prefix}_TIMEOUT_SECS"))
                    .filter(|v| *v > 0)
                    .unwrap_or(timeout_secs),
            ),
            max_retries: env_parse(&format!("{prefix}_MAX_RETRIES")).unwrap_or(max_retries),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub generation_timeout: Duration,
    pub poll_interval: Duration,
    pub fetch_file_outputs: bool,
}

impl ReplicateConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("REPLICATE_BASE_URL")
                .unwrap_or_else(|| "https://api.replicate.com".into())
                .trim_end_matches('/')
                .to_string(),
            api_token: env_string("REPLICATE_API_TOKEN"),
            generation_timeout: Duration::from_secs(
                env_parse("GENERATION_TIMEOUT_SECS")
                    .filter(|v| *v > 0)
                    .unwrap_or(90),
            ),
            poll_interval: Duration::from_millis(
                env_parse("REPLICATE_POLL_INTERVAL_MS")
                    .filter(|v| *v > 0)
                    .unwrap_or(1000),
            ),
            fetch_file_outputs: parse_env_bool("REPLICATE_FETCH_FILE_OUTPUTS"),
        }
    }
}

/// Which backend model serves each generation stage.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub blank_product: ModelSpec,
    pub composite: ModelSpec,
    pub background_removal: ModelSpec,
    /// Forwarded to the blank-product model, which bills against the caller's OpenAI key.
    pub openai_passthrough_key: Option<String>,
}

impl ModelCatalog {
    pub fn from_env(openai_key: Option<String>) -> Self {
        Self {
            blank_product: ModelSpec::new(
                env_string("BLANK_PRODUCT_MODEL").unwrap_or_else(|| "openai/gpt-image-1".into()),
                ImageBinding::List("input_images"),
            ),
            composite: ModelSpec::new(
                env_string("COMPOSITE_MODEL")
                    .unwrap_or_else(|| "flux-kontext-apps/multi-image-kontext-pro".into()),
                ImageBinding::Numbered("input_image_"),
            ),
            background_removal: ModelSpec::new(
                env_string("BACKGROUND_REMOVAL_MODEL").unwrap_or_else(|| {
                    "851-labs/background-remover:a029dff38972b5fda4ec5d75d7d1cd25aeff621d2cf4946a41055d7db66b80bc".into()
                }),
                ImageBinding::Single("image"),
            ),
            openai_passthrough_key: openai_key,
        }
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::from_env(None)
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub bucket: String,
    pub namespace: String,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            supabase_url: env_string("SUPABASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            supabase_key: env_string("SUPABASE_SERVICE_ROLE_KEY")
                .or_else(|| env_string("SUPABASE_SERVICE_KEY"))
                .or_else(|| env_string("SUPABASE_KEY")),
            bucket: env_string("SUPABASE_BUCKET").unwrap_or_else(|| "studio-images".into()),
            namespace: env_string("STORAGE_NAMESPACE").unwrap_or_else(|| "studio-images".into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobsConfig {
    pub queue_capacity: usize,
    pub concurrency: usize,
}

impl JobsConfig {
    pub fn from_env() -> Self {
        Self {
            queue_capacity: env_parse::<usize>("QUEUE_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(64),
            concurrency: env_parse::<usize>("JOB_CONCURRENCY")
                .filter(|v| *v > 0)
                .unwrap_or(4),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}

fn parse_env_bool(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

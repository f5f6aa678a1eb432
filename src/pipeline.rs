use crate::config::{AppConfig, CallPolicy, ModelCatalog};
use crate::generation::{
    BackendError, GeneratedImage, ImageModel, ImageRequest, NormalizeError, Normalizer,
    ReplicateClient, normalize::DEFAULT_CONTENT_TYPE,
};
use crate::llm::{ChatModel, LlmError, LlmMessage, OpenAiClient};
use crate::models::{
    BlankProductRequest, CompositeLogoRequest, PipelineRunRequest, PipelineRunResponse,
    StageReport, StyleAnalysisRequest,
};
use crate::storage::BlobSink;
use crate::studio::{PlacementHint, StyleDescription, prompts};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Timeout and retry budgets for the chat-backed stages.
#[derive(Debug, Clone, Copy)]
pub struct StagePolicies {
    pub style: CallPolicy,
    pub classify: CallPolicy,
}

impl StagePolicies {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            style: config.style_call,
            classify: config.classify_call,
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    chat: Arc<dyn ChatModel>,
    images: Arc<dyn ImageModel>,
    normalizer: Normalizer,
    models: Arc<ModelCatalog>,
    policies: StagePolicies,
}

impl Pipeline {
    pub fn new(
        chat: Arc<dyn ChatModel>,
        images: Arc<dyn ImageModel>,
        sink: Arc<dyn BlobSink>,
        models: ModelCatalog,
        policies: StagePolicies,
    ) -> Self {
        Self {
            chat,
            images,
            normalizer: Normalizer::new(sink),
            models: Arc::new(models),
            policies,
        }
    }

    /// Wires the OpenAI and Replicate clients from startup configuration.
    pub fn from_config(config: &AppConfig, sink: Arc<dyn BlobSink>) -> Self {
        let chat = OpenAiClient::new(config.openai.clone(), config.connect_timeout);
        let images = ReplicateClient::new(config.replicate.clone(), config.connect_timeout);
        Self::new(
            Arc::new(chat),
            Arc::new(images),
            sink,
            config.models.clone(),
            StagePolicies::from_config(config),
        )
    }

    fn generation(&self) -> stages::Generation<'_> {
        stages::Generation {
            images: self.images.as_ref(),
            normalizer: &self.normalizer,
            models: &self.models,
        }
    }

    // Granular stage endpoints

    pub async fn analyze_style(
        &self,
        request: &StyleAnalysisRequest,
    ) -> Result<StyleDescription, PipelineError> {
        let mut stages = Vec::new();
        self.capture_stage(
            stages::ANALYZE_STYLE,
            &mut stages,
            stages::analyze_style(
                self.chat.as_ref(),
                self.policies.style,
                request.style_input.as_deref(),
                request.reference_image_url.as_deref(),
            ),
        )
        .await
    }

    pub async fn create_blank_product(
        &self,
        request: &BlankProductRequest,
    ) -> Result<BlankProduct, PipelineError> {
        let mut stages = Vec::new();
        self.capture_stage(
            stages::CREATE_BLANK_PRODUCT,
            &mut stages,
            stages::create_blank_product(&self.generation(), request),
        )
        .await
    }

    /// Classifies the placement reference (when given) and composites the logo.
    /// Inputs are validated before the classifier is consulted.
    pub async fn composite_logo(
        &self,
        request: &CompositeLogoRequest,
    ) -> Result<CompositedImage, PipelineError> {
        stages::require_composite_inputs(request)?;
        let mut stages = Vec::new();
        let hint = self
            .capture_stage(
                stages::CLASSIFY_PLACEMENT,
                &mut stages,
                self.placement(request.reference_image_url.as_deref()),
            )
            .await?;
        self.capture_stage(
            stages::COMPOSITE_LOGO,
            &mut stages,
            stages::composite_logo(&self.generation(), request, &hint),
        )
        .await
    }

    pub async fn remove_background(&self, image_url: &str) -> Result<GeneratedImage, PipelineError> {
        let mut stages = Vec::new();
        self.capture_stage(
            stages::REMOVE_BACKGROUND,
            &mut stages,
            stages::remove_background(&self.generation(), image_url),
        )
        .await
    }

    async fn placement(
        &self,
        reference_image_url: Option<&str>,
    ) -> Result<StageOutcome<PlacementHint>, PipelineError> {
        Ok(stages::placement_or_default(
            self.chat.as_ref(),
            self.policies.classify,
            reference_image_url,
        )
        .await)
    }

    /// Runs style analysis, blank-product synthesis, placement classification and
    /// logo compositing in order. The first failing stage halts the run; artifacts
    /// already stored by earlier stages are left in place.
    pub async fn run(
        &self,
        request: PipelineRunRequest,
    ) -> Result<PipelineRunResponse, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let mut tracker = RunTracker::new();
        let mut stages = Vec::new();
        info!(
            target = "studio.pipeline",
            %run_id,
            user_id = request.user_id.as_deref().unwrap_or("anonymous"),
            "pipeline_started"
        );

        stages::require_run_inputs(&request).map_err(|err| tracker.fail(err))?;

        tracker.advance(RunState::AnalyzingStyle);
        let style = self
            .capture_stage(
                stages::ANALYZE_STYLE,
                &mut stages,
                stages::analyze_style(
                    self.chat.as_ref(),
                    self.policies.style,
                    request.style_input.as_deref(),
                    request.style_reference_url.as_deref(),
                ),
            )
            .await
            .map_err(|err| tracker.fail(err))?;

        tracker.advance(RunState::SynthesizingBlank);
        let blank_request = BlankProductRequest {
            original_image_url: request.original_image_url.clone(),
            style_description: style.as_str().to_string(),
            product_description: request.product_description.clone(),
            reference_image_url: request.style_reference_url.clone(),
            user_id: request.user_id.clone(),
        };
        let blank = self
            .capture_stage(
                stages::CREATE_BLANK_PRODUCT,
                &mut stages,
                stages::create_blank_product(&self.generation(), &blank_request),
            )
            .await
            .map_err(|err| tracker.fail(err))?;

        let placement = match present(request.placement_reference_url.as_deref()) {
            Some(reference) => {
                tracker.advance(RunState::Classifying);
                self.capture_stage(
                    stages::CLASSIFY_PLACEMENT,
                    &mut stages,
                    self.placement(Some(reference)),
                )
                .await
                .map_err(|err| tracker.fail(err))?
            }
            None => PlacementHint::default(),
        };

        tracker.advance(RunState::Compositing);
        let composite_request = CompositeLogoRequest {
            blank_product_url: blank.image.url().to_string(),
            logo_image_url: request.logo_image_url.clone(),
            output_size: request.output_size.clone(),
            reference_image_url: None,
            user_id: request.user_id.clone(),
        };
        let composited = self
            .capture_stage(
                stages::COMPOSITE_LOGO,
                &mut stages,
                stages::composite_logo(&self.generation(), &composite_request, &placement),
            )
            .await
            .map_err(|err| tracker.fail(err))?;

        tracker.advance(RunState::Done);
        info!(
            target = "studio.pipeline",
            %run_id,
            stages = stages.len(),
            final_image = %composited.image.url(),
            "pipeline_completed"
        );

        let (state, transitions) = tracker.into_parts();
        Ok(PipelineRunResponse {
            success: true,
            run_id,
            style_description: style.into_inner(),
            blank_product_url: blank.image.into_url(),
            final_image_url: composited.image.into_url(),
            placement,
            state,
            transitions,
            stages,
            timestamp: Utc::now(),
        })
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        match fut.await {
            Ok(outcome) => {
                let elapsed_ms = started.elapsed().as_millis();
                crate::metrics::stage_elapsed(name, elapsed_ms);
                stages.push(StageReport::new(name, elapsed_ms, outcome.output));
                Ok(outcome.value)
            }
            Err(err) => {
                crate::metrics::stage_failed(name, err.kind().as_str());
                warn!(
                    target = "studio.pipeline",
                    stage = name,
                    kind = err.kind().as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "stage_failed"
                );
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlankProduct {
    pub image: GeneratedImage,
    pub analysis: String,
}

#[derive(Debug, Clone)]
pub struct CompositedImage {
    pub image: GeneratedImage,
    pub analysis: String,
    pub placement: PlacementHint,
}

/// Where a run is. Transitions only move forward; `Failed` is reachable from any
/// non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    AnalyzingStyle,
    SynthesizingBlank,
    Classifying,
    Compositing,
    Done,
    Failed { stage: String, reason: String },
}

impl RunState {
    fn rank(&self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::AnalyzingStyle => 1,
            RunState::SynthesizingBlank => 2,
            RunState::Classifying => 3,
            RunState::Compositing => 4,
            RunState::Done => 5,
            RunState::Failed { .. } => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed { .. })
    }
}

#[derive(Debug)]
pub struct RunTracker {
    state: RunState,
    transitions: Vec<RunState>,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Returns false, leaving the state untouched, for backward or post-terminal moves.
    pub fn advance(&mut self, next: RunState) -> bool {
        let allowed = !self.state.is_terminal()
            && (matches!(next, RunState::Failed { .. }) || next.rank() > self.state.rank());
        if allowed {
            self.state = next.clone();
            self.transitions.push(next);
        }
        allowed
    }

    pub fn fail(&mut self, err: PipelineError) -> PipelineError {
        self.advance(RunState::Failed {
            stage: err.stage().to_string(),
            reason: err.detail().to_string(),
        });
        err
    }

    pub fn into_parts(self) -> (RunState, Vec<RunState>) {
        (self.state, self.transitions)
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    Validation,
    Timeout,
    RateLimited,
    AuthFailed,
    QuotaExceeded,
    EmptyModelResponse,
    UnrecognizedResponseShape,
    InvalidGeneratedUrl,
    Storage,
    Unknown,
}

impl PipelineErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineErrorKind::Validation => "validation",
            PipelineErrorKind::Timeout => "timeout",
            PipelineErrorKind::RateLimited => "rate_limited",
            PipelineErrorKind::AuthFailed => "auth_failed",
            PipelineErrorKind::QuotaExceeded => "quota_exceeded",
            PipelineErrorKind::EmptyModelResponse => "empty_model_response",
            PipelineErrorKind::UnrecognizedResponseShape => "unrecognized_response_shape",
            PipelineErrorKind::InvalidGeneratedUrl => "invalid_generated_url",
            PipelineErrorKind::Storage => "storage",
            PipelineErrorKind::Unknown => "unknown",
        }
    }
}

/// Backends do not report structured error codes, so failures are classified
/// from their message text. First match wins.
pub fn classify_failure(message: &str) -> PipelineErrorKind {
    let lowered = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| lowered.contains(needle));
    if has(&["timeout", "timed out"]) {
        PipelineErrorKind::Timeout
    } else if has(&["rate limit", "429"]) {
        PipelineErrorKind::RateLimited
    } else if has(&["authentication", "401", "unauthorized"]) {
        PipelineErrorKind::AuthFailed
    } else if has(&["billing", "insufficient", "402"]) {
        PipelineErrorKind::QuotaExceeded
    } else {
        PipelineErrorKind::Unknown
    }
}

fn stage_label(stage: &str) -> &'static str {
    match stage {
        stages::ANALYZE_STYLE => "Style analysis",
        stages::CREATE_BLANK_PRODUCT => "Blank product generation",
        stages::CLASSIFY_PLACEMENT => "Garment classification",
        stages::COMPOSITE_LOGO => "Logo placement",
        stages::REMOVE_BACKGROUND => "Background removal",
        _ => "Pipeline",
    }
}

impl PipelineError {
    pub fn validation(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Validation,
        }
    }

    /// Classifies a backend failure and phrases it for the caller.
    pub fn backend(stage: &'static str, raw: &str) -> Self {
        let kind = classify_failure(raw);
        let label = stage_label(stage);
        let message = if stage == stages::ANALYZE_STYLE {
            format!("{label} failed: {raw}")
        } else {
            match kind {
                PipelineErrorKind::Timeout => format!("{label} took too long. Please try again."),
                PipelineErrorKind::RateLimited => {
                    "Too many requests. Please wait a moment and try again.".to_string()
                }
                PipelineErrorKind::AuthFailed => {
                    format!("{label} authentication failed. Please check your API key.")
                }
                PipelineErrorKind::QuotaExceeded => {
                    "API quota exceeded. Please check your billing.".to_string()
                }
                _ => format!("{label} failed: {raw}"),
            }
        };
        Self {
            stage,
            message,
            kind,
        }
    }

    pub fn from_llm(stage: &'static str, err: LlmError) -> Self {
        Self::backend(stage, &err.to_string())
    }

    pub fn from_generation(stage: &'static str, err: BackendError) -> Self {
        Self::backend(stage, &err.to_string())
    }

    pub fn from_normalize(stage: &'static str, err: NormalizeError) -> Self {
        let kind = match &err {
            NormalizeError::EmptyResponse => PipelineErrorKind::EmptyModelResponse,
            NormalizeError::UnrecognizedShape(_) => PipelineErrorKind::UnrecognizedResponseShape,
            NormalizeError::InvalidUrl(_) => PipelineErrorKind::InvalidGeneratedUrl,
            NormalizeError::Storage(_) => PipelineErrorKind::Storage,
            NormalizeError::Stream(detail) => return Self::backend(stage, detail),
        };
        let message = match kind {
            PipelineErrorKind::Storage => format!("Failed to store generated image: {err}"),
            _ => format!("{} failed: {err}", stage_label(stage)),
        };
        Self {
            stage,
            message,
            kind,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// Trimmed, non-empty optional input.
fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("invalid reference image URL: {0}")]
    InvalidReference(String),
    #[error("answer carried no garment or location label: {0}")]
    Unlabeled(String),
}

pub mod stages {
    use super::*;

    pub const ANALYZE_STYLE: &str = "analyze_style";
    pub const CREATE_BLANK_PRODUCT: &str = "create_blank_product";
    pub const CLASSIFY_PLACEMENT: &str = "classify_placement";
    pub const COMPOSITE_LOGO: &str = "composite_logo";
    pub const REMOVE_BACKGROUND: &str = "remove_background";

    /// Everything an image-producing stage touches.
    pub struct Generation<'a> {
        pub images: &'a dyn ImageModel,
        pub normalizer: &'a Normalizer,
        pub models: &'a ModelCatalog,
    }

    impl Generation<'_> {
        async fn generate(
            &self,
            stage: &'static str,
            request: ImageRequest,
            prefix: &str,
        ) -> Result<GeneratedImage, PipelineError> {
            let raw = self
                .images
                .run(request)
                .await
                .map_err(|err| PipelineError::from_generation(stage, err))?;
            self.normalizer
                .normalize(raw, DEFAULT_CONTENT_TYPE, prefix)
                .await
                .map_err(|err| PipelineError::from_normalize(stage, err))
        }
    }

    pub async fn analyze_style(
        chat: &dyn ChatModel,
        policy: CallPolicy,
        style_input: Option<&str>,
        reference_image_url: Option<&str>,
    ) -> Result<StageOutcome<StyleDescription>, PipelineError> {
        let (messages, source) = match (present(style_input), present(reference_image_url)) {
            (None, None) => {
                let style = StyleDescription::studio_default();
                return Ok(StageOutcome::new(
                    style.clone(),
                    json!({ "source": "default", "style": style }),
                ));
            }
            (_, Some(reference)) => {
                check_http_url(ANALYZE_STYLE, reference)?;
                (
                    vec![
                        LlmMessage::system(prompts::STYLE_FROM_IMAGE_SYSTEM),
                        LlmMessage::user_with_image(prompts::STYLE_FROM_IMAGE_USER, reference),
                    ],
                    "reference_image",
                )
            }
            (Some(text), None) => (
                vec![
                    LlmMessage::system(prompts::STYLE_FROM_TEXT_SYSTEM),
                    LlmMessage::user(prompts::style_from_text(text)),
                ],
                "text",
            ),
        };

        let response = chat
            .chat(&messages, policy)
            .await
            .map_err(|err| PipelineError::from_llm(ANALYZE_STYLE, err))?;
        let style = StyleDescription::bounded(&response.text);
        Ok(StageOutcome::new(
            style.clone(),
            json!({
                "source": source,
                "chars": style.as_str().chars().count(),
                "style": style,
            }),
        ))
    }

    pub async fn create_blank_product(
        generation: &Generation<'_>,
        request: &BlankProductRequest,
    ) -> Result<StageOutcome<BlankProduct>, PipelineError> {
        let original = require_url(
            CREATE_BLANK_PRODUCT,
            &request.original_image_url,
            "Original image URL is required",
        )?;
        if request.style_description.trim().is_empty() {
            return Err(PipelineError::validation(
                CREATE_BLANK_PRODUCT,
                "Style description is required",
            ));
        }
        let reference = present(request.reference_image_url.as_deref());
        if let Some(reference) = reference {
            check_http_url(CREATE_BLANK_PRODUCT, reference)?;
        }
        let style = StyleDescription::bounded(&request.style_description);

        let model = &generation.models.blank_product;
        let mut images = vec![original.to_string()];
        images.extend(reference.map(str::to_string));
        let mut image_request = ImageRequest::new(model.clone(), images)
            .instruction(prompts::blank_product(
                style.as_str(),
                request.product_description.as_deref(),
                reference.is_some(),
            ))
            .parameter("aspect_ratio", "1:1")
            .parameter("number_of_images", 1);
        if let Some(key) = &generation.models.openai_passthrough_key {
            image_request = image_request.parameter("openai_api_key", key.as_str());
        }

        let image = generation
            .generate(CREATE_BLANK_PRODUCT, image_request, "blank-product")
            .await?;
        let inputs = if reference.is_some() {
            "original image + reference style image"
        } else {
            "original image only"
        };
        let analysis = format!(
            "Blank product created with {} ({inputs}) using style: {}",
            model.id,
            style.as_str()
        );
        Ok(StageOutcome::new(
            BlankProduct {
                image: image.clone(),
                analysis,
            },
            json!({
                "model": model.id,
                "image": image,
                "with_reference": reference.is_some(),
            }),
        ))
    }

    /// One vision query answering both garment type and design location.
    pub async fn classify_placement(
        chat: &dyn ChatModel,
        policy: CallPolicy,
        reference_image_url: &str,
    ) -> Result<PlacementHint, ClassifyError> {
        let reference = reference_image_url.trim();
        if check_http_url(CLASSIFY_PLACEMENT, reference).is_err() {
            return Err(ClassifyError::InvalidReference(reference.to_string()));
        }
        let messages = [
            LlmMessage::system(prompts::CLASSIFY_SYSTEM),
            LlmMessage::user_with_image(prompts::CLASSIFY_USER, reference),
        ];
        let response = chat.chat(&messages, policy).await?;
        let lowered = response.text.to_lowercase();
        if !lowered.contains("garment:") && !lowered.contains("location:") {
            return Err(ClassifyError::Unlabeled(response.text));
        }
        Ok(PlacementHint::parse(&response.text))
    }

    /// Never fails: without a reference, or on any classifier error, the default
    /// hint is used.
    pub async fn placement_or_default(
        chat: &dyn ChatModel,
        policy: CallPolicy,
        reference_image_url: Option<&str>,
    ) -> StageOutcome<PlacementHint> {
        let Some(reference) = present(reference_image_url) else {
            return StageOutcome::new(
                PlacementHint::default(),
                json!({ "source": "default", "reason": "no_reference" }),
            );
        };
        match classify_placement(chat, policy, reference).await {
            Ok(hint) => {
                info!(
                    target = "studio.pipeline",
                    garment = %hint.garment_type,
                    location = %hint.placement_location,
                    "placement_classified"
                );
                StageOutcome::new(hint.clone(), json!({ "source": "model", "placement": hint }))
            }
            Err(err) => {
                warn!(
                    target = "studio.pipeline",
                    stage = CLASSIFY_PLACEMENT,
                    error = %err,
                    "placement_defaulted"
                );
                crate::metrics::stage_failed(CLASSIFY_PLACEMENT, "absorbed");
                let hint = PlacementHint::default();
                StageOutcome::new(
                    hint.clone(),
                    json!({ "source": "default", "placement": hint, "error": err.to_string() }),
                )
            }
        }
    }

    pub fn require_composite_inputs(
        request: &CompositeLogoRequest,
    ) -> Result<(&str, &str), PipelineError> {
        let blank = request.blank_product_url.trim();
        let logo = request.logo_image_url.trim();
        if blank.is_empty() || logo.is_empty() {
            return Err(PipelineError::validation(
                COMPOSITE_LOGO,
                "Both blank product URL and logo image URL are required",
            ));
        }
        check_http_url(COMPOSITE_LOGO, blank)?;
        check_http_url(COMPOSITE_LOGO, logo)?;
        Ok((blank, logo))
    }

    pub async fn composite_logo(
        generation: &Generation<'_>,
        request: &CompositeLogoRequest,
        hint: &PlacementHint,
    ) -> Result<StageOutcome<CompositedImage>, PipelineError> {
        let (blank, logo) = require_composite_inputs(request)?;
        let model = &generation.models.composite;
        let mut image_request =
            ImageRequest::new(model.clone(), vec![blank.to_string(), logo.to_string()])
                .instruction(prompts::composite_logo(hint));
        if let Some(size) = present(request.output_size.as_deref()) {
            image_request = image_request.parameter("aspect_ratio", size);
        }

        let image = generation
            .generate(COMPOSITE_LOGO, image_request, "logo-composite")
            .await?;
        let analysis = format!(
            "Logo placed on the {} of the {} using {}",
            hint.placement_location, hint.garment_type, model.id
        );
        Ok(StageOutcome::new(
            CompositedImage {
                image: image.clone(),
                analysis,
                placement: hint.clone(),
            },
            json!({ "model": model.id, "image": image, "placement": hint }),
        ))
    }

    pub async fn remove_background(
        generation: &Generation<'_>,
        image_url: &str,
    ) -> Result<StageOutcome<GeneratedImage>, PipelineError> {
        let source = require_url(REMOVE_BACKGROUND, image_url, "Image URL is required")?;
        let model = &generation.models.background_removal;
        let request = ImageRequest::new(model.clone(), vec![source.to_string()]);
        let image = generation
            .generate(REMOVE_BACKGROUND, request, "background-removed")
            .await?;
        Ok(StageOutcome::new(
            image.clone(),
            json!({ "model": model.id, "image": image }),
        ))
    }

    /// A full run needs both the garment photo and the logo before anything is called.
    pub fn require_run_inputs(request: &PipelineRunRequest) -> Result<(), PipelineError> {
        require_url(
            CREATE_BLANK_PRODUCT,
            &request.original_image_url,
            "Original image URL is required",
        )?;
        require_url(
            COMPOSITE_LOGO,
            &request.logo_image_url,
            "Logo image URL is required",
        )?;
        if let Some(reference) = present(request.style_reference_url.as_deref()) {
            check_http_url(ANALYZE_STYLE, reference)?;
        }
        if let Some(reference) = present(request.placement_reference_url.as_deref()) {
            check_http_url(CLASSIFY_PLACEMENT, reference)?;
        }
        Ok(())
    }

    fn require_url<'a>(
        stage: &'static str,
        value: &'a str,
        missing: &str,
    ) -> Result<&'a str, PipelineError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(PipelineError::validation(stage, missing));
        }
        check_http_url(stage, value)?;
        Ok(value)
    }

    fn check_http_url(stage: &'static str, value: &str) -> Result<(), PipelineError> {
        match reqwest::Url::parse(value) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
            Ok(_) => Err(PipelineError::validation(
                stage,
                format!("Image URL must use http or https: {value}"),
            )),
            Err(_) => Err(PipelineError::validation(
                stage,
                format!("Invalid image URL: {value}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{ImageBinding, ModelSpec};
    use crate::storage::StorageError;
    use crate::testing::{RecordingSink, StubChat, StubImageModel, policy};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const ORIGINAL: &str = "https://cdn.example.com/uploads/hoodie.jpg";
    const LOGO: &str = "https://cdn.example.com/uploads/logo.png";
    const BLANK: &str = "https://replicate.delivery/blank.png";

    fn catalog() -> ModelCatalog {
        ModelCatalog {
            blank_product: ModelSpec::new("openai/gpt-image-1", ImageBinding::List("input_images")),
            composite: ModelSpec::new(
                "flux-kontext-apps/multi-image-kontext-pro",
                ImageBinding::Numbered("input_image_"),
            ),
            background_removal: ModelSpec::new(
                "851-labs/background-remover:abc",
                ImageBinding::Single("image"),
            ),
            openai_passthrough_key: Some("sk-passthrough".into()),
        }
    }

    fn pipeline(
        chat: &Arc<StubChat>,
        images: &Arc<StubImageModel>,
        sink: &Arc<RecordingSink>,
    ) -> Pipeline {
        Pipeline::new(
            chat.clone(),
            images.clone(),
            sink.clone(),
            catalog(),
            StagePolicies {
                style: policy(),
                classify: policy(),
            },
        )
    }

    fn blank_request() -> BlankProductRequest {
        BlankProductRequest {
            original_image_url: ORIGINAL.into(),
            style_description: "Soft key light on a seamless white sweep.".into(),
            product_description: Some("a heavyweight cotton hoodie".into()),
            reference_image_url: Some("https://cdn.example.com/style.jpg".into()),
            user_id: None,
        }
    }

    fn run_request() -> PipelineRunRequest {
        PipelineRunRequest {
            original_image_url: ORIGINAL.into(),
            logo_image_url: LOGO.into(),
            style_input: Some("clean white background".into()),
            ..Default::default()
        }
    }

    #[test]
    fn failures_classify_by_message_in_order() {
        let cases = [
            ("request timeout: deadline elapsed", PipelineErrorKind::Timeout),
            ("operation timed out", PipelineErrorKind::Timeout),
            ("HTTP 429: slow down", PipelineErrorKind::RateLimited),
            ("Rate limit reached for gpt-4o", PipelineErrorKind::RateLimited),
            ("authentication failed: missing credentials", PipelineErrorKind::AuthFailed),
            ("HTTP 401: Unauthorized", PipelineErrorKind::AuthFailed),
            ("insufficient credit", PipelineErrorKind::QuotaExceeded),
            ("Billing hard limit reached", PipelineErrorKind::QuotaExceeded),
            ("request timeout after 429", PipelineErrorKind::Timeout),
            ("prediction failed: NSFW content detected", PipelineErrorKind::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(classify_failure(message), expected, "{message}");
        }
    }

    #[test]
    fn backend_errors_read_as_user_messages() {
        let err = PipelineError::backend(stages::COMPOSITE_LOGO, "HTTP 429: too many");
        assert_eq!(err.kind(), PipelineErrorKind::RateLimited);
        assert_eq!(err.detail(), "Too many requests. Please wait a moment and try again.");

        let err = PipelineError::backend(stages::CREATE_BLANK_PRODUCT, "request timeout: 90s");
        assert_eq!(err.detail(), "Blank product generation took too long. Please try again.");

        let err = PipelineError::backend(stages::ANALYZE_STYLE, "HTTP 401: bad key");
        assert_eq!(err.kind(), PipelineErrorKind::AuthFailed);
        assert_eq!(err.detail(), "Style analysis failed: HTTP 401: bad key");
    }

    #[test]
    fn normalizer_failures_keep_their_kind() {
        let cases = [
            (NormalizeError::EmptyResponse, PipelineErrorKind::EmptyModelResponse),
            (
                NormalizeError::UnrecognizedShape("number 42".into()),
                PipelineErrorKind::UnrecognizedResponseShape,
            ),
            (
                NormalizeError::InvalidUrl("ftp://x".into()),
                PipelineErrorKind::InvalidGeneratedUrl,
            ),
            (
                NormalizeError::Storage(StorageError::Upload("bucket gone".into())),
                PipelineErrorKind::Storage,
            ),
            (
                NormalizeError::Stream("operation timed out".into()),
                PipelineErrorKind::Timeout,
            ),
        ];
        for (err, expected) in cases {
            let mapped = PipelineError::from_normalize(stages::COMPOSITE_LOGO, err);
            assert_eq!(mapped.kind(), expected);
            assert_eq!(mapped.stage(), "composite_logo");
        }
    }

    #[test]
    fn run_state_only_moves_forward() {
        let mut tracker = RunTracker::new();
        assert!(tracker.advance(RunState::AnalyzingStyle));
        assert!(tracker.advance(RunState::SynthesizingBlank));
        assert!(!tracker.advance(RunState::AnalyzingStyle));
        assert!(tracker.advance(RunState::Compositing));
        assert!(!tracker.advance(RunState::Classifying));
        assert!(tracker.advance(RunState::Done));
        assert!(!tracker.advance(RunState::Failed {
            stage: "late".into(),
            reason: "too late".into(),
        }));
        let (state, transitions) = tracker.into_parts();
        assert_eq!(state, RunState::Done);
        assert_eq!(transitions.len(), 5);
    }

    #[test]
    fn failure_is_reachable_from_any_open_state() {
        let mut tracker = RunTracker::new();
        tracker.advance(RunState::SynthesizingBlank);
        let err = tracker.fail(PipelineError::validation("create_blank_product", "nope"));
        assert_eq!(err.kind(), PipelineErrorKind::Validation);
        assert_eq!(
            tracker.state(),
            &RunState::Failed {
                stage: "create_blank_product".into(),
                reason: "nope".into(),
            }
        );
    }

    #[tokio::test]
    async fn style_defaults_without_any_call() {
        let chat = StubChat::new();
        let out = stages::analyze_style(&chat, policy(), Some("   "), None)
            .await
            .expect("default style");
        assert_eq!(out.value, StyleDescription::studio_default());
        assert_eq!(out.output["source"], json!("default"));
        assert_eq!(chat.calls(), 0);
    }

    #[tokio::test]
    async fn style_from_text_is_bounded() {
        let chat = StubChat::new().reply(&"Soft diffused key light. ".repeat(40));
        let out = stages::analyze_style(&chat, policy(), Some("clean white background"), None)
            .await
            .expect("style");
        assert!(out.value.as_str().chars().count() <= crate::studio::style::MAX_STYLE_CHARS);
        assert_eq!(out.output["source"], json!("text"));
        let sent = chat.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0][1].image_urls().is_empty());
    }

    #[tokio::test]
    async fn style_reference_image_wins_over_text() {
        let chat = StubChat::new().reply("Bright softbox lighting, white seamless backdrop.");
        let out = stages::analyze_style(
            &chat,
            policy(),
            Some("moody"),
            Some("https://cdn.example.com/style.jpg"),
        )
        .await
        .expect("style");
        assert_eq!(out.output["source"], json!("reference_image"));
        assert_eq!(
            chat.requests()[0][1].image_urls(),
            vec!["https://cdn.example.com/style.jpg"]
        );
    }

    #[tokio::test]
    async fn style_backend_failure_is_a_stage_result() {
        let chat = StubChat::new().fail(LlmError::Http {
            status: 429,
            body: "rate limited".into(),
        });
        let err = stages::analyze_style(&chat, policy(), Some("bright"), None)
            .await
            .expect_err("failure");
        assert_eq!(err.stage(), "analyze_style");
        assert_eq!(err.kind(), PipelineErrorKind::RateLimited);
        assert!(err.detail().starts_with("Style analysis failed:"));
    }

    #[tokio::test]
    async fn blank_product_rejects_missing_inputs_before_calling() {
        let images = Arc::new(StubImageModel::new());
        let sink = Arc::new(RecordingSink::new());
        let chat = Arc::new(StubChat::new());
        let pipeline = pipeline(&chat, &images, &sink);

        let mut request = blank_request();
        request.original_image_url = String::new();
        let err = pipeline.create_blank_product(&request).await.expect_err("missing original");
        assert_eq!(err.kind(), PipelineErrorKind::Validation);
        assert_eq!(err.detail(), "Original image URL is required");

        let mut request = blank_request();
        request.style_description = "  ".into();
        let err = pipeline.create_blank_product(&request).await.expect_err("missing style");
        assert_eq!(err.detail(), "Style description is required");

        assert_eq!(images.calls(), 0);
        assert_eq!(sink.stores(), 0);
    }

    #[tokio::test]
    async fn blank_product_sends_subject_then_reference() {
        let images = Arc::new(StubImageModel::new().returning_json(json!(BLANK)));
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(&Arc::new(StubChat::new()), &images, &sink);

        let blank = pipeline
            .create_blank_product(&blank_request())
            .await
            .expect("blank product");
        assert_eq!(blank.image.url(), BLANK);
        assert!(blank.analysis.contains("original image + reference style image"));

        let sent = images.requests();
        let input = sent[0].to_input();
        assert_eq!(
            input["input_images"],
            json!([ORIGINAL, "https://cdn.example.com/style.jpg"])
        );
        assert_eq!(input["aspect_ratio"], json!("1:1"));
        assert_eq!(input["number_of_images"], json!(1));
        assert_eq!(input["openai_api_key"], json!("sk-passthrough"));
        assert!(input["prompt"].as_str().unwrap().contains("heavyweight cotton hoodie"));
        assert_eq!(sink.stores(), 0);
    }

    #[tokio::test]
    async fn blank_product_surfaces_empty_model_output() {
        let images = Arc::new(StubImageModel::new().returning_json(json!({})));
        let pipeline = pipeline(
            &Arc::new(StubChat::new()),
            &images,
            &Arc::new(RecordingSink::new()),
        );
        let err = pipeline
            .create_blank_product(&blank_request())
            .await
            .expect_err("empty output");
        assert_eq!(err.kind(), PipelineErrorKind::EmptyModelResponse);
    }

    #[tokio::test]
    async fn unparsable_classification_uses_default_hint() {
        let chat = StubChat::new().reply("I cannot tell from this photo.");
        let out =
            stages::placement_or_default(&chat, policy(), Some("https://cdn.example.com/ref.jpg"))
                .await;
        assert_eq!(
            out.value,
            PlacementHint {
                garment_type: "garment".into(),
                placement_location: "center front of the garment".into(),
            }
        );
        assert_eq!(out.output["source"], json!("default"));
    }

    #[tokio::test]
    async fn classifier_errors_never_propagate() {
        let chat = StubChat::new().fail(LlmError::Timeout("30s".into()));
        let out =
            stages::placement_or_default(&chat, policy(), Some("https://cdn.example.com/ref.jpg"))
                .await;
        assert!(out.value.is_default());
        assert_eq!(chat.calls(), 1);

        let err = stages::classify_placement(&chat, policy(), "https://cdn.example.com/ref.jpg")
            .await
            .expect_err("no scripted reply left");
        assert!(matches!(err, ClassifyError::Llm(_)));
    }

    #[tokio::test]
    async fn classifier_reads_labeled_answer() {
        let chat = StubChat::new().reply("Garment: Hoodie | Location: left chest");
        let hint = stages::classify_placement(&chat, policy(), "https://cdn.example.com/ref.jpg")
            .await
            .expect("hint");
        assert_eq!(hint.garment_type, "hoodie");
        assert_eq!(hint.placement_location, "left chest");
    }

    #[tokio::test]
    async fn composite_validates_before_classifying() {
        let chat = Arc::new(StubChat::new().reply("Garment: tee | Location: back center"));
        let images = Arc::new(StubImageModel::new());
        let pipeline = pipeline(&chat, &images, &Arc::new(RecordingSink::new()));
        let request = CompositeLogoRequest {
            blank_product_url: BLANK.into(),
            logo_image_url: String::new(),
            reference_image_url: Some("https://cdn.example.com/ref.jpg".into()),
            ..Default::default()
        };
        let err = pipeline.composite_logo(&request).await.expect_err("missing logo");
        assert_eq!(
            err.detail(),
            "Both blank product URL and logo image URL are required"
        );
        assert_eq!(chat.calls(), 0);
        assert_eq!(images.calls(), 0);
    }

    #[tokio::test]
    async fn composite_sends_garment_then_logo() {
        let chat = Arc::new(StubChat::new().reply("Garment: T-Shirt | Location: back center"));
        let images = Arc::new(
            StubImageModel::new().returning_json(json!(["https://replicate.delivery/final.png"])),
        );
        let pipeline = pipeline(&chat, &images, &Arc::new(RecordingSink::new()));
        let request = CompositeLogoRequest {
            blank_product_url: BLANK.into(),
            logo_image_url: LOGO.into(),
            output_size: Some("4:5".into()),
            reference_image_url: Some("https://cdn.example.com/ref.jpg".into()),
            user_id: None,
        };
        let out = pipeline.composite_logo(&request).await.expect("composite");
        assert_eq!(out.image.url(), "https://replicate.delivery/final.png");
        assert_eq!(out.placement.garment_type, "t-shirt");

        let input = images.requests()[0].to_input();
        assert_eq!(input["input_image_1"], json!(BLANK));
        assert_eq!(input["input_image_2"], json!(LOGO));
        assert_eq!(input["aspect_ratio"], json!("4:5"));
        assert!(input["prompt"].as_str().unwrap().contains("back center of the t-shirt"));
    }

    #[tokio::test]
    async fn remove_background_persists_streamed_png() {
        let images = Arc::new(StubImageModel::new().returning_bytes(vec![
            bytes::Bytes::from_static(b"\x89PNG"),
            bytes::Bytes::from_static(b"rest"),
        ]));
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(&Arc::new(StubChat::new()), &images, &sink);
        let image = pipeline.remove_background(LOGO).await.expect("cutout");
        assert!(image.url().contains("/blobs/studio-images/background-removed-"));
        assert_eq!(sink.stores(), 1);
        assert_eq!(images.requests()[0].to_input()["image"], json!(LOGO));
    }

    #[tokio::test]
    async fn end_to_end_run_mints_a_new_final_url() {
        let chat = Arc::new(StubChat::new().reply(
            "Even softbox lighting from both sides over a seamless pure white background.",
        ));
        let images = Arc::new(
            StubImageModel::new()
                .returning_json(json!(BLANK))
                .returning_bytes(vec![
                    bytes::Bytes::from_static(b"\x89PNG\r\n"),
                    bytes::Bytes::from_static(b"composited"),
                ]),
        );
        let sink = Arc::new(RecordingSink::new());
        let pipeline = pipeline(&chat, &images, &sink);

        let response = pipeline.run(run_request()).await.expect("run");
        assert!(!response.style_description.is_empty());
        assert!(response.style_description.chars().count() <= 400);
        assert_eq!(response.blank_product_url, BLANK);
        assert_ne!(response.final_image_url, ORIGINAL);
        assert_ne!(response.final_image_url, LOGO);
        assert!(response.final_image_url.starts_with("http://blobs.test/blobs/"));
        assert!(response.placement.is_default());
        assert_eq!(response.state, RunState::Done);
        assert_eq!(
            response.transitions,
            vec![
                RunState::Idle,
                RunState::AnalyzingStyle,
                RunState::SynthesizingBlank,
                RunState::Compositing,
                RunState::Done,
            ]
        );
        let names: Vec<&str> = response.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["analyze_style", "create_blank_product", "composite_logo"]);
        assert_eq!(sink.stores(), 1);

        let key = response
            .final_image_url
            .strip_prefix("http://blobs.test/blobs/")
            .unwrap();
        let stored = sink.inner().get(key).await.expect("stored object");
        assert_eq!(&stored.bytes[..], b"\x89PNG\r\ncomposited");
    }

    #[tokio::test]
    async fn run_classifies_when_placement_reference_given() {
        let chat = Arc::new(
            StubChat::new()
                .reply("Soft light, white sweep.")
                .reply("Garment: tank top | Location: left chest"),
        );
        let images = Arc::new(
            StubImageModel::new()
                .returning_json(json!(BLANK))
                .returning_json(json!({"output": {"url": "https://replicate.delivery/final.png"}})),
        );
        let pipeline = pipeline(&chat, &images, &Arc::new(RecordingSink::new()));
        let mut request = run_request();
        request.placement_reference_url = Some("https://cdn.example.com/ref.jpg".into());

        let response = pipeline.run(request).await.expect("run");
        assert_eq!(response.placement.garment_type, "tank top");
        assert!(response.transitions.contains(&RunState::Classifying));
        assert_eq!(response.final_image_url, "https://replicate.delivery/final.png");
    }

    #[tokio::test]
    async fn failed_stage_halts_the_run() {
        let chat = Arc::new(StubChat::new().reply("Soft light."));
        let images = Arc::new(
            StubImageModel::new().failing(BackendError::Timeout("did not finish within 90s".into())),
        );
        let pipeline = pipeline(&chat, &images, &Arc::new(RecordingSink::new()));

        let err = pipeline.run(run_request()).await.expect_err("halted");
        assert_eq!(err.stage(), "create_blank_product");
        assert_eq!(err.kind(), PipelineErrorKind::Timeout);
        assert_eq!(images.calls(), 1);
    }

    #[tokio::test]
    async fn run_rejects_missing_logo_before_any_call() {
        let chat = Arc::new(StubChat::new());
        let images = Arc::new(StubImageModel::new());
        let pipeline = pipeline(&chat, &images, &Arc::new(RecordingSink::new()));
        let mut request = run_request();
        request.logo_image_url = " ".into();

        let err = pipeline.run(request).await.expect_err("rejected");
        assert_eq!(err.kind(), PipelineErrorKind::Validation);
        assert_eq!(err.stage(), "composite_logo");
        assert_eq!(chat.calls(), 0);
        assert_eq!(images.calls(), 0);
    }

    #[tokio::test]
    async fn bad_reference_urls_name_the_stage_that_uses_them() {
        let chat = Arc::new(StubChat::new());
        let images = Arc::new(StubImageModel::new());
        let pipeline = pipeline(&chat, &images, &Arc::new(RecordingSink::new()));

        let mut request = run_request();
        request.placement_reference_url = Some("ftp://cdn.example.com/ref.jpg".into());
        let err = pipeline.run(request).await.expect_err("rejected");
        assert_eq!(err.kind(), PipelineErrorKind::Validation);
        assert_eq!(err.stage(), "classify_placement");

        let mut request = run_request();
        request.style_reference_url = Some("not a url".into());
        let err = pipeline.run(request).await.expect_err("rejected");
        assert_eq!(err.stage(), "analyze_style");
        assert_eq!(chat.calls(), 0);
        assert_eq!(images.calls(), 0);
    }

    #[tokio::test]
    async fn storage_failure_is_reported_as_storage() {
        let images = Arc::new(
            StubImageModel::new().returning_bytes(vec![bytes::Bytes::from_static(b"png")]),
        );
        let pipeline = pipeline(
            &Arc::new(StubChat::new()),
            &images,
            &Arc::new(RecordingSink::failing()),
        );
        let err = pipeline.remove_background(LOGO).await.expect_err("storage");
        assert_eq!(err.kind(), PipelineErrorKind::Storage);
        assert!(err.detail().starts_with("Failed to store generated image"));
    }
}

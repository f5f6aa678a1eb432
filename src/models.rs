use crate::pipeline::RunState;
use crate::studio::PlacementHint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleAnalysisRequest {
    #[serde(default)]
    pub style_input: Option<String>,
    #[serde(default)]
    pub reference_image_url: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlankProductRequest {
    #[serde(default)]
    pub original_image_url: String,
    #[serde(default)]
    pub style_description: String,
    #[serde(default)]
    pub product_description: Option<String>,
    #[serde(default)]
    pub reference_image_url: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeLogoRequest {
    #[serde(default)]
    pub blank_product_url: String,
    #[serde(default)]
    pub logo_image_url: String,
    #[serde(default)]
    pub output_size: Option<String>,
    #[serde(default)]
    pub reference_image_url: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveBackgroundRequest {
    #[serde(default)]
    pub image_url: String,
}

/// A full run: style → blank product → (placement) → composite.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunRequest {
    #[serde(default)]
    pub original_image_url: String,
    #[serde(default)]
    pub logo_image_url: String,
    #[serde(default)]
    pub style_input: Option<String>,
    /// Style reference photo, used for style analysis and as the second blank-product input.
    #[serde(default)]
    pub style_reference_url: Option<String>,
    #[serde(default)]
    pub product_description: Option<String>,
    /// Photo showing where the design sits on the garment.
    #[serde(default)]
    pub placement_reference_url: Option<String>,
    #[serde(default)]
    pub output_size: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleAnalysisResponse {
    pub success: bool,
    pub style_description: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlankProductResponse {
    pub success: bool,
    pub blank_product_url: String,
    pub analysis: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeLogoResponse {
    pub success: bool,
    pub final_image_url: String,
    pub analysis: String,
    pub placement: PlacementHint,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveBackgroundResponse {
    pub success: bool,
    pub image_url: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunResponse {
    pub success: bool,
    pub run_id: String,
    pub style_description: String,
    pub blank_product_url: String,
    pub final_image_url: String,
    pub placement: PlacementHint,
    pub state: RunState,
    pub transitions: Vec<RunState>,
    pub stages: Vec<StageReport>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub success: bool,
    pub error: String,
    pub stage: Option<String>,
    pub kind: Option<String>,
}

impl ApiError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            stage: None,
            kind: None,
        }
    }
}

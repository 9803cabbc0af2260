pub mod client;
pub mod config;
pub mod encoder;
pub mod error;
pub mod projection;
pub mod selection;
pub mod utils;
pub mod workflow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use client::{AnalysisClient, InferenceBackend};
pub use config::ClientConfig;
pub use error::ClientError;
pub use projection::HeatmapReference;
pub use selection::{FilePick, PreviewStore, SelectedImage};
pub use workflow::{AnalyzeOutcome, Phase, Workflow, WorkflowSnapshot};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AnalysisResult {
    pub prediction_label: String,
    // 0..=100
    pub confidence_percent: f64,
    pub artifact_name: Option<String>,
}

/// Body of a 2xx `/analyze` response. Every field is optional and a field of
/// the wrong JSON type counts as missing.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AnalyzeResponse {
    pub image: Option<String>,
    pub prediction: Option<String>,
    pub confidence: Option<f64>,
}

impl AnalyzeResponse {
    pub fn from_value(value: &Value) -> Self {
        let text = |key: &str| value[key].as_str().map(str::to_string);
        Self {
            image: text("image"),
            prediction: text("prediction"),
            confidence: value["confidence"].as_f64(),
        }
    }

    // An empty name counts as no artifact.
    pub fn artifact_name(&self) -> Option<String> {
        self.image.clone().filter(|name| !name.is_empty())
    }

    pub fn analysis_result(&self, artifact_name: Option<String>) -> Option<AnalysisResult> {
        let label = self.prediction.clone()?;
        let confidence = self.confidence.filter(|c| c.is_finite())?;
        Some(AnalysisResult {
            prediction_label: label,
            confidence_percent: confidence.clamp(0.0, 100.0),
            artifact_name,
        })
    }
}

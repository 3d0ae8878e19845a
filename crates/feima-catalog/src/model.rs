//! Gateway model descriptors as served by `GET /models`.
//!
//! Descriptors that fail to deserialize are dropped element-wise so one
//! malformed entry cannot empty the whole catalog; unknown capability types
//! land in [`ModelKind::Other`] and are assigned to no list.

use serde::{Deserialize, Deserializer};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub model_picker_enabled: bool,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub policy: Option<ModelPolicy>,
    #[serde(default)]
    pub billing: Option<ModelBilling>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelCapabilities {
    #[serde(rename = "type")]
    pub kind: ModelKind,
    pub family: String,
    pub limits: ModelLimits,
    pub supports: ModelSupports,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Chat,
    Completion,
    Embeddings,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ModelLimits {
    pub max_prompt_tokens: u64,
    pub max_output_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ModelSupports {
    pub streaming: bool,
    #[serde(default)]
    pub tool_calls: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub parallel_tool_calls: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelPolicy {
    #[serde(default)]
    pub terms: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ModelBilling {
    #[serde(default)]
    pub multiplier: f64,
}

/// Wire shape of the catalog endpoint.
#[derive(Debug, Deserialize)]
pub struct CatalogResponse {
    #[serde(deserialize_with = "deserialize_models_skip_errors")]
    pub data: Vec<ModelDescriptor>,
}

fn deserialize_models_skip_errors<'de, D>(
    deserializer: D,
) -> Result<Vec<ModelDescriptor>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    let models = raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<ModelDescriptor>(value) {
            Ok(model) => Some(model),
            Err(e) => {
                warn!(error = %e, "skipping model descriptor that failed to deserialize");
                None
            }
        })
        .collect();
    Ok(models)
}

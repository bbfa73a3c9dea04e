//! A passive data type only — no fine-tuning pipeline lives in this
//! workspace (its Python sidecar is an external collaborator). Exists so
//! the orchestration server's external surface can type-check a
//! training-status endpoint without implementing one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Pending,
    Preparing,
    Training,
    Merging,
    Done,
    Failed,
}

/// Carries id, base model, status, timestamps, and dataset/adapter/output
/// paths even though no pipeline logic sits behind it here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub id: Uuid,
    pub base_model: String,
    pub status: TrainingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dataset_path: String,
    #[serde(default)]
    pub adapter_path: Option<String>,
    #[serde(default)]
    pub output_model_path: Option<String>,
}

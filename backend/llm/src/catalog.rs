use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Ready,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Local models on disk. Every subdirectory of the models directory is a model.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models_dir: PathBuf,
}

impl ModelCatalog {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &PathBuf {
        &self.models_dir
    }

    /// Get model directory path
    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(model_id)
    }

    pub fn status(&self, model_id: &str) -> ModelStatus {
        if !model_id.is_empty() && self.model_dir(model_id).is_dir() {
            ModelStatus::Ready
        } else {
            ModelStatus::NotFound
        }
    }

    pub fn is_model_ready(&self, model_id: &str) -> bool {
        self.status(model_id) == ModelStatus::Ready
    }

    /// List all models, sorted by id. A missing models directory is empty.
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        if !self.models_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.models_dir).with_context(|| {
            format!(
                "Failed to read models directory {}",
                self.models_dir.display()
            )
        })?;

        let mut models = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata = entry.metadata()?;
            models.push(ModelInfo {
                id: entry.file_name().to_string_lossy().to_string(),
                size_bytes: dir_size(&path)?,
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                path,
            });
        }

        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}

fn dir_size(dir: &PathBuf) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        total += if metadata.is_dir() {
            dir_size(&entry.path())?
        } else {
            metadata.len()
        };
    }
    Ok(total)
}

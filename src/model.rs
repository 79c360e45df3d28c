//! Model resolution and binding.
//!
//! [`ModelLoader`] turns a model directory into a [`ModelBinding`]: weights
//! validated against `config.json`, with the item-embedding table charged
//! to every acquired device context. A binding belongs to exactly one
//! handle and is released on destroy or on a failed re-initialize.

use std::path::Path;

use serde::Deserialize;

use crate::config::InitOptions;
use crate::device::{DeviceAllocation, DeviceContextPool};
use crate::error::{Result, VlmError};
use crate::weights::{self, MappedArtifact};

const CONFIG_FILE: &str = "config.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const EMBEDDING_TENSOR: &str = "item_embedding.weight";
const RANKING_HEAD_TENSOR: &str = "ranking_head.weight";

/// Model metadata shipped alongside the weights.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub num_items: usize,
    pub hidden_dim: usize,
}

/// Loaded weights bound to one handle's device contexts.
#[derive(Debug)]
pub struct ModelBinding {
    config: ModelConfig,
    /// Item embedding table, row-major `[num_items, hidden_dim]`.
    embeddings: Vec<f32>,
    /// Ranking head vector, `[hidden_dim]`.
    ranking_head: Vec<f32>,
    /// Device-resident embedding copies, one per context. Held for their
    /// byte accounting; released when the binding drops.
    _device_uploads: Vec<DeviceAllocation>,
}

impl ModelBinding {
    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    pub fn num_items(&self) -> usize {
        self.config.num_items
    }

    pub fn hidden_dim(&self) -> usize {
        self.config.hidden_dim
    }

    /// Embedding row for one item.
    pub fn embedding(&self, item: u64) -> &[f32] {
        let dim = self.config.hidden_dim;
        let row = (item as usize % self.config.num_items) * dim;
        &self.embeddings[row..row + dim]
    }

    pub fn ranking_head(&self) -> &[f32] {
        &self.ranking_head
    }
}

/// Resolves a model path into a [`ModelBinding`].
pub struct ModelLoader;

impl ModelLoader {
    /// Load and validate the model at `model_path`, uploading the
    /// embedding table to every context of `pool`.
    pub fn load(
        model_path: &str,
        pool: &DeviceContextPool,
        options: &InitOptions,
    ) -> Result<ModelBinding> {
        let dir = Path::new(model_path);
        if !dir.is_dir() {
            return Err(VlmError::InvalidModelPath(format!(
                "{model_path:?} is not a model directory"
            )));
        }

        let config = Self::read_config(&dir.join(CONFIG_FILE))?;
        if config.num_items == 0 || config.hidden_dim == 0 {
            return Err(VlmError::ModelLoad(format!(
                "model {:?} declares an empty embedding table ({} items x {} dims)",
                config.model_id, config.num_items, config.hidden_dim
            )));
        }
        if config.num_items < options.batch_size as usize {
            return Err(VlmError::ModelLoad(format!(
                "embedding table ({} items) smaller than device batch size {}",
                config.num_items, options.batch_size
            )));
        }

        let artifact = MappedArtifact::open(&dir.join(WEIGHTS_FILE))?;
        let bytes = artifact.as_bytes();
        let table = weights::parse_table(bytes)?;

        let embedding_info = table.require(EMBEDDING_TENSOR)?;
        if embedding_info.shape != [config.num_items, config.hidden_dim] {
            return Err(VlmError::ModelLoad(format!(
                "embedding shape {:?} does not match config [{}, {}]",
                embedding_info.shape, config.num_items, config.hidden_dim
            )));
        }
        let head_info = table.require(RANKING_HEAD_TENSOR)?;
        if head_info.shape != [config.hidden_dim] {
            return Err(VlmError::ModelLoad(format!(
                "ranking head shape {:?} does not match hidden dim {}",
                head_info.shape, config.hidden_dim
            )));
        }

        let embeddings = weights::tensor_f32(bytes, &table, EMBEDDING_TENSOR)?;
        let ranking_head = weights::tensor_f32(bytes, &table, RANKING_HEAD_TENSOR)?;

        // Transfer the embedding table to each device context. Rolls back
        // automatically if any context runs out of budget.
        let upload_bytes = embeddings.len() * std::mem::size_of::<f32>();
        let device_uploads = pool.alloc_on_all(upload_bytes)?;

        tracing::info!(
            model_id = %config.model_id,
            num_items = config.num_items,
            hidden_dim = config.hidden_dim,
            upload_bytes,
            contexts = pool.contexts().len(),
            "model loaded"
        );

        Ok(ModelBinding {
            config,
            embeddings,
            ranking_head,
            _device_uploads: device_uploads,
        })
    }

    fn read_config(path: &Path) -> Result<ModelConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VlmError::InvalidModelPath(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            VlmError::InvalidModelPath(format!("corrupt {}: {e}", path.display()))
        })
    }
}

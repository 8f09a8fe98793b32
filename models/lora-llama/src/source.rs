use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chat_common::{Cache, CacheError, FileSource};
use serde::Deserialize;

use crate::{ChatTemplateError, LlamaConfig, LoraError, QuantizationError};

/// An error that can occur while loading a model, tokenizer or adapter.
#[derive(Debug, thiserror::Error)]
pub enum LlamaSourceError {
    /// A file could not be fetched.
    #[error("Failed to fetch a model file: {0}")]
    Cache(#[from] CacheError),
    /// A fetched file could not be read.
    #[error("Failed to read {}: {error}", path.display())]
    Io {
        /// The file that failed to read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        error: std::io::Error,
    },
    /// A JSON file could not be parsed.
    #[error("Failed to parse {file}: {error}")]
    Json {
        /// The file that failed to parse.
        file: String,
        /// The underlying error.
        #[source]
        error: serde_json::Error,
    },
    /// The model configuration is not a Llama configuration this crate can run.
    #[error("Invalid model config: {0}")]
    InvalidConfig(String),
    /// The repository has no safetensors weights.
    #[error("No safetensors weights found for {model_id}: {error}")]
    MissingWeights {
        /// The model that was requested.
        model_id: String,
        /// The error from the last lookup.
        #[source]
        error: CacheError,
    },
    /// A tensor is missing or malformed, or the device failed.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    /// The tokenizer could not be loaded.
    #[error("Failed to load tokenizer: {0}")]
    Tokenizer(tokenizers::Error),
    /// The chat template could not be compiled.
    #[error(transparent)]
    ChatTemplate(#[from] ChatTemplateError),
    /// The quantization settings cannot be used.
    #[error(transparent)]
    Quantization(#[from] QuantizationError),
    /// The adapter could not be layered over the model.
    #[error(transparent)]
    Lora(#[from] LoraError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SourceLocation {
    HuggingFace { revision: String },
    Local(PathBuf),
}

/// Where the files of a model, tokenizer or adapter live.
///
/// An identifier that names an existing directory is read from disk, anything else is treated as a
/// Hugging Face model repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LlamaSource {
    model_id: String,
    location: SourceLocation,
}

#[derive(Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

impl LlamaSource {
    /// Create a source for a model identifier at the `main` revision.
    pub fn new(model_id: impl ToString) -> Self {
        let model_id = model_id.to_string();
        let location = if Path::new(&model_id).is_dir() {
            SourceLocation::Local(PathBuf::from(&model_id))
        } else {
            SourceLocation::HuggingFace {
                revision: "main".to_string(),
            }
        };
        Self { model_id, location }
    }

    /// Use a specific revision of a Hugging Face repository. Local sources are unaffected.
    pub fn with_revision(mut self, revision: impl ToString) -> Self {
        if let SourceLocation::HuggingFace { .. } = self.location {
            self.location = SourceLocation::HuggingFace {
                revision: revision.to_string(),
            };
        }
        self
    }

    /// The identifier this source was created from.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Returns true if the files are read from a local directory.
    pub fn is_local(&self) -> bool {
        matches!(self.location, SourceLocation::Local(_))
    }

    /// The source of a single file in this model.
    pub fn file(&self, name: &str) -> FileSource {
        match &self.location {
            SourceLocation::HuggingFace { revision } => {
                FileSource::huggingface(&self.model_id, revision, name)
            }
            SourceLocation::Local(dir) => FileSource::local(dir.join(name)),
        }
    }

    pub(crate) fn read_to_string(
        &self,
        cache: &Cache,
        name: &str,
    ) -> Result<String, LlamaSourceError> {
        let path = cache.get(&self.file(name))?;
        std::fs::read_to_string(&path).map_err(|error| LlamaSourceError::Io { path, error })
    }

    /// Read a file the model may not ship with. Only a missing file yields `None`.
    pub(crate) fn read_if_present(
        &self,
        cache: &Cache,
        name: &str,
    ) -> Result<Option<String>, LlamaSourceError> {
        match cache.get_if_present(&self.file(name))? {
            Some(path) => std::fs::read_to_string(&path)
                .map(Some)
                .map_err(|error| LlamaSourceError::Io { path, error }),
            None => Ok(None),
        }
    }

    pub(crate) fn config(&self, cache: &Cache) -> Result<LlamaConfig, LlamaSourceError> {
        let json = self.read_to_string(cache, "config.json")?;
        LlamaConfig::from_json(&json)
    }

    /// Resolve the safetensors files, preferring a sharded index over a single file.
    pub(crate) fn weight_files(&self, cache: &Cache) -> Result<Vec<PathBuf>, LlamaSourceError> {
        let Some(index) = self.read_if_present(cache, "model.safetensors.index.json")? else {
            tracing::debug!(
                "No sharded index for {}, trying a single safetensors file",
                self.model_id
            );
            let weights = cache.get(&self.file("model.safetensors")).map_err(|error| {
                LlamaSourceError::MissingWeights {
                    model_id: self.model_id.clone(),
                    error,
                }
            })?;
            return Ok(vec![weights]);
        };
        let index: SafetensorsIndex =
            serde_json::from_str(&index).map_err(|error| LlamaSourceError::Json {
                file: "model.safetensors.index.json".to_string(),
                error,
            })?;
        let shards: BTreeSet<_> = index.weight_map.into_values().collect();
        tracing::debug!("Loading {} weight shards for {}", shards.len(), self.model_id);
        shards
            .iter()
            .map(|shard| {
                cache
                    .get(&self.file(shard))
                    .map_err(LlamaSourceError::from)
            })
            .collect()
    }
}

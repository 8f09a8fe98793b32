use crate::FileSource;
use hf_hub::api::sync::{Api, ApiBuilder, ApiError};
use hf_hub::{Repo, RepoType};
use std::path::PathBuf;

/// An error that can occur when resolving a [`FileSource`] to a path on disk.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The Hugging Face hub could not provide the file.
    #[error("Hugging Face API error for {source_file}: {error}")]
    HuggingFaceApi {
        /// The file that was requested.
        source_file: FileSource,
        /// The error returned by the hub client.
        #[source]
        error: ApiError,
    },
    /// A local file does not exist.
    #[error("Local file {0} does not exist")]
    MissingLocalFile(PathBuf),
}

/// A download cache for model files.
///
/// Hugging Face files are stored in the standard hub cache (`HF_HOME`) unless another location is set.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    location: Option<PathBuf>,
    /// The huggingface token to use (defaults to the token set with `huggingface-cli login`)
    huggingface_token: Option<String>,
    progress: bool,
}

impl Cache {
    /// Create a new cache with a specific location
    pub fn new(location: PathBuf) -> Self {
        Self {
            location: Some(location),
            ..Default::default()
        }
    }

    /// Set the Hugging Face token to use for downloading (defaults to the token set with `huggingface-cli login`, and then the environment variable `HF_TOKEN`)
    pub fn with_huggingface_token(mut self, token: Option<String>) -> Self {
        self.huggingface_token = token;
        self
    }

    /// Show a progress bar while files download.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Whether downloads show a progress bar.
    pub fn shows_progress(&self) -> bool {
        self.progress
    }

    fn hub_cache(&self) -> hf_hub::Cache {
        match &self.location {
            Some(location) => hf_hub::Cache::new(location.clone()),
            None => hf_hub::Cache::default(),
        }
    }

    /// Check if the file exists locally (if it is a local file or if it has been downloaded)
    pub fn exists(&self, source: &FileSource) -> bool {
        match source {
            FileSource::HuggingFace {
                model_id,
                revision,
                file,
            } => {
                let repo = Repo::with_revision(model_id.clone(), RepoType::Model, revision.clone());
                self.hub_cache().repo(repo).get(file).is_some()
            }
            FileSource::Local(path) => path.exists(),
        }
    }

    fn api(&self) -> Result<Api, ApiError> {
        let token = self
            .huggingface_token
            .clone()
            .or_else(|| std::env::var("HF_TOKEN").ok());

        let mut builder = ApiBuilder::new().with_progress(self.progress);
        if let Some(location) = &self.location {
            builder = builder.with_cache_dir(location.clone());
        }
        if token.is_some() {
            builder = builder.with_token(token);
        }
        builder.build()
    }

    /// Get the file from the cache, downloading it if necessary
    pub fn get(&self, source: &FileSource) -> Result<PathBuf, CacheError> {
        match source {
            FileSource::HuggingFace {
                model_id,
                revision,
                file,
            } => {
                let hub_error = |error| CacheError::HuggingFaceApi {
                    source_file: source.clone(),
                    error,
                };
                let api = self.api().map_err(hub_error)?;

                let repo = Repo::with_revision(model_id.clone(), RepoType::Model, revision.clone());
                tracing::trace!("Fetching {file} from {model_id}@{revision}");
                let path = api.repo(repo).get(file).map_err(hub_error)?;
                tracing::trace!("Resolved {source} to {}", path.display());

                Ok(path)
            }
            FileSource::Local(path) => {
                if path.exists() {
                    Ok(path.clone())
                } else {
                    Err(CacheError::MissingLocalFile(path.clone()))
                }
            }
        }
    }

    /// Get a file that a model may not ship with.
    ///
    /// Returns `None` only when the file is not part of the model. Any other failure, like a network
    /// or permission error, is returned as an error.
    pub fn get_if_present(&self, source: &FileSource) -> Result<Option<PathBuf>, CacheError> {
        match source {
            FileSource::HuggingFace {
                model_id,
                revision,
                file,
            } => {
                if self.exists(source) {
                    return self.get(source).map(Some);
                }
                let hub_error = |error| CacheError::HuggingFaceApi {
                    source_file: source.clone(),
                    error,
                };
                let api = self.api().map_err(hub_error)?;
                let repo = Repo::with_revision(model_id.clone(), RepoType::Model, revision.clone());
                let info = api.repo(repo).info().map_err(hub_error)?;
                if info.siblings.iter().any(|sibling| &sibling.rfilename == file) {
                    self.get(source).map(Some)
                } else {
                    tracing::trace!("{model_id}@{revision} has no {file}");
                    Ok(None)
                }
            }
            FileSource::Local(path) => Ok(path.exists().then(|| path.clone())),
        }
    }
}

//! Shared helpers for the chat workspace: accelerator selection, a Hugging Face backed file cache,
//! and the key/value and mask caches used by the attention layers.

#![warn(missing_docs)]

use std::{fmt::Display, path::PathBuf, sync::OnceLock};

use candle_core::{utils::*, Device};

mod cache;
pub use cache::*;
mod kv_cache;
pub use kv_cache::*;
mod mask;
pub use mask::*;

/// Create a candle device that uses any available accelerator.
pub fn accelerated_device_if_available() -> candle_core::Result<Device> {
    static DEVICE: OnceLock<Device> = OnceLock::new();
    if let Some(device) = DEVICE.get() {
        return Ok(device.clone());
    }
    let device = if cuda_is_available() {
        tracing::info!("Running on CUDA device 0");
        Device::new_cuda(0)?
    } else if metal_is_available() {
        tracing::info!("Running on Metal device 0");
        Device::new_metal(0)?
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        tracing::warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
        Device::Cpu
    };
    let _ = DEVICE.set(device.clone());
    Ok(device)
}

/// A source for a file, either from Hugging Face or a local path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileSource {
    /// A file from Hugging Face
    HuggingFace {
        /// The model id to use
        model_id: String,
        /// The revision to use
        revision: String,
        /// The file to use
        file: String,
    },
    /// A local file
    Local(PathBuf),
}

impl Display for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileSource::HuggingFace {
                model_id,
                revision,
                file,
            } => write!(f, "hf://{}/{}/{}", model_id, revision, file),
            FileSource::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

impl FileSource {
    /// Create a new source for a file from Hugging Face
    pub fn huggingface(
        model_id: impl ToString,
        revision: impl ToString,
        file: impl ToString,
    ) -> Self {
        Self::HuggingFace {
            model_id: model_id.to_string(),
            revision: revision.to_string(),
            file: file.to_string(),
        }
    }

    /// Create a new source for a local file
    pub fn local(path: PathBuf) -> Self {
        Self::Local(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sources_display_as_urls_or_paths() {
        let remote = FileSource::huggingface("meta-llama/Llama-2-7b-chat-hf", "main", "config.json");
        assert_eq!(
            remote.to_string(),
            "hf://meta-llama/Llama-2-7b-chat-hf/main/config.json"
        );

        let local = FileSource::local(PathBuf::from("adapter/adapter_config.json"));
        assert_eq!(local.to_string(), "adapter/adapter_config.json");
    }
}

//! # LoRA Llama
//!
//! A Rust implementation of Hugging Face Llama checkpoints with 4-bit quantized projections and
//! unmerged LoRA adapters, built on [Candle](https://github.com/huggingface/candle).
//!
//! ## Usage
//!
//! ```rust, no_run
//! use lora_llama::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let loader = LlamaLoader::new();
//! let model = loader.load_model("meta-llama/Llama-2-7b-chat-hf", &QuantizationConfig::default())?;
//! let tokenizer = loader.load_tokenizer("meta-llama/Llama-2-7b-chat-hf")?;
//!
//! let prompt = tokenizer.apply_chat_template(&[Turn::new(Role::User, "Hello!")])?;
//! let input_ids = tokenizer.encode(&prompt)?;
//! let output = model.generate(&input_ids, &GenerationParameters::default())?;
//! println!("{}", tokenizer.decode(&output[input_ids.len()..], true)?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod chat_template;
mod config;
mod loader;
mod lora;
mod model;
mod quantize;
mod raw;
mod source;
mod tokenizer;

pub use crate::chat_template::{ChatTemplateError, LLAMA_2_CHAT_TEMPLATE};
pub use crate::config::LlamaConfig;
pub use crate::loader::LlamaLoader;
pub use crate::lora::{LoraAdapter, LoraConfig, LoraError};
pub use crate::model::{LlamaModel, LlamaModelError};
pub use crate::quantize::QuantizationError;
pub use crate::raw::cache::*;
pub use crate::source::*;
pub use crate::tokenizer::{LlamaTokenizer, LlamaTokenizerError};
pub use chat_common::*;

/// A prelude of commonly used items in lora-llama.
pub mod prelude {
    pub use crate::{LlamaLoader, LlamaModel, LlamaSource, LlamaTokenizer};
    pub use chat_language_model::*;
}

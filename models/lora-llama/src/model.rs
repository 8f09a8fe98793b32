use chat_language_model::{sample_token, CausalLanguageModel, GenerationParameters, SamplingError};

use crate::raw::cache::LlamaCache;
use crate::raw::{logits_to_vec, Model};
use crate::{LlamaConfig, LoraAdapter, LoraError};

/// An error that can occur when running a [`LlamaModel`].
#[derive(Debug, thiserror::Error)]
pub enum LlamaModelError {
    /// An error from candle while running the model.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    /// The next token could not be sampled.
    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),
    /// Generation needs at least one prompt token.
    #[error("Cannot generate from an empty prompt")]
    EmptyPrompt,
    /// The vocabulary cannot be resized to zero tokens.
    #[error("Cannot resize the vocabulary to zero tokens")]
    EmptyVocabulary,
}

/// A Llama model with 4-bit projections and an optional LoRA adapter.
pub struct LlamaModel {
    model: Model,
    adapter: Option<String>,
}

impl LlamaModel {
    pub(crate) fn new(model: Model) -> Self {
        Self {
            model,
            adapter: None,
        }
    }

    /// The configuration the model was loaded with.
    pub fn config(&self) -> &LlamaConfig {
        &self.model.config
    }

    /// Layer `adapter` over the model and remember it under `adapter_id`.
    pub fn with_adapter(
        mut self,
        adapter: LoraAdapter,
        adapter_id: impl ToString,
    ) -> Result<Self, LoraError> {
        adapter.apply(&mut self.model)?;
        let adapter_id = adapter_id.to_string();
        tracing::info!("Attached adapter {adapter_id}");
        self.adapter = Some(adapter_id);
        Ok(self)
    }

    /// Run `tokens` after everything in `cache` and return the logits of the last position.
    pub fn forward(
        &self,
        tokens: &[u32],
        cache: &mut LlamaCache,
    ) -> Result<Vec<f32>, LlamaModelError> {
        if tokens.is_empty() {
            return Err(LlamaModelError::EmptyPrompt);
        }
        let logits = self.model.forward(tokens, cache)?;
        Ok(logits_to_vec(&logits)?)
    }
}

impl CausalLanguageModel for LlamaModel {
    type Error = LlamaModelError;

    fn resize_token_embeddings(&mut self, vocab_size: usize) -> Result<(), Self::Error> {
        if vocab_size == 0 {
            return Err(LlamaModelError::EmptyVocabulary);
        }
        self.model.resize_token_embeddings(vocab_size)?;
        Ok(())
    }

    fn generate(
        &self,
        input_ids: &[u32],
        parameters: &GenerationParameters,
    ) -> Result<Vec<u32>, Self::Error> {
        let max_length = parameters.max_length();
        let mut tokens = input_ids.to_vec();
        if tokens.len() >= max_length {
            tracing::warn!(
                "The prompt is {} tokens long, which already reaches the maximum length of {max_length}; nothing will be generated",
                tokens.len()
            );
            return Ok(tokens);
        }
        if tokens.is_empty() {
            return Err(LlamaModelError::EmptyPrompt);
        }

        let stop_tokens = self.model.config.eos_token_ids();
        let mut cache = LlamaCache::new(&self.model.config, max_length);
        let mut sampler = parameters.sampler();
        let mut rng = parameters.rng();

        let mut logits = self.forward(&tokens, &mut cache)?;
        loop {
            let token = sample_token(&mut sampler, &mut rng, &tokens, logits)?;
            tracing::trace!("Sampled token {token}");
            tokens.push(token);
            if stop_tokens.contains(&token) || tokens.len() >= max_length {
                break;
            }
            logits = self.forward(&[token], &mut cache)?;
        }

        tracing::debug!(
            "Generated {} tokens after a {} token prompt",
            tokens.len() - input_ids.len(),
            input_ids.len()
        );
        Ok(tokens)
    }

    fn adapter(&self) -> Option<&str> {
        self.adapter.as_deref()
    }
}

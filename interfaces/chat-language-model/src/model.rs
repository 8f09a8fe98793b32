use crate::{GenerationParameters, QuantizationConfig, Turn};

/// A tokenizer that also knows how to render a conversation with the model's chat template.
pub trait ChatTokenizer {
    /// The error type returned by the tokenizer.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Render the conversation into a single prompt string.
    ///
    /// This must be a pure function of `turns`: rendering the same turns twice yields the same prompt.
    fn apply_chat_template(&self, turns: &[Turn]) -> Result<String, Self::Error>;

    /// Tokenize a prompt. No special tokens are added beyond those already in the text.
    fn encode(&self, prompt: &str) -> Result<Vec<u32>, Self::Error>;

    /// Turn tokens back into text.
    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String, Self::Error>;

    /// The number of tokens in the vocabulary, including added tokens.
    fn vocab_size(&self) -> usize;
}

/// A causal language model that continues a sequence of tokens.
pub trait CausalLanguageModel {
    /// The error type returned by the model.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Resize the input embeddings and output head to `vocab_size` tokens.
    fn resize_token_embeddings(&mut self, vocab_size: usize) -> Result<(), Self::Error>;

    /// Generate a continuation of `input_ids`.
    ///
    /// The returned tokens start with `input_ids` followed by the generated tokens. The whole
    /// sequence never exceeds [`GenerationParameters::max_length`].
    fn generate(
        &self,
        input_ids: &[u32],
        parameters: &GenerationParameters,
    ) -> Result<Vec<u32>, Self::Error>;

    /// The identifier of the adapter layered over the base weights, if any.
    fn adapter(&self) -> Option<&str> {
        None
    }
}

/// Loads models, tokenizers and adapters by identifier.
pub trait ModelLoader {
    /// The model this loader produces.
    type Model: CausalLanguageModel;
    /// The tokenizer this loader produces.
    type Tokenizer: ChatTokenizer;
    /// The error type returned while loading.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Load a model with the given quantization.
    fn load_model(
        &self,
        model_id: &str,
        quantization: &QuantizationConfig,
    ) -> Result<Self::Model, Self::Error>;

    /// Load the tokenizer of a model or adapter.
    fn load_tokenizer(&self, model_id: &str) -> Result<Self::Tokenizer, Self::Error>;

    /// Layer the adapter weights stored under `adapter_id` over `model`.
    fn load_adapter(&self, model: Self::Model, adapter_id: &str)
        -> Result<Self::Model, Self::Error>;
}

use chat_language_model::{GenerationParameters, QuantizationConfig};

/// The persona and safety instructions every conversation starts with.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful and joyous mental therapy assistant. Always answer as helpfully and cheerfully as possible, while being safe. Your answers should not include any harmful, unethical, racist, sexist, toxic, dangerous, or illegal content.Please ensure that your responses are socially unbiased and positive in nature.\n\nIf a question does not make any sense, or is not factually coherent, explain why instead of answering something not correct. If you don't know the answer to a question, please don't share false information.";

/// The base model the adapter was fine-tuned from.
pub const DEFAULT_BASE_MODEL_ID: &str = "meta-llama/Llama-2-7b-chat-hf";

/// The directory the fine-tuning run saved its adapter and tokenizer to.
pub const DEFAULT_ADAPTER_MODEL_ID: &str = "llama-2-7b-chat-hf-phr_mental_therapy-3";

/// The fine-tuned model with the adapter already merged into its weights.
pub const DEFAULT_MERGED_MODEL_ID: &str = "vibhorag101/llama-2-7b-chat-hf-phr_mental_therapy_v2";

/// The input that ends the chat.
pub const DEFAULT_EXIT_COMMAND: &str = "/exit";

/// Everything needed to start a chat session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    use_adapter: bool,
    base_model_id: String,
    adapter_model_id: String,
    merged_model_id: String,
    system_prompt: String,
    quantization: QuantizationConfig,
    generation: GenerationParameters,
    exit_command: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            use_adapter: false,
            base_model_id: DEFAULT_BASE_MODEL_ID.to_string(),
            adapter_model_id: DEFAULT_ADAPTER_MODEL_ID.to_string(),
            merged_model_id: DEFAULT_MERGED_MODEL_ID.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            quantization: QuantizationConfig::default(),
            generation: GenerationParameters::default(),
            exit_command: Some(DEFAULT_EXIT_COMMAND.to_string()),
        }
    }
}

impl SessionConfig {
    /// Create the default configuration: the merged model, 4-bit weights and sampled replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer the adapter over the base model instead of loading the merged model.
    pub fn with_use_adapter(mut self, use_adapter: bool) -> Self {
        self.use_adapter = use_adapter;
        self
    }

    /// Set the model the adapter is layered over.
    pub fn with_base_model_id(mut self, model_id: impl ToString) -> Self {
        self.base_model_id = model_id.to_string();
        self
    }

    /// Set where the adapter and its tokenizer are loaded from.
    pub fn with_adapter_model_id(mut self, model_id: impl ToString) -> Self {
        self.adapter_model_id = model_id.to_string();
        self
    }

    /// Set the model used when no adapter is layered.
    pub fn with_merged_model_id(mut self, model_id: impl ToString) -> Self {
        self.merged_model_id = model_id.to_string();
        self
    }

    /// Set the first turn of every conversation.
    pub fn with_system_prompt(mut self, system_prompt: impl ToString) -> Self {
        self.system_prompt = system_prompt.to_string();
        self
    }

    /// Set how weights are quantized.
    pub fn with_quantization(mut self, quantization: QuantizationConfig) -> Self {
        self.quantization = quantization;
        self
    }

    /// Set how replies are sampled.
    pub fn with_generation(mut self, generation: GenerationParameters) -> Self {
        self.generation = generation;
        self
    }

    /// Set the input that ends the chat, or `None` to chat until the input closes.
    pub fn with_exit_command(mut self, exit_command: Option<String>) -> Self {
        self.exit_command = exit_command;
        self
    }

    /// Whether the adapter is layered over the base model.
    pub fn use_adapter(&self) -> bool {
        self.use_adapter
    }

    /// The model the adapter is layered over.
    pub fn base_model_id(&self) -> &str {
        &self.base_model_id
    }

    /// Where the adapter and its tokenizer are loaded from.
    pub fn adapter_model_id(&self) -> &str {
        &self.adapter_model_id
    }

    /// The model used when no adapter is layered.
    pub fn merged_model_id(&self) -> &str {
        &self.merged_model_id
    }

    /// The first turn of every conversation.
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// How weights are quantized.
    pub fn quantization(&self) -> &QuantizationConfig {
        &self.quantization
    }

    /// How replies are sampled.
    pub fn generation(&self) -> &GenerationParameters {
        &self.generation
    }

    /// The input that ends the chat.
    pub fn exit_command(&self) -> Option<&str> {
        self.exit_command.as_deref()
    }
}

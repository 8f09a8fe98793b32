use chat_language_model::{
    CausalLanguageModel, ChatTokenizer, ConversationError, ConversationState, GenerationParameters,
    ModelLoader,
};

use crate::SessionConfig;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// An error that ends a chat session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The model, tokenizer or adapter could not be loaded.
    #[error("Failed to start the chat session: {0}")]
    Initialization(#[source] BoxedError),
    /// Rendering the prompt, generating the reply or decoding it failed.
    #[error("Failed to generate a reply: {0}")]
    Generation(#[source] BoxedError),
    /// A turn was appended out of order.
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    /// Reading input or printing a reply failed.
    #[error("Terminal I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    fn initialization(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Initialization(Box::new(error))
    }

    fn generation(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Generation(Box::new(error))
    }
}

/// A loaded model and tokenizer together with the conversation they are having.
pub struct Session<M, T> {
    model: M,
    tokenizer: T,
    conversation: ConversationState,
    parameters: GenerationParameters,
}

impl<M, T> Session<M, T>
where
    M: CausalLanguageModel,
    T: ChatTokenizer,
{
    /// Start a conversation that opens with `system_prompt`.
    pub fn new(
        model: M,
        tokenizer: T,
        system_prompt: impl ToString,
        parameters: GenerationParameters,
    ) -> Self {
        Self {
            model,
            tokenizer,
            conversation: ConversationState::with_system_prompt(system_prompt),
            parameters,
        }
    }

    /// Answer one user utterance.
    ///
    /// The utterance is appended before generating. The reply is appended only once it has been
    /// decoded, so a failure leaves the utterance unanswered.
    pub fn respond(&mut self, user_input: &str) -> Result<String, SessionError> {
        self.conversation.push_user(user_input)?;

        let prompt = self
            .tokenizer
            .apply_chat_template(self.conversation.turns())
            .map_err(SessionError::generation)?;
        let input_ids = self
            .tokenizer
            .encode(&prompt)
            .map_err(SessionError::generation)?;
        let output = self
            .model
            .generate(&input_ids, &self.parameters)
            .map_err(SessionError::generation)?;
        let generated = output.get(input_ids.len()..).unwrap_or_default();
        tracing::debug!(
            "Prompt of {} tokens produced {} new tokens",
            input_ids.len(),
            generated.len()
        );
        let response = self
            .tokenizer
            .decode(generated, true)
            .map_err(SessionError::generation)?;

        self.conversation.push_assistant(&response)?;
        Ok(response)
    }

    /// The conversation so far.
    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    /// The model generating replies.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// The tokenizer rendering prompts.
    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// The sampling settings used for every reply.
    pub fn parameters(&self) -> &GenerationParameters {
        &self.parameters
    }
}

/// Load the model and tokenizer `config` selects and start a conversation with its system prompt.
///
/// In adapter mode the tokenizer comes from the adapter, and the embeddings are resized to its
/// vocabulary before the adapter weights are attached.
pub fn initialize<L: ModelLoader>(
    loader: &L,
    config: &SessionConfig,
) -> Result<Session<L::Model, L::Tokenizer>, SessionError> {
    let (model, tokenizer) = if config.use_adapter() {
        let mut model = loader
            .load_model(config.base_model_id(), config.quantization())
            .map_err(SessionError::initialization)?;
        let tokenizer = loader
            .load_tokenizer(config.adapter_model_id())
            .map_err(SessionError::initialization)?;
        model
            .resize_token_embeddings(tokenizer.vocab_size())
            .map_err(SessionError::initialization)?;
        let model = loader
            .load_adapter(model, config.adapter_model_id())
            .map_err(SessionError::initialization)?;
        (model, tokenizer)
    } else {
        let model = loader
            .load_model(config.merged_model_id(), config.quantization())
            .map_err(SessionError::initialization)?;
        let tokenizer = loader
            .load_tokenizer(config.merged_model_id())
            .map_err(SessionError::initialization)?;
        (model, tokenizer)
    };

    Ok(Session::new(
        model,
        tokenizer,
        config.system_prompt(),
        config.generation().clone(),
    ))
}

use chat_language_model::{ChatTokenizer, Turn};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::chat_template::{HuggingFaceChatTemplate, LLAMA_2_CHAT_TEMPLATE};
use crate::{ChatTemplateError, LlamaSourceError};

/// An error that can occur while running a [`LlamaTokenizer`].
#[derive(Debug, thiserror::Error)]
pub enum LlamaTokenizerError {
    /// The chat template failed to render.
    #[error(transparent)]
    ChatTemplate(#[from] ChatTemplateError),
    /// An error from tokenizers while encoding or decoding.
    #[error("Tokenizer error: {0}")]
    Tokenizer(tokenizers::Error),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SpecialToken {
    Content(String),
    AddedToken { content: String },
}

impl SpecialToken {
    fn into_content(self) -> String {
        match self {
            SpecialToken::Content(content) | SpecialToken::AddedToken { content } => content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NamedTemplate {
    name: String,
    template: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChatTemplateSource {
    Single(String),
    Named(Vec<NamedTemplate>),
}

impl ChatTemplateSource {
    fn into_default(self) -> Option<String> {
        match self {
            ChatTemplateSource::Single(template) => Some(template),
            ChatTemplateSource::Named(templates) => {
                let mut templates = templates.into_iter();
                let first = templates.next()?;
                if first.name == "default" {
                    return Some(first.template);
                }
                Some(
                    templates
                        .find(|template| template.name == "default")
                        .unwrap_or(first)
                        .template,
                )
            }
        }
    }
}

/// The parts of `tokenizer_config.json` needed to build prompts.
#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    #[serde(default)]
    chat_template: Option<ChatTemplateSource>,
    #[serde(default)]
    bos_token: Option<SpecialToken>,
    #[serde(default)]
    eos_token: Option<SpecialToken>,
}

/// A Hugging Face tokenizer together with the chat template of its model.
#[derive(Debug)]
pub struct LlamaTokenizer {
    tokenizer: Tokenizer,
    chat_template: HuggingFaceChatTemplate,
    bos_token: String,
    eos_token: String,
}

impl LlamaTokenizer {
    /// Create a tokenizer from a `tokenizer.json` and the text of an optional `tokenizer_config.json`.
    pub fn new(tokenizer: Tokenizer, config: Option<&str>) -> Result<Self, LlamaSourceError> {
        let config: TokenizerConfig = match config {
            Some(json) => serde_json::from_str(json).map_err(|error| LlamaSourceError::Json {
                file: "tokenizer_config.json".to_string(),
                error,
            })?,
            None => TokenizerConfig::default(),
        };
        let chat_template = match config.chat_template.and_then(ChatTemplateSource::into_default)
        {
            Some(template) => template,
            None => {
                tracing::debug!("No chat template in the tokenizer config, using the Llama 2 chat template");
                LLAMA_2_CHAT_TEMPLATE.to_string()
            }
        };
        Ok(Self {
            tokenizer,
            chat_template: HuggingFaceChatTemplate::create(chat_template)?,
            bos_token: config
                .bos_token
                .map(SpecialToken::into_content)
                .unwrap_or_else(|| "<s>".to_string()),
            eos_token: config
                .eos_token
                .map(SpecialToken::into_content)
                .unwrap_or_else(|| "</s>".to_string()),
        })
    }

    /// The underlying tokenizer.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// The beginning of sequence marker the chat template emits.
    pub fn bos_token(&self) -> &str {
        &self.bos_token
    }

    /// The end of sequence marker the chat template emits.
    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }
}

impl ChatTokenizer for LlamaTokenizer {
    type Error = LlamaTokenizerError;

    fn apply_chat_template(&self, turns: &[Turn]) -> Result<String, Self::Error> {
        Ok(self
            .chat_template
            .render(&self.bos_token, &self.eos_token, turns, false)?)
    }

    fn encode(&self, prompt: &str) -> Result<Vec<u32>, Self::Error> {
        let encoded = self
            .tokenizer
            .encode(prompt, false)
            .map_err(LlamaTokenizerError::Tokenizer)?;
        Ok(encoded.get_ids().to_vec())
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String, Self::Error> {
        self.tokenizer
            .decode(tokens, skip_special_tokens)
            .map_err(LlamaTokenizerError::Tokenizer)
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

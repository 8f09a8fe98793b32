use serde::Deserialize;

use crate::LlamaSourceError;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    Single(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    fn into_vec(self) -> Vec<u32> {
        match self {
            TokenIds::Single(id) => vec![id],
            TokenIds::Many(ids) => ids,
        }
    }
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f32 {
    10_000.
}

fn default_max_position_embeddings() -> usize {
    4096
}

/// The subset of a Hugging Face `config.json` a Llama model needs.
#[derive(Debug, Clone, Deserialize)]
struct LlamaConfigFile {
    hidden_size: usize,
    intermediate_size: usize,
    num_attention_heads: usize,
    num_hidden_layers: usize,
    num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    rope_theta: f32,
    #[serde(default = "default_max_position_embeddings")]
    max_position_embeddings: usize,
    vocab_size: usize,
    eos_token_id: Option<TokenIds>,
    #[serde(default)]
    tie_word_embeddings: bool,
}

/// The configuration of a Llama model.
#[derive(Debug, Clone, PartialEq)]
pub struct LlamaConfig {
    pub(crate) hidden_size: usize,
    pub(crate) intermediate_size: usize,
    pub(crate) n_head: usize,
    pub(crate) n_kv_head: usize,
    pub(crate) n_layer: usize,
    pub(crate) rms_norm_eps: f64,
    pub(crate) rope_theta: f32,
    pub(crate) context_length: usize,
    pub(crate) vocab_size: usize,
    pub(crate) eos_token_ids: Vec<u32>,
    pub(crate) tie_word_embeddings: bool,
}

impl LlamaConfig {
    /// Parse a Hugging Face `config.json`.
    pub fn from_json(json: &str) -> Result<Self, LlamaSourceError> {
        let file: LlamaConfigFile =
            serde_json::from_str(json).map_err(|error| LlamaSourceError::Json {
                file: "config.json".to_string(),
                error,
            })?;
        let config = Self {
            hidden_size: file.hidden_size,
            intermediate_size: file.intermediate_size,
            n_head: file.num_attention_heads,
            n_kv_head: file
                .num_key_value_heads
                .unwrap_or(file.num_attention_heads),
            n_layer: file.num_hidden_layers,
            rms_norm_eps: file.rms_norm_eps,
            rope_theta: file.rope_theta,
            context_length: file.max_position_embeddings,
            vocab_size: file.vocab_size,
            eos_token_ids: file.eos_token_id.map(TokenIds::into_vec).unwrap_or_default(),
            tie_word_embeddings: file.tie_word_embeddings,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), LlamaSourceError> {
        if self.n_head == 0 || self.hidden_size % self.n_head != 0 {
            return Err(LlamaSourceError::InvalidConfig(format!(
                "hidden size {} is not divisible by {} attention heads",
                self.hidden_size, self.n_head
            )));
        }
        if self.n_kv_head == 0 || self.n_head % self.n_kv_head != 0 {
            return Err(LlamaSourceError::InvalidConfig(format!(
                "{} attention heads cannot be grouped over {} key/value heads",
                self.n_head, self.n_kv_head
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(LlamaSourceError::InvalidConfig(format!(
                "rotary embeddings need an even head dimension, found {}",
                self.head_dim()
            )));
        }
        Ok(())
    }

    /// The width of a single attention head.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_head
    }

    /// The number of rows in the embedding table.
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The tokens that end generation.
    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    /// The longest sequence the rotary embeddings are computed for.
    pub fn context_length(&self) -> usize {
        self.context_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_llama_2_config() {
        let config = LlamaConfig::from_json(
            r#"{
                "architectures": ["LlamaForCausalLM"],
                "bos_token_id": 1,
                "eos_token_id": 2,
                "hidden_act": "silu",
                "hidden_size": 4096,
                "intermediate_size": 11008,
                "max_position_embeddings": 4096,
                "num_attention_heads": 32,
                "num_hidden_layers": 32,
                "num_key_value_heads": 32,
                "rms_norm_eps": 1e-05,
                "rope_scaling": null,
                "tie_word_embeddings": false,
                "torch_dtype": "float16",
                "vocab_size": 32000
            }"#,
        )
        .unwrap();
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.n_kv_head, 32);
        assert_eq!(config.rms_norm_eps, 1e-5);
        assert_eq!(config.rope_theta, 10_000.);
        assert_eq!(config.eos_token_ids(), &[2]);
        assert_eq!(config.vocab_size(), 32000);
    }

    #[test]
    fn accepts_lists_of_eos_tokens_and_missing_kv_heads() {
        let config = LlamaConfig::from_json(
            r#"{
                "hidden_size": 64,
                "intermediate_size": 128,
                "num_attention_heads": 4,
                "num_hidden_layers": 2,
                "vocab_size": 100,
                "eos_token_id": [7, 9]
            }"#,
        )
        .unwrap();
        assert_eq!(config.n_kv_head, 4);
        assert_eq!(config.eos_token_ids(), &[7, 9]);
        assert_eq!(config.context_length(), 4096);
    }

    #[test]
    fn rejects_heads_that_do_not_divide_the_hidden_size() {
        let error = LlamaConfig::from_json(
            r#"{
                "hidden_size": 65,
                "intermediate_size": 128,
                "num_attention_heads": 4,
                "num_hidden_layers": 2,
                "vocab_size": 100
            }"#,
        )
        .unwrap_err();
        assert!(matches!(error, LlamaSourceError::InvalidConfig(_)));
    }
}

use std::collections::HashMap;

use candle_core::Tensor;
use serde::Deserialize;

use crate::raw::Model;

/// An error that can occur while layering a LoRA adapter over a model.
#[derive(Debug, thiserror::Error)]
pub enum LoraError {
    /// `adapter_config.json` could not be parsed.
    #[error("Invalid adapter config: {0}")]
    Config(#[from] serde_json::Error),
    /// The adapter uses a PEFT feature this crate does not implement.
    #[error("Unsupported adapter: {0}")]
    Unsupported(String),
    /// The adapter targets a module the model does not have.
    #[error("The adapter targets `{0}`, which is not a projection of this model")]
    UnknownModule(String),
    /// Only one half of a low rank pair was present.
    #[error("The adapter for `{module}` is missing its lora_{missing} weight")]
    IncompletePair {
        /// The module the pair belongs to.
        module: String,
        /// Which half is missing, `A` or `B`.
        missing: char,
    },
    /// A low rank pair does not fit the projection it targets.
    #[error("The adapter for `{module}` has shapes A {a:?} and B {b:?}, which do not fit a {in_features}->{out_features} projection")]
    ShapeMismatch {
        /// The module the pair belongs to.
        module: String,
        /// The shape of the A matrix.
        a: Vec<usize>,
        /// The shape of the B matrix.
        b: Vec<usize>,
        /// The input width of the projection.
        in_features: usize,
        /// The output width of the projection.
        out_features: usize,
    },
    /// A saved module has a different vocabulary than the model.
    #[error("The adapter's `{module}` has {adapter} rows but the model vocabulary has {model} tokens")]
    VocabularyMismatch {
        /// The module that was saved in full.
        module: String,
        /// The number of rows in the adapter.
        adapter: usize,
        /// The vocabulary size of the model.
        model: usize,
    },
    /// A tensor operation failed.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TargetModules {
    List(Vec<String>),
    Pattern(String),
}

/// The parts of a PEFT `adapter_config.json` that affect inference.
#[derive(Debug, Clone, Deserialize)]
pub struct LoraConfig {
    #[serde(default)]
    peft_type: Option<String>,
    r: usize,
    lora_alpha: f64,
    #[serde(default)]
    use_rslora: bool,
    #[serde(default)]
    use_dora: bool,
    #[serde(default)]
    fan_in_fan_out: bool,
    #[serde(default)]
    bias: Option<String>,
    #[serde(default)]
    target_modules: Option<TargetModules>,
    #[serde(default)]
    modules_to_save: Option<Vec<String>>,
    #[serde(default)]
    alpha_pattern: HashMap<String, f64>,
    #[serde(default)]
    base_model_name_or_path: Option<String>,
}

impl LoraConfig {
    /// Parse and validate an `adapter_config.json`.
    pub fn from_json(json: &str) -> Result<Self, LoraError> {
        let config: Self = serde_json::from_str(json)?;
        if let Some(peft_type) = &config.peft_type {
            if peft_type != "LORA" {
                return Err(LoraError::Unsupported(format!(
                    "{peft_type} adapters are not LoRA adapters"
                )));
            }
        }
        if config.fan_in_fan_out {
            return Err(LoraError::Unsupported(
                "fan_in_fan_out is only used by Conv1D models".to_string(),
            ));
        }
        if config.use_dora {
            return Err(LoraError::Unsupported(
                "DoRA adapters are not supported".to_string(),
            ));
        }
        if let Some(bias) = config.bias.as_deref() {
            if bias != "none" {
                return Err(LoraError::Unsupported(format!(
                    "trained biases (`bias = {bias}`) are not supported"
                )));
            }
        }
        if config.r == 0 {
            return Err(LoraError::Unsupported("rank 0 adapters".to_string()));
        }
        Ok(config)
    }

    /// The model the adapter was trained on, if recorded.
    pub fn base_model(&self) -> Option<&str> {
        self.base_model_name_or_path.as_deref()
    }

    /// The modules the adapter was trained on, if recorded as a list.
    pub fn target_modules(&self) -> Option<&[String]> {
        match &self.target_modules {
            Some(TargetModules::List(modules)) => Some(modules),
            _ => None,
        }
    }

    /// The modules saved in full rather than as low rank pairs.
    pub fn modules_to_save(&self) -> &[String] {
        self.modules_to_save.as_deref().unwrap_or_default()
    }

    /// The multiplier of the low rank update for `module` with the given rank.
    pub fn scale(&self, module: &str, rank: usize) -> f64 {
        let alpha = self
            .alpha_pattern
            .iter()
            .filter(|(pattern, _)| {
                module == pattern.as_str() || module.ends_with(&format!(".{pattern}"))
            })
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, alpha)| *alpha)
            .unwrap_or(self.lora_alpha);
        if self.use_rslora {
            alpha / (rank as f64).sqrt()
        } else {
            alpha / rank as f64
        }
    }
}

#[derive(Default)]
struct LoraPair {
    a: Option<Tensor>,
    b: Option<Tensor>,
}

/// The weights of a LoRA adapter, grouped by the module they apply to.
pub struct LoraAdapter {
    config: LoraConfig,
    pairs: HashMap<String, LoraPair>,
    replacements: HashMap<String, Tensor>,
}

/// Normalize a PEFT tensor name to the name of the module in the base model.
///
/// Returns `None` for tensors that are copies of the frozen base module.
fn module_key(name: &str) -> Option<String> {
    let name = name.strip_prefix("base_model.model.").unwrap_or(name);
    if name.contains(".original_module.") {
        return None;
    }
    Some(
        name.replace(".modules_to_save.default.", ".")
            .replace(".modules_to_save.", ".")
            .replace(".default.", "."),
    )
}

impl LoraAdapter {
    /// Group the tensors of `adapter_model.safetensors`.
    pub fn new(config: LoraConfig, tensors: HashMap<String, Tensor>) -> Result<Self, LoraError> {
        let mut pairs: HashMap<String, LoraPair> = HashMap::new();
        let mut replacements = HashMap::new();
        for (name, tensor) in tensors {
            let Some(name) = module_key(&name) else {
                continue;
            };
            if let Some((module, _)) = name.split_once(".lora_A") {
                pairs.entry(module.to_string()).or_default().a = Some(tensor);
            } else if let Some((module, _)) = name.split_once(".lora_B") {
                pairs.entry(module.to_string()).or_default().b = Some(tensor);
            } else if name.contains(".lora_") {
                return Err(LoraError::Unsupported(format!("adapter tensor `{name}`")));
            } else {
                replacements.insert(name, tensor);
            }
        }
        Ok(Self {
            config,
            pairs,
            replacements,
        })
    }

    /// The configuration the adapter was saved with.
    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// Layer the adapter over `model` without merging it into the base weights.
    pub(crate) fn apply(self, model: &mut Model) -> Result<(), LoraError> {
        let vocab_size = model.config.vocab_size();
        let device = model.device().clone();
        for (name, tensor) in &self.replacements {
            let (rows, _) = tensor.dims2()?;
            let is_embedding = name == "model.embed_tokens.weight";
            let is_head = name == "lm_head.weight";
            if !is_embedding && !is_head {
                return Err(LoraError::UnknownModule(name.clone()));
            }
            if rows != vocab_size {
                return Err(LoraError::VocabularyMismatch {
                    module: name.clone(),
                    adapter: rows,
                    model: vocab_size,
                });
            }
        }

        let mut attached = 0;
        for (module, pair) in self.pairs {
            let (a, b) = match (pair.a, pair.b) {
                (Some(a), Some(b)) => (a, b),
                (None, _) => return Err(LoraError::IncompletePair { module, missing: 'A' }),
                (_, None) => return Err(LoraError::IncompletePair { module, missing: 'B' }),
            };
            let rank = a.dim(0)?;
            let scale = self.config.scale(&module, rank);
            let Some(linear) = model.projection_mut(&module) else {
                return Err(LoraError::UnknownModule(module));
            };
            let (in_features, out_features) = (linear.in_features(), linear.out_features());
            if a.dims() != [rank, in_features] || b.dims() != [out_features, rank] {
                return Err(LoraError::ShapeMismatch {
                    a: a.dims().to_vec(),
                    b: b.dims().to_vec(),
                    module,
                    in_features,
                    out_features,
                });
            }
            linear.set_lora(a.to_device(&device)?, b.to_device(&device)?, scale)?;
            attached += 1;
        }

        for (name, tensor) in self.replacements {
            if name == "model.embed_tokens.weight" {
                model.replace_embeddings(tensor)?;
            } else {
                model.replace_lm_head(tensor)?;
            }
        }

        tracing::debug!("Attached {attached} low rank projections");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::cache::LlamaCache;
    use crate::raw::logits_to_vec;
    use crate::raw::tests::{f32_quantization, tiny_model};
    use candle_core::{DType, Device};

    const ADAPTER_CONFIG: &str = r#"{
        "peft_type": "LORA",
        "task_type": "CAUSAL_LM",
        "base_model_name_or_path": "meta-llama/Llama-2-7b-chat-hf",
        "r": 4,
        "lora_alpha": 16,
        "lora_dropout": 0.1,
        "bias": "none",
        "fan_in_fan_out": false,
        "target_modules": ["q_proj", "v_proj"],
        "modules_to_save": null
    }"#;

    #[test]
    fn scales_follow_alpha_over_rank() {
        let config = LoraConfig::from_json(ADAPTER_CONFIG).unwrap();
        assert_eq!(config.scale("model.layers.0.self_attn.q_proj", 4), 4.);
        assert_eq!(config.base_model(), Some("meta-llama/Llama-2-7b-chat-hf"));
        assert_eq!(
            config.target_modules(),
            Some(&["q_proj".to_string(), "v_proj".to_string()][..])
        );
        assert!(config.modules_to_save().is_empty());

        let rslora = LoraConfig::from_json(
            r#"{"r": 16, "lora_alpha": 8, "use_rslora": true,
                "alpha_pattern": {"v_proj": 32, "layers.1.self_attn.v_proj": 64}}"#,
        )
        .unwrap();
        assert_eq!(rslora.scale("model.layers.0.self_attn.q_proj", 16), 2.);
        assert_eq!(rslora.scale("model.layers.0.self_attn.v_proj", 16), 8.);
        assert_eq!(rslora.scale("model.layers.1.self_attn.v_proj", 16), 16.);
    }

    #[test]
    fn unsupported_configs_are_rejected() {
        for json in [
            r#"{"r": 4, "lora_alpha": 8, "fan_in_fan_out": true}"#,
            r#"{"r": 4, "lora_alpha": 8, "bias": "all"}"#,
            r#"{"r": 4, "lora_alpha": 8, "use_dora": true}"#,
            r#"{"r": 4, "lora_alpha": 8, "peft_type": "IA3"}"#,
        ] {
            assert!(matches!(
                LoraConfig::from_json(json),
                Err(LoraError::Unsupported(_))
            ));
        }
    }

    #[test]
    fn peft_names_map_to_base_modules() {
        assert_eq!(
            module_key("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight").as_deref(),
            Some("model.layers.0.self_attn.q_proj.lora_A.weight")
        );
        assert_eq!(
            module_key("base_model.model.model.embed_tokens.modules_to_save.default.weight")
                .as_deref(),
            Some("model.embed_tokens.weight")
        );
        assert_eq!(
            module_key("base_model.model.lm_head.weight").as_deref(),
            Some("lm_head.weight")
        );
        assert_eq!(
            module_key("base_model.model.lm_head.original_module.weight"),
            None
        );
    }

    #[test]
    fn zero_b_matrices_leave_the_model_unchanged() {
        let device = Device::Cpu;
        let mut model = tiny_model(&f32_quantization());
        let mut cache = LlamaCache::new(&model.config, 64);
        let before = logits_to_vec(&model.forward(&[1, 4, 6], &mut cache).unwrap()).unwrap();

        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.1.self_attn.q_proj.lora_A.weight".to_string(),
            Tensor::ones((4, 32), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "base_model.model.model.layers.1.self_attn.q_proj.lora_B.weight".to_string(),
            Tensor::zeros((32, 4), DType::F32, &device).unwrap(),
        );
        let adapter =
            LoraAdapter::new(LoraConfig::from_json(ADAPTER_CONFIG).unwrap(), tensors).unwrap();
        adapter.apply(&mut model).unwrap();

        let mut cache = LlamaCache::new(&model.config, 64);
        let after = logits_to_vec(&model.forward(&[1, 4, 6], &mut cache).unwrap()).unwrap();
        for (a, b) in before.iter().zip(&after) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn nonzero_adapters_change_the_output() {
        let device = Device::Cpu;
        let mut model = tiny_model(&f32_quantization());
        let mut cache = LlamaCache::new(&model.config, 64);
        let before = logits_to_vec(&model.forward(&[1, 4, 6], &mut cache).unwrap()).unwrap();

        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.0.mlp.down_proj.lora_A.weight".to_string(),
            Tensor::ones((4, 64), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "base_model.model.model.layers.0.mlp.down_proj.lora_B.weight".to_string(),
            Tensor::ones((32, 4), DType::F32, &device).unwrap(),
        );
        let adapter =
            LoraAdapter::new(LoraConfig::from_json(ADAPTER_CONFIG).unwrap(), tensors).unwrap();
        adapter.apply(&mut model).unwrap();

        let mut cache = LlamaCache::new(&model.config, 64);
        let after = logits_to_vec(&model.forward(&[1, 4, 6], &mut cache).unwrap()).unwrap();
        assert!(before.iter().zip(&after).any(|(a, b)| (a - b).abs() > 1e-3));
    }

    #[test]
    fn pairs_for_missing_modules_are_rejected() {
        let device = Device::Cpu;
        let mut model = tiny_model(&f32_quantization());
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.9.self_attn.q_proj.lora_A.weight".to_string(),
            Tensor::ones((4, 32), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "base_model.model.model.layers.9.self_attn.q_proj.lora_B.weight".to_string(),
            Tensor::zeros((32, 4), DType::F32, &device).unwrap(),
        );
        let adapter =
            LoraAdapter::new(LoraConfig::from_json(ADAPTER_CONFIG).unwrap(), tensors).unwrap();
        assert!(matches!(
            adapter.apply(&mut model),
            Err(LoraError::UnknownModule(_))
        ));
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let device = Device::Cpu;
        let mut model = tiny_model(&f32_quantization());
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.0.self_attn.k_proj.lora_A.weight".to_string(),
            Tensor::ones((4, 32), DType::F32, &device).unwrap(),
        );
        // k_proj projects to 2 key/value heads of width 8
        tensors.insert(
            "base_model.model.model.layers.0.self_attn.k_proj.lora_B.weight".to_string(),
            Tensor::zeros((32, 4), DType::F32, &device).unwrap(),
        );
        let adapter =
            LoraAdapter::new(LoraConfig::from_json(ADAPTER_CONFIG).unwrap(), tensors).unwrap();
        assert!(matches!(
            adapter.apply(&mut model),
            Err(LoraError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn saved_embeddings_must_match_the_vocabulary() {
        let device = Device::Cpu;
        let mut model = tiny_model(&f32_quantization());
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.embed_tokens.modules_to_save.default.weight".to_string(),
            Tensor::zeros((17, 32), DType::F32, &device).unwrap(),
        );
        let adapter =
            LoraAdapter::new(LoraConfig::from_json(ADAPTER_CONFIG).unwrap(), tensors).unwrap();
        assert!(matches!(
            adapter.apply(&mut model),
            Err(LoraError::VocabularyMismatch {
                adapter: 17,
                model: 16,
                ..
            })
        ));
    }

    #[test]
    fn saved_embeddings_replace_the_base_table_after_a_resize() {
        let device = Device::Cpu;
        let mut model = tiny_model(&f32_quantization());
        model.resize_token_embeddings(17).unwrap();
        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.embed_tokens.weight".to_string(),
            Tensor::zeros((17, 32), DType::F32, &device).unwrap(),
        );
        tensors.insert(
            "base_model.model.lm_head.weight".to_string(),
            Tensor::ones((17, 32), DType::F32, &device).unwrap(),
        );
        let adapter =
            LoraAdapter::new(LoraConfig::from_json(ADAPTER_CONFIG).unwrap(), tensors).unwrap();
        adapter.apply(&mut model).unwrap();
        assert_eq!(
            model
                .embeddings()
                .sum_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap(),
            0.
        );
        assert_eq!(
            model.lm_head().sum_all().unwrap().to_scalar::<f32>().unwrap(),
            17. * 32.
        );
    }
}

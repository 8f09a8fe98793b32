use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{Embedding, RmsNorm};
use chat_common::MaskCache;

use crate::quantize::Quantizer;
use crate::LlamaConfig;
use attention_layer::{LlamaAttention, LlamaDecoderLayer, LlamaFeedForward};
pub(crate) use linear::{Linear, LoraLinear};
use rope::RopeCache;

mod attention_layer;
pub mod cache;
mod linear;
mod rope;

use cache::LlamaCache;

/// The tensors of a checkpoint, either memory mapped from safetensors files or already in memory.
pub(crate) enum Weights {
    Mmaped(MmapedSafetensors),
    InMemory(HashMap<String, Tensor>),
}

impl Weights {
    pub(crate) fn from_files(files: &[PathBuf]) -> Result<Self> {
        // SAFETY: the files are not modified while the model is loading.
        let tensors = unsafe { MmapedSafetensors::multi(files)? };
        Ok(Self::Mmaped(tensors))
    }

    fn get(&self, name: &str, device: &Device) -> Result<Tensor> {
        match self {
            Weights::Mmaped(tensors) => tensors.load(name, device),
            Weights::InMemory(tensors) => match tensors.get(name) {
                Some(tensor) => tensor.to_device(device),
                None => Err(candle_core::Error::CannotFindTensor {
                    path: name.to_string(),
                }),
            },
        }
    }

    fn contains(&self, name: &str) -> bool {
        match self {
            Weights::Mmaped(tensors) => tensors.get(name).is_ok(),
            Weights::InMemory(tensors) => tensors.contains_key(name),
        }
    }
}

/// The projections of a decoder layer a LoRA adapter can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Projection {
    Query,
    Key,
    Value,
    Output,
    Gate,
    Up,
    Down,
}

impl Projection {
    const ALL: [Projection; 7] = [
        Projection::Query,
        Projection::Key,
        Projection::Value,
        Projection::Output,
        Projection::Gate,
        Projection::Up,
        Projection::Down,
    ];

    /// The module path under `model.layers.{i}` in Hugging Face checkpoints.
    fn path(self) -> &'static str {
        match self {
            Projection::Query => "self_attn.q_proj",
            Projection::Key => "self_attn.k_proj",
            Projection::Value => "self_attn.v_proj",
            Projection::Output => "self_attn.o_proj",
            Projection::Gate => "mlp.gate_proj",
            Projection::Up => "mlp.up_proj",
            Projection::Down => "mlp.down_proj",
        }
    }
}

/// Split a module name like `model.layers.3.self_attn.q_proj` into its layer and projection.
pub(crate) fn parse_module_name(module: &str) -> Option<(usize, Projection)> {
    let rest = module.strip_prefix("model.layers.")?;
    let (layer, path) = rest.split_once('.')?;
    let layer = layer.parse().ok()?;
    let projection = Projection::ALL.into_iter().find(|p| p.path() == path)?;
    Some((layer, projection))
}

fn rms_norm(weights: &Weights, name: &str, eps: f64, device: &Device) -> Result<RmsNorm> {
    let weight = weights.get(name, device)?.to_dtype(DType::F32)?;
    Ok(RmsNorm::new(weight, eps))
}

fn lora_linear(
    weights: &Weights,
    name: &str,
    quantizer: &Quantizer,
    device: &Device,
) -> Result<LoraLinear> {
    let weight = weights.get(name, device)?;
    let (out_features, in_features) = weight.dims2()?;
    let base = quantizer.linear(name, weight)?;
    Ok(LoraLinear::new(base, in_features, out_features))
}

/// Fill rows `old_rows..new_rows` with the mean of the existing rows.
fn resize_rows(weight: &Tensor, new_rows: usize) -> Result<Tensor> {
    let (old_rows, _) = weight.dims2()?;
    if new_rows <= old_rows {
        return weight.narrow(0, 0, new_rows);
    }
    let mean = weight
        .to_dtype(DType::F32)?
        .mean_keepdim(0)?
        .to_dtype(weight.dtype())?;
    let (_, columns) = mean.dims2()?;
    let new = mean
        .broadcast_as((new_rows - old_rows, columns))?
        .contiguous()?;
    Tensor::cat(&[weight, &new], 0)
}

pub struct Model {
    pub(crate) config: LlamaConfig,
    dtype: DType,
    device: Device,
    embed_tokens: Embedding,
    layers: Vec<LlamaDecoderLayer>,
    norm: RmsNorm,
    lm_head: Tensor,
    tied: bool,
    rope: RopeCache,
    masks: MaskCache,
}

impl Model {
    pub(crate) fn load(
        config: LlamaConfig,
        weights: &Weights,
        quantizer: &Quantizer,
        device: &Device,
    ) -> Result<Self> {
        let embed_tokens = quantizer.dense(weights.get("model.embed_tokens.weight", device)?)?;
        let (vocab_size, hidden_size) = embed_tokens.dims2()?;
        if vocab_size != config.vocab_size || hidden_size != config.hidden_size {
            candle_core::bail!(
                "embedding table is {vocab_size}x{hidden_size} but the config expects {}x{}",
                config.vocab_size,
                config.hidden_size
            );
        }

        let tied = config.tie_word_embeddings || !weights.contains("lm_head.weight");
        let lm_head = if tied {
            tracing::debug!("Tying the output head to the input embeddings");
            embed_tokens.clone()
        } else {
            quantizer.dense(weights.get("lm_head.weight", device)?)?
        };

        let mut layers = Vec::with_capacity(config.n_layer);
        for layer_idx in 0..config.n_layer {
            let prefix = format!("model.layers.{layer_idx}");
            let linear = |projection: Projection| {
                lora_linear(
                    weights,
                    &format!("{prefix}.{}.weight", projection.path()),
                    quantizer,
                    device,
                )
            };
            let attention = LlamaAttention {
                q_proj: linear(Projection::Query)?,
                k_proj: linear(Projection::Key)?,
                v_proj: linear(Projection::Value)?,
                o_proj: linear(Projection::Output)?,
                n_head: config.n_head,
                n_kv_head: config.n_kv_head,
                head_dim: config.head_dim(),
            };
            let feed_forward = LlamaFeedForward {
                gate: linear(Projection::Gate)?,
                up: linear(Projection::Up)?,
                down: linear(Projection::Down)?,
            };
            layers.push(LlamaDecoderLayer {
                attention,
                feed_forward,
                input_norm: rms_norm(
                    weights,
                    &format!("{prefix}.input_layernorm.weight"),
                    config.rms_norm_eps,
                    device,
                )?,
                post_attention_norm: rms_norm(
                    weights,
                    &format!("{prefix}.post_attention_layernorm.weight"),
                    config.rms_norm_eps,
                    device,
                )?,
            });
        }

        let norm = rms_norm(weights, "model.norm.weight", config.rms_norm_eps, device)?;
        let rope = RopeCache::new(&config, device)?;

        Ok(Self {
            dtype: quantizer.dtype(),
            device: device.clone(),
            embed_tokens: Embedding::new(embed_tokens, hidden_size),
            layers,
            norm,
            lm_head,
            tied,
            rope,
            masks: MaskCache::default(),
            config,
        })
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    /// Run `tokens` through the model after everything already in `cache` and return the f32
    /// logits for the last position.
    pub fn forward(&self, tokens: &[u32], cache: &mut LlamaCache) -> Result<Tensor> {
        let seq_len = tokens.len();
        if seq_len == 0 {
            candle_core::bail!("cannot run the model on an empty sequence");
        }
        let index_pos = cache.tokens.len();
        cache.tokens.extend_from_slice(tokens);

        let x = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let mask = if seq_len > 1 {
            Some(self.masks.get_mask(seq_len, index_pos, &self.device)?)
        } else {
            None
        };

        let mut layer_in = self.embed_tokens.forward(&x)?.to_dtype(DType::F32)?;
        for (layer, block) in self.layers.iter().zip(cache.blocks.iter_mut()) {
            layer_in = layer.forward(&layer_in, mask.as_ref(), &self.rope, index_pos, block)?;
        }
        let x = self.norm.forward(&layer_in)?;
        let x = x.i((.., seq_len - 1, ..))?;
        let logits = x
            .to_dtype(self.dtype)?
            .matmul(&self.lm_head.t()?)?
            .to_dtype(DType::F32)?;
        logits.squeeze(0)
    }

    /// Resize the embedding table and output head to `vocab_size` rows.
    pub(crate) fn resize_token_embeddings(&mut self, vocab_size: usize) -> Result<()> {
        let old_size = self.config.vocab_size;
        if vocab_size == old_size {
            return Ok(());
        }
        let hidden_size = self.config.hidden_size;
        let embeddings = resize_rows(self.embed_tokens.embeddings(), vocab_size)?;
        self.lm_head = if self.tied {
            embeddings.clone()
        } else {
            resize_rows(&self.lm_head, vocab_size)?
        };
        self.embed_tokens = Embedding::new(embeddings, hidden_size);
        self.config.vocab_size = vocab_size;
        tracing::debug!("Resized token embeddings from {old_size} to {vocab_size}");
        Ok(())
    }

    /// The projection at `module`, such as `model.layers.0.self_attn.q_proj`.
    pub(crate) fn projection_mut(&mut self, module: &str) -> Option<&mut LoraLinear> {
        let (layer, projection) = parse_module_name(module)?;
        let layer = self.layers.get_mut(layer)?;
        Some(match projection {
            Projection::Query => &mut layer.attention.q_proj,
            Projection::Key => &mut layer.attention.k_proj,
            Projection::Value => &mut layer.attention.v_proj,
            Projection::Output => &mut layer.attention.o_proj,
            Projection::Gate => &mut layer.feed_forward.gate,
            Projection::Up => &mut layer.feed_forward.up,
            Projection::Down => &mut layer.feed_forward.down,
        })
    }

    /// Replace the embedding table. A tied output head follows the new table.
    pub(crate) fn replace_embeddings(&mut self, weight: Tensor) -> Result<()> {
        let weight = weight.to_device(&self.device)?.to_dtype(self.dtype)?;
        if self.tied {
            self.lm_head = weight.clone();
        }
        self.embed_tokens = Embedding::new(weight, self.config.hidden_size);
        Ok(())
    }

    /// Replace the output head. This unties it from the embedding table.
    pub(crate) fn replace_lm_head(&mut self, weight: Tensor) -> Result<()> {
        self.lm_head = weight.to_device(&self.device)?.to_dtype(self.dtype)?;
        self.tied = false;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn embeddings(&self) -> &Tensor {
        self.embed_tokens.embeddings()
    }

    #[cfg(test)]
    pub(crate) fn lm_head(&self) -> &Tensor {
        &self.lm_head
    }
}

/// Keep only the last dimension of a `(.., vocab)` logits tensor as a vector.
pub(crate) fn logits_to_vec(logits: &Tensor) -> Result<Vec<f32>> {
    logits.flatten_to(D::Minus1)?.to_vec1()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chat_language_model::{ComputeDType, QuantType, QuantizationConfig};

    pub(crate) const TINY_CONFIG: &str = r#"{
        "hidden_size": 32,
        "intermediate_size": 64,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "num_hidden_layers": 2,
        "max_position_embeddings": 64,
        "vocab_size": 16,
        "eos_token_id": 2
    }"#;

    fn random(shape: (usize, usize), device: &Device) -> Tensor {
        Tensor::randn(0f32, 0.2, shape, device).unwrap()
    }

    /// Random weights for [`TINY_CONFIG`] with Hugging Face tensor names.
    pub(crate) fn tiny_weights(device: &Device) -> HashMap<String, Tensor> {
        let config = LlamaConfig::from_json(TINY_CONFIG).unwrap();
        let hidden = config.hidden_size;
        let kv = config.n_kv_head * config.head_dim();
        let intermediate = config.intermediate_size;
        let mut weights = HashMap::new();
        weights.insert(
            "model.embed_tokens.weight".to_string(),
            random((config.vocab_size, hidden), device),
        );
        weights.insert(
            "lm_head.weight".to_string(),
            random((config.vocab_size, hidden), device),
        );
        weights.insert(
            "model.norm.weight".to_string(),
            Tensor::ones(hidden, DType::F32, device).unwrap(),
        );
        for layer in 0..config.n_layer {
            let prefix = format!("model.layers.{layer}");
            let mut insert = |name: &str, tensor: Tensor| {
                weights.insert(format!("{prefix}.{name}.weight"), tensor);
            };
            insert("self_attn.q_proj", random((hidden, hidden), device));
            insert("self_attn.k_proj", random((kv, hidden), device));
            insert("self_attn.v_proj", random((kv, hidden), device));
            insert("self_attn.o_proj", random((hidden, hidden), device));
            insert("mlp.gate_proj", random((intermediate, hidden), device));
            insert("mlp.up_proj", random((intermediate, hidden), device));
            insert("mlp.down_proj", random((hidden, intermediate), device));
            insert(
                "input_layernorm",
                Tensor::ones(hidden, DType::F32, device).unwrap(),
            );
            insert(
                "post_attention_layernorm",
                Tensor::ones(hidden, DType::F32, device).unwrap(),
            );
        }
        weights
    }

    pub(crate) fn tiny_model(quantization: &QuantizationConfig) -> Model {
        let device = Device::Cpu;
        let config = LlamaConfig::from_json(TINY_CONFIG).unwrap();
        let quantizer = Quantizer::new(quantization, &device).unwrap();
        let weights = Weights::InMemory(tiny_weights(&device));
        Model::load(config, &weights, &quantizer, &device).unwrap()
    }

    pub(crate) fn f32_quantization() -> QuantizationConfig {
        QuantizationConfig::default()
            .with_load_in_4bit(false)
            .with_compute_dtype(ComputeDType::F32)
    }

    #[test]
    fn module_names_resolve_to_projections() {
        assert_eq!(
            parse_module_name("model.layers.12.self_attn.v_proj"),
            Some((12, Projection::Value))
        );
        assert_eq!(
            parse_module_name("model.layers.0.mlp.down_proj"),
            Some((0, Projection::Down))
        );
        assert_eq!(parse_module_name("model.layers.0.mlp.act_fn"), None);
        assert_eq!(parse_module_name("lm_head"), None);
    }

    #[test]
    fn incremental_decoding_matches_a_full_forward_pass() {
        let model = tiny_model(&f32_quantization());
        let tokens = [1, 5, 9, 3, 7];

        let mut cache = LlamaCache::new(&model.config, 64);
        let full = logits_to_vec(&model.forward(&tokens, &mut cache).unwrap()).unwrap();

        let mut cache = LlamaCache::new(&model.config, 64);
        model.forward(&tokens[..3], &mut cache).unwrap();
        model.forward(&tokens[3..4], &mut cache).unwrap();
        let incremental = logits_to_vec(&model.forward(&tokens[4..], &mut cache).unwrap()).unwrap();

        assert_eq!(full.len(), 16);
        assert_eq!(cache.tokens(), &tokens);
        for (a, b) in full.iter().zip(&incremental) {
            assert!((a - b).abs() < 1e-4, "{a} != {b}");
        }
    }

    #[test]
    fn quantized_models_produce_finite_logits() {
        let quantization = QuantizationConfig::default()
            .with_quant_type(QuantType::Q4_0)
            .with_compute_dtype(ComputeDType::F32);
        let model = tiny_model(&quantization);
        assert!(matches!(
            model.layers[0].attention.q_proj.base(),
            Linear::Quantized(_)
        ));
        let mut cache = LlamaCache::new(&model.config, 64);
        let logits = logits_to_vec(&model.forward(&[1, 2, 3], &mut cache).unwrap()).unwrap();
        assert_eq!(logits.len(), 16);
        assert!(logits.iter().all(|logit| logit.is_finite()));
    }

    #[test]
    fn growing_the_vocabulary_fills_new_rows_with_the_mean() {
        let mut model = tiny_model(&f32_quantization());
        let old = model.embeddings().to_vec2::<f32>().unwrap();
        model.resize_token_embeddings(18).unwrap();

        let new = model.embeddings().to_vec2::<f32>().unwrap();
        assert_eq!(new.len(), 18);
        assert_eq!(&new[..16], &old[..]);
        for column in 0..32 {
            let mean = old.iter().map(|row| row[column]).sum::<f32>() / 16.;
            assert!((new[16][column] - mean).abs() < 1e-5);
            assert_eq!(new[16][column], new[17][column]);
        }
        assert_eq!(model.lm_head().dims(), &[18, 32]);
        assert_eq!(model.config.vocab_size(), 18);

        let mut cache = LlamaCache::new(&model.config, 64);
        let logits = logits_to_vec(&model.forward(&[17], &mut cache).unwrap()).unwrap();
        assert_eq!(logits.len(), 18);
    }

    #[test]
    fn shrinking_the_vocabulary_keeps_the_leading_rows() {
        let mut model = tiny_model(&f32_quantization());
        let old = model.embeddings().to_vec2::<f32>().unwrap();
        model.resize_token_embeddings(10).unwrap();
        let new = model.embeddings().to_vec2::<f32>().unwrap();
        assert_eq!(&new[..], &old[..10]);
    }
}

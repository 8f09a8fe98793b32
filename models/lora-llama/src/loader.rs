use candle_core::Device;
use chat_common::{accelerated_device_if_available, Cache};
use chat_language_model::{ModelLoader, QuantizationConfig};
use tokenizers::Tokenizer;

use crate::quantize::Quantizer;
use crate::raw::{Model, Weights};
use crate::{LlamaModel, LlamaSource, LlamaSourceError, LlamaTokenizer, LoraAdapter, LoraConfig};

/// Loads Llama models, their tokenizers and LoRA adapters from Hugging Face or local directories.
#[derive(Debug, Clone)]
pub struct LlamaLoader {
    cache: Cache,
    device: Option<Device>,
}

impl Default for LlamaLoader {
    fn default() -> Self {
        Self {
            cache: Cache::default().with_progress(true),
            device: None,
        }
    }
}

impl LlamaLoader {
    /// Create a loader that uses the default Hugging Face cache and the fastest available device.
    ///
    /// Downloads show a progress bar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache files are downloaded to.
    pub fn with_cache(mut self, cache: Cache) -> Self {
        self.cache = cache;
        self
    }

    /// Set the device to load models on.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub(crate) fn get_device(&self) -> Result<Device, LlamaSourceError> {
        match self.device.clone() {
            Some(device) => Ok(device),
            None => Ok(accelerated_device_if_available()?),
        }
    }
}

impl ModelLoader for LlamaLoader {
    type Model = LlamaModel;
    type Tokenizer = LlamaTokenizer;
    type Error = LlamaSourceError;

    fn load_model(
        &self,
        model_id: &str,
        quantization: &QuantizationConfig,
    ) -> Result<Self::Model, Self::Error> {
        tracing::info!("Loading model {model_id}");
        let device = self.get_device()?;
        let source = LlamaSource::new(model_id);
        let config = source.config(&self.cache)?;
        let quantizer = Quantizer::new(quantization, &device)?;
        let files = source.weight_files(&self.cache)?;
        let weights = Weights::from_files(&files)?;
        let model = Model::load(config, &weights, &quantizer, &device)?;
        tracing::info!(
            "Loaded {model_id} on {device:?} with {} quantized projections",
            if quantization.load_in_4bit() {
                quantization.quant_type().to_string()
            } else {
                "no".to_string()
            }
        );
        Ok(LlamaModel::new(model))
    }

    fn load_tokenizer(&self, model_id: &str) -> Result<Self::Tokenizer, Self::Error> {
        tracing::info!("Loading tokenizer for {model_id}");
        let source = LlamaSource::new(model_id);
        let path = self.cache.get(&source.file("tokenizer.json"))?;
        let tokenizer = Tokenizer::from_file(path).map_err(LlamaSourceError::Tokenizer)?;
        let config = source.read_if_present(&self.cache, "tokenizer_config.json")?;
        if config.is_none() {
            tracing::debug!("{model_id} has no tokenizer config");
        }
        LlamaTokenizer::new(tokenizer, config.as_deref())
    }

    fn load_adapter(
        &self,
        model: Self::Model,
        adapter_id: &str,
    ) -> Result<Self::Model, Self::Error> {
        tracing::info!("Loading adapter {adapter_id}");
        let source = LlamaSource::new(adapter_id);
        let config = LoraConfig::from_json(
            &source.read_to_string(&self.cache, "adapter_config.json")?,
        )?;
        if let Some(base_model) = config.base_model() {
            tracing::debug!("Adapter {adapter_id} was trained on {base_model}");
        }
        let path = self
            .cache
            .get(&source.file("adapter_model.safetensors"))
            .map_err(|error| LlamaSourceError::MissingWeights {
                model_id: adapter_id.to_string(),
                error,
            })?;
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let adapter = LoraAdapter::new(config, tensors)?;
        Ok(model.with_adapter(adapter, adapter_id)?)
    }
}

use candle_core::quantized::{GgmlDType, QMatMul, QTensor};
use candle_core::{DType, Device, Tensor};
use chat_language_model::{ComputeDType, QuantType, QuantizationConfig};

use crate::raw::Linear;

/// An error that can occur when the quantization settings cannot be honored.
#[derive(Debug, thiserror::Error)]
pub enum QuantizationError {
    /// Quantizing the quantization scales is not supported by the 4-bit block formats.
    #[error("Double quantization is not supported")]
    DoubleQuantUnsupported,
    /// The device cannot compute in the requested precision.
    #[error("The {device:?} device does not support {dtype:?}")]
    UnsupportedComputeDType {
        /// The requested precision.
        dtype: ComputeDType,
        /// The device the model is loaded on.
        device: Device,
    },
    /// Quantizing a tensor failed.
    #[error("Failed to quantize weights: {0}")]
    Candle(#[from] candle_core::Error),
}

fn ggml_dtype(quant_type: QuantType) -> GgmlDType {
    match quant_type {
        QuantType::Q4_0 => GgmlDType::Q4_0,
        QuantType::Q4_1 => GgmlDType::Q4_1,
        QuantType::Q4K => GgmlDType::Q4K,
    }
}

/// Turns dense checkpoint weights into the representation the model runs with.
#[derive(Debug, Clone)]
pub(crate) struct Quantizer {
    quantized: Option<GgmlDType>,
    dtype: DType,
}

impl Quantizer {
    pub(crate) fn new(
        config: &QuantizationConfig,
        device: &Device,
    ) -> Result<Self, QuantizationError> {
        if config.double_quant() {
            return Err(QuantizationError::DoubleQuantUnsupported);
        }
        let dtype = match config.compute_dtype() {
            ComputeDType::F16 => DType::F16,
            ComputeDType::BF16 => {
                if !device.supports_bf16() {
                    return Err(QuantizationError::UnsupportedComputeDType {
                        dtype: ComputeDType::BF16,
                        device: device.clone(),
                    });
                }
                DType::BF16
            }
            ComputeDType::F32 => DType::F32,
        };
        let quantized = config
            .load_in_4bit()
            .then(|| ggml_dtype(config.quant_type()));
        Ok(Self { quantized, dtype })
    }

    /// The precision weights that stay dense are stored in.
    pub(crate) fn dtype(&self) -> DType {
        self.dtype
    }

    /// Convert a tensor that stays dense to the compute precision.
    pub(crate) fn dense(&self, tensor: Tensor) -> candle_core::Result<Tensor> {
        tensor.to_dtype(self.dtype)
    }

    /// Build a projection from an `(out_features, in_features)` weight.
    pub(crate) fn linear(&self, name: &str, weight: Tensor) -> candle_core::Result<Linear> {
        let (_, in_features) = weight.dims2()?;
        match self.quantized {
            Some(format) if in_features % format.block_size() == 0 => {
                let weight = weight.to_dtype(DType::F32)?;
                let weight = QTensor::quantize(&weight, format)?;
                Ok(Linear::Quantized(QMatMul::from_qtensor(weight)?))
            }
            Some(format) => {
                tracing::debug!(
                    "Keeping {name} dense: {in_features} input features are not a multiple of the {format:?} block size"
                );
                Ok(Linear::Dense(self.dense(weight)?))
            }
            None => Ok(Linear::Dense(self.dense(weight)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_quantization_is_rejected() {
        let config = QuantizationConfig::default().with_double_quant(true);
        assert!(matches!(
            Quantizer::new(&config, &Device::Cpu),
            Err(QuantizationError::DoubleQuantUnsupported)
        ));
    }

    #[test]
    fn projections_with_block_aligned_inputs_are_quantized() {
        let config = QuantizationConfig::default().with_quant_type(QuantType::Q4_0);
        let quantizer = Quantizer::new(&config, &Device::Cpu).unwrap();
        let aligned = Tensor::ones((4, 64), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            quantizer.linear("aligned", aligned).unwrap(),
            Linear::Quantized(_)
        ));
        let unaligned = Tensor::ones((4, 48), DType::F32, &Device::Cpu).unwrap();
        match quantizer.linear("unaligned", unaligned).unwrap() {
            Linear::Dense(weight) => assert_eq!(weight.dtype(), DType::F16),
            Linear::Quantized(_) => panic!("expected a dense projection"),
        }
    }

    #[test]
    fn unquantized_projections_use_the_compute_dtype() {
        let config = QuantizationConfig::default()
            .with_load_in_4bit(false)
            .with_compute_dtype(ComputeDType::F32);
        let quantizer = Quantizer::new(&config, &Device::Cpu).unwrap();
        let weight = Tensor::ones((4, 256), DType::F16, &Device::Cpu).unwrap();
        match quantizer.linear("weight", weight).unwrap() {
            Linear::Dense(weight) => assert_eq!(weight.dtype(), DType::F32),
            Linear::Quantized(_) => panic!("expected a dense projection"),
        }
    }
}

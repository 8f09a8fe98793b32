use candle_core::{DType, Device, Tensor};

use crate::LlamaConfig;

/// Precomputed rotary embedding tables for every position the model supports.
#[derive(Debug, Clone)]
pub(crate) struct RopeCache {
    sin: Tensor,
    cos: Tensor,
}

impl RopeCache {
    pub(crate) fn new(config: &LlamaConfig, device: &Device) -> candle_core::Result<Self> {
        let head_dim = config.head_dim();
        let inverse_frequency: Vec<_> = (0..head_dim)
            .step_by(2)
            .map(|i| 1f32 / config.rope_theta.powf(i as f32 / head_dim as f32))
            .collect();
        let inverse_frequency_len = inverse_frequency.len();
        let inverse_frequency =
            Tensor::from_vec(inverse_frequency, (1, inverse_frequency_len), device)?;
        let positions = Tensor::arange(0, config.context_length as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((config.context_length, 1))?;
        let frequency = positions.matmul(&inverse_frequency)?;
        Ok(Self {
            sin: frequency.sin()?,
            cos: frequency.cos()?,
        })
    }

    /// Rotate the `(batch, heads, seq_len, head_dim)` query and key starting at `start_pos`.
    pub(crate) fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        start_pos: usize,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let (_, _, seq_len, _) = q.dims4()?;
        let max_positions = self.cos.dim(0)?;
        if start_pos + seq_len > max_positions {
            candle_core::bail!(
                "position {} is past the {max_positions} positions the rotary embeddings cover",
                start_pos + seq_len
            );
        }
        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

use candle_core::*;
use std::collections::HashMap;
use std::sync::RwLock;

/// Distinct prompt lengths kept before the cache is emptied.
const MAX_CACHED_MASKS: usize = 8;

/// A cache of causal attention masks keyed by sequence length.
#[derive(Default, Debug)]
pub struct MaskCache {
    masks: RwLock<HashMap<usize, Tensor>>,
}

impl MaskCache {
    /// Get the causal mask for `seq_len` new tokens that follow `seqlen_offset` cached tokens.
    pub fn get_mask(
        &self,
        seq_len: usize,
        seqlen_offset: usize,
        device: &Device,
    ) -> Result<AttentionMask> {
        let cached = {
            let masks = self.masks.read().unwrap();
            masks.get(&seq_len).cloned()
        };
        let mask = match cached {
            Some(mask) => mask,
            None => {
                let mask: Vec<_> = (0..seq_len)
                    .flat_map(|i| (0..seq_len).map(move |j| u8::from(j > i)))
                    .collect();
                let mask = Tensor::from_slice(&mask, (seq_len, seq_len), device)?;
                let mut masks = self.masks.write().unwrap();
                // Every turn re-encodes a longer conversation, so old lengths are rarely reused.
                if masks.len() >= MAX_CACHED_MASKS {
                    masks.clear();
                }
                masks.insert(seq_len, mask.clone());
                mask
            }
        };

        let mask = if seqlen_offset > 0 {
            // Every new token may attend to all of the cached tokens.
            let mask0 = Tensor::zeros((seq_len, seqlen_offset), DType::U8, device)?;
            Tensor::cat(&[&mask0, &mask], D::Minus1)?
        } else {
            mask
        };

        Ok(AttentionMask {
            mask: mask.unsqueeze(0)?.unsqueeze(0)?,
        })
    }
}

/// A `(1, 1, new_tokens, all_tokens)` mask where `1` marks positions that may not be attended to.
#[derive(Clone, Debug)]
pub struct AttentionMask {
    mask: Tensor,
}

impl AttentionMask {
    /// The raw mask tensor.
    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    /// Set every masked attention weight to negative infinity.
    pub fn apply(&self, attn_weights: &Tensor) -> Result<Tensor> {
        let shape = attn_weights.shape();
        let attention_mask = self.mask.broadcast_as(shape)?;
        let on_true = Tensor::new(f32::NEG_INFINITY, attn_weights.device())?
            .to_dtype(attn_weights.dtype())?
            .broadcast_as(shape)?;
        attention_mask.where_cond(&on_true, attn_weights)
    }
}

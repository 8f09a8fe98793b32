use candle_core::{Module, Tensor};
use candle_nn::RmsNorm;
use chat_common::{AttentionMask, KvCache};

use super::linear::LoraLinear;
use super::rope::RopeCache;

pub(crate) struct LlamaFeedForward {
    pub(crate) gate: LoraLinear,
    pub(crate) up: LoraLinear,
    pub(crate) down: LoraLinear,
}

impl LlamaFeedForward {
    pub(crate) fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate.forward(x)?)?;
        let up = self.up.forward(x)?;
        self.down.forward(&(gate * up)?)
    }
}

pub(crate) struct LlamaAttention {
    pub(crate) q_proj: LoraLinear,
    pub(crate) k_proj: LoraLinear,
    pub(crate) v_proj: LoraLinear,
    pub(crate) o_proj: LoraLinear,
    pub(crate) n_head: usize,
    pub(crate) n_kv_head: usize,
    pub(crate) head_dim: usize,
}

impl LlamaAttention {
    pub(crate) fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&AttentionMask>,
        rope_cache: &RopeCache,
        start_pos: usize,
        cache: &mut KvCache,
    ) -> candle_core::Result<Tensor> {
        let (bsz, q_len, hidden_size) = hidden_states.dims3()?;
        let num_key_value_groups = self.n_head / self.n_kv_head;

        let query_states = self
            .q_proj
            .forward(hidden_states)?
            .reshape((bsz, q_len, self.n_head, self.head_dim))?
            .transpose(1, 2)?;
        let key_states = self
            .k_proj
            .forward(hidden_states)?
            .reshape((bsz, q_len, self.n_kv_head, self.head_dim))?
            .transpose(1, 2)?;
        let value_states = self
            .v_proj
            .forward(hidden_states)?
            .reshape((bsz, q_len, self.n_kv_head, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (query_states, key_states) =
            rope_cache.forward(&query_states, &key_states, start_pos)?;

        let (key_states, value_states) = cache.append(&key_states, &value_states)?;
        let key_states = repeat_kv(key_states, num_key_value_groups)?.contiguous()?;
        let value_states = repeat_kv(value_states, num_key_value_groups)?.contiguous()?;

        let scale = 1. / (self.head_dim as f64).sqrt();
        let mut attn_weights = (query_states.matmul(&key_states.t()?)? * scale)?;
        if let Some(attention_mask) = attention_mask {
            attn_weights = attention_mask.apply(&attn_weights)?;
        }
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&value_states)?;

        if attn_output.dims() != [bsz, self.n_head, q_len, self.head_dim] {
            candle_core::bail!(
                "`attn_output` should be of size {:?}, but is {:?}",
                [bsz, self.n_head, q_len, self.head_dim],
                attn_output.dims()
            );
        }

        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape((bsz, q_len, hidden_size))?;
        self.o_proj.forward(&attn_output)
    }
}

pub(crate) struct LlamaDecoderLayer {
    pub(crate) attention: LlamaAttention,
    pub(crate) feed_forward: LlamaFeedForward,
    pub(crate) input_norm: RmsNorm,
    pub(crate) post_attention_norm: RmsNorm,
}

impl LlamaDecoderLayer {
    pub(crate) fn forward(
        &self,
        x: &Tensor,
        attention_mask: Option<&AttentionMask>,
        rope_cache: &RopeCache,
        start_pos: usize,
        cache: &mut KvCache,
    ) -> candle_core::Result<Tensor> {
        let residual = x;
        let x = self.input_norm.forward(x)?;
        let x = self
            .attention
            .forward(&x, attention_mask, rope_cache, start_pos, cache)?;
        let x = (x + residual)?;

        let residual = &x;
        let y = self.post_attention_norm.forward(&x)?;
        let y = self.feed_forward.forward(&y)?;
        y + residual
    }
}

fn repeat_kv(x: Tensor, num_key_value_groups: usize) -> candle_core::Result<Tensor> {
    if num_key_value_groups == 1 {
        Ok(x)
    } else {
        let (b_sz, n_kv_head, seq_len, head_dim) = x.dims4()?;
        Tensor::cat(&vec![&x; num_key_value_groups], 2)?.reshape((
            b_sz,
            n_kv_head * num_key_value_groups,
            seq_len,
            head_dim,
        ))
    }
}

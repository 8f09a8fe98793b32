use chat_common::KvCache;

use crate::LlamaConfig;

/// The dimension along which the attention cache is concatenated with attention for new tokens.
const CONCAT_DIMENSION: usize = 2;

/// A cache for llama inference. This cache will speed up generation of sequential text significantly.
#[derive(Debug, Clone)]
pub struct LlamaCache {
    pub(crate) tokens: Vec<u32>,
    pub(crate) blocks: Vec<KvCache>,
}

impl LlamaCache {
    /// Create a new cache for a model that holds up to `max_seq_len` tokens.
    pub fn new(config: &LlamaConfig, max_seq_len: usize) -> Self {
        let max_seq_len = max_seq_len.min(config.context_length);
        let blocks = (0..config.n_layer)
            .map(|_| KvCache::new(CONCAT_DIMENSION, max_seq_len))
            .collect();
        Self {
            tokens: Vec::new(),
            blocks,
        }
    }

    /// The tokens the cache holds attention for.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Clear the cache.
    pub fn clear(&mut self) {
        self.tokens.clear();
        for block in &mut self.blocks {
            block.reset()
        }
    }
}

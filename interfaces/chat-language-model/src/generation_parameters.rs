use llm_samplers::configure::{SamplerChainBuilder, SamplerSlot};
use llm_samplers::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Parameters to use when generating text.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParameters {
    pub(crate) max_length: usize,
    pub(crate) do_sample: bool,
    pub(crate) top_p: f32,
    pub(crate) top_k: usize,
    pub(crate) temperature: f32,
    pub(crate) seed: Option<u64>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_length: 1024,
            do_sample: true,
            top_p: 0.95,
            top_k: 50,
            temperature: 1.0,
            seed: None,
        }
    }
}

impl GenerationParameters {
    /// Create a sampler chain from the generation parameters.
    ///
    /// With sampling enabled the chain applies temperature, then top-k, then top-p and finally draws
    /// from the remaining distribution. With sampling disabled it always picks the most likely token.
    pub fn sampler(&self) -> SamplerChain {
        let GenerationParameters {
            do_sample,
            top_p,
            top_k,
            temperature,
            ..
        } = self.clone();
        if !do_sample {
            return SamplerChainBuilder::from([
                (
                    "topk",
                    SamplerSlot::<usize, f32>::new_static(|| Box::new(SampleTopK::default().k(1))),
                ),
                (
                    "randdistrib",
                    SamplerSlot::new_static(|| Box::<SampleRandDistrib>::default()),
                ),
            ])
            .into_chain();
        }
        SamplerChainBuilder::from([
            (
                "temperature",
                SamplerSlot::new_static(move || {
                    Box::new(SampleTemperature::default().temperature(temperature))
                }),
            ),
            (
                "topk",
                SamplerSlot::new_static(move || Box::new(SampleTopK::default().k(top_k))),
            ),
            (
                "topp",
                SamplerSlot::new_static(move || Box::new(SampleTopP::default().p(top_p))),
            ),
            (
                "randdistrib",
                SamplerSlot::new_static(|| Box::<SampleRandDistrib>::default()),
            ),
        ])
        .into_chain()
    }

    /// Create the random number generator sampling draws from.
    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Set the maximum total length (prompt and generated tokens) of a sequence.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set whether to sample. When disabled, the most likely token is always picked.
    pub fn with_do_sample(mut self, do_sample: bool) -> Self {
        self.do_sample = do_sample;
        self
    }

    /// Set the nucleus (top-p) threshold.
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set the number of most likely tokens to keep (top-k).
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Set the temperature to use when generating text.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the seed for the sampler's random number generator.
    pub fn with_seed(mut self, seed: impl Into<Option<u64>>) -> Self {
        self.seed = seed.into();
        self
    }

    /// Get the maximum total length of a sequence.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Get whether sampling is enabled.
    pub fn do_sample(&self) -> bool {
        self.do_sample
    }

    /// Get the nucleus (top-p) threshold.
    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    /// Get the top-k restriction.
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Get the temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Get the seed, if one is set.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}

use llm_samplers::types::{HasSamplerResources, Logits, Sampler, SamplerError};

/// An error that can occur while picking the next token.
#[derive(Debug, thiserror::Error)]
pub enum SamplingError {
    /// The logits could not be turned into a distribution.
    #[error("Invalid logits: {0}")]
    InvalidLogits(String),
    /// The sampler chain failed.
    #[error("Sampler error: {0}")]
    Sampler(#[from] SamplerError),
    /// The sampler chain filtered out every token.
    #[error("No token sampled")]
    NoTokenSampled,
}

struct SamplerResources<'a, 'b, R: rand::Rng> {
    rng: &'a mut R,
    previous_tokens: &'b [u32],
}

impl<R> std::fmt::Debug for SamplerResources<'_, '_, R>
where
    R: rand::Rng,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerResources")
            .field("previous_tokens", &self.previous_tokens)
            .finish()
    }
}

impl<R> HasSamplerResources for SamplerResources<'_, '_, R>
where
    R: rand::Rng,
{
    fn with_rng_mut(
        &mut self,
        fun: &mut dyn FnMut(&mut dyn rand::RngCore),
    ) -> Result<(), SamplerError> {
        fun(self.rng);
        Ok(())
    }

    fn with_last_tokens(&self, fun: &mut dyn FnMut(&[u32])) -> Result<(), SamplerError> {
        fun(self.previous_tokens);
        Ok(())
    }
}

/// Pick the next token from the raw logits of the last position.
pub fn sample_token(
    sampler: &mut impl Sampler,
    rng: &mut impl rand::Rng,
    previous_tokens: &[u32],
    logits: Vec<f32>,
) -> Result<u32, SamplingError> {
    let mut logits = Logits::try_from_iter(logits)
        .map_err(|err| SamplingError::InvalidLogits(err.to_string()))?;
    logits
        .sample_token(
            &mut SamplerResources {
                previous_tokens,
                rng,
            },
            sampler,
        )?
        .ok_or_else(|| {
            tracing::trace!(
                "Sampler chain picked no token after {} previous tokens",
                previous_tokens.len()
            );
            SamplingError::NoTokenSampled
        })
}

use candle_core::quantized::QMatMul;
use candle_core::{DType, Module, Tensor};

/// A bias free projection, either 4-bit quantized or dense in the compute dtype.
#[derive(Debug, Clone)]
pub(crate) enum Linear {
    Quantized(QMatMul),
    Dense(Tensor),
}

impl Linear {
    /// Project f32 activations of shape `(.., in_features)`.
    pub(crate) fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Linear::Quantized(matmul) => matmul.forward(x),
            Linear::Dense(weight) => x
                .to_dtype(weight.dtype())?
                .broadcast_matmul(&weight.t()?)?
                .to_dtype(DType::F32),
        }
    }
}

/// A low rank update `scale * B * A` applied next to a frozen projection.
#[derive(Debug, Clone)]
pub(crate) struct LoraDelta {
    pub(crate) a: Tensor,
    pub(crate) b: Tensor,
    pub(crate) scale: f64,
}

impl LoraDelta {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let down = x.broadcast_matmul(&self.a.t()?)?;
        let up = down.broadcast_matmul(&self.b.t()?)?;
        up * self.scale
    }
}

/// A projection that can carry a LoRA adapter without merging it into the base weight.
#[derive(Debug, Clone)]
pub(crate) struct LoraLinear {
    base: Linear,
    in_features: usize,
    out_features: usize,
    lora: Option<LoraDelta>,
}

impl LoraLinear {
    pub(crate) fn new(base: Linear, in_features: usize, out_features: usize) -> Self {
        Self {
            base,
            in_features,
            out_features,
            lora: None,
        }
    }

    pub(crate) fn in_features(&self) -> usize {
        self.in_features
    }

    pub(crate) fn out_features(&self) -> usize {
        self.out_features
    }

    #[cfg(test)]
    pub(crate) fn base(&self) -> &Linear {
        &self.base
    }

    /// `a` must be `(rank, in_features)` and `b` must be `(out_features, rank)`. Both are kept in f32.
    pub(crate) fn set_lora(&mut self, a: Tensor, b: Tensor, scale: f64) -> candle_core::Result<()> {
        self.lora = Some(LoraDelta {
            a: a.to_dtype(DType::F32)?,
            b: b.to_dtype(DType::F32)?,
            scale,
        });
        Ok(())
    }

    pub(crate) fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let y = self.base.forward(x)?;
        match &self.lora {
            Some(lora) => y + lora.forward(x)?,
            None => Ok(y),
        }
    }
}

use std::fmt::Display;
use std::str::FromStr;

/// The 4-bit block format projection weights are stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuantType {
    /// 32 weights per block with a single scale.
    Q4_0,
    /// 32 weights per block with a scale and a minimum.
    Q4_1,
    /// 256 weights per super-block with per-sub-block scales and minimums.
    #[default]
    Q4K,
}

/// An error returned when parsing an unknown [`QuantType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown 4-bit quantization type `{0}` (expected q4_0, q4_1 or q4k)")]
pub struct UnknownQuantType(String);

impl FromStr for QuantType {
    type Err = UnknownQuantType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "q4_0" => Ok(Self::Q4_0),
            "q4_1" => Ok(Self::Q4_1),
            "q4k" | "q4_k" => Ok(Self::Q4K),
            _ => Err(UnknownQuantType(s.to_string())),
        }
    }
}

impl Display for QuantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Q4_0 => write!(f, "q4_0"),
            Self::Q4_1 => write!(f, "q4_1"),
            Self::Q4K => write!(f, "q4k"),
        }
    }
}

/// The precision of weights that are kept dense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeDType {
    /// IEEE half precision.
    #[default]
    F16,
    /// Brain floating point.
    BF16,
    /// Single precision.
    F32,
}

/// How model weights are quantized when they are loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizationConfig {
    load_in_4bit: bool,
    quant_type: QuantType,
    compute_dtype: ComputeDType,
    double_quant: bool,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            quant_type: QuantType::default(),
            compute_dtype: ComputeDType::default(),
            double_quant: false,
        }
    }
}

impl QuantizationConfig {
    /// Set whether projection weights are quantized to 4 bits.
    pub fn with_load_in_4bit(mut self, load_in_4bit: bool) -> Self {
        self.load_in_4bit = load_in_4bit;
        self
    }

    /// Set the 4-bit block format.
    pub fn with_quant_type(mut self, quant_type: QuantType) -> Self {
        self.quant_type = quant_type;
        self
    }

    /// Set the precision of weights that stay dense.
    pub fn with_compute_dtype(mut self, compute_dtype: ComputeDType) -> Self {
        self.compute_dtype = compute_dtype;
        self
    }

    /// Set whether the quantization scales are themselves quantized.
    pub fn with_double_quant(mut self, double_quant: bool) -> Self {
        self.double_quant = double_quant;
        self
    }

    /// Whether projection weights are quantized to 4 bits.
    pub fn load_in_4bit(&self) -> bool {
        self.load_in_4bit
    }

    /// The 4-bit block format.
    pub fn quant_type(&self) -> QuantType {
        self.quant_type
    }

    /// The precision of weights that stay dense.
    pub fn compute_dtype(&self) -> ComputeDType {
        self.compute_dtype
    }

    /// Whether the quantization scales are themselves quantized.
    pub fn double_quant(&self) -> bool {
        self.double_quant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_4bit_without_double_quantization() {
        let config = QuantizationConfig::default();
        assert!(config.load_in_4bit());
        assert_eq!(config.quant_type(), QuantType::Q4K);
        assert_eq!(config.compute_dtype(), ComputeDType::F16);
        assert!(!config.double_quant());
    }

    #[test]
    fn quant_types_parse_case_insensitively() {
        assert_eq!("Q4_0".parse::<QuantType>(), Ok(QuantType::Q4_0));
        assert_eq!("q4_k".parse::<QuantType>(), Ok(QuantType::Q4K));
        assert_eq!(QuantType::Q4_1.to_string().parse::<QuantType>(), Ok(QuantType::Q4_1));
        assert!("nf4".parse::<QuantType>().is_err());
    }
}

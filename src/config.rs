use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use tracing::debug;

use crate::{
    error::{Error, Result},
    metadata::Metadata,
};

/// Supported model families, named as in `general.architecture`
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum ModelFamily {
    Llama,
    Qwen2,
    Qwen3,
    Phi3,
}

impl ModelFamily {
    /// Prefix of this family's keys in the metadata map
    pub fn metadata_prefix(&self) -> String {
        self.to_string()
    }
}

/// Model dimensions and hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub family: ModelFamily,
    /// Embedding width
    pub dim: usize,
    /// Feed-forward width
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    /// Width of one attention head. Usually `dim / n_heads`, Qwen3 declares it separately.
    pub head_size: usize,
    pub vocab_size: usize,
    pub context_length: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
}

impl ModelConfig {
    /// Read the configuration out of the metadata map. A `context_length` cap, if given, limits the
    /// model's declared context.
    pub fn from_metadata(meta: &Metadata, context_length: Option<usize>) -> Result<Self> {
        let arch = meta.string("general.architecture")?;
        let family = arch
            .parse::<ModelFamily>()
            .map_err(|_| Error::config(format!("unsupported model family `{arch}`")))?;
        let p = family.metadata_prefix();

        let dim = meta.usize(&format!("{p}.embedding_length"))?;
        let n_heads = meta.usize(&format!("{p}.attention.head_count"))?;
        let n_kv_heads = meta
            .optional_usize(&format!("{p}.attention.head_count_kv"))?
            .unwrap_or(n_heads);
        let head_size = match meta.optional_usize(&format!("{p}.attention.key_length"))? {
            Some(h) => h,
            None if n_heads > 0 => dim / n_heads,
            None => 0,
        };
        let vocab_size = match meta.optional_usize(&format!("{p}.vocab_size"))? {
            Some(v) => v,
            None => meta
                .array_len("tokenizer.ggml.tokens")
                .ok_or_else(|| Error::format(format!("{p}.vocab_size"), "missing metadata entry"))?,
        };
        let model_context = meta.usize(&format!("{p}.context_length"))?;

        let config = Self {
            family,
            dim,
            hidden_dim: meta.usize(&format!("{p}.feed_forward_length"))?,
            n_layers: meta.usize(&format!("{p}.block_count"))?,
            n_heads,
            n_kv_heads,
            head_size,
            vocab_size,
            context_length: context_length.map_or(model_context, |c| c.min(model_context)),
            rms_norm_eps: meta
                .optional_f32(&format!("{p}.attention.layer_norm_rms_epsilon"))?
                .unwrap_or(1e-5),
            rope_theta: meta
                .optional_f32(&format!("{p}.rope.freq_base"))?
                .unwrap_or(10000.),
        };
        debug!(?config, "read model configuration");
        Ok(config)
    }

    /// Check that the dimensions describe a plannable model
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("head_size", self.head_size),
            ("vocab_size", self.vocab_size),
            ("context_length", self.context_length),
        ] {
            if v == 0 {
                return Err(Error::config(format!("{name} must be non-zero")));
            }
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(Error::config(format!(
                "{} attention heads cannot be grouped over {} key/value heads",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.dim % self.n_heads != 0 {
            return Err(Error::config(format!(
                "{} attention heads do not divide the embedding width {}",
                self.n_heads, self.dim
            )));
        }
        if self.head_size % 2 != 0 {
            return Err(Error::config(format!(
                "rotary embedding needs an even head size, got {}",
                self.head_size
            )));
        }
        if [self.rms_norm_eps, self.rope_theta]
            .iter()
            .any(|v| !v.is_finite() || *v <= 0.)
        {
            return Err(Error::config(
                "rms epsilon and rope base must be positive and finite",
            ));
        }
        Ok(())
    }

    /// Width of all query heads together
    pub fn q_dim(&self) -> usize {
        self.n_heads * self.head_size
    }

    /// Width of all key (or value) heads together
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_size
    }

    /// Query heads per key/value head
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataValue;

    fn phi3_metadata() -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("general.architecture", MetadataValue::String("phi3".into()));
        meta.insert("phi3.embedding_length", MetadataValue::U32(3072));
        meta.insert("phi3.feed_forward_length", MetadataValue::U32(8192));
        meta.insert("phi3.block_count", MetadataValue::U32(32));
        meta.insert("phi3.attention.head_count", MetadataValue::U32(32));
        meta.insert("phi3.context_length", MetadataValue::U32(4096));
        meta.insert(
            "tokenizer.ggml.tokens",
            MetadataValue::Array(vec![MetadataValue::String("a".into()); 32064]),
        );
        meta
    }

    #[test]
    fn test_from_metadata_defaults() {
        let config = ModelConfig::from_metadata(&phi3_metadata(), Some(512)).unwrap();
        assert_eq!(config.family, ModelFamily::Phi3);
        assert_eq!(config.n_kv_heads, 32);
        assert_eq!(config.head_size, 96);
        assert_eq!(config.vocab_size, 32064);
        assert_eq!(config.context_length, 512);
        assert_eq!(config.rms_norm_eps, 1e-5);
        assert_eq!(config.rope_theta, 10000.);
        assert_eq!(config.kv_dim(), 3072);
        config.validate().unwrap();
    }

    #[test]
    fn test_context_cap_never_grows() {
        let config = ModelConfig::from_metadata(&phi3_metadata(), Some(1 << 20)).unwrap();
        assert_eq!(config.context_length, 4096);
    }

    #[test]
    fn test_unknown_family() {
        let mut meta = phi3_metadata();
        meta.insert("general.architecture", MetadataValue::String("gpt2".into()));
        assert!(matches!(
            ModelConfig::from_metadata(&meta, None),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_non_integer_gqa_ratio() {
        let mut meta = phi3_metadata();
        meta.insert("phi3.attention.head_count", MetadataValue::U32(5));
        meta.insert("phi3.attention.head_count_kv", MetadataValue::U32(2));
        meta.insert("phi3.embedding_length", MetadataValue::U32(40));
        let config = ModelConfig::from_metadata(&meta, None).unwrap();
        assert_eq!(config.head_size, 8);
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_heads_must_divide_dim() {
        let mut config = ModelConfig::from_metadata(&phi3_metadata(), None).unwrap();
        config.n_heads = 7;
        config.n_kv_heads = 7;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}

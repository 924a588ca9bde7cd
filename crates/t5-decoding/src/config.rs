//! Run parameters for a sampling decode.
//!
//! A [`RunConfig`] is fixed for the lifetime of a decoder instance: the arena
//! is sized from it once and nothing re-reads it for resizing afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DecodingError, Result};

/// Numeric precision of the accelerator kernels.
///
/// Storage inside the arena is always `f32`; `F16` pads the vocabulary to a
/// multiple of 8 and rounds the logits through `half::f16` to mirror a
/// reduced-precision GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    F32,
    F16,
}

impl DataType {
    /// Multiple the padded vocabulary is rounded up to.
    pub fn vocab_alignment(self) -> usize {
        match self {
            DataType::F32 => 1,
            DataType::F16 => 8,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
        }
    }

    #[inline]
    pub fn quantize(self, x: f32) -> f32 {
        match self {
            DataType::F32 => x,
            DataType::F16 => half::f16::from_f32(x).to_f32(),
        }
    }
}

/// The token selection strategy derived from `candidate_num` / `probability_threshold`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingMode {
    TopK { candidate_num: usize },
    TopP { probability_threshold: f32 },
}

impl SamplingMode {
    pub fn name(&self) -> &'static str {
        match self {
            SamplingMode::TopK { .. } => "top_k",
            SamplingMode::TopP { .. } => "top_p",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub batch_size: usize,
    /// Upper bound on decode steps, and the self-attention cache capacity.
    pub max_seq_len: usize,
    pub head_num: usize,
    pub size_per_head: usize,
    pub decoder_layers: usize,
    pub vocab_size: usize,
    pub memory_hidden_units: usize,
    pub memory_max_seq_len: usize,
    pub start_id: u32,
    pub end_id: u32,
    #[serde(default)]
    pub min_length: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default)]
    pub candidate_num: usize,
    #[serde(default)]
    pub probability_threshold: f32,
    /// `None` seeds the random stream from OS entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub precision: DataType,
    #[serde(default = "default_para_size")]
    pub tensor_para_size: usize,
    #[serde(default)]
    pub tensor_para_rank: usize,
    #[serde(default = "default_para_size")]
    pub layer_para_size: usize,
    #[serde(default)]
    pub layer_para_rank: usize,
    /// Defaults to `ceil(decoder_layers / layer_para_size)`.
    #[serde(default)]
    pub layers_per_group: Option<usize>,
    #[serde(default = "default_num_bucket")]
    pub num_bucket: usize,
    #[serde(default = "default_max_distance")]
    pub max_distance: usize,
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
    #[serde(default = "default_layernorm_eps")]
    pub layernorm_eps: f32,
    /// Optional GEMM tuning table. A missing file only logs a warning.
    #[serde(default)]
    pub gemm_config_path: Option<PathBuf>,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_repeat_penalty() -> f32 {
    1.0
}

fn default_para_size() -> usize {
    1
}

fn default_num_bucket() -> usize {
    32
}

fn default_max_distance() -> usize {
    128
}

fn default_tie_word_embeddings() -> bool {
    true
}

fn default_layernorm_eps() -> f32 {
    1e-6
}

impl RunConfig {
    /// T5-small geometry with top-k sampling over 4 candidates.
    pub fn t5_small(batch_size: usize, max_seq_len: usize) -> Self {
        Self {
            batch_size,
            max_seq_len,
            head_num: 8,
            size_per_head: 64,
            decoder_layers: 6,
            vocab_size: 32128,
            memory_hidden_units: 512,
            memory_max_seq_len: 512,
            start_id: 0,
            end_id: 1,
            min_length: 0,
            temperature: default_temperature(),
            repeat_penalty: default_repeat_penalty(),
            candidate_num: 4,
            probability_threshold: 0.0,
            seed: None,
            precision: DataType::F32,
            tensor_para_size: 1,
            tensor_para_rank: 0,
            layer_para_size: 1,
            layer_para_rank: 0,
            layers_per_group: None,
            num_bucket: default_num_bucket(),
            max_distance: default_max_distance(),
            tie_word_embeddings: true,
            layernorm_eps: default_layernorm_eps(),
            gemm_config_path: None,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RunConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    #[inline]
    pub fn hidden_units(&self) -> usize {
        self.head_num * self.size_per_head
    }

    /// Vocabulary rounded up for the active precision.
    pub fn vocab_size_padded(&self) -> usize {
        let align = self.precision.vocab_alignment();
        self.vocab_size.div_ceil(align) * align
    }

    /// Scale applied to the logits GEMM (`hidden^-0.5` for tied embeddings).
    pub fn logits_scale(&self) -> f32 {
        if self.tie_word_embeddings {
            (self.hidden_units() as f32).powf(-0.5)
        } else {
            1.0
        }
    }

    pub fn sampling_mode(&self) -> Result<SamplingMode> {
        match (self.candidate_num, self.probability_threshold) {
            (k, p) if k != 0 && p == 0.0 => Ok(SamplingMode::TopK { candidate_num: k }),
            (0, p) if p != 0.0 => Ok(SamplingMode::TopP {
                probability_threshold: p,
            }),
            (k, p) => Err(DecodingError::AmbiguousSampling {
                candidate_num: k,
                probability_threshold: p,
            }),
        }
    }

    /// Checks every field; called by the decoder constructor.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("max_seq_len", self.max_seq_len),
            ("head_num", self.head_num),
            ("size_per_head", self.size_per_head),
            ("decoder_layers", self.decoder_layers),
            ("vocab_size", self.vocab_size),
            ("memory_hidden_units", self.memory_hidden_units),
            ("memory_max_seq_len", self.memory_max_seq_len),
            ("num_bucket", self.num_bucket),
            ("max_distance", self.max_distance),
            ("tensor_para_size", self.tensor_para_size),
            ("layer_para_size", self.layer_para_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(DecodingError::Config(format!("{name} must be greater than 0")));
        }

        for (name, id) in [("start_id", self.start_id), ("end_id", self.end_id)] {
            if id as usize >= self.vocab_size {
                return Err(DecodingError::Config(format!(
                    "{name}={id} is outside the vocabulary (vocab_size={})",
                    self.vocab_size
                )));
            }
        }

        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(DecodingError::Config(format!(
                "temperature must be a positive finite number, got {}",
                self.temperature
            )));
        }
        if !(self.repeat_penalty > 0.0) || !self.repeat_penalty.is_finite() {
            return Err(DecodingError::Config(format!(
                "repeat_penalty must be a positive finite number, got {}",
                self.repeat_penalty
            )));
        }
        if !(self.layernorm_eps >= 0.0) {
            return Err(DecodingError::Config(format!(
                "layernorm_eps must be non-negative, got {}",
                self.layernorm_eps
            )));
        }

        if self.max_distance <= self.num_bucket / 2 {
            return Err(DecodingError::Config(format!(
                "max_distance={} must exceed num_bucket / 2 ({})",
                self.max_distance,
                self.num_bucket / 2
            )));
        }

        match self.sampling_mode()? {
            SamplingMode::TopK { candidate_num } if candidate_num > self.vocab_size => {
                return Err(DecodingError::Config(format!(
                    "candidate_num={candidate_num} exceeds vocab_size={}",
                    self.vocab_size
                )));
            }
            SamplingMode::TopP {
                probability_threshold,
            } if !(probability_threshold > 0.0 && probability_threshold <= 1.0) => {
                return Err(DecodingError::Config(format!(
                    "probability_threshold must be in (0, 1], got {probability_threshold}"
                )));
            }
            _ => {}
        }

        if self.head_num % self.tensor_para_size != 0 {
            return Err(DecodingError::Config(format!(
                "head_num={} is not divisible by tensor_para_size={}",
                self.head_num, self.tensor_para_size
            )));
        }
        if self.tensor_para_rank >= self.tensor_para_size {
            return Err(DecodingError::Config(format!(
                "tensor_para_rank={} must be below tensor_para_size={}",
                self.tensor_para_rank, self.tensor_para_size
            )));
        }
        if self.layer_para_size > self.decoder_layers {
            return Err(DecodingError::Config(format!(
                "layer_para_size={} exceeds decoder_layers={}",
                self.layer_para_size, self.decoder_layers
            )));
        }
        if self.layer_para_rank >= self.layer_para_size {
            return Err(DecodingError::Config(format!(
                "layer_para_rank={} must be below layer_para_size={}",
                self.layer_para_rank, self.layer_para_size
            )));
        }
        if let Some(per_group) = self.layers_per_group {
            if per_group == 0 || per_group * self.layer_para_size < self.decoder_layers {
                return Err(DecodingError::Config(format!(
                    "layers_per_group={per_group} cannot cover {} layers over {} groups",
                    self.decoder_layers, self.layer_para_size
                )));
            }
        }

        Ok(())
    }
}

//! Error types for the decoding engine.

use thiserror::Error;

/// Errors raised while configuring or running a sampling decoder.
///
/// Every variant is terminal for the run that produced it: the engine never
/// retries, and it never returns partially decoded output alongside an error.
#[derive(Debug, Error)]
pub enum DecodingError {
    /// A configuration field is out of range or inconsistent with another.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Exactly one of top-k and top-p must be enabled.
    #[error(
        "Ambiguous sampling mode: candidate_num={candidate_num}, \
         probability_threshold={probability_threshold} (exactly one must be non-zero)"
    )]
    AmbiguousSampling {
        candidate_num: usize,
        probability_threshold: f32,
    },

    /// The GEMM tuning table is malformed or incompatible with the active precision.
    #[error("GEMM config error: {0}")]
    GemmConfig(String),

    /// The allocator refused the arena request.
    #[error("Failed to allocate {bytes} bytes for the decoding arena: {source}")]
    Allocation {
        bytes: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A sample op could not report its scratch size during the dry run.
    #[error("Sampler '{0}' did not report a workspace size")]
    SamplerWorkspace(&'static str),

    /// A view could not be carved out of the arena.
    #[error("Arena layout error: {0}")]
    Layout(String),

    /// A per-run input or output buffer has the wrong shape or content.
    #[error("Invalid decoding input: {0}")]
    Input(String),

    /// An opaque kernel (decoder layer, projection, sampler) failed.
    #[error("Kernel '{op}' failed at step {step}: {source}")]
    Kernel {
        op: &'static str,
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Eager debug-build check found a non-finite activation.
    #[error("Non-finite value in {stage} at step {step}")]
    NonFinite { stage: String, step: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for decoding operations.
pub type Result<T> = std::result::Result<T, DecodingError>;

impl DecodingError {
    pub(crate) fn kernel(op: &'static str, step: usize, source: anyhow::Error) -> Self {
        DecodingError::Kernel { op, step, source }
    }
}

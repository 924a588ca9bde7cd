//! Sampling decoder for T5-style encoder-decoder models.
//!
//! Drives the autoregressive decode loop of a T5 decoder on top of opaque
//! numeric kernels: decoder layers, the logits projection and the token
//! selection op are supplied by the caller through the traits in [`ops`].
//! Every buffer a run touches lives in one pre-planned [`arena::Arena`].

pub mod arena;
pub mod bias;
pub mod cache;
pub mod config;
pub mod decoding;
pub mod error;
pub mod gemm;
pub mod norm;
pub mod ops;
pub mod parallel;
pub mod sampling;

pub use arena::{
    Allocator, Arena, ArenaLayout, ArenaPlanner, BufferKind, DeviceBlock, HostAllocator,
};
pub use cache::{CacheGeometry, CacheViews, CrossCacheAccess, SelfCacheStep};
pub use config::{DataType, RunConfig, SamplingMode};
pub use decoding::{
    DecodeState, DecodeSummary, DecodingInputs, DecodingOutputs, ForcedPrefix, T5SamplingDecoder,
    TokenSource,
};
pub use error::{DecodingError, Result};
pub use gemm::{GemmAlgo, GemmAlgoTable, NdarrayProjection};
pub use ops::{
    DecoderLayerArgs, DecoderLayerOp, EncoderMemory, FinishedFlags, ProjectionArgs, ProjectionOp,
    SampleArgs, SampleOp,
};
pub use parallel::{LayerParallel, ParallelOwnership, TensorParallel};
pub use sampling::{RandomState, SamplingPipeline, TopKSampler, TopPSampler};

#[cfg(test)]
mod tests;

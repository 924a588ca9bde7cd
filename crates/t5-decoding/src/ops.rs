//! Capability interfaces for the numeric kernels the decode loop drives.
//!
//! The loop never looks inside a decoder layer, a GEMM or a selection kernel.
//! It hands each one views into the arena and relies on call order alone for
//! visibility: whatever an op wrote before returning is what the next op reads.

use std::ops::Range;

use anyhow::Result;

use crate::cache::{CrossCacheAccess, SelfCacheStep};
use crate::config::{DataType, RunConfig};
use crate::gemm::GemmAlgo;
use crate::parallel::TensorParallel;
use crate::sampling::RandomState;

/// Per-sequence completion flags stored as bytes in the arena.
///
/// Within a run a flag is only cleared again when a forced token replaces a
/// sampled end token.
pub struct FinishedFlags<'a> {
    flags: &'a mut [u8],
}

impl<'a> FinishedFlags<'a> {
    pub fn new(flags: &'a mut [u8]) -> Self {
        Self { flags }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    #[inline]
    pub fn is_finished(&self, index: usize) -> bool {
        self.flags[index] != 0
    }

    #[inline]
    pub fn mark(&mut self, index: usize) {
        self.flags[index] = 1;
    }

    /// Puts back the value a flag had before the step's selection.
    #[inline]
    pub(crate) fn restore(&mut self, index: usize, finished: bool) {
        self.flags[index] = finished as u8;
    }

    pub fn clear(&mut self) {
        self.flags.fill(0);
    }

    pub fn all(&self) -> bool {
        self.flags.iter().all(|&f| f != 0)
    }

    pub fn count(&self) -> usize {
        self.flags.iter().filter(|&&f| f != 0).count()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.flags
    }

    pub fn reborrow(&mut self) -> FinishedFlags<'_> {
        FinishedFlags {
            flags: &mut *self.flags,
        }
    }
}

/// Encoder output shared by every layer and step.
#[derive(Clone, Copy)]
pub struct EncoderMemory<'a> {
    /// `[batch][memory_max_seq_len][memory_hidden_units]`
    pub states: &'a [f32],
    /// Valid length per sequence.
    pub lengths: &'a [u32],
    pub max_len: usize,
    pub hidden_units: usize,
}

/// Everything one decoder layer invocation may touch.
pub struct DecoderLayerArgs<'a, W> {
    pub layer: usize,
    pub weights: &'a W,
    /// `[batch][hidden_units]`
    pub input: &'a [f32],
    /// `[batch][hidden_units]`
    pub output: &'a mut [f32],
    pub memory: EncoderMemory<'a>,
    pub self_cache: SelfCacheStep<'a>,
    pub cross_cache: CrossCacheAccess<'a>,
    pub step: usize,
    pub max_seq_len: usize,
    /// Finished sequences still get a layer pass.
    pub finished: &'a [u8],
    /// `[head][max_seq_len + 1][max_seq_len + 1]`
    pub relative_bias: &'a [f32],
    pub workspace: &'a mut [f32],
    pub tensor_parallel: TensorParallel,
    pub local_batch: Range<usize>,
}

/// One decoder block: self-attention, cross-attention and feed-forward.
pub trait DecoderLayerOp {
    type Weights;

    /// Scratch the layer needs, in `f32` elements, queried before allocation.
    fn workspace_size(&self, config: &RunConfig, tensor_parallel: &TensorParallel) -> usize;

    fn forward(&self, args: DecoderLayerArgs<'_, Self::Weights>) -> Result<()>;
}

/// Row-major `c = alpha * a (m x k) * b (k x n)`.
pub struct ProjectionArgs<'a> {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: f32,
    pub a: &'a [f32],
    pub b: &'a [f32],
    pub c: &'a mut [f32],
    /// Tuned algorithm for this shape, if the tuning table has one.
    pub algo: Option<GemmAlgo>,
    pub workspace: &'a mut [u8],
}

pub trait ProjectionOp {
    fn workspace_size(&self, _precision: DataType) -> usize {
        0
    }

    fn project(&self, args: ProjectionArgs<'_>) -> Result<()>;
}

/// Inputs of one selection call, after the pipeline has normalized the logits.
pub struct SampleArgs<'a> {
    pub step: usize,
    /// `[batch][vocab_size_padded]`, probabilities if `probabilities` is set.
    pub logits: &'a [f32],
    pub probabilities: bool,
    pub batch: usize,
    pub vocab_size: usize,
    pub vocab_size_padded: usize,
    /// Row of the output buffer for this step, one id per sequence.
    pub output_ids: &'a mut [u32],
    pub sequence_length: &'a mut [u32],
    /// Cumulative log-probabilities; only updated when present.
    pub scores: Option<&'a mut [f32]>,
    pub finished: FinishedFlags<'a>,
    pub end_id: u32,
    pub workspace: &'a mut [u8],
    pub rng: &'a mut RandomState,
}

/// Token selection kernel.
///
/// Implementations must draw exactly one uniform per unfinished sequence, in
/// batch order, and must not draw for finished sequences.
pub trait SampleOp {
    fn name(&self) -> &'static str;

    /// Dry run: bytes of scratch needed, or `None` if the size cannot be determined.
    fn workspace_size(&self, batch: usize, vocab_size_padded: usize) -> Option<usize>;

    /// Whether the op expects probabilities rather than raw logits.
    fn needs_probabilities(&self) -> bool;

    fn sample(&mut self, args: SampleArgs<'_>) -> Result<()>;
}

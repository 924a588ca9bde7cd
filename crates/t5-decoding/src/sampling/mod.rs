//! Per-step logits post-processing and token selection.

pub mod pipeline;
pub mod random;
pub mod topk;
pub mod topp;

pub use pipeline::{PipelineStep, SamplingPipeline, MASKED_LOGIT};
pub use random::RandomState;
pub use topk::TopKSampler;
pub use topp::TopPSampler;

use anyhow::{anyhow, ensure};

use crate::ops::SampleArgs;

/// Index of the first candidate whose cumulative weight reaches `target`.
///
/// Zero-weight candidates are never returned. If rounding keeps the sum below
/// `target`, the last candidate with positive weight wins.
pub(crate) fn pick_cumulative(
    weights: impl IntoIterator<Item = f32>,
    target: f32,
) -> Option<usize> {
    let mut cumulative = 0.0f32;
    let mut last_positive = None;
    for (i, w) in weights.into_iter().enumerate() {
        if !(w > 0.0) {
            continue;
        }
        last_positive = Some(i);
        cumulative += w;
        if cumulative >= target {
            return Some(i);
        }
    }
    last_positive
}

/// Splits a sampler workspace into a `u32` block followed by a 4-byte-element block.
pub(crate) fn split_workspace<T: bytemuck::Pod>(
    workspace: &mut [u8],
    ids: usize,
    values: usize,
) -> anyhow::Result<(&mut [u32], &mut [T])> {
    let ids_bytes = ids * 4;
    let values_bytes = values * std::mem::size_of::<T>();
    ensure!(
        workspace.len() >= ids_bytes + values_bytes,
        "sampler workspace has {} bytes, need {}",
        workspace.len(),
        ids_bytes + values_bytes
    );
    let (head, tail) = workspace.split_at_mut(ids_bytes);
    let ids = bytemuck::try_cast_slice_mut(head).map_err(|e| anyhow!("sampler id buffer: {e}"))?;
    let values = bytemuck::try_cast_slice_mut(&mut tail[..values_bytes])
        .map_err(|e| anyhow!("sampler value buffer: {e}"))?;
    Ok((ids, values))
}

/// Shape checks shared by the samplers.
pub(crate) fn check_sample_args(args: &SampleArgs<'_>) -> anyhow::Result<()> {
    ensure!(
        args.logits.len() >= args.batch * args.vocab_size_padded,
        "logits hold {} values, need {} x {}",
        args.logits.len(),
        args.batch,
        args.vocab_size_padded
    );
    ensure!(args.vocab_size <= args.vocab_size_padded, "vocab_size exceeds padded size");
    ensure!(
        args.output_ids.len() >= args.batch
            && args.sequence_length.len() >= args.batch
            && args.finished.len() >= args.batch,
        "per-sequence buffers are shorter than batch {}",
        args.batch
    );
    if let Some(scores) = args.scores.as_deref() {
        ensure!(scores.len() >= args.batch, "score buffer shorter than batch");
        ensure!(args.probabilities, "scores require normalized probabilities");
    }
    Ok(())
}

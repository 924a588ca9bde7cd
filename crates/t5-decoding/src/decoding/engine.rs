use std::sync::Arc;

use rayon::prelude::*;

use super::forced::{ForcedMerge, ForcedPrefix, ScoreCorrection};
use super::state::{DecodeState, TokenSource};
use crate::arena::{Allocator, Arena, ArenaPlanner};
use crate::bias::RelativeAttentionBias;
use crate::cache::{CacheViews, CrossCacheTracker};
use crate::config::{DataType, RunConfig};
use crate::error::{DecodingError, Result};
use crate::gemm::{GemmAlgoTable, NdarrayProjection};
use crate::norm::T5LayerNorm;
use crate::ops::{
    DecoderLayerArgs, DecoderLayerOp, EncoderMemory, ProjectionArgs, ProjectionOp, SampleOp,
};
use crate::parallel::ParallelOwnership;
use crate::sampling::{PipelineStep, SamplingPipeline};

/// Read-only tensors for one run.
pub struct DecodingInputs<'a, W> {
    /// `[batch][memory_max_seq_len][memory_hidden_units]`
    pub memory: &'a [f32],
    /// Valid encoder length per sequence.
    pub memory_lengths: &'a [u32],
    /// One entry per decoder layer.
    pub layer_weights: &'a [W],
    /// `[vocab_size][hidden_units]`
    pub embedding_table: &'a [f32],
    /// `[hidden_units][vocab_size]`
    pub output_kernel: &'a [f32],
    pub output_bias: Option<&'a [f32]>,
    pub final_norm_gamma: &'a [f32],
    pub final_norm_beta: Option<&'a [f32]>,
    /// `[num_bucket][head_num]`
    pub relative_bias_table: &'a [f32],
    /// `true` suppresses the vocabulary entry at every step.
    pub logits_mask: Option<&'a [bool]>,
    pub forced: Option<ForcedPrefix<'a>>,
}

/// Caller-owned result buffers.
pub struct DecodingOutputs<'a> {
    /// `[max_seq_len][batch]`, step-major.
    pub output_ids: &'a mut [u32],
    /// `[batch]`
    pub sequence_length: &'a mut [u32],
    /// `[batch]` cumulative log-probabilities, when requested.
    pub scores: Option<&'a mut [f32]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeSummary {
    pub steps_run: usize,
    pub early_stopped: bool,
    pub finished: usize,
}

/// Autoregressive sampling decoder over a single pre-planned arena.
///
/// All per-run memory is allocated once in [`T5SamplingDecoder::new`]; every
/// call to [`T5SamplingDecoder::forward`] reuses it.
pub struct T5SamplingDecoder<L: DecoderLayerOp, P: ProjectionOp = NdarrayProjection> {
    config: RunConfig,
    ownership: ParallelOwnership,
    layer_op: L,
    projection: P,
    pipeline: SamplingPipeline,
    gemm_table: GemmAlgoTable,
    arena: Arena,
    cross_tracker: CrossCacheTracker,
    state: DecodeState,
}

impl<L: DecoderLayerOp, P: ProjectionOp> T5SamplingDecoder<L, P> {
    pub fn new(
        config: RunConfig,
        allocator: Arc<dyn Allocator>,
        layer_op: L,
        projection: P,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline = SamplingPipeline::from_config(&config)?;
        Self::build(config, allocator, layer_op, projection, pipeline)
    }

    /// Same as [`T5SamplingDecoder::new`] with a custom selection kernel.
    pub fn with_sampler(
        config: RunConfig,
        allocator: Arc<dyn Allocator>,
        layer_op: L,
        projection: P,
        sampler: Box<dyn SampleOp + Send>,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline = SamplingPipeline::with_sampler(&config, sampler)?;
        Self::build(config, allocator, layer_op, projection, pipeline)
    }

    fn build(
        config: RunConfig,
        allocator: Arc<dyn Allocator>,
        layer_op: L,
        projection: P,
        pipeline: SamplingPipeline,
    ) -> Result<Self> {
        let ownership = ParallelOwnership::from_config(&config);

        let gemm_table = match &config.gemm_config_path {
            Some(path) => GemmAlgoTable::load(path, config.precision)?,
            None => GemmAlgoTable::empty(),
        };

        let layout = ArenaPlanner::new(&config, &ownership)
            .decoder_workspace(layer_op.workspace_size(&config, &ownership.tensor))
            .gemm_workspace(projection.workspace_size(config.precision))
            .sample_workspace(pipeline.sampler_name(), pipeline.workspace_size())
            .plan()?;
        let arena = Arena::allocate(layout, allocator)?;

        log::info!(
            "T5 sampling decoder ready: batch={}, max_seq_len={}, layers {:?} of {}, \
             {} sampling, {} tuned GEMM shapes",
            config.batch_size,
            config.max_seq_len,
            ownership.owned_layers(),
            config.decoder_layers,
            pipeline.mode().name(),
            gemm_table.len()
        );

        Ok(Self {
            cross_tracker: CrossCacheTracker::new(config.decoder_layers),
            config,
            ownership,
            layer_op,
            projection,
            pipeline,
            gemm_table,
            arena,
            state: DecodeState::NotStarted,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn ownership(&self) -> &ParallelOwnership {
        &self.ownership
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn pipeline(&self) -> &SamplingPipeline {
        &self.pipeline
    }

    /// Self and cross caches as left by the last run.
    pub fn caches(&mut self) -> Result<CacheViews<'_>> {
        Ok(self.arena.views()?.caches)
    }

    fn check_io(
        &self,
        inputs: &DecodingInputs<'_, L::Weights>,
        outputs: &DecodingOutputs<'_>,
    ) -> Result<()> {
        let cfg = &self.config;
        let (batch, hidden, vocab) = (cfg.batch_size, cfg.hidden_units(), cfg.vocab_size);

        let expect = |name: &str, got: usize, want: usize| {
            if got == want {
                Ok(())
            } else {
                Err(DecodingError::Input(format!("{name} has {got} values, expected {want}")))
            }
        };

        expect(
            "memory",
            inputs.memory.len(),
            batch * cfg.memory_max_seq_len * cfg.memory_hidden_units,
        )?;
        expect("memory_lengths", inputs.memory_lengths.len(), batch)?;
        let too_long = |&&l: &&u32| l as usize > cfg.memory_max_seq_len;
        if let Some(&len) = inputs.memory_lengths.iter().find(too_long) {
            return Err(DecodingError::Input(format!(
                "memory length {len} exceeds memory_max_seq_len={}",
                cfg.memory_max_seq_len
            )));
        }
        expect("layer_weights", inputs.layer_weights.len(), cfg.decoder_layers)?;
        expect("embedding_table", inputs.embedding_table.len(), vocab * hidden)?;
        expect("output_kernel", inputs.output_kernel.len(), hidden * vocab)?;
        if let Some(bias) = inputs.output_bias {
            expect("output_bias", bias.len(), vocab)?;
        }
        expect("final_norm_gamma", inputs.final_norm_gamma.len(), hidden)?;
        if let Some(mask) = inputs.logits_mask {
            expect("logits_mask", mask.len(), vocab)?;
        }
        if let Some(forced) = &inputs.forced {
            expect("forced prefix batch", forced.batch_size(), batch)?;
        }

        expect("output_ids", outputs.output_ids.len(), cfg.max_seq_len * batch)?;
        expect("sequence_length", outputs.sequence_length.len(), batch)?;
        if let Some(scores) = outputs.scores.as_deref() {
            expect("scores", scores.len(), batch)?;
        }
        Ok(())
    }

    /// Decodes up to `max_seq_len` tokens per sequence.
    ///
    /// Steps that never ran because every sequence finished early leave
    /// `end_id` in their output rows.
    pub fn forward(
        &mut self,
        inputs: &DecodingInputs<'_, L::Weights>,
        outputs: DecodingOutputs<'_>,
    ) -> Result<DecodeSummary> {
        self.check_io(inputs, &outputs)?;

        let Self {
            config: cfg,
            ownership,
            layer_op,
            projection,
            pipeline,
            gemm_table,
            arena,
            cross_tracker,
            state,
        } = self;
        let DecodingOutputs {
            output_ids,
            sequence_length,
            mut scores,
        } = outputs;

        let (batch, hidden) = (cfg.batch_size, cfg.hidden_units());
        let (vocab, vpad) = (cfg.vocab_size, cfg.vocab_size_padded());
        let max_seq_len = cfg.max_seq_len;
        let local_batch = ownership.local_batch_range();

        *state = DecodeState::NotStarted;
        cross_tracker.reset();
        pipeline.reset();

        let mut views = arena.views()?;

        views.finished.clear();
        views.word_ids.fill(cfg.start_id);
        sequence_length.fill(0);
        if let Some(scores) = scores.as_deref_mut() {
            scores.fill(0.0);
        }

        RelativeAttentionBias::new(
            inputs.relative_bias_table,
            cfg.num_bucket,
            cfg.head_num,
            cfg.max_distance,
        )?
        .compute_into(max_seq_len + 1, views.relative_bias)?;

        let padded = vpad != vocab;
        if padded {
            pad_columns(inputs.output_kernel, vocab, vpad, views.padded_kernel);
            if let Some(bias) = inputs.output_bias {
                views.padded_bias[..vocab].copy_from_slice(bias);
                views.padded_bias[vocab..].fill(0.0);
            }
        }
        let kernel: &[f32] = if padded { &*views.padded_kernel } else { inputs.output_kernel };
        let bias: Option<&[f32]> = match inputs.output_bias {
            Some(_) if padded => Some(&*views.padded_bias),
            other => other,
        };

        let final_norm = T5LayerNorm::new(
            inputs.final_norm_gamma,
            inputs.final_norm_beta,
            cfg.layernorm_eps,
        )?;
        let memory = EncoderMemory {
            states: inputs.memory,
            lengths: inputs.memory_lengths,
            max_len: cfg.memory_max_seq_len,
            hidden_units: cfg.memory_hidden_units,
        };
        let (min_forced, max_forced) = inputs
            .forced
            .as_ref()
            .map_or((0, 0), |f| (f.min_len(), f.max_len()));
        let projection_algo = gemm_table.lookup(batch, vpad, hidden);

        log::debug!(
            "Decoding batch of {} (max_seq_len={}, forced prefix {}..={})",
            batch,
            max_seq_len,
            min_forced,
            max_forced
        );

        let mut source = TokenSource::WordIds;
        let mut early_stopped = false;

        loop {
            let step = state.advance(max_seq_len)?;

            let ids: &[u32] = match source {
                TokenSource::WordIds => &*views.word_ids,
                TokenSource::OutputRow(row) => &output_ids[(row - 1) * batch..row * batch],
            };
            embed_tokens(inputs.embedding_table, ids, hidden, views.hidden.slot_mut(0))?;

            let mut out_id = 0;
            for layer in 0..cfg.decoder_layers {
                if !ownership.owns_layer(layer) {
                    continue;
                }
                let from_id = layer & 1;
                let populate = !cross_tracker.is_populated(layer);
                let (input, output) = views.hidden.layer_io(from_id);
                let (self_cache, cross_cache) = views.caches.layer_step(layer, step, populate)?;

                layer_op
                    .forward(DecoderLayerArgs {
                        layer,
                        weights: &inputs.layer_weights[layer],
                        input,
                        output,
                        memory,
                        self_cache,
                        cross_cache,
                        step,
                        max_seq_len,
                        finished: views.finished.as_bytes(),
                        relative_bias: &*views.relative_bias,
                        workspace: views.scratch.decoder_workspace(),
                        tensor_parallel: ownership.tensor,
                        local_batch: local_batch.clone(),
                    })
                    .map_err(|e| DecodingError::kernel("decoder_layer", step, e))?;

                if populate {
                    cross_tracker.mark_populated(layer);
                }
                out_id = 1 - from_id;

                if cfg!(debug_assertions) {
                    let stage = || format!("decoder layer {layer}");
                    check_finite(views.hidden.slot(out_id), stage, step)?;
                }
            }

            views.finished_before.copy_from_slice(views.finished.as_bytes());
            let sampled = step > min_forced;
            if sampled {
                final_norm.forward_rows(views.hidden.slot(out_id), views.scratch.normed_output())?;

                if let Some(scores) = scores.as_deref() {
                    views.score_snapshot.copy_from_slice(scores);
                }

                projection
                    .project(ProjectionArgs {
                        m: batch,
                        n: vpad,
                        k: hidden,
                        alpha: cfg.logits_scale(),
                        a: views.scratch.normed(),
                        b: kernel,
                        c: &mut *views.logits,
                        algo: projection_algo,
                        workspace: &mut *views.gemm_workspace,
                    })
                    .map_err(|e| DecodingError::kernel("projection", step, e))?;

                if cfg.precision == DataType::F16 {
                    let precision = cfg.precision;
                    views.logits.par_iter_mut().for_each(|v| *v = precision.quantize(*v));
                }
                if cfg!(debug_assertions) {
                    check_finite(&*views.logits, || "logits".to_string(), step)?;
                }

                let (history, rest) = output_ids.split_at_mut((step - 1) * batch);
                pipeline
                    .run(PipelineStep {
                        step,
                        logits: &mut *views.logits,
                        bias,
                        logits_mask: inputs.logits_mask,
                        history,
                        output_ids: &mut rest[..batch],
                        sequence_length: &mut *sequence_length,
                        scores: scores.as_deref_mut(),
                        finished: views.finished.reborrow(),
                        workspace: &mut *views.sample_workspace,
                    })
                    .map_err(|e| DecodingError::kernel("sample", step, e))?;
            }

            if let Some(forced) = inputs.forced.as_ref().filter(|_| step <= max_forced) {
                let output_row = &mut output_ids[(step - 1) * batch..step * batch];
                let correction = match scores.as_deref_mut() {
                    Some(scores) if sampled => Some(ScoreCorrection {
                        scores,
                        snapshot: &*views.score_snapshot,
                        probabilities: &*views.logits,
                        vocab_size_padded: vpad,
                    }),
                    _ => None,
                };
                forced.merge(ForcedMerge {
                    step,
                    sampled,
                    output_row,
                    word_ids: &mut *views.word_ids,
                    finished: views.finished.reborrow(),
                    finished_before: &*views.finished_before,
                    sequence_length: &mut *sequence_length,
                    scores: correction,
                    end_id: cfg.end_id,
                });
            }
            source = TokenSource::after_step(step, max_forced);

            if step > max_forced && views.finished.all() {
                output_ids[step * batch..].fill(cfg.end_id);
                early_stopped = step < max_seq_len;
                break;
            }
            if step == max_seq_len {
                break;
            }
        }

        state.finish(early_stopped);
        let steps_run = match *state {
            DecodeState::Done { steps, .. } => steps,
            _ => 0,
        };
        Ok(DecodeSummary {
            steps_run,
            early_stopped,
            finished: views.finished.count(),
        })
    }
}

/// Copies `[rows][vocab]` into `[rows][vpad]`, zeroing the extra columns.
fn pad_columns(src: &[f32], vocab: usize, vpad: usize, dst: &mut [f32]) {
    dst.par_chunks_mut(vpad)
        .zip(src.par_chunks(vocab))
        .for_each(|(out, row)| {
            out[..vocab].copy_from_slice(row);
            out[vocab..].fill(0.0);
        });
}

fn embed_tokens(table: &[f32], ids: &[u32], hidden: usize, out: &mut [f32]) -> Result<()> {
    let rows = table.len() / hidden;
    if let Some(&bad) = ids.iter().find(|&&id| id as usize >= rows) {
        return Err(DecodingError::Input(format!(
            "token id {bad} is outside the embedding table ({rows} rows)"
        )));
    }
    out.par_chunks_mut(hidden).zip(ids.par_iter()).for_each(|(row, &id)| {
        let id = id as usize;
        row.copy_from_slice(&table[id * hidden..(id + 1) * hidden]);
    });
    Ok(())
}

fn check_finite(values: &[f32], stage: impl FnOnce() -> String, step: usize) -> Result<()> {
    if values.par_iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(DecodingError::NonFinite { stage: stage(), step })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_columns() {
        let src = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut dst = [9.0f32; 8];
        pad_columns(&src, 3, 4, &mut dst);
        assert_eq!(dst, [1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]);
    }

    #[test]
    fn test_embed_tokens() {
        let table = [0.0, 0.5, 1.0, 1.5, 2.0, 2.5];
        let mut out = [0.0f32; 4];
        embed_tokens(&table, &[2, 0], 2, &mut out).unwrap();
        assert_eq!(out, [2.0, 2.5, 0.0, 0.5]);
        assert!(embed_tokens(&table, &[3, 0], 2, &mut out).is_err());
    }

    #[test]
    fn test_check_finite() {
        assert!(check_finite(&[1.0, -2.0], || "x".into(), 1).is_ok());
        let err = check_finite(&[1.0, f32::NAN], || "logits".into(), 3).unwrap_err();
        assert!(matches!(err, DecodingError::NonFinite { step: 3, .. }));
    }
}

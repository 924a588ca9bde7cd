//! Logits post-processing applied once per step before token selection.
//!
//! Stages run in a fixed order: masking, repetition penalty, temperature,
//! normalization, selection. Every stage except selection works row-parallel
//! over the batch.

use anyhow::{ensure, Result};
use rayon::prelude::*;

use super::{RandomState, TopKSampler, TopPSampler};
use crate::config::{RunConfig, SamplingMode};
use crate::ops::{FinishedFlags, SampleArgs, SampleOp};

/// Logit assigned to entries that must never be selected.
pub const MASKED_LOGIT: f32 = -1e20;

/// Buffers for one step of the pipeline.
pub struct PipelineStep<'a> {
    pub step: usize,
    /// `[batch][vocab_size_padded]`, rewritten in place.
    pub logits: &'a mut [f32],
    /// Output bias, at least `vocab_size` long.
    pub bias: Option<&'a [f32]>,
    /// `true` suppresses the vocabulary entry.
    pub logits_mask: Option<&'a [bool]>,
    /// Tokens emitted at steps `1..step`, `[step - 1][batch]`.
    pub history: &'a [u32],
    pub output_ids: &'a mut [u32],
    pub sequence_length: &'a mut [u32],
    pub scores: Option<&'a mut [f32]>,
    pub finished: FinishedFlags<'a>,
    pub workspace: &'a mut [u8],
}

pub struct SamplingPipeline {
    mode: SamplingMode,
    sampler: Box<dyn SampleOp + Send>,
    rng: RandomState,
    batch: usize,
    vocab_size: usize,
    vocab_size_padded: usize,
    end_id: u32,
    min_length: usize,
    temperature: f32,
    repeat_penalty: f32,
}

impl SamplingPipeline {
    /// Builds the pipeline with the built-in sampler for the configured mode.
    pub fn from_config(config: &RunConfig) -> crate::error::Result<Self> {
        let sampler: Box<dyn SampleOp + Send> = match config.sampling_mode()? {
            SamplingMode::TopK { candidate_num } => Box::new(TopKSampler::new(candidate_num)),
            SamplingMode::TopP {
                probability_threshold,
            } => Box::new(TopPSampler::new(probability_threshold)),
        };
        Self::with_sampler(config, sampler)
    }

    pub fn with_sampler(
        config: &RunConfig,
        sampler: Box<dyn SampleOp + Send>,
    ) -> crate::error::Result<Self> {
        let mode = config.sampling_mode()?;
        log::debug!("Sampling pipeline: {:?} via '{}'", mode, sampler.name());
        Ok(Self {
            mode,
            sampler,
            rng: RandomState::new(config.seed),
            batch: config.batch_size,
            vocab_size: config.vocab_size,
            vocab_size_padded: config.vocab_size_padded(),
            end_id: config.end_id,
            min_length: config.min_length,
            temperature: config.temperature,
            repeat_penalty: config.repeat_penalty,
        })
    }

    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    pub fn sampler_name(&self) -> &'static str {
        self.sampler.name()
    }

    /// Dry-run scratch query forwarded to the sampler.
    pub fn workspace_size(&self) -> Option<usize> {
        self.sampler.workspace_size(self.batch, self.vocab_size_padded)
    }

    /// Top-p and score reporting both need explicit probabilities.
    pub fn needs_softmax(&self, output_scores: bool) -> bool {
        output_scores
            || matches!(self.mode, SamplingMode::TopP { .. })
            || self.sampler.needs_probabilities()
    }

    pub fn random_state(&self) -> &RandomState {
        &self.rng
    }

    /// Restarts the random stream for a new run.
    pub fn reset(&mut self) {
        self.rng.reset();
    }

    pub fn run(&mut self, args: PipelineStep<'_>) -> Result<()> {
        let PipelineStep {
            step,
            logits,
            bias,
            logits_mask,
            history,
            output_ids,
            sequence_length,
            scores,
            finished,
            workspace,
        } = args;
        let (batch, vocab, vpad) = (self.batch, self.vocab_size, self.vocab_size_padded);
        ensure!(
            logits.len() == batch * vpad,
            "logits hold {} values, expected {}",
            logits.len(),
            batch * vpad
        );
        ensure!(history.len() % batch.max(1) == 0, "history is not a whole number of steps");
        if let Some(bias) = bias {
            ensure!(bias.len() >= vocab, "bias has {} values, vocab is {}", bias.len(), vocab);
        }
        if let Some(mask) = logits_mask {
            ensure!(
                mask.len() >= vocab,
                "logits mask has {} entries, vocab is {}",
                mask.len(),
                vocab
            );
        }

        let suppress_end = (self.min_length != 0 && step <= self.min_length).then_some(self.end_id);
        if logits_mask.is_some() || suppress_end.is_some() {
            apply_mask(logits, vpad, vocab, finished.as_bytes(), logits_mask, suppress_end);
        }

        if self.repeat_penalty != 1.0 && !history.is_empty() {
            apply_repetition_penalty(
                logits,
                vpad,
                vocab,
                finished.as_bytes(),
                history,
                self.repeat_penalty,
            );
        }

        if self.temperature != 1.0 {
            apply_temperature(logits, vpad, vocab, self.temperature);
        }

        let probabilities = self.needs_softmax(scores.is_some());
        normalize(logits, vpad, vocab, bias, finished.as_bytes(), self.end_id, probabilities);

        log::trace!(
            "Step {}: selecting with '{}' ({} of {} sequences finished)",
            step,
            self.sampler.name(),
            finished.count(),
            batch
        );

        self.sampler.sample(SampleArgs {
            step,
            logits,
            probabilities,
            batch,
            vocab_size: vocab,
            vocab_size_padded: vpad,
            output_ids,
            sequence_length,
            scores,
            finished,
            end_id: self.end_id,
            workspace,
            rng: &mut self.rng,
        })
    }
}

/// Forces masked entries (and optionally `end_id`) of unfinished rows to [`MASKED_LOGIT`].
pub(crate) fn apply_mask(
    logits: &mut [f32],
    vpad: usize,
    vocab: usize,
    finished: &[u8],
    mask: Option<&[bool]>,
    suppress_end: Option<u32>,
) {
    logits
        .par_chunks_mut(vpad)
        .zip(finished.par_iter())
        .filter(|(_, &done)| done == 0)
        .for_each(|(row, _)| {
            if let Some(mask) = mask {
                row[..vocab]
                    .iter_mut()
                    .zip(mask)
                    .filter(|(_, &masked)| masked)
                    .for_each(|(v, _)| *v = MASKED_LOGIT);
            }
            if let Some(end_id) = suppress_end {
                row[end_id as usize] = MASKED_LOGIT;
            }
        });
}

/// Penalizes every distinct token already emitted by an unfinished sequence.
pub(crate) fn apply_repetition_penalty(
    logits: &mut [f32],
    vpad: usize,
    vocab: usize,
    finished: &[u8],
    history: &[u32],
    penalty: f32,
) {
    let batch = finished.len();
    let steps = history.len() / batch.max(1);
    logits
        .par_chunks_mut(vpad)
        .zip(finished.par_iter())
        .enumerate()
        .filter(|(_, (_, &done))| done == 0)
        .for_each(|(b, (row, _))| {
            for t in 0..steps {
                let token = history[t * batch + b];
                let idx = token as usize;
                if idx >= vocab || (0..t).any(|s| history[s * batch + b] == token) {
                    continue;
                }
                let score = row[idx];
                row[idx] = if score < 0.0 { score * penalty } else { score / penalty };
            }
        });
}

pub(crate) fn apply_temperature(logits: &mut [f32], vpad: usize, vocab: usize, temperature: f32) {
    let inv = 1.0 / temperature;
    logits
        .par_chunks_mut(vpad)
        .for_each(|row| row[..vocab].iter_mut().for_each(|v| *v *= inv));
}

/// Adds the bias, masks the padding slots and optionally applies softmax.
///
/// Finished rows become a point mass on `end_id`.
pub(crate) fn normalize(
    logits: &mut [f32],
    vpad: usize,
    vocab: usize,
    bias: Option<&[f32]>,
    finished: &[u8],
    end_id: u32,
    softmax: bool,
) {
    logits
        .par_chunks_mut(vpad)
        .zip(finished.par_iter())
        .for_each(|(row, &done)| {
            if done != 0 {
                row.fill(if softmax { 0.0 } else { MASKED_LOGIT });
                row[end_id as usize] = if softmax { 1.0 } else { 0.0 };
                return;
            }

            let (real, padding) = row.split_at_mut(vocab);
            if let Some(bias) = bias {
                real.iter_mut().zip(bias).for_each(|(v, b)| *v += b);
            }
            padding.fill(if softmax { 0.0 } else { MASKED_LOGIT });

            if softmax {
                let max = real.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0f32;
                for v in real.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                let inv = 1.0 / sum;
                real.iter_mut().for_each(|v| *v *= inv);
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mask_skips_finished_rows() {
        let mut logits = vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0];
        let mask = [false, true, false];
        apply_mask(&mut logits, 3, 3, &[0, 1], Some(&mask[..]), Some(2));
        assert_eq!(&logits[..3], &[1.0, MASKED_LOGIT, MASKED_LOGIT]);
        assert_eq!(&logits[3..], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_repetition_penalty_counts_each_token_once() {
        // batch 1, history [3, 3, 0]
        let mut logits = vec![-2.0, 1.0, 1.0, 4.0];
        apply_repetition_penalty(&mut logits, 4, 4, &[0], &[3, 3, 0], 2.0);
        assert_eq!(logits, vec![-4.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_repetition_penalty_per_sequence() {
        // batch 2, history step 1: [1, 0]
        let mut logits = vec![2.0, 2.0, 2.0, 2.0];
        apply_repetition_penalty(&mut logits, 2, 2, &[0, 0], &[1, 0], 2.0);
        assert_eq!(logits, vec![2.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_temperature_leaves_padding() {
        let mut logits = vec![2.0, 4.0, 7.0];
        apply_temperature(&mut logits, 3, 2, 2.0);
        assert_eq!(logits, vec![1.0, 2.0, 7.0]);
    }

    #[test]
    fn test_normalize_softmax_with_bias_and_padding() {
        let mut logits = vec![0.0, 0.0, 0.0, 5.0];
        let bias = [0.0, 2f32.ln(), 0.0];
        normalize(&mut logits, 4, 3, Some(&bias[..]), &[0], 1, true);
        assert_abs_diff_eq!(logits[0], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(logits[1], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(logits[2], 0.25, epsilon = 1e-6);
        assert_eq!(logits[3], 0.0);
    }

    #[test]
    fn test_normalize_without_softmax_masks_padding() {
        let mut logits = vec![1.0, 2.0, 3.0, 9.0];
        normalize(&mut logits, 4, 3, None, &[0], 1, false);
        assert_eq!(logits, vec![1.0, 2.0, 3.0, MASKED_LOGIT]);
    }

    #[test]
    fn test_normalize_pins_finished_rows() {
        let mut logits = vec![1.0, 2.0, 3.0];
        normalize(&mut logits, 3, 3, None, &[1], 2, true);
        assert_eq!(logits, vec![0.0, 0.0, 1.0]);
    }

    fn config(candidate_num: usize, probability_threshold: f32) -> RunConfig {
        let mut config = RunConfig::t5_small(2, 4);
        config.vocab_size = 5;
        config.end_id = 4;
        config.candidate_num = candidate_num;
        config.probability_threshold = probability_threshold;
        config.seed = Some(1);
        config
    }

    #[test]
    fn test_min_length_blocks_end_token() {
        let mut config = config(1, 0.0);
        config.min_length = 2;
        let mut pipeline = SamplingPipeline::from_config(&config).unwrap();
        let mut workspace = vec![0u64; pipeline.workspace_size().unwrap().div_ceil(8)];

        for (step, expect_end) in [(2, false), (3, true)] {
            // End token has the highest logit in both rows.
            let mut logits = vec![0.0, 1.0, 0.0, 0.0, 9.0, 0.0, 0.0, 2.0, 0.0, 9.0];
            let mut output = [0u32; 2];
            let mut lengths = [0u32; 2];
            let mut finished = [0u8; 2];
            pipeline
                .run(PipelineStep {
                    step,
                    logits: &mut logits,
                    bias: None,
                    logits_mask: None,
                    history: &[],
                    output_ids: &mut output,
                    sequence_length: &mut lengths,
                    scores: None,
                    finished: FinishedFlags::new(&mut finished),
                    workspace: bytemuck::cast_slice_mut(&mut workspace),
                })
                .unwrap();
            if expect_end {
                assert_eq!(output, [4, 4]);
                assert_eq!(finished, [1, 1]);
            } else {
                assert_eq!(output, [1, 2]);
                assert_eq!(finished, [0, 0]);
            }
        }
    }

    #[test]
    fn test_scores_force_softmax_for_top_k() {
        let top_k = SamplingPipeline::from_config(&config(2, 0.0)).unwrap();
        assert!(!top_k.needs_softmax(false));
        assert!(top_k.needs_softmax(true));

        let top_p = SamplingPipeline::from_config(&config(0, 0.9)).unwrap();
        assert!(top_p.needs_softmax(false));
        assert_eq!(top_p.sampler_name(), "top_p");
    }
}

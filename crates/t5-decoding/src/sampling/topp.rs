use anyhow::{ensure, Result};

use super::{check_sample_args, pick_cumulative, split_workspace};
use crate::ops::{SampleArgs, SampleOp};

/// Nucleus sampling over softmax probabilities.
///
/// The workspace holds one id per padded vocabulary slot and sequence (sorted
/// in place by descending probability) followed by the segment offsets of
/// each sequence's block.
#[derive(Debug, Clone, Copy)]
pub struct TopPSampler {
    pub probability_threshold: f32,
}

impl TopPSampler {
    pub fn new(probability_threshold: f32) -> Self {
        Self {
            probability_threshold,
        }
    }

    fn offsets_len(batch: usize) -> usize {
        (batch + 1).div_ceil(4) * 4
    }
}

impl SampleOp for TopPSampler {
    fn name(&self) -> &'static str {
        "top_p"
    }

    fn workspace_size(&self, batch: usize, vocab_size_padded: usize) -> Option<usize> {
        if !(self.probability_threshold > 0.0) {
            return None;
        }
        Some((batch * vocab_size_padded + Self::offsets_len(batch)) * 4)
    }

    fn needs_probabilities(&self) -> bool {
        true
    }

    fn sample(&mut self, mut args: SampleArgs<'_>) -> Result<()> {
        check_sample_args(&args)?;
        ensure!(args.probabilities, "top-p sampling needs softmax probabilities");
        let (batch, vocab, vpad) = (args.batch, args.vocab_size, args.vocab_size_padded);
        let (sorted_ids, offsets) =
            split_workspace::<u32>(args.workspace, batch * vpad, Self::offsets_len(batch))?;

        for (b, offset) in offsets[..=batch].iter_mut().enumerate() {
            *offset = (b * vpad) as u32;
        }

        for b in 0..batch {
            if args.finished.is_finished(b) {
                args.output_ids[b] = args.end_id;
                continue;
            }

            let row = &args.logits[b * vpad..(b + 1) * vpad];
            let begin = offsets[b] as usize;
            // Padding slots are left out of the candidate set.
            let ids = &mut sorted_ids[begin..begin + vocab];
            for (i, id) in ids.iter_mut().enumerate() {
                *id = i as u32;
            }
            ids.sort_unstable_by(|&x, &y| {
                row[y as usize]
                    .total_cmp(&row[x as usize])
                    .then(x.cmp(&y))
            });

            let target = args.rng.uniform() * self.probability_threshold;
            let chosen = pick_cumulative(ids.iter().map(|&id| row[id as usize]), target);
            let Some(chosen) = chosen else {
                anyhow::bail!(
                    "no candidate with positive probability for sequence {} at step {}",
                    b,
                    args.step
                );
            };

            let id = ids[chosen];
            args.output_ids[b] = id;
            args.sequence_length[b] += 1;
            if let Some(scores) = args.scores.as_deref_mut() {
                scores[b] += row[id as usize].ln();
            }
            if id == args.end_id {
                args.finished.mark(b);
            }
        }
        Ok(())
    }
}

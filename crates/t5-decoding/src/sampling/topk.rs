use anyhow::{ensure, Result};

use super::{check_sample_args, pick_cumulative, split_workspace};
use crate::ops::{SampleArgs, SampleOp};

/// Samples among the `candidate_num` highest-scoring real vocabulary entries.
///
/// Accepts raw logits (weights are `exp(logit - max)`) or probabilities.
#[derive(Debug, Clone, Copy)]
pub struct TopKSampler {
    pub candidate_num: usize,
}

impl TopKSampler {
    pub fn new(candidate_num: usize) -> Self {
        Self { candidate_num }
    }
}

/// Keeps the `ids.len()` largest values of `row` in descending order.
///
/// Equal values keep the lower id first. Returns how many slots were filled.
pub(crate) fn select_top_k(row: &[f32], ids: &mut [u32], vals: &mut [f32]) -> usize {
    let k = ids.len().min(vals.len()).min(row.len());
    if k == 0 {
        return 0;
    }
    let mut filled = 0;
    for (id, &v) in row.iter().enumerate() {
        if filled == k && !(v > vals[k - 1]) {
            continue;
        }
        let mut pos = if filled < k { filled } else { k - 1 };
        while pos > 0 && vals[pos - 1] < v {
            vals[pos] = vals[pos - 1];
            ids[pos] = ids[pos - 1];
            pos -= 1;
        }
        vals[pos] = v;
        ids[pos] = id as u32;
        if filled < k {
            filled += 1;
        }
    }
    filled
}

impl SampleOp for TopKSampler {
    fn name(&self) -> &'static str {
        "top_k"
    }

    fn workspace_size(&self, batch: usize, _vocab_size_padded: usize) -> Option<usize> {
        if self.candidate_num == 0 {
            return None;
        }
        Some(batch * self.candidate_num * 8)
    }

    fn needs_probabilities(&self) -> bool {
        false
    }

    fn sample(&mut self, mut args: SampleArgs<'_>) -> Result<()> {
        check_sample_args(&args)?;
        let k = self.candidate_num;
        let (batch, vocab, vpad) = (args.batch, args.vocab_size, args.vocab_size_padded);
        let (all_ids, all_vals) = split_workspace::<f32>(args.workspace, batch * k, batch * k)?;

        for b in 0..batch {
            if args.finished.is_finished(b) {
                args.output_ids[b] = args.end_id;
                continue;
            }

            let row = &args.logits[b * vpad..b * vpad + vocab];
            let ids = &mut all_ids[b * k..(b + 1) * k];
            let vals = &mut all_vals[b * k..(b + 1) * k];
            let count = select_top_k(row, ids, vals);
            ensure!(count > 0, "no candidates for sequence {} at step {}", b, args.step);

            let max = vals[0];
            let probabilities = args.probabilities;
            let weight = |v: f32| if probabilities { v } else { (v - max).exp() };
            let total: f32 = vals[..count].iter().map(|&v| weight(v)).sum();
            let target = args.rng.uniform() * total;
            let weights = vals[..count].iter().map(|&v| weight(v));
            let chosen = pick_cumulative(weights, target).unwrap_or(0);

            let id = ids[chosen];
            args.output_ids[b] = id;
            args.sequence_length[b] += 1;
            if let Some(scores) = args.scores.as_deref_mut() {
                scores[b] += vals[chosen].ln();
            }
            if id == args.end_id {
                args.finished.mark(b);
            }
        }
        Ok(())
    }
}

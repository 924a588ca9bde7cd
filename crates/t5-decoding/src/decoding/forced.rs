use crate::error::{DecodingError, Result};
use crate::ops::FinishedFlags;

/// Caller-supplied token prefix that overrides sampling.
///
/// `tokens` is `[batch][max_len]`; sequence `b` is forced for steps
/// `1..=lengths[b]`.
#[derive(Debug, Clone, Copy)]
pub struct ForcedPrefix<'a> {
    tokens: &'a [u32],
    lengths: &'a [u32],
    stride: usize,
}

impl<'a> ForcedPrefix<'a> {
    pub fn new(tokens: &'a [u32], lengths: &'a [u32], vocab_size: usize) -> Result<Self> {
        let batch = lengths.len();
        if batch == 0 || tokens.len() % batch != 0 {
            return Err(DecodingError::Input(format!(
                "forced tokens ({}) are not a whole number of rows for batch {}",
                tokens.len(),
                batch
            )));
        }
        let stride = tokens.len() / batch;
        let too_long = lengths.iter().enumerate().find(|(_, &len)| len as usize > stride);
        if let Some((b, &len)) = too_long {
            return Err(DecodingError::Input(format!(
                "forced length {len} of sequence {b} exceeds the prefix width {stride}"
            )));
        }
        for (b, &len) in lengths.iter().enumerate() {
            let row = &tokens[b * stride..b * stride + len as usize];
            if let Some(&bad) = row.iter().find(|&&t| t as usize >= vocab_size) {
                return Err(DecodingError::Input(format!(
                    "forced token {bad} of sequence {b} is outside the vocabulary"
                )));
            }
        }
        Ok(Self {
            tokens,
            lengths,
            stride,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Steps at or below this bound are forced for every sequence.
    pub fn min_len(&self) -> usize {
        self.lengths.iter().copied().min().unwrap_or(0) as usize
    }

    pub fn max_len(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0) as usize
    }

    /// Forced token for sequence `b` at 1-based `step`, if any.
    #[inline]
    pub fn token(&self, b: usize, step: usize) -> Option<u32> {
        (step >= 1 && step <= self.lengths[b] as usize)
            .then(|| self.tokens[b * self.stride + step - 1])
    }

    /// Reconciles the step's output row with the prefix.
    pub(crate) fn merge(&self, mut merge: ForcedMerge<'_>) {
        let step = merge.step;
        for b in 0..merge.output_row.len() {
            let Some(token) = self.token(b, step) else {
                merge.word_ids[b] = merge.output_row[b];
                continue;
            };

            // A finished sequence keeps emitting end_id whatever its prefix says.
            if merge.finished_before[b] != 0 {
                merge.output_row[b] = merge.end_id;
                merge.word_ids[b] = merge.end_id;
                continue;
            }

            if merge.sampled {
                // Undo whatever the sampler decided for this sequence.
                merge.finished.restore(b, false);
                if let Some(scores) = merge.scores.as_mut() {
                    scores.replace(b, token);
                }
            } else {
                merge.sequence_length[b] += 1;
            }

            if token == merge.end_id {
                merge.finished.mark(b);
            }
            merge.output_row[b] = token;
            merge.word_ids[b] = token;
        }
    }
}

/// Replaces the sampler's score contribution with the forced token's log-probability.
pub(crate) struct ScoreCorrection<'a> {
    pub scores: &'a mut [f32],
    pub snapshot: &'a [f32],
    /// `[batch][vocab_size_padded]` softmax output of the step.
    pub probabilities: &'a [f32],
    pub vocab_size_padded: usize,
}

impl ScoreCorrection<'_> {
    fn replace(&mut self, b: usize, token: u32) {
        let p = self.probabilities[b * self.vocab_size_padded + token as usize];
        self.scores[b] = self.snapshot[b] + p.ln();
    }
}

pub(crate) struct ForcedMerge<'a> {
    pub step: usize,
    /// Whether the sampling pipeline ran this step.
    pub sampled: bool,
    pub output_row: &'a mut [u32],
    pub word_ids: &'a mut [u32],
    pub finished: FinishedFlags<'a>,
    pub finished_before: &'a [u8],
    pub sequence_length: &'a mut [u32],
    pub scores: Option<ScoreCorrection<'a>>,
    pub end_id: u32,
}

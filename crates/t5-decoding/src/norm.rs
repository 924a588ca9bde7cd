//! Final decoder layer norm (T5 style).

use rayon::prelude::*;

use crate::error::{DecodingError, Result};

/// Root-mean-square normalization without mean subtraction.
///
/// `y = x / sqrt(mean(x^2) + eps) * gamma (+ beta)`
pub struct T5LayerNorm<'a> {
    pub gamma: &'a [f32],
    pub beta: Option<&'a [f32]>,
    pub eps: f32,
}

impl<'a> T5LayerNorm<'a> {
    pub fn new(gamma: &'a [f32], beta: Option<&'a [f32]>, eps: f32) -> Result<Self> {
        if let Some(beta) = beta {
            if beta.len() != gamma.len() {
                return Err(DecodingError::Input(format!(
                    "layer norm beta has {} values, gamma has {}",
                    beta.len(),
                    gamma.len()
                )));
            }
        }
        Ok(Self { gamma, beta, eps })
    }

    pub fn hidden_size(&self) -> usize {
        self.gamma.len()
    }

    /// Normalizes each `hidden_size` row of `input` into `output`.
    pub fn forward_rows(&self, input: &[f32], output: &mut [f32]) -> Result<()> {
        let hidden = self.hidden_size();
        if hidden == 0 || input.len() != output.len() || input.len() % hidden != 0 {
            return Err(DecodingError::Layout(format!(
                "layer norm over {} inputs into {} outputs with hidden size {}",
                input.len(),
                output.len(),
                hidden
            )));
        }

        output
            .par_chunks_mut(hidden)
            .zip(input.par_chunks(hidden))
            .for_each(|(out_row, in_row)| {
                let mean_sq = in_row.iter().map(|x| x * x).sum::<f32>() / hidden as f32;
                let inv_rms = 1.0 / (mean_sq + self.eps).sqrt();
                for (i, (o, &x)) in out_row.iter_mut().zip(in_row).enumerate() {
                    *o = x * inv_rms * self.gamma[i];
                }
                if let Some(beta) = self.beta {
                    out_row.iter_mut().zip(beta).for_each(|(o, b)| *o += b);
                }
            });
        Ok(())
    }
}

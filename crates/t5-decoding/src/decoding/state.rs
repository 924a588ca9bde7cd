use crate::error::{DecodingError, Result};

/// Lifecycle of one decoding run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeState {
    #[default]
    NotStarted,
    Stepping {
        step: usize,
    },
    Done {
        steps: usize,
        early_stop: bool,
    },
}

impl DecodeState {
    pub fn current_step(&self) -> Option<usize> {
        match self {
            DecodeState::Stepping { step } => Some(*step),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, DecodeState::Done { .. })
    }

    /// `NotStarted -> Stepping(1)`, `Stepping(t) -> Stepping(t + 1)`.
    pub fn advance(&mut self, max_seq_len: usize) -> Result<usize> {
        let next = match *self {
            DecodeState::NotStarted => 1,
            DecodeState::Stepping { step } => step + 1,
            DecodeState::Done { .. } => {
                return Err(DecodingError::Input(
                    "decode run already finished; start a new run".to_string(),
                ))
            }
        };
        if next > max_seq_len {
            return Err(DecodingError::Input(format!(
                "step {next} exceeds max_seq_len={max_seq_len}"
            )));
        }
        *self = DecodeState::Stepping { step: next };
        Ok(next)
    }

    pub fn finish(&mut self, early_stop: bool) {
        let steps = self.current_step().unwrap_or(0);
        log::debug!(
            "Decoding done after {} steps{}",
            steps,
            if early_stop { " (all sequences finished)" } else { "" }
        );
        *self = DecodeState::Done { steps, early_stop };
    }
}

/// Where the next step's embedding lookup reads its token ids from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// The arena word-id buffer: the start token, or merged forced tokens.
    WordIds,
    /// The output row written at the given step.
    OutputRow(usize),
}

impl TokenSource {
    /// Source for the step after `step` has been merged.
    pub fn after_step(step: usize, max_forced_len: usize) -> Self {
        if step <= max_forced_len {
            TokenSource::WordIds
        } else {
            TokenSource::OutputRow(step)
        }
    }
}

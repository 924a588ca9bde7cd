//! The autoregressive decode loop and its per-run bookkeeping.

mod engine;
mod forced;
mod state;

pub use engine::{DecodeSummary, DecodingInputs, DecodingOutputs, T5SamplingDecoder};
pub use forced::ForcedPrefix;
pub use state::{DecodeState, TokenSource};

use std::sync::Arc;

use anyhow::Result;
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use t5_decoding::{
    CrossCacheAccess, DecoderLayerArgs, DecoderLayerOp, DecodingInputs, DecodingOutputs,
    ForcedPrefix, HostAllocator, NdarrayProjection, RunConfig, T5SamplingDecoder, TensorParallel,
};

/// Toy residual block: `y = x + tanh(x W)`. Caches the input as key and value.
struct ResidualMix {
    hidden: usize,
}

impl DecoderLayerOp for ResidualMix {
    type Weights = Array2<f32>;

    fn workspace_size(&self, _config: &RunConfig, tensor_parallel: &TensorParallel) -> usize {
        tensor_parallel.local_hidden_units
    }

    fn forward(&self, args: DecoderLayerArgs<'_, Array2<f32>>) -> Result<()> {
        let DecoderLayerArgs {
            weights,
            input,
            output,
            memory,
            self_cache,
            cross_cache,
            local_batch,
            ..
        } = args;
        let hidden = self.hidden;
        let width = self_cache.key_slot.len() / (input.len() / hidden);

        if let CrossCacheAccess::Populate { key, value } = cross_cache {
            let n = key.len().min(memory.states.len());
            key[..n].copy_from_slice(&memory.states[..n]);
            value[..n].copy_from_slice(&memory.states[..n]);
        }

        for b in local_batch {
            let x = &input[b * hidden..(b + 1) * hidden];
            let mixed = ArrayView1::from(x).dot(weights);
            let y = &mut output[b * hidden..(b + 1) * hidden];
            for ((y, &x), m) in y.iter_mut().zip(x).zip(mixed.iter()) {
                *y = x + m.tanh();
            }
            self_cache.key_slot[b * width..(b + 1) * width].copy_from_slice(&x[..width]);
            self_cache.value_slot[b * width..(b + 1) * width].copy_from_slice(&x[..width]);
        }
        Ok(())
    }
}

fn random(rng: &mut StdRng, len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-scale..scale)).collect()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = RunConfig::t5_small(2, 12);
    config.head_num = 4;
    config.size_per_head = 8;
    config.decoder_layers = 3;
    config.vocab_size = 50;
    config.memory_hidden_units = 32;
    config.memory_max_seq_len = 6;
    config.candidate_num = 0;
    config.probability_threshold = 0.8;
    config.temperature = 0.7;
    config.repeat_penalty = 1.2;
    config.seed = Some(2024);

    let hidden = config.hidden_units();
    let vocab = config.vocab_size;
    let batch = config.batch_size;
    let mut rng = StdRng::seed_from_u64(7);

    let layer_weights: Vec<Array2<f32>> = (0..config.decoder_layers)
        .map(|_| Array2::from_shape_vec((hidden, hidden), random(&mut rng, hidden * hidden, 0.3)))
        .collect::<std::result::Result<_, _>>()?;
    let memory_len = batch * config.memory_max_seq_len * config.memory_hidden_units;
    let memory = random(&mut rng, memory_len, 1.0);
    let memory_lengths = vec![config.memory_max_seq_len as u32, 4];
    let embedding_table = random(&mut rng, vocab * hidden, 1.0);
    let output_kernel = random(&mut rng, hidden * vocab, 1.0);
    let gamma = vec![1.0; hidden];
    let relative_bias_table = random(&mut rng, config.num_bucket * config.head_num, 0.5);

    // Force the first two tokens of the second sequence.
    let forced_tokens = [0, 0, 17, 23];
    let forced_lengths = [0, 2];

    let mut decoder = T5SamplingDecoder::new(
        config.clone(),
        Arc::new(HostAllocator),
        ResidualMix { hidden },
        NdarrayProjection,
    )?;

    let inputs = DecodingInputs {
        memory: &memory,
        memory_lengths: &memory_lengths,
        layer_weights: &layer_weights,
        embedding_table: &embedding_table,
        output_kernel: &output_kernel,
        output_bias: None,
        final_norm_gamma: &gamma,
        final_norm_beta: None,
        relative_bias_table: &relative_bias_table,
        logits_mask: None,
        forced: Some(ForcedPrefix::new(&forced_tokens, &forced_lengths, vocab)?),
    };

    let mut output_ids = vec![0u32; config.max_seq_len * batch];
    let mut sequence_length = vec![0u32; batch];
    let mut scores = vec![0.0f32; batch];
    let summary = decoder.forward(
        &inputs,
        DecodingOutputs {
            output_ids: &mut output_ids,
            sequence_length: &mut sequence_length,
            scores: Some(&mut scores[..]),
        },
    )?;

    log::info!("{:?}", summary);
    for b in 0..batch {
        let tokens: Vec<u32> = output_ids.iter().skip(b).step_by(batch).copied().collect();
        println!(
            "sequence {}: len={} score={:.3} ids={:?}",
            b, sequence_length[b], scores[b], tokens
        );
    }
    Ok(())
}

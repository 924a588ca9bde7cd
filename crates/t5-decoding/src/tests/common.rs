// Shared fixtures for the decoder scenarios.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, ensure, Result};

use crate::arena::{Allocator, DeviceBlock};
use crate::config::RunConfig;
use crate::decoding::{DecodingInputs, ForcedPrefix};
use crate::gemm::NdarrayProjection;
use crate::ops::{DecoderLayerArgs, DecoderLayerOp, ProjectionArgs, ProjectionOp};
use crate::parallel::TensorParallel;
use crate::CrossCacheAccess;

/// 2 layers, hidden 8 (2 x 4), vocab 8, top-1, untied output projection.
pub fn tiny_config(batch_size: usize, max_seq_len: usize) -> RunConfig {
    let mut config = RunConfig::t5_small(batch_size, max_seq_len);
    config.head_num = 2;
    config.size_per_head = 4;
    config.decoder_layers = 2;
    config.vocab_size = 8;
    config.memory_hidden_units = 8;
    config.memory_max_seq_len = 3;
    config.start_id = 0;
    config.end_id = 1;
    config.candidate_num = 1;
    config.num_bucket = 4;
    config.max_distance = 8;
    config.tie_word_embeddings = false;
    config.seed = Some(7);
    config
}

/// Value the mock writes into the self cache of `layer` at `step`.
pub fn self_cache_marker(layer: usize, step: usize) -> f32 {
    (layer * 1000 + step) as f32
}

pub fn cross_key(memory: &[f32], layer: usize, i: usize) -> f32 {
    memory[i % memory.len()] + layer as f32
}

pub fn cross_value(memory: &[f32], layer: usize, i: usize) -> f32 {
    -cross_key(memory, layer, i)
}

#[derive(Debug, Default)]
pub struct Trace {
    /// `(layer, step)` of every invocation, in order.
    pub calls: Vec<(usize, usize)>,
    /// Cross-cache populate count per layer.
    pub populates: Vec<usize>,
    /// First input element of every row seen by layer 0, per step.
    pub layer0_inputs: Vec<Vec<f32>>,
    pub local_batches: Vec<std::ops::Range<usize>>,
}

type Script = Box<dyn Fn(usize, usize) -> Option<u32>>;

/// Decoder layer whose output is a one-hot vector chosen by a script.
///
/// `script(step, b)` names the token that should win for sequence `b`; `None`
/// leaves the row at zero, which projects to uniform logits. The layer also
/// checks that the caches it is handed hold what earlier invocations wrote.
pub struct ScriptedLayer {
    hidden: usize,
    script: Script,
    trace: Rc<RefCell<Trace>>,
    fail_at_step: Cell<Option<usize>>,
    poison_at_step: Cell<Option<usize>>,
}

impl ScriptedLayer {
    pub fn new(config: &RunConfig, script: impl Fn(usize, usize) -> Option<u32> + 'static) -> Self {
        Self {
            hidden: config.hidden_units(),
            script: Box::new(script),
            trace: Rc::new(RefCell::new(Trace {
                populates: vec![0; config.decoder_layers],
                ..Trace::default()
            })),
            fail_at_step: Cell::new(None),
            poison_at_step: Cell::new(None),
        }
    }

    pub fn uniform(config: &RunConfig) -> Self {
        Self::new(config, |_, _| None)
    }

    pub fn trace(&self) -> Rc<RefCell<Trace>> {
        Rc::clone(&self.trace)
    }

    pub fn fail_at(self, step: usize) -> Self {
        self.fail_at_step.set(Some(step));
        self
    }

    pub fn poison_at(self, step: usize) -> Self {
        self.poison_at_step.set(Some(step));
        self
    }
}

impl DecoderLayerOp for ScriptedLayer {
    type Weights = usize;

    fn workspace_size(&self, _config: &RunConfig, tensor_parallel: &TensorParallel) -> usize {
        4 * tensor_parallel.local_hidden_units
    }

    fn forward(&self, args: DecoderLayerArgs<'_, usize>) -> Result<()> {
        let DecoderLayerArgs {
            layer,
            weights,
            input,
            output,
            memory,
            self_cache,
            cross_cache,
            step,
            workspace,
            local_batch,
            ..
        } = args;
        ensure!(*weights == layer, "layer {} got weights for {}", layer, weights);
        ensure!(!workspace.is_empty(), "no layer workspace");
        if self.fail_at_step.get() == Some(step) {
            bail!("injected failure");
        }

        let mut trace = self.trace.borrow_mut();
        trace.calls.push((layer, step));
        trace.local_batches.push(local_batch.clone());
        if layer == 0 {
            trace.layer0_inputs.push(input.chunks(self.hidden).map(|row| row[0]).collect());
        }

        // Earlier steps must still be intact.
        let row = self_cache.key_slot.len();
        ensure!(self_cache.past_keys.len() == (step - 1) * row, "self cache past length mismatch");
        for (t, (keys, values)) in self_cache
            .past_keys
            .chunks(row)
            .zip(self_cache.past_values.chunks(row))
            .enumerate()
        {
            let want = self_cache_marker(layer, t + 1);
            ensure!(
                keys.iter().all(|&k| k == want) && values.iter().all(|&v| v == -want),
                "layer {} step {}: self cache row {} was overwritten",
                layer,
                step,
                t + 1
            );
        }
        self_cache.key_slot.fill(self_cache_marker(layer, step));
        self_cache.value_slot.fill(-self_cache_marker(layer, step));

        match cross_cache {
            CrossCacheAccess::Populate { key, value } => {
                trace.populates[layer] += 1;
                for (i, (k, v)) in key.iter_mut().zip(value.iter_mut()).enumerate() {
                    *k = cross_key(memory.states, layer, i);
                    *v = cross_value(memory.states, layer, i);
                }
            }
            CrossCacheAccess::Ready { key, value } => {
                let intact = key.iter().zip(value).enumerate().all(|(i, (&k, &v))| {
                    k == cross_key(memory.states, layer, i)
                        && v == cross_value(memory.states, layer, i)
                });
                ensure!(
                    intact,
                    "layer {} step {}: cross cache changed after population",
                    layer,
                    step
                );
            }
        }

        let poison = self.poison_at_step.get() == Some(step);
        for b in local_batch {
            let out = &mut output[b * self.hidden..(b + 1) * self.hidden];
            out.fill(0.0);
            if let Some(token) = (self.script)(step, b) {
                out[token as usize] = 1.0;
            }
            if poison {
                out[0] = f32::NAN;
            }
        }
        Ok(())
    }
}

/// Host projection that counts its invocations.
#[derive(Default)]
pub struct CountingProjection {
    pub calls: Arc<AtomicUsize>,
}

impl ProjectionOp for CountingProjection {
    fn project(&self, args: ProjectionArgs<'_>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        NdarrayProjection.project(args)
    }
}

#[derive(Default)]
pub struct CountingAllocator {
    pub allocations: AtomicUsize,
    pub releases: AtomicUsize,
}

impl Allocator for CountingAllocator {
    fn allocate(&self, bytes: usize) -> Result<DeviceBlock> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        DeviceBlock::zeroed(bytes)
    }

    fn release(&self, _block: DeviceBlock) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Model tensors for a config whose hidden size equals its vocabulary.
///
/// The embedding of token `i` is a row of `i`s and the output kernel is the
/// identity, so the winning token of a one-hot hidden state is its index.
pub struct Fixture {
    pub config: RunConfig,
    pub memory: Vec<f32>,
    pub memory_lengths: Vec<u32>,
    pub layer_weights: Vec<usize>,
    pub embedding_table: Vec<f32>,
    pub output_kernel: Vec<f32>,
    pub gamma: Vec<f32>,
    pub relative_bias_table: Vec<f32>,
}

impl Fixture {
    pub fn new(config: RunConfig) -> Self {
        let hidden = config.hidden_units();
        let vocab = config.vocab_size;
        assert_eq!(hidden, vocab, "fixture needs hidden_units == vocab_size");

        let memory_len = config.batch_size * config.memory_max_seq_len * config.memory_hidden_units;
        let mut output_kernel = vec![0.0; hidden * vocab];
        for i in 0..hidden {
            output_kernel[i * vocab + i] = 1.0;
        }

        Self {
            memory: (0..memory_len).map(|i| (i % 13) as f32 * 0.25).collect(),
            memory_lengths: vec![config.memory_max_seq_len as u32; config.batch_size],
            layer_weights: (0..config.decoder_layers).collect(),
            embedding_table: (0..vocab)
                .flat_map(|i| std::iter::repeat(i as f32).take(hidden))
                .collect(),
            output_kernel,
            gamma: vec![1.0; hidden],
            relative_bias_table: (0..config.num_bucket * config.head_num)
                .map(|i| i as f32 * 0.1)
                .collect(),
            config,
        }
    }

    pub fn inputs<'a>(&'a self, forced: Option<ForcedPrefix<'a>>) -> DecodingInputs<'a, usize> {
        DecodingInputs {
            memory: &self.memory,
            memory_lengths: &self.memory_lengths,
            layer_weights: &self.layer_weights,
            embedding_table: &self.embedding_table,
            output_kernel: &self.output_kernel,
            output_bias: None,
            final_norm_gamma: &self.gamma,
            final_norm_beta: None,
            relative_bias_table: &self.relative_bias_table,
            logits_mask: None,
            forced,
        }
    }
}

/// Caller-side output buffers.
pub struct Outputs {
    pub output_ids: Vec<u32>,
    pub sequence_length: Vec<u32>,
    pub scores: Vec<f32>,
}

impl Outputs {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            output_ids: vec![u32::MAX; config.max_seq_len * config.batch_size],
            sequence_length: vec![0; config.batch_size],
            scores: vec![0.0; config.batch_size],
        }
    }

    /// Token of sequence `b` at 1-based `step`.
    pub fn token(&self, batch: usize, step: usize, b: usize) -> u32 {
        self.output_ids[(step - 1) * batch + b]
    }

    pub fn sequence(&self, batch: usize, b: usize) -> Vec<u32> {
        self.output_ids.iter().skip(b).step_by(batch).copied().collect()
    }
}

pub fn counting_allocator() -> (Arc<CountingAllocator>, Arc<dyn Allocator>) {
    let counting = Arc::new(CountingAllocator::default());
    let allocator: Arc<dyn Allocator> = counting.clone();
    (counting, allocator)
}

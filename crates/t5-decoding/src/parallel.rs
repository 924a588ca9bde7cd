//! Shard ownership predicates for tensor- and layer-parallel decoding.
//!
//! Communication between shards is external. This module only answers "does
//! this process own layer `i` / batch element `b`" and how wide the local
//! hidden slice is, which in turn sizes the attention caches.

use std::ops::Range;

use crate::config::RunConfig;

/// Hidden-width partition across cooperating processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorParallel {
    pub world_size: usize,
    pub rank: usize,
    pub local_head_num: usize,
    pub local_hidden_units: usize,
}

impl TensorParallel {
    pub fn from_config(config: &RunConfig) -> Self {
        let world_size = config.tensor_para_size.max(1);
        let local_head_num = config.head_num / world_size;
        Self {
            world_size,
            rank: config.tensor_para_rank,
            local_head_num,
            local_hidden_units: local_head_num * config.size_per_head,
        }
    }

    pub fn is_sharded(&self) -> bool {
        self.world_size > 1
    }

    /// Attention heads computed by this rank.
    pub fn local_head_range(&self) -> Range<usize> {
        let start = self.rank * self.local_head_num;
        start..start + self.local_head_num
    }
}

/// Layer-stack partition across pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerParallel {
    pub world_size: usize,
    pub rank: usize,
    pub layers_per_group: usize,
    pub local_batch_size: usize,
}

impl LayerParallel {
    pub fn from_config(config: &RunConfig) -> Self {
        let world_size = config.layer_para_size.max(1);
        let layers_per_group = config
            .layers_per_group
            .unwrap_or_else(|| config.decoder_layers.div_ceil(world_size));
        Self {
            world_size,
            rank: config.layer_para_rank,
            layers_per_group,
            local_batch_size: config.batch_size.div_ceil(world_size),
        }
    }

    #[inline]
    pub fn owns_layer(&self, layer: usize) -> bool {
        let first = self.layers_per_group * self.rank;
        layer >= first && layer < first + self.layers_per_group
    }

    /// Owned layers, clamped to the real stack depth.
    pub fn owned_layers(&self, decoder_layers: usize) -> Range<usize> {
        let start = (self.layers_per_group * self.rank).min(decoder_layers);
        let end = (self.layers_per_group * (self.rank + 1)).min(decoder_layers);
        start..end
    }

    /// Micro-batch of sequences this stage is responsible for.
    pub fn local_batch_range(&self, batch_size: usize) -> Range<usize> {
        let start = (self.local_batch_size * self.rank).min(batch_size);
        let end = (start + self.local_batch_size).min(batch_size);
        start..end
    }
}

/// Combined ownership view consulted by the decode loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelOwnership {
    pub tensor: TensorParallel,
    pub layer: LayerParallel,
    batch_size: usize,
    decoder_layers: usize,
}

impl ParallelOwnership {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            tensor: TensorParallel::from_config(config),
            layer: LayerParallel::from_config(config),
            batch_size: config.batch_size,
            decoder_layers: config.decoder_layers,
        }
    }

    #[inline]
    pub fn owns_layer(&self, layer: usize) -> bool {
        layer < self.decoder_layers && self.layer.owns_layer(layer)
    }

    pub fn owned_layers(&self) -> Range<usize> {
        self.layer.owned_layers(self.decoder_layers)
    }

    pub fn local_batch_range(&self) -> Range<usize> {
        self.layer.local_batch_range(self.batch_size)
    }

    pub fn owns_batch(&self, index: usize) -> bool {
        self.local_batch_range().contains(&index)
    }

    #[inline]
    pub fn local_hidden_units(&self) -> usize {
        self.tensor.local_hidden_units
    }

    /// True when a single process owns the whole model.
    pub fn owns_everything(&self) -> bool {
        !self.tensor.is_sharded() && self.layer.world_size == 1
    }
}

//! Self- and cross-attention key/value caches living inside the arena.
//!
//! Self-attention caches are stored step-major (`[step][batch][width]` per
//! layer) so the slot a layer writes at step `t` is one contiguous row block,
//! handed out mutably while every earlier step is handed out read-only. A
//! layer therefore cannot rewrite a past position.
//!
//! Cross-attention caches are written on a layer's first invocation of a run
//! and only lent out immutably afterwards.

use crate::error::{DecodingError, Result};

/// Fixed shape of all caches for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    pub layers: usize,
    pub batch: usize,
    pub max_seq_len: usize,
    pub memory_len: usize,
    /// Locally owned hidden width (hidden_units / tensor_para_size).
    pub width: usize,
}

impl CacheGeometry {
    /// Elements written per layer per step.
    #[inline]
    pub fn row_len(&self) -> usize {
        self.batch * self.width
    }

    #[inline]
    pub fn self_layer_len(&self) -> usize {
        self.max_seq_len * self.row_len()
    }

    #[inline]
    pub fn cross_layer_len(&self) -> usize {
        self.batch * self.memory_len * self.width
    }
}

/// What a decoder layer sees of its self-attention cache at one step.
pub struct SelfCacheStep<'a> {
    pub step: usize,
    /// Keys of steps `1..step`, `[step-1][batch][width]`.
    pub past_keys: &'a [f32],
    pub past_values: &'a [f32],
    /// Slot for this step's keys, `[batch][width]`.
    pub key_slot: &'a mut [f32],
    pub value_slot: &'a mut [f32],
}

impl SelfCacheStep<'_> {
    pub fn past_len(&self) -> usize {
        self.step - 1
    }
}

/// Cross-attention cache as lent to a layer.
pub enum CrossCacheAccess<'a> {
    /// First invocation of the layer in this run: compute and store K/V.
    Populate {
        key: &'a mut [f32],
        value: &'a mut [f32],
    },
    /// Already populated; read only.
    Ready { key: &'a [f32], value: &'a [f32] },
}

impl CrossCacheAccess<'_> {
    pub fn is_populate(&self) -> bool {
        matches!(self, CrossCacheAccess::Populate { .. })
    }
}

/// Typed views over the cache regions of the arena.
pub struct CacheViews<'a> {
    geometry: CacheGeometry,
    self_keys: &'a mut [f32],
    self_values: &'a mut [f32],
    cross: &'a mut [f32],
}

impl<'a> CacheViews<'a> {
    pub fn new(
        geometry: CacheGeometry,
        self_keys: &'a mut [f32],
        self_values: &'a mut [f32],
        cross: &'a mut [f32],
    ) -> Result<Self> {
        let self_len = geometry.layers * geometry.self_layer_len();
        let cross_len = geometry.layers * 2 * geometry.cross_layer_len();
        if self_keys.len() != self_len
            || self_values.len() != self_len
            || cross.len() != cross_len
        {
            return Err(DecodingError::Layout(format!(
                "cache views do not match geometry {:?}: self {}/{}, cross {}",
                geometry,
                self_keys.len(),
                self_values.len(),
                cross.len()
            )));
        }
        Ok(Self {
            geometry,
            self_keys,
            self_values,
            cross,
        })
    }

    pub fn geometry(&self) -> CacheGeometry {
        self.geometry
    }

    fn check_layer(&self, layer: usize) -> Result<()> {
        if layer >= self.geometry.layers {
            return Err(DecodingError::Layout(format!(
                "layer index {} out of bounds (num_layers={})",
                layer, self.geometry.layers
            )));
        }
        Ok(())
    }

    /// Whole self-attention cache of a layer, `[max_seq_len][batch][width]`.
    pub fn self_cache(&self, layer: usize) -> Result<(&[f32], &[f32])> {
        self.check_layer(layer)?;
        let len = self.geometry.self_layer_len();
        let range = layer * len..(layer + 1) * len;
        Ok((&self.self_keys[range.clone()], &self.self_values[range]))
    }

    /// Cross-attention cache of a layer, `[batch][memory_len][width]` each.
    pub fn cross_cache(&self, layer: usize) -> Result<(&[f32], &[f32])> {
        self.check_layer(layer)?;
        let len = self.geometry.cross_layer_len();
        let block = &self.cross[layer * 2 * len..(layer + 1) * 2 * len];
        Ok(block.split_at(len))
    }

    /// Lends both caches of a layer for one step.
    pub fn layer_step(
        &mut self,
        layer: usize,
        step: usize,
        populate_cross: bool,
    ) -> Result<(SelfCacheStep<'_>, CrossCacheAccess<'_>)> {
        self.check_layer(layer)?;
        let g = self.geometry;
        if step == 0 || step > g.max_seq_len {
            return Err(DecodingError::Layout(format!(
                "step {} outside cache capacity 1..={}",
                step, g.max_seq_len
            )));
        }

        let row = g.row_len();
        let layer_len = g.self_layer_len();
        let keys = &mut self.self_keys[layer * layer_len..(layer + 1) * layer_len];
        let values = &mut self.self_values[layer * layer_len..(layer + 1) * layer_len];
        let (past_keys, key_rest) = keys.split_at_mut((step - 1) * row);
        let (past_values, value_rest) = values.split_at_mut((step - 1) * row);

        let self_step = SelfCacheStep {
            step,
            past_keys,
            past_values,
            key_slot: &mut key_rest[..row],
            value_slot: &mut value_rest[..row],
        };

        let cross_len = g.cross_layer_len();
        let block = &mut self.cross[layer * 2 * cross_len..(layer + 1) * 2 * cross_len];
        let (key, value) = block.split_at_mut(cross_len);
        let cross = if populate_cross {
            CrossCacheAccess::Populate { key, value }
        } else {
            CrossCacheAccess::Ready { key, value }
        };

        Ok((self_step, cross))
    }
}

/// Remembers which layers have populated their cross cache in the current run.
#[derive(Debug, Clone)]
pub struct CrossCacheTracker {
    populated: Vec<bool>,
}

impl CrossCacheTracker {
    pub fn new(layers: usize) -> Self {
        Self {
            populated: vec![false; layers],
        }
    }

    pub fn reset(&mut self) {
        self.populated.iter_mut().for_each(|p| *p = false);
    }

    pub fn is_populated(&self, layer: usize) -> bool {
        self.populated.get(layer).copied().unwrap_or(false)
    }

    pub fn mark_populated(&mut self, layer: usize) {
        if let Some(p) = self.populated.get_mut(layer) {
            *p = true;
        }
    }
}

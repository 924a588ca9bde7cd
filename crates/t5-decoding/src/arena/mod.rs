//! Single-allocation arena backing every buffer of a decoding run.
//!
//! [`ArenaPlanner`] decides where each buffer lives, [`Arena`] owns the one
//! block obtained from an [`Allocator`], and [`ArenaViews`] is the set of
//! typed, disjoint borrows carved from it for the duration of a run.

pub mod layout;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use anyhow::anyhow;

pub use layout::{
    AliasGroup, ArenaLayout, ArenaPlanner, BufferKind, ElemType, Region, ALIAS_GROUPS,
};

use self::layout::alias_group_of;
use crate::cache::CacheViews;
use crate::error::{DecodingError, Result};
use crate::ops::FinishedFlags;

/// A block of zeroed memory handed out by an [`Allocator`].
///
/// Backed by `u64` words so every region offset that is a multiple of 8 is
/// suitably aligned for any element type the arena stores.
pub struct DeviceBlock {
    words: Vec<u64>,
    bytes: usize,
}

impl DeviceBlock {
    pub fn zeroed(bytes: usize) -> anyhow::Result<Self> {
        let len = bytes.div_ceil(8);
        let mut words = Vec::new();
        words
            .try_reserve_exact(len)
            .map_err(|e| anyhow!("host allocation of {} bytes failed: {}", bytes, e))?;
        words.resize(len, 0);
        Ok(Self { words, bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.bytes]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.bytes]
    }
}

/// Source of the arena's backing memory.
pub trait Allocator: Send + Sync {
    fn allocate(&self, bytes: usize) -> anyhow::Result<DeviceBlock>;

    /// Called once when the arena is torn down.
    fn release(&self, _block: DeviceBlock) {}
}

/// Allocates from the process heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostAllocator;

impl Allocator for HostAllocator {
    fn allocate(&self, bytes: usize) -> anyhow::Result<DeviceBlock> {
        DeviceBlock::zeroed(bytes)
    }
}

/// The owned allocation plus the plan describing it.
pub struct Arena {
    layout: ArenaLayout,
    block: Option<DeviceBlock>,
    allocator: Arc<dyn Allocator>,
}

impl Arena {
    /// Performs the run's only allocation.
    pub fn allocate(layout: ArenaLayout, allocator: Arc<dyn Allocator>) -> Result<Self> {
        let bytes = layout.total_bytes();
        let block = allocator
            .allocate(bytes)
            .map_err(|source| DecodingError::Allocation { bytes, source })?;
        if block.len() < bytes {
            let got = block.len();
            allocator.release(block);
            return Err(DecodingError::Allocation {
                bytes,
                source: anyhow!("allocator returned only {} bytes", got),
            });
        }

        log::info!(
            "Allocated decoding arena: {:.2} MiB in {} regions",
            bytes as f64 / (1024.0 * 1024.0),
            layout.regions().len()
        );

        Ok(Self {
            layout,
            block: Some(block),
            allocator,
        })
    }

    pub fn layout(&self) -> &ArenaLayout {
        &self.layout
    }

    pub fn size_bytes(&self) -> usize {
        self.layout.total_bytes()
    }

    /// Carves typed views over the whole arena.
    pub fn views(&mut self) -> Result<ArenaViews<'_>> {
        let block = self
            .block
            .as_mut()
            .ok_or_else(|| DecodingError::Layout("arena has been released".to_string()))?;
        let layout = &self.layout;
        let mut carver = Carver::new(layout, block.as_bytes_mut())?;

        let hidden_a = carver.take::<f32>(layout, BufferKind::HiddenA)?;
        let hidden_b = carver.take::<f32>(layout, BufferKind::HiddenB)?;
        let cross = carver.take::<f32>(layout, BufferKind::CrossCache)?;
        let self_keys = carver.take::<f32>(layout, BufferKind::SelfKeyCache)?;
        let self_values = carver.take::<f32>(layout, BufferKind::SelfValueCache)?;

        Ok(ArenaViews {
            gemm_workspace: carver.take::<u8>(layout, BufferKind::GemmWorkspace)?,
            hidden: RotatingHidden {
                slots: [hidden_a, hidden_b],
            },
            caches: CacheViews::new(layout.cache_geometry(), self_keys, self_values, cross)?,
            scratch: LayerScratch::carve(layout, &mut carver)?,
            logits: carver.take::<f32>(layout, BufferKind::Logits)?,
            word_ids: carver.take::<u32>(layout, BufferKind::WordIds)?,
            finished: FinishedFlags::new(carver.take::<u8>(layout, BufferKind::Finished)?),
            finished_before: carver.take::<u8>(layout, BufferKind::FinishedBefore)?,
            score_snapshot: carver.take::<f32>(layout, BufferKind::ScoreSnapshot)?,
            relative_bias: carver.take::<f32>(layout, BufferKind::RelativeBias)?,
            sample_workspace: carver.take::<u8>(layout, BufferKind::SampleWorkspace)?,
            padded_kernel: carver.take::<f32>(layout, BufferKind::PaddedKernel)?,
            padded_bias: carver.take::<f32>(layout, BufferKind::PaddedBias)?,
        })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            log::debug!("Releasing decoding arena ({} bytes)", block.len());
            self.allocator.release(block);
        }
    }
}

/// Splits the arena bytes into one slice per physical extent.
struct Carver<'a> {
    slices: Vec<(BufferKind, &'a mut [u8])>,
}

impl<'a> Carver<'a> {
    fn new(layout: &ArenaLayout, bytes: &'a mut [u8]) -> Result<Self> {
        let mut regions: Vec<&Region> = layout
            .regions()
            .iter()
            .filter(|r| match alias_group_of(r.kind) {
                // Only the group leader owns the shared extent.
                Some(group) => group.members.first() == Some(&r.kind),
                None => true,
            })
            .collect();
        regions.sort_by_key(|r| r.offset);

        let mut rest = bytes;
        let mut cursor = 0usize;
        let mut slices = Vec::with_capacity(regions.len());
        for region in regions {
            if region.offset < cursor || region.end() - cursor > rest.len() {
                return Err(DecodingError::Layout(format!(
                    "region {:?} at {}..{} overlaps or exceeds the arena",
                    region.kind,
                    region.offset,
                    region.end()
                )));
            }
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(region.offset - cursor);
            let (head, tail) = tail.split_at_mut(region.bytes);
            slices.push((region.kind, head));
            rest = tail;
            cursor = region.end();
        }
        Ok(Self { slices })
    }

    fn take_raw(&mut self, kind: BufferKind) -> Result<&'a mut [u8]> {
        let pos = self
            .slices
            .iter()
            .position(|(k, _)| *k == kind)
            .ok_or_else(|| DecodingError::Layout(format!("{kind:?} already borrowed")))?;
        Ok(self.slices.swap_remove(pos).1)
    }

    /// Typed view over the region's logical elements.
    fn take<T: bytemuck::Pod>(
        &mut self,
        layout: &ArenaLayout,
        kind: BufferKind,
    ) -> Result<&'a mut [T]> {
        let region = layout.region(kind)?;
        let len = region.elements * std::mem::size_of::<T>();
        let raw = self.take_raw(kind)?;
        bytemuck::try_cast_slice_mut(&mut raw[..len])
            .map_err(|e| DecodingError::Layout(format!("cannot view {kind:?} as typed slice: {e}")))
    }

    /// Typed view over the whole reserved extent.
    fn take_extent<T: bytemuck::Pod>(&mut self, kind: BufferKind) -> Result<&'a mut [T]> {
        let raw = self.take_raw(kind)?;
        let len = raw.len() - raw.len() % std::mem::size_of::<T>();
        bytemuck::try_cast_slice_mut(&mut raw[..len])
            .map_err(|e| DecodingError::Layout(format!("cannot view {kind:?} as typed slice: {e}")))
    }
}

/// The two hidden-state buffers ping-ponged between layers.
pub struct RotatingHidden<'a> {
    slots: [&'a mut [f32]; 2],
}

impl RotatingHidden<'_> {
    /// `(input, output)` for a layer with parity `from_id`.
    pub fn layer_io(&mut self, from_id: usize) -> (&[f32], &mut [f32]) {
        let [a, b] = &mut self.slots;
        if from_id & 1 == 0 {
            (&**a, &mut **b)
        } else {
            (&**b, &mut **a)
        }
    }

    pub fn slot(&self, id: usize) -> &[f32] {
        &*self.slots[id & 1]
    }

    pub fn slot_mut(&mut self, id: usize) -> &mut [f32] {
        &mut *self.slots[id & 1]
    }
}

/// The aliased extent shared by the decoder workspace and the normed output.
///
/// Handing out one accessor borrows the whole extent, so the two uses cannot
/// overlap in time.
pub struct LayerScratch<'a> {
    extent: &'a mut [f32],
    workspace_len: usize,
    normed_len: usize,
}

impl<'a> LayerScratch<'a> {
    fn carve(layout: &ArenaLayout, carver: &mut Carver<'a>) -> Result<Self> {
        let workspace_len = layout.region(BufferKind::DecoderWorkspace)?.elements;
        let normed_len = layout.region(BufferKind::NormedOutput)?.elements;
        let extent = carver.take_extent::<f32>(BufferKind::DecoderWorkspace)?;
        if extent.len() < workspace_len.max(normed_len) {
            return Err(DecodingError::Layout(format!(
                "layer scratch holds {} elements, needs {}",
                extent.len(),
                workspace_len.max(normed_len)
            )));
        }
        Ok(Self {
            extent,
            workspace_len,
            normed_len,
        })
    }

    pub fn decoder_workspace(&mut self) -> &mut [f32] {
        &mut self.extent[..self.workspace_len]
    }

    pub fn normed_output(&mut self) -> &mut [f32] {
        &mut self.extent[..self.normed_len]
    }

    pub fn normed(&self) -> &[f32] {
        &self.extent[..self.normed_len]
    }
}

/// Typed borrows of every arena region for one run.
pub struct ArenaViews<'a> {
    pub gemm_workspace: &'a mut [u8],
    pub hidden: RotatingHidden<'a>,
    pub caches: CacheViews<'a>,
    pub scratch: LayerScratch<'a>,
    /// `[batch][vocab_size_padded]`
    pub logits: &'a mut [f32],
    /// Token fed to the next step's embedding lookup.
    pub word_ids: &'a mut [u32],
    pub finished: FinishedFlags<'a>,
    pub finished_before: &'a mut [u8],
    pub score_snapshot: &'a mut [f32],
    pub relative_bias: &'a mut [f32],
    pub sample_workspace: &'a mut [u8],
    /// Empty unless the vocabulary is padded.
    pub padded_kernel: &'a mut [f32],
    pub padded_bias: &'a mut [f32],
}

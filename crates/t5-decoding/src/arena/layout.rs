//! Byte layout of the decoding arena.
//!
//! The planner turns a [`RunConfig`] into a list of [`Region`]s inside one
//! allocation. Buffers listed together in [`ALIAS_GROUPS`] are never live in
//! the same phase of a step and share a single extent.

use crate::cache::CacheGeometry;
use crate::config::RunConfig;
use crate::error::{DecodingError, Result};
use crate::parallel::ParallelOwnership;

/// Every logical buffer the decode loop needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Scratch for the projection GEMM.
    GemmWorkspace,
    HiddenA,
    HiddenB,
    /// Encoder-memory K/V for every layer, `[layer][k|v][batch][mem_len][width]`.
    CrossCache,
    /// Self-attention keys, `[layer][step][batch][width]`.
    SelfKeyCache,
    SelfValueCache,
    /// Inner workspace of the opaque decoder layer.
    DecoderWorkspace,
    /// Final layer-norm output fed to the logits projection.
    NormedOutput,
    Logits,
    WordIds,
    Finished,
    /// Finished flags as they were at the start of the step.
    FinishedBefore,
    /// Scores as they were before the step's selection.
    ScoreSnapshot,
    RelativeBias,
    SampleWorkspace,
    PaddedKernel,
    PaddedBias,
}

/// Element type stored in a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    F32,
    U32,
    U8,
    /// Opaque scratch handed to an external op.
    Bytes,
}

impl ElemType {
    pub fn size(self) -> usize {
        match self {
            ElemType::F32 | ElemType::U32 => 4,
            ElemType::U8 | ElemType::Bytes => 1,
        }
    }

    pub fn align(self) -> usize {
        match self {
            ElemType::F32 | ElemType::U32 => 4,
            ElemType::U8 => 1,
            ElemType::Bytes => 8,
        }
    }
}

/// Buffers that may share physical memory because their lifetimes never overlap.
#[derive(Debug)]
pub struct AliasGroup {
    pub name: &'static str,
    pub members: &'static [BufferKind],
}

/// The decoder workspace is only live inside the layer stack; the normed
/// output is only live between the final layer norm and the projection.
pub const ALIAS_GROUPS: &[AliasGroup] = &[AliasGroup {
    name: "layer_scratch",
    members: &[BufferKind::DecoderWorkspace, BufferKind::NormedOutput],
}];

pub(crate) fn alias_group_of(kind: BufferKind) -> Option<&'static AliasGroup> {
    ALIAS_GROUPS.iter().find(|g| g.members.contains(&kind))
}

/// A placed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub kind: BufferKind,
    pub elem: ElemType,
    /// Logical element count exposed through views.
    pub elements: usize,
    pub offset: usize,
    /// Reserved bytes, including element padding (and the shared extent for aliases).
    pub bytes: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.offset + self.bytes
    }
}

#[derive(Debug, Clone, Copy)]
struct Request {
    kind: BufferKind,
    elem: ElemType,
    elements: usize,
    pad_to: usize,
}

impl Request {
    fn new(kind: BufferKind, elem: ElemType, elements: usize) -> Self {
        Self { kind, elem, elements, pad_to: 1 }
    }

    fn padded(mut self, multiple: usize) -> Self {
        self.pad_to = multiple;
        self
    }

    fn bytes(&self) -> usize {
        self.elements.div_ceil(self.pad_to) * self.pad_to * self.elem.size()
    }
}

#[inline]
fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Result of planning: offsets of every buffer inside one allocation.
#[derive(Debug, Clone)]
pub struct ArenaLayout {
    regions: Vec<Region>,
    total_bytes: usize,
    geometry: CacheGeometry,
}

impl ArenaLayout {
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, kind: BufferKind) -> Result<&Region> {
        self.regions
            .iter()
            .find(|r| r.kind == kind)
            .ok_or_else(|| DecodingError::Layout(format!("no region planned for {kind:?}")))
    }

    /// Size of the single allocation backing all views.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Bytes the plan would need without aliasing.
    pub fn unaliased_bytes(&self) -> usize {
        self.regions
            .iter()
            .map(|r| align_up(r.elements * r.elem.size(), 4))
            .sum()
    }

    pub fn aliased(&self, a: BufferKind, b: BufferKind) -> bool {
        match (self.region(a), self.region(b)) {
            (Ok(ra), Ok(rb)) => a != b && ra.offset == rb.offset && ra.bytes > 0,
            _ => false,
        }
    }

    pub fn cache_geometry(&self) -> CacheGeometry {
        self.geometry
    }
}

/// Computes the arena plan for a run.
///
/// The decoder-layer and sampler scratch sizes come from dry-run queries
/// against the opaque ops, so they are supplied before [`ArenaPlanner::plan`].
pub struct ArenaPlanner<'a> {
    config: &'a RunConfig,
    ownership: &'a ParallelOwnership,
    decoder_workspace: usize,
    gemm_workspace: usize,
    sample_workspace: Option<usize>,
    sampler_name: &'static str,
}

impl<'a> ArenaPlanner<'a> {
    pub fn new(config: &'a RunConfig, ownership: &'a ParallelOwnership) -> Self {
        Self {
            config,
            ownership,
            decoder_workspace: 0,
            gemm_workspace: 0,
            sample_workspace: None,
            sampler_name: "unknown",
        }
    }

    /// Decoder layer scratch, in `f32` elements.
    pub fn decoder_workspace(mut self, elements: usize) -> Self {
        self.decoder_workspace = elements;
        self
    }

    /// Projection scratch, in bytes.
    pub fn gemm_workspace(mut self, bytes: usize) -> Self {
        self.gemm_workspace = bytes;
        self
    }

    /// Sampler scratch, in bytes, as reported by its dry run.
    pub fn sample_workspace(mut self, name: &'static str, bytes: Option<usize>) -> Self {
        self.sampler_name = name;
        self.sample_workspace = bytes;
        self
    }

    fn requests(&self) -> Result<Vec<Request>> {
        use BufferKind::*;
        use ElemType::*;

        let cfg = self.config;
        let sample_workspace = self
            .sample_workspace
            .ok_or(DecodingError::SamplerWorkspace(self.sampler_name))?;

        let batch = cfg.batch_size;
        let hidden = cfg.hidden_units();
        let vocab_padded = cfg.vocab_size_padded();
        let geometry = self.geometry();
        let bias_positions = cfg.max_seq_len + 1;
        let (padded_kernel, padded_bias) = if vocab_padded != cfg.vocab_size {
            (hidden * vocab_padded, vocab_padded)
        } else {
            (0, 0)
        };

        Ok(vec![
            Request::new(GemmWorkspace, Bytes, self.gemm_workspace),
            Request::new(HiddenA, F32, batch * hidden),
            Request::new(HiddenB, F32, batch * hidden),
            Request::new(CrossCache, F32, cfg.decoder_layers * 2 * geometry.cross_layer_len()),
            Request::new(SelfKeyCache, F32, cfg.decoder_layers * geometry.self_layer_len()),
            Request::new(SelfValueCache, F32, cfg.decoder_layers * geometry.self_layer_len()),
            Request::new(DecoderWorkspace, F32, self.decoder_workspace),
            Request::new(NormedOutput, F32, batch * hidden),
            Request::new(Logits, F32, batch * vocab_padded).padded(4),
            Request::new(WordIds, U32, batch).padded(4),
            Request::new(Finished, U8, batch).padded(32),
            Request::new(FinishedBefore, U8, batch).padded(32),
            Request::new(ScoreSnapshot, F32, batch).padded(4),
            Request::new(RelativeBias, F32, bias_positions * bias_positions * cfg.head_num),
            Request::new(SampleWorkspace, Bytes, sample_workspace),
            Request::new(PaddedKernel, F32, padded_kernel),
            Request::new(PaddedBias, F32, padded_bias),
        ])
    }

    fn geometry(&self) -> CacheGeometry {
        CacheGeometry {
            layers: self.config.decoder_layers,
            batch: self.config.batch_size,
            max_seq_len: self.config.max_seq_len,
            memory_len: self.config.memory_max_seq_len,
            width: self.ownership.local_hidden_units(),
        }
    }

    pub fn plan(self) -> Result<ArenaLayout> {
        let requests = self.requests()?;
        let mut regions: Vec<Region> = Vec::with_capacity(requests.len());
        let mut cursor = 0usize;

        for request in &requests {
            let Some(group) = alias_group_of(request.kind) else {
                cursor = align_up(cursor, request.elem.align());
                regions.push(Region {
                    kind: request.kind,
                    elem: request.elem,
                    elements: request.elements,
                    offset: cursor,
                    bytes: request.bytes(),
                });
                cursor += request.bytes();
                continue;
            };

            // The first member of a group places the shared extent.
            let placed = regions
                .iter()
                .find(|r| group.members.contains(&r.kind))
                .map(|r| (r.offset, r.bytes));
            let (offset, extent) = match placed {
                Some(shared) => shared,
                None => {
                    let members: Vec<&Request> = requests
                        .iter()
                        .filter(|r| group.members.contains(&r.kind))
                        .collect();
                    let align = members.iter().map(|r| r.elem.align()).max().unwrap_or(1);
                    let extent = members.iter().map(|r| r.bytes()).max().unwrap_or(0);
                    cursor = align_up(cursor, align);
                    let offset = cursor;
                    cursor += extent;
                    (offset, extent)
                }
            };
            regions.push(Region {
                kind: request.kind,
                elem: request.elem,
                elements: request.elements,
                offset,
                bytes: extent,
            });
        }

        let total_bytes = align_up(cursor, 8);
        log::debug!(
            "Planned decoding arena: {} regions, {} bytes ({} without aliasing)",
            regions.len(),
            total_bytes,
            requests.iter().map(Request::bytes).sum::<usize>()
        );

        Ok(ArenaLayout {
            regions,
            total_bytes,
            geometry: self.geometry(),
        })
    }
}

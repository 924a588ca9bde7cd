use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;
use crate::config::{DataType, RunConfig};
use crate::error::DecodingError;
use crate::parallel::ParallelOwnership;

fn small_config() -> RunConfig {
    let mut config = RunConfig::t5_small(3, 5);
    config.head_num = 2;
    config.size_per_head = 4;
    config.decoder_layers = 2;
    config.vocab_size = 10;
    config.memory_hidden_units = 8;
    config.memory_max_seq_len = 6;
    config
}

fn plan(config: &RunConfig, decoder_workspace: usize) -> ArenaLayout {
    let ownership = ParallelOwnership::from_config(config);
    ArenaPlanner::new(config, &ownership)
        .decoder_workspace(decoder_workspace)
        .gemm_workspace(16)
        .sample_workspace("top_k", Some(40))
        .plan()
        .unwrap()
}

#[derive(Default)]
struct CountingAllocator {
    allocations: AtomicUsize,
    releases: AtomicUsize,
    requested: AtomicUsize,
}

impl Allocator for CountingAllocator {
    fn allocate(&self, bytes: usize) -> anyhow::Result<DeviceBlock> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.requested.store(bytes, Ordering::SeqCst);
        DeviceBlock::zeroed(bytes)
    }

    fn release(&self, _block: DeviceBlock) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

struct FailingAllocator;

impl Allocator for FailingAllocator {
    fn allocate(&self, bytes: usize) -> anyhow::Result<DeviceBlock> {
        anyhow::bail!("out of device memory ({bytes} bytes requested)")
    }
}

#[test]
fn test_regions_fit_and_only_alias_group_overlaps() {
    let config = small_config();
    let layout = plan(&config, 100);

    for region in layout.regions() {
        assert!(region.end() <= layout.total_bytes(), "{:?} exceeds arena", region.kind);
        assert_eq!(region.offset % region.elem.align(), 0, "{:?} misaligned", region.kind);
    }

    let regions = layout.regions();
    for (i, a) in regions.iter().enumerate() {
        for b in &regions[i + 1..] {
            let overlap = a.offset < b.end() && b.offset < a.end();
            if overlap {
                assert!(
                    layout.aliased(a.kind, b.kind),
                    "{:?} and {:?} overlap without an alias entry",
                    a.kind,
                    b.kind
                );
            }
        }
    }
}

#[test]
fn test_workspace_and_normed_output_share_memory() {
    let config = small_config();
    let layout = plan(&config, 100);

    assert!(layout.aliased(BufferKind::DecoderWorkspace, BufferKind::NormedOutput));
    assert!(!layout.aliased(BufferKind::HiddenA, BufferKind::HiddenB));

    let workspace = layout.region(BufferKind::DecoderWorkspace).unwrap();
    assert_eq!(workspace.bytes, 100 * 4);
    assert!(layout.total_bytes() < layout.unaliased_bytes());
}

#[test]
fn test_alias_extent_covers_larger_member() {
    let config = small_config();
    // Normed output is batch * hidden = 24 elements, larger than the workspace.
    let layout = plan(&config, 2);
    let normed = layout.region(BufferKind::NormedOutput).unwrap();
    assert_eq!(normed.elements, 24);
    assert_eq!(normed.bytes, 24 * 4);
}

#[test]
fn test_padding_rules() {
    let config = small_config();
    let layout = plan(&config, 0);

    let finished = layout.region(BufferKind::Finished).unwrap();
    assert_eq!(finished.elements, 3);
    assert_eq!(finished.bytes, 32);

    let word_ids = layout.region(BufferKind::WordIds).unwrap();
    assert_eq!(word_ids.bytes, 4 * 4);

    let logits = layout.region(BufferKind::Logits).unwrap();
    assert_eq!(logits.elements, 30);
    assert_eq!(logits.bytes, 32 * 4);

    assert_eq!(layout.total_bytes() % 8, 0);
}

#[test]
fn test_cache_sizes_follow_geometry() {
    let config = small_config();
    let layout = plan(&config, 0);

    let geometry = layout.cache_geometry();
    assert_eq!(geometry.width, 8);
    assert_eq!(
        layout.region(BufferKind::SelfKeyCache).unwrap().elements,
        2 * 5 * 3 * 8
    );
    assert_eq!(
        layout.region(BufferKind::CrossCache).unwrap().elements,
        2 * 2 * 3 * 6 * 8
    );
    assert_eq!(
        layout.region(BufferKind::RelativeBias).unwrap().elements,
        6 * 6 * 2
    );
}

#[test]
fn test_tensor_parallel_shrinks_caches() {
    let mut config = small_config();
    config.tensor_para_size = 2;
    let layout = plan(&config, 0);
    assert_eq!(layout.cache_geometry().width, 4);
    assert_eq!(
        layout.region(BufferKind::SelfValueCache).unwrap().elements,
        2 * 5 * 3 * 4
    );
}

#[test]
fn test_padded_vocabulary_regions() {
    let mut config = small_config();
    assert_eq!(plan(&config, 0).region(BufferKind::PaddedKernel).unwrap().elements, 0);

    config.precision = DataType::F16;
    let layout = plan(&config, 0);
    assert_eq!(layout.region(BufferKind::PaddedKernel).unwrap().elements, 8 * 16);
    assert_eq!(layout.region(BufferKind::PaddedBias).unwrap().elements, 16);
    assert_eq!(layout.region(BufferKind::Logits).unwrap().elements, 3 * 16);
}

#[test]
fn test_missing_sampler_workspace_is_fatal() {
    let config = small_config();
    let ownership = ParallelOwnership::from_config(&config);
    let err = ArenaPlanner::new(&config, &ownership)
        .sample_workspace("top_p", None)
        .plan()
        .unwrap_err();
    assert!(matches!(err, DecodingError::SamplerWorkspace("top_p")));
}

#[test]
fn test_single_allocation_and_release() {
    let config = small_config();
    let layout = plan(&config, 100);
    let total = layout.total_bytes();
    let allocator = Arc::new(CountingAllocator::default());

    {
        let mut arena = Arena::allocate(layout, allocator.clone()).unwrap();
        assert_eq!(arena.size_bytes(), total);
        let _ = arena.views().unwrap();
        let _ = arena.views().unwrap();
        assert_eq!(allocator.allocations.load(Ordering::SeqCst), 1);
        assert_eq!(allocator.releases.load(Ordering::SeqCst), 0);
    }

    assert_eq!(allocator.requested.load(Ordering::SeqCst), total);
    assert_eq!(allocator.releases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_allocation_failure() {
    let config = small_config();
    let layout = plan(&config, 0);
    let err = Arena::allocate(layout, Arc::new(FailingAllocator)).err().unwrap();
    assert!(matches!(err, DecodingError::Allocation { .. }));
}

#[test]
fn test_views_have_logical_lengths() {
    let config = small_config();
    let mut arena = Arena::allocate(plan(&config, 100), Arc::new(HostAllocator)).unwrap();
    let mut views = arena.views().unwrap();

    assert_eq!(views.hidden.slot(0).len(), 24);
    assert_eq!(views.logits.len(), 30);
    assert_eq!(views.word_ids.len(), 3);
    assert_eq!(views.finished.len(), 3);
    assert_eq!(views.sample_workspace.len(), 40);
    assert_eq!(views.gemm_workspace.len(), 16);
    assert_eq!(views.scratch.decoder_workspace().len(), 100);
    assert_eq!(views.scratch.normed_output().len(), 24);
    assert!(views.padded_kernel.is_empty());
}

#[test]
fn test_views_are_disjoint() {
    let config = small_config();
    let mut arena = Arena::allocate(plan(&config, 100), Arc::new(HostAllocator)).unwrap();

    {
        let mut views = arena.views().unwrap();
        views.hidden.slot_mut(0).fill(1.0);
        views.hidden.slot_mut(1).fill(2.0);
        views.logits.fill(3.0);
        views.word_ids.fill(7);
        views.finished.mark(2);
    }

    let mut views = arena.views().unwrap();
    assert!(views.hidden.slot(0).iter().all(|&v| v == 1.0));
    assert!(views.hidden.slot(1).iter().all(|&v| v == 2.0));
    assert!(views.logits.iter().all(|&v| v == 3.0));
    assert_eq!(&views.word_ids[..], &[7u32, 7, 7][..]);
    assert!(views.finished.is_finished(2));
    assert!(!views.finished.is_finished(0));

    let (input, output) = views.hidden.layer_io(1);
    assert_eq!(input[0], 2.0);
    output[0] = 9.0;
    assert_eq!(views.hidden.slot(0)[0], 9.0);
}

#[test]
fn test_scratch_aliases_workspace_and_normed() {
    let config = small_config();
    let mut arena = Arena::allocate(plan(&config, 100), Arc::new(HostAllocator)).unwrap();
    let mut views = arena.views().unwrap();
    views.scratch.decoder_workspace()[0] = 42.0;
    assert_eq!(views.scratch.normed()[0], 42.0);
}

use std::collections::{BTreeSet, HashMap};
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vidsim::bitmap::PairBitmap;
use vidsim::metric::ScalarBackend;
use vidsim::{
    BackendKind, CancelToken, ItemId, MediaSource, MemorySource, MetricBackend, Miniature,
    Notifier, Phase, Result, SimError, SimOptions, SimilarityGraph, SimilarityPipeline, Thumbnail,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn solid(value: u8) -> Thumbnail {
    Thumbnail { width: 16, height: 16, rgb: vec![value; 16 * 16 * 3] }
}

/// 在 base 色上逐像素加 ±3 的噪声
fn noisy(base: u8, rng: &mut StdRng) -> Thumbnail {
    let rgb = (0..16 * 16 * 3)
        .map(|_| (base as i32 + rng.random_range(-3..=3)).clamp(0, 255) as u8)
        .collect();
    Thumbnail { width: 16, height: 16, rgb }
}

/// 把结果映射还原成分组集合，忽略具体 id，只看划分
fn partition(result: &HashMap<ItemId, Option<i64>>) -> BTreeSet<Vec<ItemId>> {
    let mut by_group: HashMap<i64, Vec<ItemId>> = HashMap::new();
    for (&item, &group) in result {
        if let Some(group) = group {
            by_group.entry(group).or_default().push(item);
        }
    }
    by_group
        .into_values()
        .filter(|members| members.len() > 1)
        .map(|mut members| {
            members.sort();
            members
        })
        .collect()
}

#[test]
fn test_repeated_runs_are_identical() {
    init();
    let mut source = MemorySource::new();
    let mut rng = StdRng::seed_from_u64(7);
    for id in 0..20 {
        let base = [20, 20, 120, 220][id as usize % 4];
        source.add(id, noisy(base, &mut rng), 60.0);
    }

    let first = SimilarityPipeline::new(&source, SimOptions::default()).unwrap().run().unwrap();
    let second = SimilarityPipeline::new(&source, SimOptions::default()).unwrap().run().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_incremental_item_joins_existing_group() {
    init();
    let mut source = MemorySource::new();
    source.add(1, solid(10), 60.0);
    source.add(2, solid(12), 60.0);
    source.add(3, solid(11), 60.0);
    source.set_previous_group(1, 5);
    source.set_previous_group(2, 5);

    let mut pipeline = SimilarityPipeline::new(&source, SimOptions::default()).unwrap();
    pipeline.notice_new(3);
    let result = pipeline.run().unwrap();

    // 历史分组 id 保持稳定，新成员并入
    assert_eq!(result[&1], Some(5));
    assert_eq!(result[&2], Some(5));
    assert_eq!(result[&3], Some(5));
}

#[test]
fn test_dissimilar_items_stay_apart() {
    init();
    let mut source = MemorySource::new();
    source.add(1, solid(10), 60.0);
    source.add(2, solid(100), 60.0);
    source.add(3, solid(200), 60.0);

    let result = SimilarityPipeline::new(&source, SimOptions::default()).unwrap().run().unwrap();
    assert_eq!(result[&1], None);
    assert_eq!(result[&2], None);
    assert_eq!(result[&3], None);
}

struct FailingBackend;

impl MetricBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn score(&self, _a: &Miniature, _b: &Miniature) -> Result<f64> {
        Err(SimError::ComparisonWorkerFailure("injected".into()))
    }
}

#[test]
fn test_backend_failure_aborts_without_result() {
    init();
    let mut source = MemorySource::new();
    source.add(1, solid(10), 60.0);
    source.add(2, solid(12), 60.0);
    source.set_previous_group(1, 5);

    let mut pipeline = SimilarityPipeline::new(&source, SimOptions::default())
        .unwrap()
        .with_backend(Box::new(FailingBackend));
    pipeline.notice_new(2);
    assert!(matches!(pipeline.run(), Err(SimError::ComparisonWorkerFailure(_))));

    // 失败的运行不产生映射，宿主保留原有分组
    assert_eq!(source.previous_group(1), Some(5));
    assert_eq!(source.previous_group(2), None);
}

/// 模拟慢任务失败：先占住工作线程一段时间再报错
struct SlowFailingBackend;

impl MetricBackend for SlowFailingBackend {
    fn name(&self) -> &'static str {
        "slow-failing"
    }

    fn score(&self, _a: &Miniature, _b: &Miniature) -> Result<f64> {
        thread::sleep(Duration::from_millis(20));
        Err(SimError::ComparisonWorkerFailure("injected".into()))
    }
}

#[test]
fn test_worker_failure_with_queued_batches_aborts() {
    init();
    let mut source = MemorySource::new();
    for id in 0..60 {
        source.add(id, solid(10), 60.0);
    }

    // 单对批次把队列压满，失败后投喂端必须随通道断开而退出
    let opts = SimOptions { batch_size: 1, ..Default::default() };
    let mut pipeline = SimilarityPipeline::new(&source, opts)
        .unwrap()
        .with_backend(Box::new(SlowFailingBackend));
    assert!(matches!(pipeline.run(), Err(SimError::ComparisonWorkerFailure(_))));
}

/// 在比较阶段的第一个进度事件里触发取消
struct CancelOnCompare(CancelToken);

impl Notifier for CancelOnCompare {
    fn progress(&self, phase: Phase, _done: usize, _total: usize) {
        if phase == Phase::Compare {
            self.0.cancel();
        }
    }
}

#[test]
fn test_cancel_during_compare_phase() {
    init();
    let mut source = MemorySource::new();
    for id in 0..20 {
        source.add(id, solid(10), 60.0);
    }

    let opts = SimOptions { batch_size: 1, ..Default::default() };
    let pipeline = SimilarityPipeline::new(&source, opts).unwrap();
    let token = pipeline.cancel_token();
    let mut pipeline = pipeline.with_notifier(CancelOnCompare(token));
    assert!(matches!(pipeline.run(), Err(SimError::Cancelled)));
}

#[test]
fn test_full_scan_matches_brute_force() {
    init();
    let opts = SimOptions::default();
    let mut source = MemorySource::new();
    let mut rng = StdRng::seed_from_u64(42);
    let mut thumbs = Vec::new();
    for id in 0..40u64 {
        let base = [15, 80, 150, 230][id as usize % 4];
        let thumb = noisy(base, &mut rng);
        source.add(id, thumb.clone(), 60.0);
        thumbs.push((id, thumb));
    }

    let result = SimilarityPipeline::new(&source, opts.clone()).unwrap().run().unwrap();

    // 暴力基准：所有对都过标量后端
    let minis: Vec<Miniature> = thumbs
        .iter()
        .map(|(id, t)| Miniature::from_thumbnail(*id, t, opts.width, opts.height).unwrap())
        .collect();
    let bitmap = PairBitmap::new(minis.len());
    let all_pairs: Vec<(u32, u32)> = (0..minis.len() as u32)
        .flat_map(|a| (a + 1..minis.len() as u32).map(move |b| (a, b)))
        .collect();
    ScalarBackend.compare_batch(&minis, &all_pairs, opts.sim_limit, &bitmap).unwrap();

    let mut graph = SimilarityGraph::new();
    for (i, j) in bitmap.pairs() {
        graph.connect(minis[i as usize].id(), minis[j as usize].id());
    }
    let expected: BTreeSet<Vec<ItemId>> = graph.groups().into_iter().collect();

    assert_eq!(partition(&result), expected);
}

#[test]
fn test_backends_agree_on_grouping() {
    init();
    let mut source = MemorySource::new();
    let mut rng = StdRng::seed_from_u64(99);
    for id in 0..24 {
        let base = [30, 30, 140, 250][id as usize % 4];
        source.add(id, noisy(base, &mut rng), 120.0);
    }

    let scalar_opts = SimOptions { backend: BackendKind::Scalar, ..Default::default() };
    let batch_opts = SimOptions { backend: BackendKind::Batch, ..Default::default() };
    let scalar = SimilarityPipeline::new(&source, scalar_opts).unwrap().run().unwrap();
    let batch = SimilarityPipeline::new(&source, batch_opts).unwrap().run().unwrap();
    assert_eq!(scalar, batch);
}

#[test]
fn test_buffer_overflow_falls_back_to_full_scan() {
    init();
    let mut source = MemorySource::new();
    source.add(1, solid(10), 60.0);
    source.add(2, solid(12), 60.0);
    source.add(3, solid(11), 60.0);
    source.set_previous_group(1, 5);
    source.set_previous_group(2, 5);

    let opts = SimOptions { buffer_capacity: 1, ..Default::default() };
    let mut pipeline = SimilarityPipeline::new(&source, opts).unwrap();
    pipeline.notice_new(3);
    pipeline.notice_new(4);

    // 溢出后退化为全量扫描，结果仍然正确
    let result = pipeline.run().unwrap();
    assert_eq!(result[&1], Some(5));
    assert_eq!(result[&2], Some(5));
    assert_eq!(result[&3], Some(5));
}

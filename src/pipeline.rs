use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_channel::bounded;
use log::{debug, info};
use rayon::prelude::*;

use crate::bitmap::PairBitmap;
use crate::buckets::BucketScan;
use crate::config::SimOptions;
use crate::error::{Result, SimError};
use crate::features::FeatureMatrix;
use crate::graph::SimilarityGraph;
use crate::index::candidate_pairs;
use crate::merge::merge_groups;
use crate::metric::{MetricBackend, select_backend};
use crate::miniature::{ItemId, Miniature, Thumbnail};
use crate::notify::{Notifier, NullNotifier, Phase, ProgressStep};

/// 宿主应用向流水线提供的能力
///
/// 核心自身不做任何 I/O：缩略图、时长和历史分组都来自这里，结果
/// 映射交还调用方持久化。
pub trait MediaSource {
    fn count(&self) -> usize;
    /// 有限的 (id, 缩略图) 序列
    fn items(&self) -> Box<dyn Iterator<Item = (ItemId, Thumbnail)> + '_>;
    fn duration(&self, id: ItemId) -> Option<f64>;
    fn previous_group(&self, id: ItemId) -> Option<i64>;
}

/// 内存实现，嵌入测试和小规模调用的最简适配
#[derive(Default)]
pub struct MemorySource {
    items: Vec<(ItemId, Thumbnail)>,
    durations: HashMap<ItemId, f64>,
    groups: HashMap<ItemId, i64>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: ItemId, thumb: Thumbnail, duration: f64) {
        self.items.push((id, thumb));
        self.durations.insert(id, duration);
    }

    pub fn set_previous_group(&mut self, id: ItemId, group: i64) {
        self.groups.insert(id, group);
    }
}

impl MediaSource for MemorySource {
    fn count(&self) -> usize {
        self.items.len()
    }

    fn items(&self) -> Box<dyn Iterator<Item = (ItemId, Thumbnail)> + '_> {
        Box::new(self.items.iter().map(|(id, t)| (*id, t.clone())))
    }

    fn duration(&self, id: ItemId) -> Option<f64> {
        self.durations.get(&id).copied()
    }

    fn previous_group(&self, id: ItemId) -> Option<i64> {
        self.groups.get(&id).copied()
    }
}

/// 协作式取消令牌，只在批次边界生效
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// 新条目的有界缓冲
///
/// 容量之内记录增量，超出后进入溢出态：下一次运行退化为全量重扫。
/// 状态显式化，避免原型里靠可空字段加副作用翻转的写法。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewItemBuffer {
    Buffering { ids: Vec<ItemId>, capacity: usize },
    Overflowed,
}

impl NewItemBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::Buffering { ids: Vec::new(), capacity }
    }

    pub fn push(&mut self, id: ItemId) {
        if let Self::Buffering { ids, capacity } = self {
            // 已缓冲的 id 重复登记不消耗容量
            if ids.contains(&id) {
                return;
            }
            if ids.len() >= *capacity {
                *self = Self::Overflowed;
            } else {
                ids.push(id);
            }
        }
    }

    pub fn is_overflowed(&self) -> bool {
        matches!(self, Self::Overflowed)
    }

    fn ids(&self) -> Option<&[ItemId]> {
        match self {
            Self::Buffering { ids, .. } => Some(ids),
            Self::Overflowed => None,
        }
    }
}

/// 近重复检测流水线
///
/// 各阶段严格串行，比较阶段内部使用固定大小的工作线程池。一次
/// `run()` 要么返回完整的新分组映射，要么返回错误且不产生任何可
/// 持久化的部分结果。
pub struct SimilarityPipeline<'a, S: MediaSource> {
    opts: SimOptions,
    source: &'a S,
    notifier: Box<dyn Notifier + 'a>,
    backend: Box<dyn MetricBackend>,
    buffer: NewItemBuffer,
    cancel: CancelToken,
}

impl<'a, S: MediaSource> SimilarityPipeline<'a, S> {
    /// 创建流水线并在此刻选定度量后端，运行中不再切换
    pub fn new(source: &'a S, opts: SimOptions) -> Result<Self> {
        let backend = select_backend(opts.backend)?;
        let buffer = NewItemBuffer::new(opts.buffer_capacity);
        Ok(Self {
            opts,
            source,
            notifier: Box::new(NullNotifier),
            backend,
            buffer,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'a) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    /// 测试注入用
    pub fn with_backend(mut self, backend: Box<dyn MetricBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// 宿主登记一个新增条目；缓冲溢出后转为全量重扫
    pub fn notice_new(&mut self, id: ItemId) {
        self.buffer.push(id);
    }

    /// 执行一次完整的检测运行
    ///
    /// 返回 id 到新分组 id 的完整映射，未被本轮触及的条目保留原值
    /// （包括空值）。任何错误都不产生部分结果，调用方保持原有分组。
    pub fn run(&mut self) -> Result<HashMap<ItemId, Option<i64>>> {
        info!("similarity run over {} items", self.source.count());
        let items: Vec<(ItemId, Thumbnail)> = self.source.items().collect();

        let minis = self.build_miniatures(&items)?;
        drop(items);

        let prior = self.load_prior(&minis);
        let has_prior = prior.values().any(Option::is_some);

        let features = self.build_features(&minis)?;

        // 溢出或没有任何历史分组时全量扫描，否则按缓冲的新条目增量扫描
        let full_scan = self.buffer.is_overflowed() || !has_prior;
        let is_new = self.new_flags(&minis, full_scan);
        if self.cancel.is_cancelled() {
            return Err(SimError::Cancelled);
        }

        let pairs = if full_scan {
            debug!("full scan: bucketed exhaustive candidate generation");
            self.bucket_candidates(&minis, &is_new)
        } else {
            debug!("incremental scan: approximate index candidate generation");
            let t = Instant::now();
            let pairs = candidate_pairs(&features, &is_new, &self.opts);
            self.notifier.elapsed(Phase::Index, t.elapsed());
            pairs
        };
        drop(features);
        debug!("{} candidate pairs to verify", pairs.len());

        let confirmed = self.verify_pairs(&minis, &pairs)?;

        let t = Instant::now();
        let mut graph = SimilarityGraph::new();
        for (i, j) in confirmed.pairs() {
            graph.connect(minis[i as usize].id(), minis[j as usize].id());
        }
        let groups = graph.groups();
        self.notifier.elapsed(Phase::Cluster, t.elapsed());
        info!("{} groups found", groups.len());

        if self.cancel.is_cancelled() {
            return Err(SimError::Cancelled);
        }

        let t = Instant::now();
        let result = merge_groups(Some(&prior), &groups);
        self.notifier.elapsed(Phase::Merge, t.elapsed());

        // 只有完整跑完才清空缓冲
        self.buffer = NewItemBuffer::new(self.opts.buffer_capacity);
        Ok(result)
    }

    fn build_miniatures(&self, items: &[(ItemId, Thumbnail)]) -> Result<Vec<Miniature>> {
        let t = Instant::now();
        let step = ProgressStep::new(Phase::Miniatures, items.len());
        let done = AtomicUsize::new(0);
        let notifier = &*self.notifier;
        let (w, h) = (self.opts.width, self.opts.height);

        let minis = items
            .par_iter()
            .map(|(id, thumb)| {
                let m = Miniature::from_thumbnail(*id, thumb, w, h);
                step.tick(done.fetch_add(1, Ordering::Relaxed) + 1, notifier);
                m
            })
            .collect::<Result<Vec<_>>>()?;

        self.notifier.elapsed(Phase::Miniatures, t.elapsed());
        Ok(minis)
    }

    fn load_prior(&self, minis: &[Miniature]) -> HashMap<ItemId, Option<i64>> {
        minis.iter().map(|m| (m.id(), self.source.previous_group(m.id()))).collect()
    }

    fn build_features(&self, minis: &[Miniature]) -> Result<FeatureMatrix> {
        let t = Instant::now();
        let mut durations = HashMap::with_capacity(minis.len());
        for m in minis {
            let duration = self
                .source
                .duration(m.id())
                .ok_or(SimError::MissingInput { id: m.id(), what: "duration" })?;
            durations.insert(m.id(), duration);
        }
        let features = FeatureMatrix::build(minis, &durations, self.opts.tail_len())?;
        self.notifier.elapsed(Phase::Features, t.elapsed());
        Ok(features)
    }

    fn new_flags(&self, minis: &[Miniature], full_scan: bool) -> Vec<bool> {
        if full_scan {
            return vec![true; minis.len()];
        }
        let new_ids: HashSet<ItemId> =
            self.buffer.ids().map(|ids| ids.iter().copied().collect()).unwrap_or_default();
        minis.iter().map(|m| new_ids.contains(&m.id())).collect()
    }

    fn bucket_candidates(&self, minis: &[Miniature], is_new: &[bool]) -> Vec<(u32, u32)> {
        let t = Instant::now();
        let step = ProgressStep::new(Phase::Buckets, minis.len());
        let done = AtomicUsize::new(0);
        let notifier = &*self.notifier;
        let tolerance = self.opts.region_tolerance;

        let scalars: Vec<(f64, u32)> = minis
            .par_iter()
            .map(|m| {
                let keys = (m.gray_average(), m.region_count(tolerance));
                step.tick(done.fetch_add(1, Ordering::Relaxed) + 1, notifier);
                keys
            })
            .collect();
        let gray: Vec<f64> = scalars.iter().map(|&(g, _)| g).collect();
        let regions: Vec<u32> = scalars.iter().map(|&(_, r)| r).collect();

        let bitmap = PairBitmap::new(minis.len());
        BucketScan::new(&gray, &regions, is_new).mark_candidates(
            self.opts.gray_delta(),
            self.opts.region_slack,
            &bitmap,
        );
        self.notifier.elapsed(Phase::Buckets, t.elapsed());
        bitmap.pairs()
    }

    /// 并行验证候选对，确认的对写入结果位图
    ///
    /// 工作线程数为核数减一，任务是最多 batch_size 对的无状态批次，
    /// 完成顺序无关紧要。任何任务失败都会中止整次运行；取消只在批
    /// 次边界生效。
    fn verify_pairs(&self, minis: &[Miniature], pairs: &[(u32, u32)]) -> Result<PairBitmap> {
        let result = PairBitmap::new(minis.len());
        if pairs.is_empty() {
            return Ok(result);
        }

        let t = Instant::now();
        let workers = num_cpus::get().saturating_sub(1).max(1);
        let step = ProgressStep::new(Phase::Compare, pairs.len());
        let done = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let failure: Mutex<Option<String>> = Mutex::new(None);
        let sim_limit = self.opts.sim_limit;
        let backend = &*self.backend;
        let notifier = &*self.notifier;
        let cancel = &self.cancel;

        let (tx, rx) = bounded::<&[(u32, u32)]>(workers * 2);

        std::thread::scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                let result = &result;
                let done = &done;
                let abort = &abort;
                let failure = &failure;
                let step = &step;
                s.spawn(move || {
                    while let Ok(batch) = rx.recv() {
                        let outcome = catch_unwind(AssertUnwindSafe(|| {
                            backend.compare_batch(minis, batch, sim_limit, result)
                        }));
                        match outcome {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => {
                                failure.lock().unwrap().get_or_insert(e.to_string());
                                abort.store(true, Ordering::Relaxed);
                                return;
                            }
                            Err(_) => {
                                failure.lock().unwrap().get_or_insert("worker panicked".into());
                                abort.store(true, Ordering::Relaxed);
                                return;
                            }
                        }
                        let n = done.fetch_add(batch.len(), Ordering::Relaxed) + batch.len();
                        step.tick_batch(n, batch.len(), notifier);
                    }
                });
            }
            // 工作线程全部退出后通道必须断开，否则失败时阻塞在
            // send 上的投喂端会永远挂住
            drop(rx);

            for batch in pairs.chunks(self.opts.batch_size) {
                if abort.load(Ordering::Relaxed) || cancel.is_cancelled() {
                    break;
                }
                if tx.send(batch).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        if let Some(e) = failure.into_inner().unwrap() {
            return Err(SimError::ComparisonWorkerFailure(e));
        }
        if cancel.is_cancelled() {
            return Err(SimError::Cancelled);
        }
        self.notifier.elapsed(Phase::Compare, t.elapsed());
        Ok(result)
    }
}

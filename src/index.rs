use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::marker::PhantomData;

use log::debug;
use rand::prelude::*;
use smallvec::SmallVec;

use crate::config::{CandidatePolicy, SimOptions};
use crate::features::FeatureMatrix;

/// 近似索引使用的向量距离
pub trait VectorMetric: Send + Sync {
    const NAME: &'static str;
    fn dist(a: &[f32], b: &[f32]) -> f32;
}

/// 角度距离 1 - cos，对亮度整体缩放不敏感
pub struct Angular;

impl VectorMetric for Angular {
    const NAME: &'static str = "angular";

    fn dist(a: &[f32], b: &[f32]) -> f32 {
        let mut dot = 0.0;
        let mut na = 0.0;
        let mut nb = 0.0;
        for (&x, &y) in a.iter().zip(b) {
            dot += x * y;
            na += x * x;
            nb += y * y;
        }
        let norm = (na * nb).sqrt();
        if norm == 0.0 { 1.0 } else { 1.0 - dot / norm }
    }
}

/// 欧氏距离
pub struct Euclidean;

impl VectorMetric for Euclidean {
    const NAME: &'static str = "euclidean";

    fn dist(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(&x, &y)| (x - y) * (x - y)).sum::<f32>().sqrt()
    }
}

/// 堆元素，距离相同按节点编号比较，保证遍历顺序全序可复现
#[derive(PartialEq)]
struct DistNode {
    dist: f32,
    node: u32,
}

impl Eq for DistNode {}

impl Ord for DistNode {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist.total_cmp(&other.dist).then(self.node.cmp(&other.node))
    }
}

impl PartialOrd for DistNode {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

const M: usize = 16;
const EF_CONSTRUCTION: usize = 128;
const EF_SEARCH: usize = 64;

/// 固定种子的 HNSW 索引
///
/// 层级由种子化的 StdRng 决定，插入顺序即特征矩阵行序，堆内平局按
/// 节点编号打破，因此同一份数据和种子总是产出同一张图 —— 角度度量
/// 下候选集的可复现性依赖这一点。构建 O(n log n)，查询 O(n * K)。
pub struct HnswIndex<'a, M0: VectorMetric> {
    features: &'a FeatureMatrix,
    /// neighbors[node][level]
    neighbors: Vec<Vec<SmallVec<[u32; M]>>>,
    entry: Option<u32>,
    max_level: usize,
    level_mult: f64,
    rng: StdRng,
    _metric: PhantomData<M0>,
}

impl<'a, M0: VectorMetric> HnswIndex<'a, M0> {
    /// 建库：按行序插入全部特征向量
    pub fn build(features: &'a FeatureMatrix, seed: u64) -> Self {
        let mut index = Self {
            features,
            neighbors: Vec::with_capacity(features.len()),
            entry: None,
            max_level: 0,
            level_mult: 1.0 / (M as f64).ln(),
            rng: StdRng::seed_from_u64(seed),
            _metric: PhantomData,
        };
        for node in 0..features.len() as u32 {
            index.insert(node);
        }
        debug!("built {} hnsw index: {} vectors", M0::NAME, features.len());
        index
    }

    fn dist(&self, a: u32, b: u32) -> f32 {
        M0::dist(self.features.row_slice(a as usize), self.features.row_slice(b as usize))
    }

    fn random_level(&mut self) -> usize {
        let r: f64 = self.rng.random();
        // r 属于 [0,1)，避免 ln(0)
        (-(1.0 - r).ln() * self.level_mult) as usize
    }

    fn insert(&mut self, node: u32) {
        let level = self.random_level();
        self.neighbors.push(vec![SmallVec::new(); level + 1]);

        let Some(entry) = self.entry else {
            self.entry = Some(node);
            self.max_level = level;
            return;
        };

        // 上层贪心下降到目标层
        let mut ep = entry;
        for l in (level + 1..=self.max_level).rev() {
            ep = self.greedy_closest(node, ep, l);
        }

        for l in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(node, &[ep], l, EF_CONSTRUCTION);
            let selected: SmallVec<[u32; M]> =
                found.iter().take(M).map(|n| n.node).collect();

            for &peer in &selected {
                self.neighbors[node as usize][l].push(peer);
                self.neighbors[peer as usize][l].push(node);
                let cap = if l == 0 { M * 2 } else { M };
                if self.neighbors[peer as usize][l].len() > cap {
                    self.prune(peer, l, cap);
                }
            }
            if let Some(nearest) = found.first() {
                ep = nearest.node;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry = Some(node);
        }
    }

    /// 邻居超过容量时保留距离最近的 cap 个
    fn prune(&mut self, node: u32, level: usize, cap: usize) {
        let mut list: Vec<DistNode> = self.neighbors[node as usize][level]
            .iter()
            .map(|&peer| DistNode { dist: self.dist(node, peer), node: peer })
            .collect();
        list.sort_unstable();
        list.dedup_by_key(|n| n.node);
        self.neighbors[node as usize][level] = list.into_iter().take(cap).map(|n| n.node).collect();
    }

    fn greedy_closest(&self, query: u32, mut ep: u32, level: usize) -> u32 {
        let mut best = self.dist(query, ep);
        loop {
            let mut improved = false;
            for &peer in &self.neighbors[ep as usize][level] {
                let d = self.dist(query, peer);
                if d < best || (d == best && peer < ep) {
                    best = d;
                    ep = peer;
                    improved = true;
                }
            }
            if !improved {
                return ep;
            }
        }
    }

    /// 单层束搜索，返回按距离升序的至多 ef 个节点
    fn search_layer(&self, query: u32, eps: &[u32], level: usize, ef: usize) -> Vec<DistNode> {
        let mut visited = vec![false; self.neighbors.len()];
        let mut candidates = BinaryHeap::new();
        let mut results: BinaryHeap<DistNode> = BinaryHeap::new();

        for &ep in eps {
            if visited[ep as usize] {
                continue;
            }
            visited[ep as usize] = true;
            let d = self.dist(query, ep);
            candidates.push(Reverse(DistNode { dist: d, node: ep }));
            results.push(DistNode { dist: d, node: ep });
        }

        while let Some(Reverse(closest)) = candidates.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |n| n.dist);
            if closest.dist > worst && results.len() >= ef {
                break;
            }
            for &peer in &self.neighbors[closest.node as usize][level] {
                if visited[peer as usize] {
                    continue;
                }
                visited[peer as usize] = true;
                let d = self.dist(query, peer);
                if results.len() < ef || d < results.peek().unwrap().dist {
                    candidates.push(Reverse(DistNode { dist: d, node: peer }));
                    results.push(DistNode { dist: d, node: peer });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out = results.into_vec();
        out.sort_unstable();
        out
    }

    /// 查询 k 个近邻及距离，不含查询点自身
    pub fn search(&self, node: u32, k: usize) -> Vec<(u32, f32)> {
        let Some(entry) = self.entry else {
            return vec![];
        };
        let mut ep = entry;
        for l in (1..=self.max_level).rev() {
            ep = self.greedy_closest(node, ep, l);
        }
        self.search_layer(node, &[ep], 0, EF_SEARCH.max(k + 1))
            .into_iter()
            .filter(|n| n.node != node)
            .take(k)
            .map(|n| (n.node, n.dist))
            .collect()
    }
}

/// 单个条目的候选邻居集合
type NeighborSet = SmallVec<[u32; 16]>;

fn query_pass<M0: VectorMetric>(
    features: &FeatureMatrix,
    seed: u64,
    knn: usize,
    cutoff: f32,
) -> Vec<NeighborSet> {
    let index = HnswIndex::<M0>::build(features, seed);
    (0..features.len() as u32)
        .map(|node| {
            index
                .search(node, knn)
                .into_iter()
                .filter(|&(_, d)| d <= cutoff)
                .map(|(peer, _)| peer)
                .collect()
        })
        .collect()
}

/// 近似候选生成：角度与欧氏两遍独立查询，按策略合并
///
/// 索引单独产出的边不保证对称，这里把两个方向的结果并在一起后去重；
/// 旧×旧的对被直接丢弃。返回的对满足 i < j，升序排列。
pub fn candidate_pairs(
    features: &FeatureMatrix,
    is_new: &[bool],
    opts: &SimOptions,
) -> Vec<(u32, u32)> {
    let dim = features.dim() as f32;
    let angular_cutoff = opts.angular_norm * (1.0 - opts.sim_limit) as f32;
    let euclidean_cutoff =
        opts.euclidean_norm * (1.0 - opts.sim_limit) as f32 * 255.0 * dim.sqrt();

    let by_angle = query_pass::<Angular>(features, opts.seed, opts.knn, angular_cutoff);
    let by_dist = query_pass::<Euclidean>(features, opts.seed, opts.knn, euclidean_cutoff);

    let mut pairs = Vec::new();
    for i in 0..features.len() {
        let mut set: NeighborSet = match opts.policy {
            CandidatePolicy::Intersection => by_angle[i]
                .iter()
                .copied()
                .filter(|peer| by_dist[i].contains(peer))
                .collect(),
            CandidatePolicy::Union => {
                let mut set = by_angle[i].clone();
                for &peer in &by_dist[i] {
                    if !set.contains(&peer) {
                        set.push(peer);
                    }
                }
                set
            }
        };
        set.retain(|&mut peer| is_new[i] || is_new[peer as usize]);
        for peer in set {
            let (a, b) = if (i as u32) < peer { (i as u32, peer) } else { (peer, i as u32) };
            pairs.push((a, b));
        }
    }
    pairs.sort_unstable();
    pairs.dedup();
    debug!("approximate candidates: {} pairs", pairs.len());
    pairs
}

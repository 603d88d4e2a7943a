use crate::bitmap::PairBitmap;

/// 全量扫描用的分桶穷举比较器
///
/// 近似索引只保证召回，首次全量建库需要完备性：在剪枝假设成立的前提
/// 下，任何可能相似的对都必须进入验证阶段。做法是把条目按灰度平均值
/// 排序，只比较灰度差不超过 Δ 的滑动窗口内的对，窗口内再用均匀区域
/// 数量差二次剪枝。新×新与新×旧使用同一套窗口邻接生成，旧×旧永远
/// 不会重新比较，因此增量重扫的代价只与新增量相关。
pub struct BucketScan<'a> {
    gray: &'a [f64],
    regions: &'a [u32],
    is_new: &'a [bool],
}

impl<'a> BucketScan<'a> {
    pub fn new(gray: &'a [f64], regions: &'a [u32], is_new: &'a [bool]) -> Self {
        assert_eq!(gray.len(), regions.len());
        assert_eq!(gray.len(), is_new.len());
        Self { gray, regions, is_new }
    }

    /// 排序后的条目下标，灰度相同按下标升序，保证全序
    fn sorted_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.gray.len()).collect();
        order.sort_unstable_by(|&a, &b| {
            self.gray[a].total_cmp(&self.gray[b]).then(a.cmp(&b))
        });
        order
    }

    /// 把通过剪枝的候选对标记进位图
    ///
    /// O(n * w)，w 为平均窗口宽度。`gray_delta` 与 `region_slack`
    /// 是经验参数，见 SimOptions。
    pub fn mark_candidates(&self, gray_delta: f64, region_slack: u32, out: &PairBitmap) {
        let order = self.sorted_order();
        for a in 0..order.len() {
            let ia = order[a];
            for &ib in &order[a + 1..] {
                if self.gray[ib] - self.gray[ia] > gray_delta {
                    break;
                }
                if !self.is_new[ia] && !self.is_new[ib] {
                    continue;
                }
                if self.regions[ia].abs_diff(self.regions[ib]) > region_slack {
                    continue;
                }
                out.mark(ia, ib);
            }
        }
    }

    /// 不剪枝的全对版本，小输入上验证剪枝等价性的基准
    ///
    /// 仍然跳过旧×旧。
    pub fn mark_all_pairs(&self, out: &PairBitmap) {
        for a in 0..self.gray.len() {
            for b in a + 1..self.gray.len() {
                if self.is_new[a] || self.is_new[b] {
                    out.mark(a, b);
                }
            }
        }
    }
}

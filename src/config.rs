use serde::{Deserialize, Serialize};

/// 两遍近似索引查询结果的合并策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidatePolicy {
    /// 取角度与欧氏两遍邻居集合的交集（更严格，默认值）
    Intersection,
    /// 取并集（召回更高，验证开销更大）
    Union,
}

/// 像素度量的执行后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// 启动时探测能力，自动选择最快的可用后端
    Auto,
    /// 逐像素标量参考实现，测试基准
    Scalar,
    /// 缓冲批处理实现
    Batch,
    /// AVX2 原生实现，仅 x86_64
    Avx2,
}

/// 相似度检测的全部可调参数
///
/// `region_slack` 与 `gray_delta` 为经验值，没有推导过程，因此保留为
/// 参数而不是常量。修改任何参数后，缓存的特征向量和桶索引都必须失效。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimOptions {
    /// 相似度阈值，得分大于等于该值的一对视为同一画面
    pub sim_limit: f64,
    /// 缩略图统一缩放到的宽度
    pub width: usize,
    /// 缩略图统一缩放到的高度
    pub height: usize,
    /// 特征向量尾部重复时长权重的个数 K，0 表示按像素数自动推导
    pub tail_len: usize,
    /// 判定相邻像素属于同一均匀区域的曼哈顿距离容差
    pub region_tolerance: u32,
    /// 同一灰度桶内允许的均匀区域数量差
    pub region_slack: u32,
    /// 灰度桶宽度，None 时取 255 * (1 - sim_limit)
    pub gray_delta: Option<f64>,
    /// 近似索引的随机种子，角度度量下的确定性依赖它
    pub seed: u64,
    /// 每个条目查询的近邻数量
    pub knn: usize,
    /// 角度距离截断的经验归一化系数
    pub angular_norm: f32,
    /// 欧氏距离截断的经验归一化系数
    pub euclidean_norm: f32,
    /// 两遍索引结果的合并策略
    pub policy: CandidatePolicy,
    /// 度量后端
    pub backend: BackendKind,
    /// 比较任务单批的最大对数
    pub batch_size: usize,
    /// 新条目缓冲区容量，超出后退化为全量重扫
    pub buffer_capacity: usize,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            sim_limit: 0.9,
            width: 32,
            height: 32,
            tail_len: 0,
            region_tolerance: 20,
            region_slack: 40,
            gray_delta: None,
            seed: 0x5eed,
            knn: 10,
            angular_norm: 2.0,
            euclidean_norm: 1.0,
            policy: CandidatePolicy::Intersection,
            backend: BackendKind::Auto,
            batch_size: 2000,
            buffer_capacity: 1000,
        }
    }
}

impl SimOptions {
    /// 实际使用的灰度桶宽度
    pub fn gray_delta(&self) -> f64 {
        self.gray_delta.unwrap_or(255.0 * (1.0 - self.sim_limit))
    }

    /// 实际使用的时长权重个数
    ///
    /// 默认让 K 随像素数等比缩放，32x32 时为 64。
    pub fn tail_len(&self) -> usize {
        if self.tail_len != 0 { self.tail_len } else { 3 * self.width * self.height / 48 }
    }

    /// 特征向量维度 3 * W * H + K
    pub fn feature_dim(&self) -> usize {
        3 * self.width * self.height + self.tail_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_gray_delta() {
        let opts = SimOptions::default();
        assert!((opts.gray_delta() - 25.5).abs() < 1e-9);
        let opts = SimOptions { gray_delta: Some(10.0), ..Default::default() };
        assert_eq!(opts.gray_delta(), 10.0);
    }

    #[test]
    fn test_feature_dim() {
        let opts = SimOptions::default();
        assert_eq!(opts.tail_len(), 64);
        assert_eq!(opts.feature_dim(), 3 * 32 * 32 + 64);

        let opts = SimOptions { width: 6, height: 7, tail_len: 2, ..Default::default() };
        assert_eq!(opts.feature_dim(), 3 * 42 + 2);
    }
}

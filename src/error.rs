use thiserror::Error;

use crate::miniature::ItemId;

pub type Result<T, E = SimError> = std::result::Result<T, E>;

/// 相似度流水线的错误类型
///
/// 除 `BackendUnavailable` 外全部是致命错误：一旦出现，本次运行不会产生
/// 任何可持久化的分组结果，调用方保留之前的分组不变。
#[derive(Debug, Error)]
pub enum SimError {
    /// 引用的条目缺少必要输入（缩略图或时长）
    #[error("item {id} is missing required input: {what}")]
    MissingInput { id: ItemId, what: &'static str },

    /// 显式请求的度量后端在当前机器上不可用
    ///
    /// 只有显式指定后端时才会返回该错误；`Auto` 模式下会静默回退并记录
    /// 一次日志。
    #[error("metric backend `{0}` is unavailable on this machine")]
    BackendUnavailable(&'static str),

    /// 特征向量维度不一致
    #[error("feature dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    /// 并行比较任务失败，整次运行中止
    #[error("comparison worker failed: {0}")]
    ComparisonWorkerFailure(String),

    /// 运行在批次边界处被取消
    #[error("run cancelled")]
    Cancelled,
}

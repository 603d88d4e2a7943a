//! 视频缩略图的近重复检测
//!
//! 流水线分六个阶段：缩略图归一化、特征提取、候选对生成（近似索引
//! 或全量分桶扫描）、像素级相似度验证、连通分量聚类、与历史分组 id
//! 对账。核心不做任何 I/O，缩略图和时长由 [`MediaSource`] 提供，
//! 结果映射交还调用方持久化。
//!
//! ```no_run
//! use vidsim::{MemorySource, SimOptions, SimilarityPipeline, Thumbnail};
//!
//! let mut source = MemorySource::new();
//! source.add(1, Thumbnail { width: 160, height: 90, rgb: vec![0; 160 * 90 * 3] }, 60.0);
//! let mut pipeline = SimilarityPipeline::new(&source, SimOptions::default())?;
//! let groups = pipeline.run()?;
//! # Ok::<(), vidsim::SimError>(())
//! ```

pub mod bitmap;
pub mod buckets;
pub mod config;
pub mod error;
pub mod features;
pub mod graph;
pub mod index;
pub mod merge;
pub mod metric;
pub mod miniature;
pub mod notify;
pub mod pipeline;

pub use config::{BackendKind, CandidatePolicy, SimOptions};
pub use error::{Result, SimError};
pub use graph::SimilarityGraph;
pub use merge::merge_groups;
pub use metric::{select_backend, MetricBackend};
pub use miniature::{ItemId, Miniature, Thumbnail};
pub use notify::{LogNotifier, Notifier, NullNotifier, Phase, ProgressBarNotifier};
pub use pipeline::{CancelToken, MediaSource, MemorySource, SimilarityPipeline};

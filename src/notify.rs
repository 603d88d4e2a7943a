use std::fmt;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};

/// 流水线阶段，进度与计时事件都按阶段上报
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Miniatures,
    Features,
    Index,
    Buckets,
    Compare,
    Cluster,
    Merge,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Miniatures => "miniatures",
            Phase::Features => "features",
            Phase::Index => "index",
            Phase::Buckets => "buckets",
            Phase::Compare => "compare",
            Phase::Cluster => "cluster",
            Phase::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// 外部提供的通知接收端
///
/// 发射后不管：任何阶段都不会阻塞等待通知送达，实现方不应该在回调
/// 里做慢操作。进度通知的频率由流水线限制（见 ProgressStep）。
pub trait Notifier: Send + Sync {
    fn progress(&self, _phase: Phase, _done: usize, _total: usize) {}
    fn elapsed(&self, _phase: Phase, _elapsed: Duration) {}
}

/// 丢弃全部事件
pub struct NullNotifier;

impl Notifier for NullNotifier {}

/// 写进日志的实现
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn progress(&self, phase: Phase, done: usize, total: usize) {
        debug!("{phase}: {done}/{total}");
    }

    fn elapsed(&self, phase: Phase, elapsed: Duration) {
        info!("{phase} time: {:.2}s", elapsed.as_secs_f32());
    }
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template("{wide_bar} {pos}/{len} {msg} ({eta})")
        .expect("progress style template")
}

/// 终端进度条实现
pub struct ProgressBarNotifier {
    pb: ProgressBar,
}

impl ProgressBarNotifier {
    pub fn new() -> Self {
        Self { pb: ProgressBar::no_length().with_style(pb_style()) }
    }
}

impl Default for ProgressBarNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for ProgressBarNotifier {
    fn progress(&self, phase: Phase, done: usize, total: usize) {
        if self.pb.length() != Some(total as u64) {
            self.pb.set_length(total as u64);
        }
        self.pb.set_position(done as u64);
        self.pb.set_message(phase.to_string());
    }

    fn elapsed(&self, phase: Phase, elapsed: Duration) {
        self.pb.println(format!("{phase}: {:.2}s", elapsed.as_secs_f32()));
    }
}

/// 限频的进度计数器，约每 0.2% 上报一次
pub(crate) struct ProgressStep {
    phase: Phase,
    total: usize,
    step: usize,
}

impl ProgressStep {
    pub fn new(phase: Phase, total: usize) -> Self {
        Self { phase, total, step: (total / 500).max(1) }
    }

    pub fn tick(&self, done: usize, notifier: &dyn Notifier) {
        self.tick_batch(done, 1, notifier);
    }

    /// 一次推进 inc 个单位时的限频上报，批次大小与步长无关
    pub fn tick_batch(&self, done: usize, inc: usize, notifier: &dyn Notifier) {
        if done == self.total || done / self.step != done.saturating_sub(inc) / self.step {
            notifier.progress(self.phase, done, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder(Mutex<Vec<(usize, usize)>>);

    impl Notifier for Recorder {
        fn progress(&self, _phase: Phase, done: usize, total: usize) {
            self.0.lock().unwrap().push((done, total));
        }
    }

    #[test]
    fn test_progress_step_bounds_frequency() {
        let rec = Recorder(Mutex::new(vec![]));
        let step = ProgressStep::new(Phase::Compare, 10_000);
        for done in 1..=10_000 {
            step.tick(done, &rec);
        }
        let events = rec.0.lock().unwrap();
        assert_eq!(events.len(), 500);
        assert_eq!(*events.last().unwrap(), (10_000, 10_000));
    }

    #[test]
    fn test_progress_step_small_totals() {
        let rec = Recorder(Mutex::new(vec![]));
        let step = ProgressStep::new(Phase::Features, 3);
        for done in 1..=3 {
            step.tick(done, &rec);
        }
        assert_eq!(rec.0.lock().unwrap().len(), 3);
    }
}

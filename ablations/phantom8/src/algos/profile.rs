//! 算法运行统计.

use std::time::{Duration, Instant};

use tract_berry::prelude::{LengthStats, TrackingStats};

/// ablation/benchmark 计时器.
///
/// 该计时器支持 "中途中断" 与 "结束中断, 继续开始计时".
#[derive(Clone, Debug)]
struct AccTimer {
    consumed: Duration,
    since: Instant,
}

impl AccTimer {
    /// 初始化计时器. 初始化时会视为已经开始计时 (`self.start()`).
    #[inline]
    pub fn new() -> Self {
        Self {
            consumed: Duration::from_secs(0),
            since: Instant::now(),
        }
    }

    /// 开始计时.
    #[inline]
    pub fn start(&mut self) {
        self.since = Instant::now();
    }

    /// 结束计时, 并将这一区间的时间累加.
    ///
    /// # 注意
    ///
    /// 上一次调用必须是 `self.start()`, 否则计算时间值无意义.
    #[inline]
    pub fn elapsed(&mut self) {
        self.consumed += self.since.elapsed();
    }

    /// 获得总共累计下来的时间 (以微秒为单位).
    #[inline]
    pub fn get_total_us(&self) -> u64 {
        self.consumed.as_micros() as u64
    }
}

impl Default for AccTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// 一次全流程运行的统计.
#[derive(Clone, Debug, Default)]
pub struct Profile {
    /// 追踪统计.
    tracking_stats: TrackingStats,

    /// 被接受流线的长度统计.
    lengths: Option<LengthStats>,

    /// 聚类质心个数.
    clusters: usize,

    /// 去噪后被标注的体素个数.
    labeled: usize,

    /// tractometry 分区个数.
    bins: usize,

    /// 追踪耗时.
    tracking: AccTimer,

    /// 聚类 + 分区 + tractometry 耗时.
    analysis: AccTimer,

    /// 全部耗时 (包括输出).
    real_time: AccTimer,
}

impl Profile {
    /// 初始化.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始追踪计时.
    #[inline]
    pub fn tracking_start(&mut self) {
        self.tracking.start();
    }

    /// 结束追踪计时.
    #[inline]
    pub fn tracking_elapsed(&mut self) {
        self.tracking.elapsed();
    }

    /// 开始分析计时.
    #[inline]
    pub fn analysis_start(&mut self) {
        self.analysis.start();
    }

    /// 结束分析计时.
    #[inline]
    pub fn analysis_elapsed(&mut self) {
        self.analysis.elapsed();
    }

    /// 记录追踪统计.
    pub fn record_tracking(&mut self, stats: &TrackingStats) {
        self.tracking_stats = *stats;
    }

    /// 记录长度统计.
    pub fn record_lengths(&mut self, lengths: Option<LengthStats>) {
        self.lengths = lengths;
    }

    /// 记录分析结果.
    pub fn record_analysis(&mut self, clusters: usize, labeled: usize, bins: usize) {
        self.clusters = clusters;
        self.labeled = labeled;
        self.bins = bins;
    }

    /// 结束全部计时.
    #[inline]
    pub fn finish(mut self) -> Self {
        self.real_time.elapsed();
        self
    }

    /// 追踪统计.
    #[inline]
    pub fn get_tracking_stats(&self) -> &TrackingStats {
        &self.tracking_stats
    }

    /// 长度统计.
    #[inline]
    pub fn get_lengths(&self) -> Option<&LengthStats> {
        self.lengths.as_ref()
    }

    /// 聚类质心个数.
    #[inline]
    pub fn get_clusters(&self) -> usize {
        self.clusters
    }

    /// 被标注的体素个数.
    #[inline]
    pub fn get_labeled(&self) -> usize {
        self.labeled
    }

    /// tractometry 分区个数.
    #[inline]
    pub fn get_bins(&self) -> usize {
        self.bins
    }

    /// 以微秒为单位获得追踪耗时.
    #[inline]
    pub fn get_tracking_time_us(&self) -> u64 {
        self.tracking.get_total_us()
    }

    /// 以微秒为单位获得分析耗时.
    #[inline]
    pub fn get_analysis_time_us(&self) -> u64 {
        self.analysis.get_total_us()
    }

    /// 以微秒为单位获得总耗时.
    #[inline]
    pub fn get_real_time_us(&self) -> u64 {
        self.real_time.get_total_us()
    }

    /// 每个种子的平均追踪耗时 (微秒).
    pub fn get_avg_seed_time_us(&self) -> Option<f64> {
        match self.tracking_stats.seeds {
            0 => None,
            seeds => Some(self.get_tracking_time_us() as f64 / seeds as f64),
        }
    }
}

//! 通用常量.

/// 标签图像中背景的体素值.
pub const BACKGROUND: u8 = 0;

/// ROI/掩膜体素值大于该值时, 视为 "在区域内".
pub const ROI_THRESHOLD: f32 = 0.5;

/// 追踪相关常量.
pub mod tracking {
    /// 默认角度阈值的下限 (度).
    pub const MIN_ANGULAR_THRESHOLD_DEG: f64 = 15.0;

    /// 默认角度阈值与步长 (体素) 的比例系数 (度/体素).
    pub const ANGULAR_THRESHOLD_PER_VOXEL_DEG: f64 = 90.0;

    /// 环路检测窗口覆盖的路径长度 (体素).
    pub const LOOP_WINDOW_VOXELS: f64 = 4.0;

    /// 环路检测窗口的最少方向个数.
    pub const MIN_LOOP_WINDOW: usize = 4;

    /// 每积分这么多步检查一次中止信号.
    pub const ABORT_POLL_STEPS: usize = 64;

    /// 概率追踪中, 抖动方向超出角度阈值时的最多重抽次数.
    pub const JITTER_RETRIES: usize = 16;

    /// 并行追踪时每批处理的种子个数.
    pub const SEED_BATCH: usize = 2048;

    /// 单个半流线的最大步数. 用于兜底, 正常情况下由最大长度先行截断.
    pub const MAX_STEPS_PER_HALF: usize = 1 << 20;
}

/// 聚类相关常量.
pub mod clustering {
    /// 外层阈值迭代的最大轮数.
    pub const MAX_ITERATIONS: usize = 30;

    /// 默认的纤维重采样点数.
    pub const DEFAULT_NUM_POINTS: usize = 12;
}

/// 分区相关常量.
pub mod parcellation {
    /// 多数投票后处理的轮数.
    pub const POSTPROCESS_PASSES: usize = 3;

    /// 分区个数上限 (标签以 `u8` 保存, 0 为背景).
    pub const MAX_PARCELS: usize = u8::MAX as usize;
}

//! 追踪参数.

use std::fmt;
use std::str::FromStr;

use super::ConfigError;
use crate::consts::tracking::*;
use crate::direction::Flip;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 追踪模式.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Mode {
    /// 确定性: 每个种子只追踪一次, 取最佳候选方向.
    #[default]
    Deterministic,

    /// 概率性: 按权重随机抽取候选方向, 可多次尝试.
    Probabilistic,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deterministic" | "det" => Ok(Self::Deterministic),
            "probabilistic" | "prob" => Ok(Self::Probabilistic),
            _ => Err(ConfigError::UnsupportedType("tracking mode", s.to_owned())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deterministic => "deterministic",
            Self::Probabilistic => "probabilistic",
        })
    }
}

/// 端点约束. 在流线结束后对两个端点统一评估.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EpConstraint {
    /// 不约束.
    #[default]
    None,

    /// 两个端点都在目标区域内.
    EpsInTarget,

    /// 两个端点都在目标区域内, 且目标标签不同.
    EpsInTargetLabelDiff,

    /// 一个端点在种子区域内, 另一个在目标区域内.
    EpsInSeedAndTarget,

    /// 至少一个端点在目标区域内.
    MinOneEpInTarget,

    /// 恰好一个端点在目标区域内.
    OneEpInTarget,

    /// 没有端点在目标区域内.
    NoEpInTarget,
}

impl EpConstraint {
    /// 是否需要目标图像.
    #[inline]
    pub fn needs_target(&self) -> bool {
        *self != Self::None
    }
}

impl FromStr for EpConstraint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.to_ascii_uppercase().replace('-', "_");
        match t.as_str() {
            "NONE" => Ok(Self::None),
            "EPS_IN_TARGET" => Ok(Self::EpsInTarget),
            "EPS_IN_TARGET_LABELDIFF" => Ok(Self::EpsInTargetLabelDiff),
            "EPS_IN_SEED_AND_TARGET" => Ok(Self::EpsInSeedAndTarget),
            "MIN_ONE_EP_IN_TARGET" => Ok(Self::MinOneEpInTarget),
            "ONE_EP_IN_TARGET" => Ok(Self::OneEpInTarget),
            "NO_EP_IN_TARGET" => Ok(Self::NoEpInTarget),
            _ => Err(ConfigError::UnsupportedType("endpoint constraint", s.to_owned())),
        }
    }
}

/// 追踪参数. 由调用方构建后以引用传给追踪器, 追踪器不会修改它.
///
/// 长度单位为毫米, 步长与采样距离以体素 (最小体素间距) 为单位.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrackingParams {
    /// 追踪模式.
    pub mode: Mode,

    /// 每个种子体素产生的种子点个数.
    pub seeds_per_voxel: usize,

    /// 概率模式下每个种子的最大尝试次数.
    pub trials_per_seed: usize,

    /// 接受的流线数达到该值后提前结束. 负数表示不限.
    pub max_num_fibers: i64,

    /// 数据阈值 (峰值幅值 / FA / GFA / 森林置信度).
    pub cutoff: f64,

    /// 概率模式下参与抽样的候选权重阈值; 同时作为 ODF 极大值阈值.
    pub odf_cutoff: f64,

    /// 步长 (体素).
    pub step_size_vox: f64,

    /// 邻域采样距离 (体素).
    pub sampling_distance_vox: f64,

    /// 额外的邻域采样点个数.
    pub num_neighborhood_samples: usize,

    /// 最小流线长度 (毫米).
    pub min_tract_length_mm: f64,

    /// 最大流线长度 (毫米).
    pub max_tract_length_mm: f64,

    /// 角度阈值 (度). `None` 时取 `max(15°, 90°·step_size_vox)`, 不超过 90°.
    pub angular_threshold_deg: Option<f64>,

    /// 环路检测阈值 (度). `None` 时不检测.
    pub loop_check_deg: Option<f64>,

    /// 概率模式下的方向抖动幅度.
    pub peak_jitter: f64,

    /// 使用二阶 (中点) 积分.
    pub second_order: bool,

    /// 数据方向的翻转.
    pub flip: Flip,

    /// 先验方向的翻转.
    pub prior_flip: Flip,

    /// 先验方向的权重, `[0, 1]`.
    pub prior_weight: f64,

    /// 先验无方向处停止追踪.
    pub restrict_to_prior: bool,

    /// 数据无方向处使用先验方向.
    pub new_directions_from_prior: bool,

    /// 端点约束.
    pub ep_constraint: EpConstraint,

    /// 追踪完成后压缩流线.
    pub compress_fibers: bool,

    /// 压缩允许的最大误差 (毫米).
    pub compression_error: f64,

    /// 固定随机种子, 使结果可复现.
    pub fix_random_seed: bool,

    /// 固定随机种子时使用的种子值.
    pub random_seed: u64,

    /// 对方向数据做三线性插值.
    pub interpolate_data: bool,

    /// 对掩膜/ROI 做三线性插值.
    pub interpolate_masks: bool,

    /// 输出概率图而非纤维束.
    pub output_prob_map: bool,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            mode: Mode::Deterministic,
            seeds_per_voxel: 1,
            trials_per_seed: 10,
            max_num_fibers: -1,
            cutoff: 0.1,
            odf_cutoff: 0.1,
            step_size_vox: 0.5,
            sampling_distance_vox: 0.25,
            num_neighborhood_samples: 0,
            min_tract_length_mm: 20.0,
            max_tract_length_mm: 400.0,
            angular_threshold_deg: None,
            loop_check_deg: None,
            peak_jitter: 0.01,
            second_order: true,
            flip: Flip::default(),
            prior_flip: Flip::default(),
            prior_weight: 0.5,
            restrict_to_prior: false,
            new_directions_from_prior: false,
            ep_constraint: EpConstraint::None,
            compress_fibers: false,
            compression_error: 0.1,
            fix_random_seed: false,
            random_seed: 0,
            interpolate_data: true,
            interpolate_masks: true,
            output_prob_map: false,
        }
    }
}

impl TrackingParams {
    /// 检查参数取值.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::invalid(name, format!("{v} must be > 0")))
            }
        };
        positive("step_size_vox", self.step_size_vox)?;
        positive("max_tract_length_mm", self.max_tract_length_mm)?;
        if self.seeds_per_voxel == 0 {
            return Err(ConfigError::invalid("seeds_per_voxel", "must be > 0"));
        }
        if self.trials_per_seed == 0 {
            return Err(ConfigError::invalid("trials_per_seed", "must be > 0"));
        }
        if !(self.min_tract_length_mm >= 0.0) {
            return Err(ConfigError::invalid("min_tract_length_mm", "must be >= 0"));
        }
        if self.min_tract_length_mm > self.max_tract_length_mm {
            return Err(ConfigError::invalid(
                "min_tract_length_mm",
                format!(
                    "{} exceeds max_tract_length_mm {}",
                    self.min_tract_length_mm, self.max_tract_length_mm
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.prior_weight) {
            return Err(ConfigError::invalid(
                "prior_weight",
                format!("{} not in [0, 1]", self.prior_weight),
            ));
        }
        if let Some(a) = self.angular_threshold_deg {
            if !(0.0..=180.0).contains(&a) {
                return Err(ConfigError::invalid(
                    "angular_threshold_deg",
                    format!("{a} not in [0, 180]"),
                ));
            }
        }
        if let Some(a) = self.loop_check_deg {
            if !(a >= 0.0) {
                return Err(ConfigError::invalid("loop_check_deg", "must be >= 0"));
            }
        }
        if self.num_neighborhood_samples > 0 {
            positive("sampling_distance_vox", self.sampling_distance_vox)?;
        }
        if !(self.peak_jitter >= 0.0) {
            return Err(ConfigError::invalid("peak_jitter", "must be >= 0"));
        }
        if self.compress_fibers {
            positive("compression_error", self.compression_error)?;
        }
        Ok(())
    }

    /// 实际使用的角度阈值 (度).
    pub fn effective_angular_threshold_deg(&self) -> f64 {
        self.angular_threshold_deg.unwrap_or_else(|| {
            (ANGULAR_THRESHOLD_PER_VOXEL_DEG * self.step_size_vox)
                .max(MIN_ANGULAR_THRESHOLD_DEG)
                .min(90.0)
        })
    }

    /// 环路检测窗口的方向个数.
    pub fn loop_window(&self) -> usize {
        ((LOOP_WINDOW_VOXELS / self.step_size_vox).round() as usize).max(MIN_LOOP_WINDOW)
    }

    /// 设置模式.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// 设置步长 (体素).
    pub fn with_step_size_vox(mut self, step: f64) -> Self {
        self.step_size_vox = step;
        self
    }

    /// 设置长度范围 (毫米).
    pub fn with_length_range(mut self, min_mm: f64, max_mm: f64) -> Self {
        self.min_tract_length_mm = min_mm;
        self.max_tract_length_mm = max_mm;
        self
    }

    /// 设置每个种子体素的种子个数.
    pub fn with_seeds_per_voxel(mut self, n: usize) -> Self {
        self.seeds_per_voxel = n;
        self
    }

    /// 设置角度阈值 (度).
    pub fn with_angular_threshold_deg(mut self, deg: f64) -> Self {
        self.angular_threshold_deg = Some(deg);
        self
    }

    /// 设置端点约束.
    pub fn with_ep_constraint(mut self, ep: EpConstraint) -> Self {
        self.ep_constraint = ep;
        self
    }

    /// 设置接受流线数上限.
    pub fn with_max_num_fibers(mut self, n: i64) -> Self {
        self.max_num_fibers = n;
        self
    }

    /// 固定随机种子.
    pub fn with_fixed_seed(mut self, seed: u64) -> Self {
        self.fix_random_seed = true;
        self.random_seed = seed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let p = TrackingParams::default();
        assert!(p.validate().is_ok());
        assert_eq!(p.effective_angular_threshold_deg(), 45.0);
        assert_eq!(p.loop_window(), 8);
    }

    #[test]
    fn test_angular_threshold_formula() {
        let p = TrackingParams::default().with_step_size_vox(0.1);
        assert_eq!(p.effective_angular_threshold_deg(), 15.0);
        let p = TrackingParams::default().with_step_size_vox(2.0);
        assert_eq!(p.effective_angular_threshold_deg(), 90.0);
        assert_eq!(p.loop_window(), 4);
        let p = p.with_angular_threshold_deg(0.0);
        assert_eq!(p.effective_angular_threshold_deg(), 0.0);
    }

    #[test]
    fn test_validate_rejects() {
        let p = TrackingParams::default().with_length_range(50.0, 10.0);
        assert!(matches!(
            p.validate(),
            Err(ConfigError::InvalidParameter {
                name: "min_tract_length_mm",
                ..
            })
        ));
        let p = TrackingParams {
            prior_weight: 1.5,
            ..Default::default()
        };
        assert!(p.validate().is_err());
        let p = TrackingParams::default().with_step_size_vox(0.0);
        assert!(p.validate().is_err());
        let p = TrackingParams::default().with_seeds_per_voxel(0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!("prob".parse::<Mode>().unwrap(), Mode::Probabilistic);
        assert_eq!(
            "eps_in_target_labeldiff".parse::<EpConstraint>().unwrap(),
            EpConstraint::EpsInTargetLabelDiff
        );
        assert_eq!(
            "MIN-ONE-EP-IN-TARGET".parse::<EpConstraint>().unwrap(),
            EpConstraint::MinOneEpInTarget
        );
        assert!("EPS_SOMEWHERE".parse::<EpConstraint>().is_err());
    }
}

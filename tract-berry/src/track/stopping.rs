//! 停止策略: 掩膜, 停止区域, 排除区域, 数据阈值与端点约束.

use super::{ConfigError, EpConstraint};
use crate::consts::ROI_THRESHOLD;
use crate::direction::DirectionModel;
use crate::{Geometry, GeometryAttr, ScalarImage, Vec3};

/// 单点判定结果.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// 继续追踪.
    Continue,

    /// 停止, 保留已追踪的部分.
    Stop,

    /// 丢弃整条流线.
    Discard,
}

/// 停止策略. 所有区域图像只读, 判定是当前点的纯函数.
#[derive(Debug, Clone, Default)]
pub struct StoppingPolicy {
    mask: Option<ScalarImage>,
    stop: Option<ScalarImage>,
    exclusion: Option<ScalarImage>,
    target: Option<ScalarImage>,
    ep_constraint: EpConstraint,
    cutoff: f64,
    interpolate_masks: bool,
    interpolate_data: bool,
}

impl StoppingPolicy {
    /// 空策略: 只在越界时停止.
    pub fn new() -> Self {
        Self {
            interpolate_masks: true,
            interpolate_data: true,
            ..Default::default()
        }
    }

    /// 掩膜: 掩膜外停止.
    pub fn with_mask(mut self, mask: ScalarImage) -> Self {
        self.mask = Some(mask);
        self
    }

    /// 停止区域: 区域内停止.
    pub fn with_stop(mut self, stop: ScalarImage) -> Self {
        self.stop = Some(stop);
        self
    }

    /// 排除区域: 进入即丢弃整条流线.
    pub fn with_exclusion(mut self, exclusion: ScalarImage) -> Self {
        self.exclusion = Some(exclusion);
        self
    }

    /// 目标区域, 用于端点约束. 体素值同时作为标签.
    pub fn with_target(mut self, target: ScalarImage) -> Self {
        self.target = Some(target);
        self
    }

    /// 端点约束.
    #[inline]
    pub fn ep_constraint(&self) -> EpConstraint {
        self.ep_constraint
    }

    /// 掩膜.
    #[inline]
    pub fn mask(&self) -> Option<&ScalarImage> {
        self.mask.as_ref()
    }

    /// 由追踪器在构建时调用: 写入参数, 并检查所有区域图像与 `grid` 一致.
    pub(crate) fn configure(
        &mut self,
        grid: &Geometry,
        ep_constraint: EpConstraint,
        cutoff: f64,
        interpolate_masks: bool,
        interpolate_data: bool,
    ) -> Result<(), ConfigError> {
        for (name, img) in [
            ("mask image", &self.mask),
            ("stop image", &self.stop),
            ("exclusion image", &self.exclusion),
            ("target image", &self.target),
        ] {
            if let Some(img) = img {
                if !img.geometry().is_same_grid(grid) {
                    return Err(ConfigError::GeometryMismatch(name));
                }
            }
        }
        if ep_constraint.needs_target() && self.target.is_none() {
            return Err(ConfigError::MissingInput("target image"));
        }
        self.ep_constraint = ep_constraint;
        self.cutoff = cutoff;
        self.interpolate_masks = interpolate_masks;
        self.interpolate_data = interpolate_data;
        Ok(())
    }

    #[inline]
    fn inside(&self, img: &ScalarImage, p: &Vec3) -> bool {
        img.sample(p, self.interpolate_masks) > ROI_THRESHOLD
    }

    /// 判定点 `p`. 先检查网格与区域, 最后检查数据阈值.
    pub fn check(&self, p: &Vec3, model: &DirectionModel) -> Verdict {
        let g = model.geometry();
        if !g.contains_index(&g.world_to_index(p)) {
            return Verdict::Stop;
        }
        if let Some(ex) = &self.exclusion {
            if self.inside(ex, p) {
                return Verdict::Discard;
            }
        }
        if let Some(mask) = &self.mask {
            if !self.inside(mask, p) {
                return Verdict::Stop;
            }
        }
        if let Some(stop) = &self.stop {
            if self.inside(stop, p) {
                return Verdict::Stop;
            }
        }
        if self.cutoff > 0.0 && model.signal(p, self.interpolate_data) < self.cutoff {
            return Verdict::Stop;
        }
        Verdict::Continue
    }

    /// 端点 `p` 处的目标标签 (最近邻). 不在目标区域内时为 `None`.
    fn target_label(&self, p: &Vec3) -> Option<i64> {
        let target = self.target.as_ref()?;
        if !self.inside(target, p) {
            return None;
        }
        let v = target.geometry().nearest_voxel(p)?;
        Some(target[v].round() as i64)
    }

    /// 对连接后流线的两个端点评估端点约束. `seed` 为种子图像.
    pub fn accept_endpoints(&self, a: &Vec3, b: &Vec3, seed: Option<&ScalarImage>) -> bool {
        let in_target = |p: &Vec3| self.target.as_ref().is_some_and(|t| self.inside(t, p));
        match self.ep_constraint {
            EpConstraint::None => true,
            EpConstraint::EpsInTarget => in_target(a) && in_target(b),
            EpConstraint::EpsInTargetLabelDiff => {
                match (self.target_label(a), self.target_label(b)) {
                    (Some(la), Some(lb)) => la != lb,
                    _ => false,
                }
            }
            EpConstraint::EpsInSeedAndTarget => {
                let in_seed = |p: &Vec3| seed.is_some_and(|s| self.inside(s, p));
                (in_seed(a) && in_target(b)) || (in_seed(b) && in_target(a))
            }
            EpConstraint::MinOneEpInTarget => in_target(a) || in_target(b),
            EpConstraint::OneEpInTarget => in_target(a) != in_target(b),
            EpConstraint::NoEpInTarget => !in_target(a) && !in_target(b),
        }
    }
}

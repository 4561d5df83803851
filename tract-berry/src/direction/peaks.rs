//! 离散峰值模型.

use super::{Candidate, Flip};
use crate::data::interp::Sampler;
use crate::track::ConfigError;
use crate::{Geometry, GeometryAttr, Vec3, VectorField};

/// 每个体素存放 `P` 个峰值向量 (`3P` 个通道), 向量长度即峰值幅值.
#[derive(Debug, Clone)]
pub struct PeakModel {
    field: VectorField,
    num_peaks: usize,

    /// 翻转配置.
    pub(crate) flip: Flip,

    /// 绝对幅值阈值.
    pub(crate) cutoff: f64,

    /// 相对幅值阈值: 小于 `peak_ratio * 最大幅值` 的峰值被丢弃.
    peak_ratio: f64,
}

impl PeakModel {
    /// 从峰值向量场构建. 通道数必须是 3 的正整数倍.
    pub fn new(field: VectorField) -> Result<Self, ConfigError> {
        let c = field.channels();
        if c % 3 != 0 {
            return Err(ConfigError::ChannelMismatch {
                what: "peaks",
                expected: "a multiple of 3".to_owned(),
                found: c,
            });
        }
        Ok(Self {
            field,
            num_peaks: c / 3,
            flip: Flip::default(),
            cutoff: 0.1,
            peak_ratio: 0.5,
        })
    }

    /// 设置绝对幅值阈值.
    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }

    /// 设置相对幅值阈值 (`[0, 1]`).
    pub fn with_peak_ratio(mut self, ratio: f64) -> Self {
        assert!((0.0..=1.0).contains(&ratio));
        self.peak_ratio = ratio;
        self
    }

    /// 设置翻转配置.
    pub fn with_flip(mut self, flip: Flip) -> Self {
        self.flip = flip;
        self
    }

    /// 每个体素的峰值个数.
    #[inline]
    pub fn num_peaks(&self) -> usize {
        self.num_peaks
    }

    #[inline]
    pub(crate) fn geometry(&self) -> &Geometry {
        self.field.geometry()
    }

    /// 第 `peak` 个峰值在体素 `pos` 处的原始向量.
    #[inline]
    fn raw_peak(&self, pos: crate::Idx3d, peak: usize) -> Vec3 {
        let v = self.field.voxel(pos);
        let o = 3 * peak;
        Vec3::new(v[o] as f64, v[o + 1] as f64, v[o + 2] as f64)
    }

    /// 在 `p` 处取得所有峰值向量 (未归一化, 未翻转).
    ///
    /// 插值时, 各体素上的同序号峰值先与参考方向对齐符号再加权,
    /// 避免轴向对称的峰值相互抵消. 参考方向优先取 `prev`,
    /// 否则取权重最大的体素上的该峰值.
    fn peaks_at(&self, p: &Vec3, prev: Option<&Vec3>, interpolate: bool) -> Vec<Vec3> {
        let Some(sampler) = Sampler::new(self.geometry(), p, interpolate) else {
            return Vec::new();
        };
        let heaviest = sampler
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(v, _)| v);
        let Some(heaviest) = heaviest else {
            return Vec::new();
        };

        (0..self.num_peaks)
            .map(|peak| {
                let reference = prev.copied().unwrap_or_else(|| self.raw_peak(heaviest, peak));
                sampler.iter().fold(Vec3::zeros(), |acc, (pos, w)| {
                    let v = self.raw_peak(pos, peak);
                    let v = if v.dot(&reference) < 0.0 { -v } else { v };
                    acc + v * w
                })
            })
            .collect()
    }

    pub(crate) fn directions(
        &self,
        p: &Vec3,
        prev: Option<&Vec3>,
        interpolate: bool,
        out: &mut Vec<Candidate>,
    ) {
        let peaks = self.peaks_at(p, prev, interpolate);
        let max = peaks.iter().map(|v| v.norm()).fold(0.0, f64::max);
        if max <= self.cutoff {
            return;
        }
        let threshold = (self.peak_ratio * max).max(self.cutoff);
        out.extend(
            peaks
                .into_iter()
                .filter_map(|v| {
                    let m = v.norm();
                    (m >= threshold).then(|| Candidate::from_vec(v, m)).flatten()
                }),
        );
    }

    /// 最大峰值幅值.
    pub(crate) fn signal(&self, p: &Vec3, interpolate: bool) -> f64 {
        self.peaks_at(p, None, interpolate)
            .iter()
            .map(|v| v.norm())
            .fold(0.0, f64::max)
    }
}

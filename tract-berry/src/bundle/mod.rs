//! 纤维束: 流线集合及其几何操作.
//!
//! 所有点存放在一个连续数组中, 第 `i` 条纤维占据
//! `points[offsets[i]..offsets[i + 1]]`. 删除纤维时重建偏移, 不会留下悬空索引.
//!
//! 修改纤维束的操作需要 `&mut self`; 需要保留原始数据时先 `clone()` 一份私有副本.

use std::fmt;

use crate::{Geometry, LabelImage, Mat3, ScalarImage, Vec3};

mod polyline;

pub use polyline::{
    compress, paired_distances, polyline_length, prefers_reversed, resample_count,
    resample_spacing,
};
pub(crate) use polyline::{point_segment_distance, visited_voxels};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 纤维束结构错误.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleError {
    /// 纤维点数不足 2. `(纤维下标, 点数)`.
    TooFewPoints(usize, usize),

    /// 逐纤维/逐点数组长度不符.
    LengthMismatch {
        /// 出错的数组.
        what: &'static str,

        /// 期望长度.
        expected: usize,

        /// 实际长度.
        found: usize,
    },

    /// 偏移数组不合法.
    InvalidOffsets,
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooFewPoints(i, n) => write!(f, "fiber {i} has {n} points, expected >= 2"),
            Self::LengthMismatch {
                what,
                expected,
                found,
            } => write!(f, "`{what}` has length {found}, expected {expected}"),
            Self::InvalidOffsets => f.write_str("fiber offsets are inconsistent"),
        }
    }
}

impl std::error::Error for BundleError {}

/// 长度统计 (毫米).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LengthStats {
    /// 最短.
    pub min: f64,

    /// 最长.
    pub max: f64,

    /// 平均.
    pub mean: f64,

    /// 总体标准差.
    pub std: f64,

    /// 中位数.
    pub median: f64,
}

/// 纤维束.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FiberBundle {
    points: Vec<Vec3>,
    offsets: Vec<usize>,
    weights: Vec<f32>,

    /// 逐点 RGB 颜色.
    colors: Option<Vec<[u8; 3]>>,

    /// 纤维束所属的网格, 供导出格式使用.
    geometry: Option<Geometry>,
}

impl Default for FiberBundle {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberBundle {
    /// 空纤维束.
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            offsets: vec![0],
            weights: Vec::new(),
            colors: None,
            geometry: None,
        }
    }

    /// 带网格几何的空纤维束.
    pub fn with_geometry(geometry: Geometry) -> Self {
        Self {
            geometry: Some(geometry),
            ..Self::new()
        }
    }

    /// 由多条折线构建. 每条至少两个点.
    pub fn try_from_fibers<I>(fibers: I) -> Result<Self, BundleError>
    where
        I: IntoIterator,
        I::Item: AsRef<[Vec3]>,
    {
        let mut b = Self::new();
        for (i, f) in fibers.into_iter().enumerate() {
            let f = f.as_ref();
            if f.len() < 2 {
                return Err(BundleError::TooFewPoints(i, f.len()));
            }
            b.push(f);
        }
        Ok(b)
    }

    /// 检查内部不变量.
    pub fn validate(&self) -> Result<(), BundleError> {
        let ok = self.offsets.first() == Some(&0)
            && self.offsets.last() == Some(&self.points.len())
            && self.offsets.windows(2).all(|w| w[0] <= w[1]);
        if !ok {
            return Err(BundleError::InvalidOffsets);
        }
        if let Some(i) = self.offsets.windows(2).position(|w| w[1] - w[0] < 2) {
            return Err(BundleError::TooFewPoints(i, self.offsets[i + 1] - self.offsets[i]));
        }
        if self.weights.len() != self.len() {
            return Err(BundleError::LengthMismatch {
                what: "weights",
                expected: self.len(),
                found: self.weights.len(),
            });
        }
        if let Some(c) = &self.colors {
            if c.len() != self.points.len() {
                return Err(BundleError::LengthMismatch {
                    what: "colors",
                    expected: self.points.len(),
                    found: c.len(),
                });
            }
        }
        Ok(())
    }

    /// 追加一条纤维 (权重 1.0), 返回其下标. 点数不足 2 时 panic.
    pub fn push(&mut self, fiber: &[Vec3]) -> usize {
        assert!(fiber.len() >= 2, "纤维至少需要两个点");
        self.points.extend_from_slice(fiber);
        self.offsets.push(self.points.len());
        self.weights.push(1.0);
        if let Some(c) = &mut self.colors {
            c.extend(orientation_colors(fiber));
        }
        self.len() - 1
    }

    /// 纤维条数.
    #[inline]
    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 所有纤维的点数之和.
    #[inline]
    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// 第 `i` 条纤维.
    #[inline]
    pub fn fiber(&self, i: usize) -> &[Vec3] {
        &self.points[self.offsets[i]..self.offsets[i + 1]]
    }

    /// 按下标顺序迭代所有纤维.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = &[Vec3]> + '_ {
        self.offsets
            .windows(2)
            .map(move |w| &self.points[w[0]..w[1]])
    }

    /// 逐纤维权重.
    #[inline]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// 设置全部权重. 长度必须等于纤维条数.
    pub fn set_weights(&mut self, weights: Vec<f32>) -> Result<(), BundleError> {
        if weights.len() != self.len() {
            return Err(BundleError::LengthMismatch {
                what: "weights",
                expected: self.len(),
                found: weights.len(),
            });
        }
        self.weights = weights;
        Ok(())
    }

    /// 设置第 `i` 条纤维的权重.
    #[inline]
    pub fn set_weight(&mut self, i: usize, w: f32) {
        self.weights[i] = w;
    }

    /// 逐点颜色.
    #[inline]
    pub fn colors(&self) -> Option<&[[u8; 3]]> {
        self.colors.as_deref()
    }

    /// 第 `i` 条纤维的逐点颜色.
    pub fn fiber_colors(&self, i: usize) -> Option<&[[u8; 3]]> {
        self.colors
            .as_ref()
            .map(|c| &c[self.offsets[i]..self.offsets[i + 1]])
    }

    /// 设置逐点颜色. 长度必须等于总点数.
    pub fn set_colors(&mut self, colors: Vec<[u8; 3]>) -> Result<(), BundleError> {
        if colors.len() != self.points.len() {
            return Err(BundleError::LengthMismatch {
                what: "colors",
                expected: self.points.len(),
                found: colors.len(),
            });
        }
        self.colors = Some(colors);
        Ok(())
    }

    /// 按局部走向着色 (`|dx|, |dy|, |dz|` 映射为 RGB).
    pub fn color_by_orientation(&mut self) {
        let colors = self.iter().flat_map(orientation_colors).collect();
        self.colors = Some(colors);
    }

    /// 所属网格.
    #[inline]
    pub fn geometry(&self) -> Option<&Geometry> {
        self.geometry.as_ref()
    }

    /// 设置所属网格.
    #[inline]
    pub fn set_geometry(&mut self, geometry: Option<Geometry>) {
        self.geometry = geometry;
    }

    /// 以 `op` 重建每条纤维. `op` 返回 `None` 的纤维被删除.
    ///
    /// 点数不变的纤维保留原颜色, 否则按走向重新着色.
    fn rebuild<F>(&mut self, mut op: F)
    where
        F: FnMut(usize, &[Vec3]) -> Option<Vec<Vec3>>,
    {
        let mut points = Vec::with_capacity(self.points.len());
        let mut offsets = Vec::with_capacity(self.offsets.len());
        let mut weights = Vec::with_capacity(self.weights.len());
        let mut colors = self.colors.as_ref().map(|c| Vec::with_capacity(c.len()));
        offsets.push(0);
        for i in 0..self.len() {
            let old = self.fiber(i);
            let Some(new) = op(i, old) else {
                continue;
            };
            debug_assert!(new.len() >= 2);
            if let Some(c) = &mut colors {
                match self.fiber_colors(i) {
                    Some(oc) if new.len() == old.len() => c.extend_from_slice(oc),
                    _ => c.extend(orientation_colors(&new)),
                }
            }
            points.extend(new);
            offsets.push(points.len());
            weights.push(self.weights[i]);
        }
        self.points = points;
        self.offsets = offsets;
        self.weights = weights;
        self.colors = colors;
    }

    /// 只保留满足 `keep(下标, 纤维)` 的纤维, 相对顺序不变.
    pub fn retain<F: FnMut(usize, &[Vec3]) -> bool>(&mut self, mut keep: F) {
        self.rebuild(|i, f| keep(i, f).then(|| f.to_vec()));
    }

    /// 删除给定下标的纤维.
    pub fn remove(&mut self, indices: &[usize]) {
        let mut drop = vec![false; self.len()];
        for &i in indices {
            drop[i] = true;
        }
        self.retain(|i, _| !drop[i]);
    }

    /// 反转第 `i` 条纤维的点序.
    pub fn flip_fiber(&mut self, i: usize) {
        let range = self.offsets[i]..self.offsets[i + 1];
        self.points[range.clone()].reverse();
        if let Some(c) = &mut self.colors {
            c[range].reverse();
        }
    }

    /// 每条纤维重采样为 `n` 个点.
    pub fn resample_points(&mut self, n: usize) {
        self.rebuild(|_, f| Some(resample_count(f, n)));
    }

    /// 每条纤维按弧长间距 `spacing` (毫米) 重采样.
    pub fn resample_spacing(&mut self, spacing: f64) {
        self.rebuild(|_, f| Some(resample_spacing(f, spacing)));
    }

    /// 压缩每条纤维, 误差不超过 `max_error` 毫米.
    pub fn compress(&mut self, max_error: f64) {
        self.rebuild(|_, f| Some(compress(f, max_error)));
    }

    /// 仿射变换所有点: `p -> m · p + t`.
    pub fn transform(&mut self, m: &Mat3, t: &Vec3) {
        self.points.iter_mut().for_each(|p| *p = m * *p + t);
    }

    /// 第 `i` 条纤维的长度 (毫米).
    #[inline]
    pub fn fiber_length(&self, i: usize) -> f64 {
        polyline_length(self.fiber(i))
    }

    /// 所有纤维的长度.
    pub fn lengths(&self) -> Vec<f64> {
        self.iter().map(polyline_length).collect()
    }

    /// 平均长度. 空纤维束为 0.
    pub fn mean_length(&self) -> f64 {
        self.length_stats().map_or(0.0, |s| s.mean)
    }

    /// 长度统计. 空纤维束返回 `None`.
    pub fn length_stats(&self) -> Option<LengthStats> {
        let mut lengths = self.lengths();
        if lengths.is_empty() {
            return None;
        }
        lengths.sort_unstable_by(f64::total_cmp);
        let n = lengths.len();
        let mean = lengths.iter().sum::<f64>() / n as f64;
        let var = lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            lengths[n / 2]
        } else {
            0.5 * (lengths[n / 2 - 1] + lengths[n / 2])
        };
        Some(LengthStats {
            min: lengths[0],
            max: lengths[n - 1],
            mean,
            std: var.sqrt(),
            median,
        })
    }

    /// 外包盒 `(最小角, 最大角)`. 空纤维束返回 `None`.
    pub fn bounding_box(&self) -> Option<(Vec3, Vec3)> {
        let first = *self.points.first()?;
        Some(self.points.iter().fold((first, first), |(lo, hi), p| {
            (lo.inf(p), hi.sup(p))
        }))
    }

    /// 外包盒对角线长度 (毫米).
    pub fn diagonal(&self) -> f64 {
        self.bounding_box().map_or(0.0, |(lo, hi)| (hi - lo).norm())
    }

    /// 纤维密度图 (TDI): 每个体素被多少条纤维经过.
    pub fn tdi(&self, geometry: &Geometry) -> ScalarImage {
        let mut tdi = ScalarImage::filled(geometry.clone(), 0.0);
        for f in self.iter() {
            for v in visited_voxels(f, geometry) {
                tdi[v] += 1.0;
            }
        }
        tdi
    }

    /// 二值包络: 至少被一条纤维经过的体素为 1.
    pub fn envelope(&self, geometry: &Geometry) -> LabelImage {
        let mut env = LabelImage::zeros(geometry.clone());
        for f in self.iter() {
            for v in visited_voxels(f, geometry) {
                env[v] = 1;
            }
        }
        env
    }

    /// 以 `bincode` + zlib 压缩保存.
    #[cfg(feature = "serde")]
    pub fn save<P: AsRef<std::path::Path>>(
        &self,
        path: P,
    ) -> Result<(), crate::persist::PersistError> {
        crate::persist::save(self, path)
    }

    /// 读取 [`FiberBundle::save`] 保存的纤维束, 并检查内部不变量.
    #[cfg(feature = "serde")]
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, crate::persist::PersistError> {
        let b: Self = crate::persist::load(path)?;
        b.validate()
            .map_err(|e| crate::persist::PersistError::Invalid(e.to_string()))?;
        Ok(b)
    }
}

/// 逐点走向颜色. 端点取相邻线段方向, 内部点取前后点连线方向.
fn orientation_colors(fiber: &[Vec3]) -> Vec<[u8; 3]> {
    let n = fiber.len();
    (0..n)
        .map(|i| {
            let (a, b) = (fiber[i.saturating_sub(1)], fiber[(i + 1).min(n - 1)]);
            let d = (b - a).try_normalize(f64::EPSILON).unwrap_or_else(Vec3::zeros);
            [d.x, d.y, d.z].map(|c| (c.abs() * 255.0).round() as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(y: f64, n: usize) -> Vec<Vec3> {
        (0..n).map(|i| Vec3::new(i as f64, y, 0.0)).collect()
    }

    fn bundle() -> FiberBundle {
        FiberBundle::try_from_fibers([line(0.0, 5), line(1.0, 3), line(2.0, 11)]).unwrap()
    }

    #[test]
    fn test_build_and_access() {
        let b = bundle();
        assert_eq!(b.len(), 3);
        assert_eq!(b.num_points(), 19);
        assert_eq!(b.fiber(1), &line(1.0, 3)[..]);
        assert_eq!(b.weights(), &[1.0, 1.0, 1.0]);
        assert!(b.validate().is_ok());
        assert_eq!(
            FiberBundle::try_from_fibers([vec![Vec3::zeros()]]),
            Err(BundleError::TooFewPoints(0, 1))
        );
    }

    #[test]
    fn test_retain_keeps_topology() {
        let mut b = bundle();
        b.color_by_orientation();
        b.set_weight(2, 3.0);
        b.remove(&[0]);
        assert_eq!(b.len(), 2);
        assert!(b.validate().is_ok());
        assert_eq!(b.fiber(0), &line(1.0, 3)[..]);
        assert_eq!(b.fiber(1), &line(2.0, 11)[..]);
        assert_eq!(b.weights(), &[1.0, 3.0]);
        assert_eq!(b.colors().unwrap().len(), 14);
        assert_eq!(b.fiber_colors(0).unwrap()[0], [255, 0, 0]);
    }

    #[test]
    fn test_length_stats() {
        let s = bundle().length_stats().unwrap();
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 10.0);
        assert_eq!(s.median, 4.0);
        assert!((s.mean - 16.0 / 3.0).abs() < 1e-12);
        assert!(FiberBundle::new().length_stats().is_none());
    }

    #[test]
    fn test_resample_and_compress() {
        let mut b = bundle();
        b.color_by_orientation();
        b.resample_points(4);
        assert!(b.validate().is_ok());
        assert!(b.iter().all(|f| f.len() == 4));
        assert!((b.fiber_length(2) - 10.0).abs() < 1e-9);
        b.compress(0.01);
        assert!(b.iter().all(|f| f.len() == 2));
        assert!(b.validate().is_ok());
    }

    #[test]
    fn test_transform_and_flip() {
        let mut b = bundle();
        b.transform(&Mat3::identity(), &Vec3::new(0.0, 0.0, 5.0));
        assert!(b.iter().flatten().all(|p| p.z == 5.0));
        b.flip_fiber(0);
        assert_eq!(b.fiber(0)[0], Vec3::new(4.0, 0.0, 5.0));
        let (lo, hi) = b.bounding_box().unwrap();
        assert_eq!(lo, Vec3::new(0.0, 0.0, 5.0));
        assert_eq!(hi, Vec3::new(10.0, 2.0, 5.0));
    }

    #[test]
    fn test_tdi_and_envelope() {
        let g = Geometry::isotropic((12, 3, 1), 1.0).unwrap();
        let b = bundle();
        let tdi = b.tdi(&g);
        assert_eq!(tdi[(0, 0, 0)], 1.0);
        assert_eq!(tdi[(3, 0, 0)], 1.0);
        assert_eq!(tdi[(5, 0, 0)], 0.0);
        assert_eq!(tdi[(10, 2, 0)], 1.0);
        let env = b.envelope(&g);
        assert_eq!(env.count_nonzero(), 5 + 3 + 11);
    }
}

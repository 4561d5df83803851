//! Tractometry: 沿纤维束对标量图像采样, 按分区统计.
//!
//! 两种分区方式:
//!
//! 1. 静态重采样: 每条纤维重采样为固定点数, 第 `i` 个点归入第 `i` 个分区.
//! 2. 最近质心点: 纤维先聚类, 每个纤维点归入其所属簇质心上最近点的分区.

use itertools::Itertools;
use log::info;
use ndarray::Array2;
use ordered_float::OrderedFloat;

use crate::bundle::{prefers_reversed, resample_count, resample_spacing, FiberBundle};
use crate::cluster::{ClusterParams, TractClusterer};
use crate::track::ConfigError;
use crate::{par, GeometryAttr, ScalarImage, Vec3};

/// 单个分区的统计量.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BinStats {
    /// 平均值. 空分区为 0.
    pub mean: f64,

    /// 总体标准差. 空分区为 0.
    pub std: f64,

    /// 样本个数.
    pub count: usize,
}

impl BinStats {
    /// 由样本计算.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: var.sqrt(),
            count: values.len(),
        }
    }
}

/// 静态重采样的结果.
#[derive(Debug, Clone)]
pub struct StaticProfile {
    /// `[纤维, 点]` 排列的采样值.
    pub values: Array2<f64>,

    /// 每个点下标上的统计量.
    pub stats: Vec<BinStats>,
}

/// 在图像分辨率下, 使每个分区至少跨越 `voxels_per_parcel` 个体素的最大分区数.
/// 至少为 1.
pub fn estimate_num_sampling_points(
    min_spacing: f64,
    fiber_length: f64,
    voxels_per_parcel: f64,
) -> usize {
    assert!(min_spacing > 0.0 && voxels_per_parcel > 0.0);
    let n = (fiber_length / (voxels_per_parcel * min_spacing)).floor();
    if n >= 1.0 {
        n as usize
    } else {
        1
    }
}

/// 以参照纤维对齐方向: 需要反向时返回反转后的副本.
fn oriented(fiber: Vec<Vec3>, reference: &[Vec3]) -> Vec<Vec3> {
    if prefers_reversed(&fiber, reference) {
        fiber.into_iter().rev().collect()
    } else {
        fiber
    }
}

/// 静态重采样 tractometry.
///
/// 每条纤维重采样为 `num_points` 个点, 与 `reference` (缺省时为第一条纤维)
/// 对齐方向后在 `image` 上采样.
///
/// `num_points` 为 1 时整条纤维为一个分区: 纤维按图像最小体素间距重采样,
/// 取全部采样值的平均.
pub fn static_profile(
    image: &ScalarImage,
    bundle: &FiberBundle,
    num_points: usize,
    reference: Option<&[Vec3]>,
    interpolate: bool,
) -> StaticProfile {
    assert!(num_points >= 1);
    if bundle.is_empty() {
        return StaticProfile {
            values: Array2::zeros((0, num_points)),
            stats: vec![BinStats::default(); num_points],
        };
    }
    if num_points == 1 {
        let spacing = image.geometry().min_spacing();
        let rows = par::map_indexed(bundle.len(), |i| {
            let samples = resample_spacing(bundle.fiber(i), spacing);
            samples
                .iter()
                .map(|p| image.sample(p, interpolate) as f64)
                .sum::<f64>()
                / samples.len() as f64
        });
        return StaticProfile {
            values: Array2::from_shape_fn((rows.len(), 1), |(i, _)| rows[i]),
            stats: vec![BinStats::from_values(&rows)],
        };
    }

    let reference = match reference {
        Some(r) => resample_count(r, num_points),
        None => resample_count(bundle.fiber(0), num_points),
    };
    let rows = par::map_indexed(bundle.len(), |i| {
        oriented(resample_count(bundle.fiber(i), num_points), &reference)
            .iter()
            .map(|p| image.sample(p, interpolate) as f64)
            .collect_vec()
    });
    let mut values = Array2::zeros((rows.len(), num_points));
    for (mut dst, src) in values.rows_mut().into_iter().zip(&rows) {
        dst.iter_mut().zip(src).for_each(|(d, s)| *d = *s);
    }
    let stats = values
        .columns()
        .into_iter()
        .map(|c| BinStats::from_values(&c.to_vec()))
        .collect();
    StaticProfile { values, stats }
}

/// 最近质心点 tractometry 的参数.
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidProfileParams {
    /// 质心个数上限.
    pub max_centroids: usize,

    /// 质心点数, 即分区个数.
    pub num_points: usize,

    /// 聚类的初始距离阈值 (毫米).
    pub start_cluster_size: f64,

    /// 在图像上采样时是否插值.
    pub interpolate: bool,
}

impl Default for CentroidProfileParams {
    fn default() -> Self {
        Self {
            max_centroids: 1,
            num_points: 20,
            start_cluster_size: 5.0,
            interpolate: true,
        }
    }
}

/// 最近质心点 tractometry.
///
/// 纤维按图像最小体素间距重采样; 每个点在其所属簇的质心上找最近点,
/// 采样值归入该点下标对应的分区. 质心先与 `reference`
/// (缺省时为第一个质心) 对齐方向.
pub fn centroid_profile(
    image: &ScalarImage,
    bundle: &FiberBundle,
    params: &CentroidProfileParams,
    reference: Option<&[Vec3]>,
) -> Result<Vec<BinStats>, ConfigError> {
    let k = params.num_points;
    let clusterer = TractClusterer::new(ClusterParams {
        num_points: k,
        start_cluster_size: params.start_cluster_size,
        num_centroids: params.max_centroids,
        ..ClusterParams::default()
    })?;
    if bundle.is_empty() {
        return Ok(vec![BinStats::default(); k]);
    }
    let clustering = clusterer.cluster(bundle);
    let centroids = clustering.centroids();
    let reference = match reference {
        Some(r) => resample_count(r, k),
        None => centroids.fiber(0).to_vec(),
    };
    let centroids: Vec<Vec<Vec3>> = centroids
        .iter()
        .map(|c| oriented(c.to_vec(), &reference))
        .collect();

    let spacing = image.geometry().min_spacing();
    let samples: Vec<Vec<(usize, f64)>> = par::map_indexed(bundle.len(), |i| {
        let centroid = &centroids[clustering.assignments()[i]];
        resample_spacing(bundle.fiber(i), spacing)
            .iter()
            .filter_map(|p| {
                let bin = centroid
                    .iter()
                    .position_min_by_key(|q| OrderedFloat((p - *q).norm()))?;
                Some((bin, image.sample(p, params.interpolate) as f64))
            })
            .collect()
    });

    let mut bins = vec![Vec::new(); k];
    for (bin, v) in samples.into_iter().flatten() {
        bins[bin].push(v);
    }
    info!(
        "tractometry: {} 条纤维, {} 个质心, {k} 个分区",
        bundle.len(),
        centroids.len()
    );
    Ok(bins.iter().map(|b| BinStats::from_values(b)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Geometry;
    use ndarray::Array3;

    /// 体素值等于 x 坐标.
    fn ramp() -> ScalarImage {
        let g = Geometry::isotropic((20, 5, 5), 1.0).unwrap();
        let data = Array3::from_shape_fn((20, 5, 5), |(i, _, _)| i as f32);
        ScalarImage::new(g, data).unwrap()
    }

    fn bundle() -> FiberBundle {
        let f: Vec<_> = (0..20).map(|i| Vec3::new(i as f64, 2.0, 2.0)).collect();
        let mut r = f.clone();
        r.reverse();
        FiberBundle::try_from_fibers([f, r]).unwrap()
    }

    #[test]
    fn test_estimate_num_sampling_points() {
        assert_eq!(estimate_num_sampling_points(1.0, 100.0, 5.0), 20);
        assert_eq!(estimate_num_sampling_points(2.0, 100.0, 5.0), 10);
        assert_eq!(estimate_num_sampling_points(1.0, 3.0, 5.0), 1);
    }

    #[test]
    fn test_static_profile() {
        let p = static_profile(&ramp(), &bundle(), 5, None, true);
        assert_eq!(p.values.dim(), (2, 5));
        let expected = [0.0, 4.75, 9.5, 14.25, 19.0];
        for (s, e) in p.stats.iter().zip(expected) {
            assert!((s.mean - e).abs() < 1e-4);
            assert!(s.std < 1e-4);
            assert_eq!(s.count, 2);
        }

        let reference: Vec<_> = (0..20).rev().map(|i| Vec3::new(i as f64, 2.0, 2.0)).collect();
        let p = static_profile(&ramp(), &bundle(), 5, Some(&reference), true);
        assert!((p.stats[0].mean - 19.0).abs() < 1e-4);
    }

    #[test]
    fn test_static_profile_single_bin() {
        let short = FiberBundle::try_from_fibers([vec![
            Vec3::new(2.0, 2.0, 2.0),
            Vec3::new(5.0, 2.0, 2.0),
        ]])
        .unwrap();
        let n = estimate_num_sampling_points(1.0, short.mean_length(), 5.0);
        assert_eq!(n, 1);
        let p = static_profile(&ramp(), &short, n, None, true);
        assert_eq!(p.values.dim(), (1, 1));
        assert_eq!(p.stats.len(), 1);
        // 采样点 x = 2, 3, 4, 5.
        assert!((p.stats[0].mean - 3.5).abs() < 1e-4);
        assert_eq!(p.stats[0].count, 1);
    }

    #[test]
    fn test_bin_stats() {
        let s = BinStats::from_values(&[1.0, 3.0]);
        assert_eq!(s.mean, 2.0);
        assert_eq!(s.std, 1.0);
        assert_eq!(BinStats::from_values(&[]), BinStats::default());
    }

    #[test]
    fn test_centroid_profile() {
        let params = CentroidProfileParams {
            num_points: 5,
            ..Default::default()
        };
        let bins = centroid_profile(&ramp(), &bundle(), &params, None).unwrap();
        assert_eq!(bins.len(), 5);
        assert_eq!(bins[0].count, 6);
        assert!((bins[0].mean - 1.0).abs() < 1e-4);
        assert!((bins[4].mean - 18.0).abs() < 1e-4);
        assert!(bins.windows(2).all(|w| w[0].mean < w[1].mean));
        assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), 40);
    }
}

//! 纤维聚类.
//!
//! 以递增的距离阈值 `start_cluster_size · k` 反复执行贪心的 leader 聚类,
//! 直到质心个数不超过目标值, 或阈值超过纤维束外包盒对角线.
//!
//! # 注意
//!
//! 1. 每轮以下标最小的未分配纤维作为新簇的 leader, 结果与线程调度无关.
//! 2. 无法达到目标个数时返回质心最少的一次结果, 不会报错.

use log::{debug, info};
use ordered_float::OrderedFloat;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::bundle::{polyline_length, prefers_reversed, resample_count, FiberBundle};
use crate::consts::clustering::{DEFAULT_NUM_POINTS, MAX_ITERATIONS};
use crate::track::ConfigError;
use crate::{par, Vec3};

mod metric;

pub use metric::Metric;
use metric::{combined, Fiber};

/// 聚类参数.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ClusterParams {
    /// 每条纤维重采样的点数.
    pub num_points: usize,

    /// 初始距离阈值 (毫米).
    pub start_cluster_size: f64,

    /// 目标质心个数. 0 表示只做一轮 (阈值为 `start_cluster_size`).
    pub num_centroids: usize,

    /// 质心间距离小于该值时合并. 0 表示不合并.
    pub merge_duplicate_threshold: f64,

    /// 度量及其权重.
    pub metrics: Vec<(Metric, f64)>,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            num_points: DEFAULT_NUM_POINTS,
            start_cluster_size: 5.0,
            num_centroids: 0,
            merge_duplicate_threshold: 0.0,
            metrics: vec![(Metric::EuclideanMean, 1.0)],
        }
    }
}

impl ClusterParams {
    /// 检查参数取值.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_points < 2 {
            return Err(ConfigError::invalid("num_points", "must be >= 2"));
        }
        if !(self.start_cluster_size > 0.0 && self.start_cluster_size.is_finite()) {
            return Err(ConfigError::invalid(
                "start_cluster_size",
                format!("{} must be > 0", self.start_cluster_size),
            ));
        }
        if self.metrics.is_empty() || self.metrics.iter().any(|(_, w)| !(*w >= 0.0)) {
            return Err(ConfigError::invalid(
                "metrics",
                "need at least one metric with non-negative weight",
            ));
        }
        Ok(())
    }

    /// 设置目标质心个数.
    pub fn with_num_centroids(mut self, n: usize) -> Self {
        self.num_centroids = n;
        self
    }

    /// 设置初始距离阈值.
    pub fn with_start_cluster_size(mut self, mm: f64) -> Self {
        self.start_cluster_size = mm;
        self
    }

    /// 设置重采样点数.
    pub fn with_num_points(mut self, n: usize) -> Self {
        self.num_points = n;
        self
    }
}

/// 聚类结果.
#[derive(Debug, Clone)]
pub struct Clustering {
    /// 质心纤维, 按簇大小降序; 权重为簇内纤维数.
    centroids: FiberBundle,

    /// 每条输入纤维所属的簇.
    assignments: Vec<usize>,

    /// 得到该结果的距离阈值 (毫米).
    threshold: f64,
}

impl Clustering {
    /// 簇的个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    /// 是否为空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    /// 质心纤维.
    #[inline]
    pub fn centroids(&self) -> &FiberBundle {
        &self.centroids
    }

    /// 取出质心纤维.
    pub fn into_centroids(self) -> FiberBundle {
        self.centroids
    }

    /// 每条输入纤维所属的簇.
    #[inline]
    pub fn assignments(&self) -> &[usize] {
        &self.assignments
    }

    /// 第 `c` 个簇的成员 (升序).
    pub fn members(&self, c: usize) -> Vec<usize> {
        self.assignments
            .iter()
            .enumerate()
            .filter_map(|(i, &a)| (a == c).then_some(i))
            .collect()
    }

    /// 得到该结果的距离阈值.
    #[inline]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// 纤维聚类器.
#[derive(Debug, Clone)]
pub struct TractClusterer {
    params: ClusterParams,
}

/// 一轮聚类的中间结果. `clusters[c]` 为升序成员列表.
struct Pass {
    centroids: Vec<Vec<Vec3>>,
    clusters: Vec<Vec<usize>>,
}

impl TractClusterer {
    /// 检查参数后构建.
    pub fn new(params: ClusterParams) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self { params })
    }

    /// 聚类. 输入纤维束不会被修改.
    pub fn cluster(&self, bundle: &FiberBundle) -> Clustering {
        let n = bundle.len();
        let mut empty = FiberBundle::new();
        empty.set_geometry(bundle.geometry().cloned());
        if n == 0 {
            return Clustering {
                centroids: empty,
                assignments: Vec::new(),
                threshold: self.params.start_cluster_size,
            };
        }

        let num_points = self.params.num_points;
        let resampled: Vec<Vec<Vec3>> = par::map_indexed(n, |i| resample_count(bundle.fiber(i), num_points));
        let lengths = bundle.lengths();
        let diagonal = bundle.diagonal();

        let start = self.params.start_cluster_size;
        let reached = |count: usize| {
            self.params.num_centroids == 0 || count <= self.params.num_centroids
        };
        let (mut pass, mut threshold) = (self.run_pass(&resampled, &lengths, start), start);
        debug!("聚类阈值 {start:.2} mm: {} 个质心", pass.clusters.len());
        for k in 2..=MAX_ITERATIONS {
            if reached(pass.clusters.len()) {
                break;
            }
            let t = start * k as f64;
            if t > diagonal {
                break;
            }
            let next = self.run_pass(&resampled, &lengths, t);
            debug!("聚类阈值 {t:.2} mm: {} 个质心", next.clusters.len());
            if next.clusters.len() < pass.clusters.len() {
                (pass, threshold) = (next, t);
            }
        }

        let mut assignments = vec![0; n];
        let mut centroids = empty;
        for (c, (centroid, members)) in pass.centroids.iter().zip(&pass.clusters).enumerate() {
            for &i in members {
                assignments[i] = c;
            }
            centroids.push(centroid);
            centroids.set_weight(c, members.len() as f32);
        }
        info!(
            "聚类完成: {n} 条纤维, {} 个质心, 阈值 {threshold:.2} mm",
            centroids.len()
        );
        Clustering {
            centroids,
            assignments,
            threshold,
        }
    }

    #[inline]
    fn distance(&self, a: &[Vec3], la: f64, b: &[Vec3], lb: f64) -> f64 {
        combined(
            &self.params.metrics,
            Fiber { points: a, length: la },
            Fiber { points: b, length: lb },
        )
    }

    /// 以阈值 `threshold` 执行一轮: leader 聚类, 求质心, 重新分配, 合并.
    fn run_pass(&self, fibers: &[Vec<Vec3>], lengths: &[f64], threshold: f64) -> Pass {
        let n = fibers.len();

        // leader 聚类
        let mut label: Vec<Option<usize>> = vec![None; n];
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        while let Some(leader) = label.iter().position(Option::is_none) {
            let c = clusters.len();
            let snapshot = &label;
            let joins = par::map_indexed(n, |j| {
                snapshot[j].is_none()
                    && (j == leader
                        || self.distance(&fibers[leader], lengths[leader], &fibers[j], lengths[j])
                            <= threshold)
            });
            let members: Vec<usize> = joins
                .iter()
                .enumerate()
                .filter_map(|(j, &yes)| yes.then_some(j))
                .collect();
            for &j in &members {
                label[j] = Some(c);
            }
            clusters.push(members);
        }

        // 求质心后, 每条纤维重新分配到最近的质心
        let centroids: Vec<Vec<Vec3>> = clusters.iter().map(|m| mean_fiber(fibers, m)).collect();
        let centroid_lengths: Vec<f64> = centroids.iter().map(|c| polyline_length(c)).collect();
        let nearest = par::map_indexed(n, |i| {
            (0..centroids.len())
                .min_by_key(|&c| {
                    OrderedFloat(self.distance(&fibers[i], lengths[i], &centroids[c], centroid_lengths[c]))
                })
                .unwrap_or(0)
        });
        let mut clusters = vec![Vec::new(); centroids.len()];
        for (i, c) in nearest.into_iter().enumerate() {
            clusters[c].push(i);
        }
        clusters.retain(|m| !m.is_empty());

        let clusters = self.merge(fibers, clusters);
        let mut pass = Pass {
            centroids: clusters.iter().map(|m| mean_fiber(fibers, m)).collect(),
            clusters,
        };
        sort_by_size(&mut pass);
        pass
    }

    /// 合并距离小于 `merge_duplicate_threshold` 的质心.
    fn merge(&self, fibers: &[Vec<Vec3>], mut clusters: Vec<Vec<usize>>) -> Vec<Vec<usize>> {
        let limit = self.params.merge_duplicate_threshold;
        if limit <= 0.0 {
            return clusters;
        }
        let mut i = 0;
        while i < clusters.len() {
            let ci = mean_fiber(fibers, &clusters[i]);
            let li = polyline_length(&ci);
            let mut j = i + 1;
            let mut merged = false;
            while j < clusters.len() {
                let cj = mean_fiber(fibers, &clusters[j]);
                let lj = polyline_length(&cj);
                if self.distance(&ci, li, &cj, lj) < limit {
                    let moved = clusters.remove(j);
                    clusters[i].extend(moved);
                    merged = true;
                } else {
                    j += 1;
                }
            }
            if merged {
                clusters[i].sort_unstable();
            } else {
                i += 1;
            }
        }
        clusters
    }
}

/// 簇按大小降序排列, 大小相同时按最小成员下标升序.
fn sort_by_size(pass: &mut Pass) {
    let mut order: Vec<usize> = (0..pass.clusters.len()).collect();
    order.sort_by_key(|&c| (std::cmp::Reverse(pass.clusters[c].len()), pass.clusters[c][0]));
    pass.centroids = order.iter().map(|&c| pass.centroids[c].clone()).collect();
    pass.clusters = order.iter().map(|&c| pass.clusters[c].clone()).collect();
}

/// 成员纤维以第一个成员为参照对齐方向后逐点平均.
fn mean_fiber(fibers: &[Vec<Vec3>], members: &[usize]) -> Vec<Vec3> {
    let reference = &fibers[members[0]];
    let mut sum = vec![Vec3::zeros(); reference.len()];
    for &m in members {
        let f = &fibers[m];
        if prefers_reversed(f, reference) {
            sum.iter_mut().zip(f.iter().rev()).for_each(|(s, p)| *s += p);
        } else {
            sum.iter_mut().zip(f).for_each(|(s, p)| *s += p);
        }
    }
    let k = members.len() as f64;
    sum.into_iter().map(|s| s / k).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(y: f64, reversed: bool) -> Vec<Vec3> {
        let mut f: Vec<_> = (0..21).map(|i| Vec3::new(i as f64, y, 0.0)).collect();
        if reversed {
            f.reverse();
        }
        f
    }

    #[test]
    fn test_identical_fibers_give_one_centroid() {
        let b = FiberBundle::try_from_fibers((0..10).map(|_| line(0.0, false))).unwrap();
        let c = TractClusterer::new(ClusterParams::default().with_start_cluster_size(0.1))
            .unwrap()
            .cluster(&b);
        assert_eq!(c.len(), 1);
        assert_eq!(c.members(0), (0..10).collect::<Vec<_>>());
        assert_eq!(c.centroids().weights(), &[10.0]);
        assert!((c.centroids().fiber_length(0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_bundles() {
        // 三条在 y = 0 附近 (其中一条反向), 两条在 y = 30 附近.
        let fibers = vec![
            line(0.0, false),
            line(30.0, false),
            line(1.0, true),
            line(-1.0, false),
            line(31.0, true),
        ];
        let b = FiberBundle::try_from_fibers(fibers).unwrap();
        let c = TractClusterer::new(ClusterParams::default()).unwrap().cluster(&b);
        assert_eq!(c.len(), 2);
        assert_eq!(c.members(0), vec![0, 2, 3]);
        assert_eq!(c.members(1), vec![1, 4]);
        assert_eq!(c.assignments(), &[0, 1, 0, 0, 1]);
        let centroid = c.centroids().fiber(0);
        assert!(centroid.iter().all(|p| p.y.abs() < 1e-9));
    }

    #[test]
    fn test_threshold_grows_to_target() {
        let fibers: Vec<_> = (0..4).map(|i| line(10.0 * i as f64, false)).collect();
        let b = FiberBundle::try_from_fibers(fibers).unwrap();
        let params = ClusterParams::default()
            .with_start_cluster_size(1.0)
            .with_num_centroids(2);
        let c = TractClusterer::new(params).unwrap().cluster(&b);
        assert!(c.len() <= 2);
        assert!(c.threshold() > 1.0);
    }

    #[test]
    fn test_merge_duplicates() {
        let b = FiberBundle::try_from_fibers([line(0.0, false), line(3.0, false)]).unwrap();
        let params = ClusterParams {
            start_cluster_size: 1.0,
            merge_duplicate_threshold: 5.0,
            ..ClusterParams::default()
        };
        let c = TractClusterer::new(params).unwrap().cluster(&b);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_empty_bundle() {
        let c = TractClusterer::new(ClusterParams::default())
            .unwrap()
            .cluster(&FiberBundle::new());
        assert!(c.is_empty());
    }

    #[test]
    fn test_invalid_params() {
        assert!(TractClusterer::new(ClusterParams::default().with_num_points(1)).is_err());
        assert!(TractClusterer::new(ClusterParams::default().with_start_cluster_size(0.0)).is_err());
    }
}

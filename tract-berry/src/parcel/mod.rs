//! 沿束分区 (parcellation).
//!
//! 把纤维束包络内的每个体素标注为沿纤维走向排列的 `1..=N` 号分区.
//!
//! # 注意
//!
//! 1. 所有纤维先按参照纤维对齐方向, 否则分区编号在两端会混淆.
//! 2. 距离阈值放宽的次数有上限: 阈值超过工作纤维束外包盒对角线后,
//!   该体素保持为背景 `0`.

use std::fmt;

use log::{debug, info, warn};
use ordered_float::OrderedFloat;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::bundle::{prefers_reversed, resample_count, FiberBundle};
use crate::cluster::{ClusterParams, TractClusterer};
use crate::consts::parcellation::{MAX_PARCELS, POSTPROCESS_PASSES};
use crate::consts::BACKGROUND;
use crate::track::ConfigError;
use crate::{par, Geometry, LabelImage, Vec3};

mod postprocess;

pub use postprocess::{majority_pass, postprocess};

/// 分区错误.
#[derive(Debug, Clone, PartialEq)]
pub enum ParcelError {
    /// 输入纤维束为空.
    EmptyBundle,

    /// 纤维束平均长度为 0, 无法确定距离阈值.
    DegenerateBundle,

    /// 参数非法.
    Config(ConfigError),
}

impl fmt::Display for ParcelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyBundle => f.write_str("fiber bundle is empty"),
            Self::DegenerateBundle => f.write_str("fiber bundle has zero mean length"),
            Self::Config(e) => write!(f, "invalid parcellation parameters: {e}"),
        }
    }
}

impl std::error::Error for ParcelError {}

impl From<ConfigError> for ParcelError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// 分区参数.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ParcelParams {
    /// 分区个数, `2..=255`.
    pub num_parcels: usize,

    /// 大于 0 时, 以聚类质心作为工作纤维束.
    pub num_centroids: usize,

    /// 聚类的初始距离阈值 (毫米).
    pub start_cluster_size: f64,

    /// 初始投票距离阈值的倍数.
    pub multiplier: f64,
}

impl Default for ParcelParams {
    fn default() -> Self {
        Self {
            num_parcels: 10,
            num_centroids: 0,
            start_cluster_size: 5.0,
            multiplier: 1.0,
        }
    }
}

impl ParcelParams {
    /// 检查参数取值.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=MAX_PARCELS).contains(&self.num_parcels) {
            return Err(ConfigError::invalid(
                "num_parcels",
                format!("{} not in [2, {MAX_PARCELS}]", self.num_parcels),
            ));
        }
        if !(self.multiplier > 0.0 && self.multiplier.is_finite()) {
            return Err(ConfigError::invalid(
                "multiplier",
                format!("{} must be > 0", self.multiplier),
            ));
        }
        Ok(())
    }

    /// 设置分区个数.
    pub fn with_num_parcels(mut self, n: usize) -> Self {
        self.num_parcels = n;
        self
    }

    /// 设置质心个数.
    pub fn with_num_centroids(mut self, n: usize) -> Self {
        self.num_centroids = n;
        self
    }
}

/// 分区结果.
#[derive(Debug, Clone)]
pub struct Parcellation {
    /// 投票得到的原始标签.
    pub raw: LabelImage,

    /// 多数投票去噪后的标签.
    pub postprocessed: LabelImage,

    num_parcels: u8,
}

impl Parcellation {
    /// 分区个数.
    #[inline]
    pub fn num_parcels(&self) -> usize {
        self.num_parcels as usize
    }

    /// 去噪后每个分区各自的 0/1 掩膜, 恰好 `num_parcels` 个.
    pub fn binary_split(&self) -> Vec<LabelImage> {
        self.postprocessed.binary_split(self.num_parcels)
    }
}

/// 两点的曼哈顿距离.
#[inline]
fn manhattan(a: &Vec3, b: &Vec3) -> f64 {
    (a - b).abs().sum()
}

/// 构建工作纤维束: 重采样后的原纤维束或其聚类质心, 每条 `num_parcels` 个点,
/// 并对齐方向.
fn working_tract(
    bundle: &FiberBundle,
    params: &ParcelParams,
    reference: Option<&FiberBundle>,
) -> Result<FiberBundle, ParcelError> {
    let k = params.num_parcels;
    let mut work = if params.num_centroids > 0 {
        let cp = ClusterParams {
            num_points: k,
            start_cluster_size: params.start_cluster_size,
            num_centroids: params.num_centroids,
            ..ClusterParams::default()
        };
        TractClusterer::new(cp)?.cluster(bundle).into_centroids()
    } else {
        let mut copy = bundle.clone();
        copy.resample_points(k);
        copy
    };

    let references: Vec<Vec<Vec3>> = match reference.filter(|r| !r.is_empty()) {
        Some(r) => r.iter().map(|f| resample_count(f, k)).collect(),
        None => vec![work.fiber(0).to_vec()],
    };
    let mut flipped = 0;
    for i in 0..work.len() {
        let r = &references[i.min(references.len() - 1)];
        if prefers_reversed(work.fiber(i), r) {
            work.flip_fiber(i);
            flipped += 1;
        }
    }
    debug!("工作纤维束 {} 条, 其中 {flipped} 条反向", work.len());
    Ok(work)
}

/// 对纤维束包络内的体素进行沿束分区.
///
/// `geometry` 为输出标签图像的网格. `reference` 给出时, 纤维方向与其对齐
/// (第 `i` 条工作纤维对齐参照的第 `i` 条, 超出时对齐最后一条);
/// 否则与第一条工作纤维对齐.
pub fn parcellate(
    bundle: &FiberBundle,
    geometry: &Geometry,
    params: &ParcelParams,
    reference: Option<&FiberBundle>,
) -> Result<Parcellation, ParcelError> {
    params.validate()?;
    if bundle.is_empty() {
        return Err(ParcelError::EmptyBundle);
    }
    let mean_length = bundle.mean_length();
    let base = mean_length / (2.0 * params.num_parcels as f64) * params.multiplier;
    if !(base > 0.0) {
        return Err(ParcelError::DegenerateBundle);
    }

    let work = working_tract(bundle, params, reference)?;
    let diagonal = work.diagonal();
    let envelope = bundle.envelope(geometry);
    let voxels = envelope.filter_pos(|v| v != BACKGROUND);
    info!(
        "分区开始: {} 个分区, 包络 {} 个体素, 初始阈值 {base:.2} mm",
        params.num_parcels,
        voxels.len()
    );

    let labels = par::map_slice(&voxels, |&v| {
        label_voxel(&geometry.voxel_center(v), &work, params.num_parcels, base, diagonal)
    });
    let mut raw = LabelImage::zeros(geometry.clone());
    let mut unlabeled = 0usize;
    for (v, l) in voxels.iter().zip(labels) {
        raw[*v] = l;
        unlabeled += usize::from(l == BACKGROUND);
    }
    if unlabeled > 0 {
        warn!("{unlabeled} 个包络体素超出放宽上限, 保持为背景");
    }

    let postprocessed = postprocess(&raw, POSTPROCESS_PASSES);
    Ok(Parcellation {
        raw,
        postprocessed,
        num_parcels: params.num_parcels as u8,
    })
}

/// 以反距离加权投票确定体素 `p` 的分区. 每条工作纤维只对其最近点投票.
fn label_voxel(p: &Vec3, work: &FiberBundle, k: usize, base: f64, diagonal: f64) -> u8 {
    let nearest: Vec<(usize, f64)> = work
        .iter()
        .filter_map(|f| {
            f.iter()
                .map(|q| manhattan(p, q))
                .enumerate()
                .min_by_key(|&(_, d)| OrderedFloat(d))
        })
        .collect();

    let mut widen = 1;
    loop {
        let threshold = base * widen as f64;
        let mut votes = vec![0.0; k];
        let mut any = false;
        for &(idx, d) in &nearest {
            if d <= threshold {
                votes[idx] += 1.0 / d.max(f64::EPSILON);
                any = true;
            }
        }
        if any {
            let best = votes
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)))
                .map_or(0, |(i, _)| i);
            return (best + 1) as u8;
        }
        widen += 1;
        if base * widen as f64 > diagonal {
            return BACKGROUND;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeometryAttr;

    fn grid() -> Geometry {
        Geometry::isotropic((20, 5, 5), 1.0).unwrap()
    }

    fn line(y: f64, reversed: bool) -> Vec<Vec3> {
        let mut f: Vec<_> = (0..20).map(|i| Vec3::new(i as f64, y, 2.0)).collect();
        if reversed {
            f.reverse();
        }
        f
    }

    fn bundle() -> FiberBundle {
        FiberBundle::try_from_fibers([line(1.0, false), line(2.0, true), line(3.0, false)]).unwrap()
    }

    #[test]
    fn test_labels_follow_tract() {
        let params = ParcelParams::default().with_num_parcels(4);
        let p = parcellate(&bundle(), &grid(), &params, None).unwrap();
        for y in 1..=3 {
            let row: Vec<u8> = (0..20).map(|x| p.postprocessed[(x, y, 2)]).collect();
            assert_eq!(row[0], 1);
            assert_eq!(row[19], 4);
            assert!(row.windows(2).all(|w| w[0] <= w[1]));
        }
        assert_eq!(p.raw.count_nonzero(), 60);
        assert_eq!(p.postprocessed[(5, 0, 2)], 0);
    }

    #[test]
    fn test_binary_split_partitions_labels() {
        let params = ParcelParams::default().with_num_parcels(4);
        let p = parcellate(&bundle(), &grid(), &params, None).unwrap();
        let masks = p.binary_split();
        assert_eq!(masks.len(), 4);
        let total: usize = masks.iter().map(|m| m.count_nonzero()).sum();
        assert_eq!(total, p.postprocessed.count_nonzero());
        for v in p.postprocessed.filter_pos(|l| l != 0) {
            assert_eq!(masks.iter().filter(|m| m[v] == 1).count(), 1);
        }
    }

    #[test]
    fn test_reference_orientation() {
        let params = ParcelParams::default().with_num_parcels(4);
        let mut reference = FiberBundle::new();
        reference.push(&line(2.0, true));
        let p = parcellate(&bundle(), &grid(), &params, Some(&reference)).unwrap();
        assert_eq!(p.postprocessed[(0, 2, 2)], 4);
        assert_eq!(p.postprocessed[(19, 2, 2)], 1);
        assert_eq!(p.postprocessed.geometry().shape(), (20, 5, 5));
    }

    #[test]
    fn test_centroid_working_tract() {
        let params = ParcelParams::default()
            .with_num_parcels(5)
            .with_num_centroids(1);
        let p = parcellate(&bundle(), &grid(), &params, None).unwrap();
        assert_eq!(p.raw.max_label(), 5);
        assert_eq!(p.raw.count_nonzero(), 60);
    }

    #[test]
    fn test_widening_is_capped() {
        // 两条相距 14 mm 的短纤维合并为一个质心, 质心位于两者正中.
        // 包络体素到质心至少 7 mm, 超过质心外包盒对角线 3 mm.
        let g = Geometry::isotropic((20, 20, 5), 1.0).unwrap();
        let short = |y: f64| -> Vec<Vec3> { (2..=5).map(|x| Vec3::new(x as f64, y, 2.0)).collect() };
        let b = FiberBundle::try_from_fibers([short(2.0), short(16.0)]).unwrap();
        let params = ParcelParams {
            start_cluster_size: 100.0,
            ..ParcelParams::default()
        }
        .with_num_parcels(2)
        .with_num_centroids(1);
        let p = parcellate(&b, &g, &params, None).unwrap();
        assert_eq!(b.envelope(&g).count_nonzero(), 8);
        assert_eq!(p.raw.count_nonzero(), 0);
        assert_eq!(p.postprocessed.count_nonzero(), 0);
    }

    #[test]
    fn test_errors() {
        let params = ParcelParams::default();
        assert_eq!(
            parcellate(&FiberBundle::new(), &grid(), &params, None).unwrap_err(),
            ParcelError::EmptyBundle
        );
        let bad = ParcelParams::default().with_num_parcels(1);
        assert!(matches!(
            parcellate(&bundle(), &grid(), &bad, None),
            Err(ParcelError::Config(_))
        ));
    }
}

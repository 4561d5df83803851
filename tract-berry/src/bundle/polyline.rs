//! 单条折线上的几何运算.

use binary_heap_plus::BinaryHeap;
use itertools::Itertools;

use crate::{Geometry, GeometryAttr, Idx3d, Vec3};

/// 折线总长度.
#[inline]
pub fn polyline_length(points: &[Vec3]) -> f64 {
    points
        .iter()
        .tuple_windows()
        .map(|(a, b)| (b - a).norm())
        .sum()
}

/// 按弧长等间距重采样为 `n` 个点 (含两端点). `n >= 2`.
///
/// 零长度折线得到 `n` 个相同的点.
pub fn resample_count(points: &[Vec3], n: usize) -> Vec<Vec3> {
    assert!(n >= 2, "至少需要两个采样点");
    assert!(!points.is_empty());
    let total = polyline_length(points);
    if points.len() == 1 || total <= f64::EPSILON {
        return vec![points[0]; n];
    }
    let step = total / (n - 1) as f64;
    let mut out = Vec::with_capacity(n);
    out.push(points[0]);

    // 当前所在线段 `[seg, seg + 1]` 以及该线段起点处的累计弧长
    let mut seg = 0;
    let mut seg_start = 0.0;
    let mut seg_len = (points[1] - points[0]).norm();
    for k in 1..n - 1 {
        let target = step * k as f64;
        while seg_start + seg_len < target && seg + 2 < points.len() {
            seg_start += seg_len;
            seg += 1;
            seg_len = (points[seg + 1] - points[seg]).norm();
        }
        let t = if seg_len > 0.0 {
            ((target - seg_start) / seg_len).clamp(0.0, 1.0)
        } else {
            0.0
        };
        out.push(points[seg] + (points[seg + 1] - points[seg]) * t);
    }
    out.push(points[points.len() - 1]);
    out
}

/// 按弧长间距 `spacing` (毫米) 重采样, 至少保留两个点.
pub fn resample_spacing(points: &[Vec3], spacing: f64) -> Vec<Vec3> {
    assert!(spacing > 0.0);
    let n = (polyline_length(points) / spacing).round() as usize + 1;
    resample_count(points, n.max(2))
}

/// 点 `p` 到线段 `ab` 的距离.
#[inline]
pub(crate) fn point_segment_distance(p: &Vec3, a: &Vec3, b: &Vec3) -> f64 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 <= f64::EPSILON {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

/// 压缩折线: 反复删除删除误差最小的内部点, 直到任一删除都会使误差超过
/// `max_error` (毫米). 误差为所有已删除点到保留折线对应线段的最大距离.
///
/// 两端点始终保留.
pub fn compress(points: &[Vec3], max_error: f64) -> Vec<Vec3> {
    let n = points.len();
    if n <= 2 {
        return points.to_vec();
    }
    let mut prev: Vec<usize> = (0..n).map(|i| i.saturating_sub(1)).collect();
    let mut next: Vec<usize> = (0..n).map(|i| (i + 1).min(n - 1)).collect();
    let mut alive = vec![true; n];
    let mut version = vec![0u32; n];

    // 删除 `(lo, hi)` 之间的所有点后产生的误差
    let error = |lo: usize, hi: usize| -> f64 {
        ((lo + 1)..hi)
            .map(|j| point_segment_distance(&points[j], &points[lo], &points[hi]))
            .fold(0.0, f64::max)
    };

    // 堆顶误差最小
    let mut heap: BinaryHeap<(f64, usize, u32), _> =
        BinaryHeap::new_by(|a: &(f64, usize, u32), b: &(f64, usize, u32)| b.0.total_cmp(&a.0));
    heap.reserve(n);
    for i in 1..n - 1 {
        heap.push((error(i - 1, i + 1), i, 0));
    }

    while let Some((e, i, v)) = heap.pop() {
        if !alive[i] || v != version[i] {
            continue;
        }
        if e > max_error {
            break;
        }
        alive[i] = false;
        let (p, q) = (prev[i], next[i]);
        next[p] = q;
        prev[q] = p;
        for k in [p, q] {
            if k != 0 && k != n - 1 {
                version[k] += 1;
                heap.push((error(prev[k], next[k]), k, version[k]));
            }
        }
    }

    points
        .iter()
        .zip(&alive)
        .filter_map(|(p, a)| a.then_some(*p))
        .collect()
}

/// 两条点数相同的折线的平均逐点距离: `(正向, 反向)`.
pub fn paired_distances(a: &[Vec3], b: &[Vec3]) -> (f64, f64) {
    assert_eq!(a.len(), b.len());
    let n = a.len().max(1) as f64;
    let forward: f64 = a.iter().zip(b).map(|(p, q)| (p - q).norm()).sum();
    let reversed: f64 = a.iter().zip(b.iter().rev()).map(|(p, q)| (p - q).norm()).sum();
    (forward / n, reversed / n)
}

/// 与 `reference` 逐点比较时, `fiber` 反向是否更接近.
#[inline]
pub fn prefers_reversed(fiber: &[Vec3], reference: &[Vec3]) -> bool {
    let (f, r) = paired_distances(fiber, reference);
    r < f
}

/// 折线经过的体素 (按行优先排序, 去重). 每段线段以不超过最小体素间距
/// 四分之一的步长细分.
pub(crate) fn visited_voxels(points: &[Vec3], geometry: &Geometry) -> Vec<Idx3d> {
    let step = geometry.min_spacing() * 0.25;
    let mut voxels: Vec<Idx3d> = points.iter().filter_map(|p| geometry.nearest_voxel(p)).collect();
    for (a, b) in points.iter().tuple_windows() {
        let len = (b - a).norm();
        let k = (len / step).ceil() as usize;
        voxels.extend((1..k).filter_map(|s| {
            let t = s as f64 / k as f64;
            geometry.nearest_voxel(&(a + (b - a) * t))
        }));
    }
    voxels.sort_unstable();
    voxels.dedup();
    voxels
}

//! 分区结果的多数投票去噪.

use crate::consts::BACKGROUND;
use crate::{par, GeometryAttr, Idx3d, LabelImage};

/// `(i, j, k)` 的 26 邻域 (不含中心), 越界的邻居被跳过.
fn neighbours_26((i, j, k): Idx3d, (ni, nj, nk): Idx3d) -> impl Iterator<Item = Idx3d> {
    let range = |c: usize, n: usize| c.saturating_sub(1)..=(c + 1).min(n - 1);
    itertools::iproduct!(range(i, ni), range(j, nj), range(k, nk))
        .filter(move |&p| p != (i, j, k))
}

/// 单轮多数投票.
///
/// 对每个非背景体素, 统计 26 邻域中的非背景标签 (不含自身).
/// 票数最多的标签胜出; 平票时若当前标签在其中则保持不变, 否则取最小标签.
/// 没有非背景邻居的体素保持不变.
pub fn majority_pass(labels: &LabelImage) -> LabelImage {
    let shape = labels.geometry().shape();
    let voxels = labels.filter_pos(|v| v != BACKGROUND);
    let updated = par::map_slice(&voxels, |&v| {
        let mut votes = [0u32; 256];
        for n in neighbours_26(v, shape) {
            let l = labels[n];
            if l != BACKGROUND {
                votes[l as usize] += 1;
            }
        }
        let best = votes.iter().copied().max().unwrap_or(0);
        let current = labels[v];
        if best == 0 || votes[current as usize] == best {
            current
        } else {
            // 第一个达到最大票数的即为最小标签
            votes.iter().position(|&c| c == best).map_or(current, |l| l as u8)
        }
    });
    let mut out = labels.clone();
    for (v, l) in voxels.into_iter().zip(updated) {
        out[v] = l;
    }
    out
}

/// 连续执行 `passes` 轮多数投票, 每轮以上一轮的输出为输入.
pub fn postprocess(labels: &LabelImage, passes: usize) -> LabelImage {
    (0..passes).fold(labels.clone(), |acc, _| majority_pass(&acc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Geometry;
    use ndarray::Array3;

    fn two_blocks() -> LabelImage {
        let g = Geometry::isotropic((10, 4, 4), 1.0).unwrap();
        let data = Array3::from_shape_fn((10, 4, 4), |(i, _, _)| if i < 5 { 1 } else { 2 });
        LabelImage::new(g, data).unwrap()
    }

    #[test]
    fn test_neighbours() {
        assert_eq!(neighbours_26((1, 1, 1), (3, 3, 3)).count(), 26);
        assert_eq!(neighbours_26((0, 0, 0), (3, 3, 3)).count(), 7);
    }

    #[test]
    fn test_speckle_removed() {
        let mut labels = two_blocks();
        labels[(2, 1, 1)] = 2;
        let out = postprocess(&labels, 3);
        assert_eq!(out[(2, 1, 1)], 1);
        assert_eq!(out.data(), two_blocks().data());
    }

    #[test]
    fn test_idempotent_on_clean_volume() {
        let once = postprocess(&two_blocks(), 3);
        assert_eq!(once.data(), two_blocks().data());
        let twice = postprocess(&once, 3);
        assert_eq!(twice.data(), once.data());
    }

    #[test]
    fn test_background_untouched() {
        let mut labels = two_blocks();
        labels[(0, 0, 0)] = 0;
        let out = majority_pass(&labels);
        assert_eq!(out[(0, 0, 0)], 0);
    }
}

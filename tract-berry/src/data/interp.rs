//! 连续体素索引上的采样权重.

use super::Geometry;
use crate::{Idx3d, Vec3};

/// 一次采样所涉及的体素及其权重. 最多 8 个体素.
///
/// 权重之和恒为 1. 网格外的点不会产生 `Sampler`.
#[derive(Debug, Clone)]
pub(crate) struct Sampler {
    voxels: [Idx3d; 8],
    weights: [f64; 8],
    len: usize,
}

impl Sampler {
    /// 为世界坐标 `p` 构造采样器. `interpolate` 为 `false` 时退化为最近邻.
    ///
    /// 越界时返回 `None`.
    pub fn new(geometry: &Geometry, p: &Vec3, interpolate: bool) -> Option<Self> {
        let idx = geometry.world_to_index(p);
        if !geometry.contains_index(&idx) {
            return None;
        }
        if interpolate {
            Some(Self::trilinear(geometry.shape(), &idx))
        } else {
            let v = (
                (idx.x + 0.5).floor() as usize,
                (idx.y + 0.5).floor() as usize,
                (idx.z + 0.5).floor() as usize,
            );
            Some(Self::single(v))
        }
    }

    #[inline]
    fn single(v: Idx3d) -> Self {
        let mut voxels = [(0, 0, 0); 8];
        let mut weights = [0.0; 8];
        voxels[0] = v;
        weights[0] = 1.0;
        Self {
            voxels,
            weights,
            len: 1,
        }
    }

    /// 三线性插值. 超出网格的邻居被钳制到边界体素 (即边界处的最近邻回退).
    fn trilinear((ni, nj, nk): Idx3d, idx: &Vec3) -> Self {
        // (下界, 上界, 上界权重)
        let axis = |v: f64, n: usize| -> (usize, usize, f64) {
            let base = v.floor();
            let frac = v - base;
            let lo = (base.max(0.0) as usize).min(n - 1);
            let hi = ((base + 1.0).max(0.0) as usize).min(n - 1);
            (lo, hi, frac)
        };
        let (i0, i1, fi) = axis(idx.x, ni);
        let (j0, j1, fj) = axis(idx.y, nj);
        let (k0, k1, fk) = axis(idx.z, nk);

        let mut voxels = [(0, 0, 0); 8];
        let mut weights = [0.0; 8];
        let mut len = 0;
        for (i, wi) in [(i0, 1.0 - fi), (i1, fi)] {
            for (j, wj) in [(j0, 1.0 - fj), (j1, fj)] {
                for (k, wk) in [(k0, 1.0 - fk), (k1, fk)] {
                    let w = wi * wj * wk;
                    if w > 0.0 {
                        voxels[len] = (i, j, k);
                        weights[len] = w;
                        len += 1;
                    }
                }
            }
        }
        Self {
            voxels,
            weights,
            len,
        }
    }

    /// 迭代 `(体素, 权重)`.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (Idx3d, f64)> + '_ {
        self.voxels[..self.len]
            .iter()
            .copied()
            .zip(self.weights[..self.len].iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_is_exact() {
        let g = Geometry::isotropic((3, 3, 3), 1.5).unwrap();
        let s = Sampler::new(&g, &g.voxel_center((1, 2, 0)), true).unwrap();
        let v: Vec<_> = s.iter().collect();
        assert_eq!(v, vec![((1, 2, 0), 1.0)]);
    }

    #[test]
    fn test_weights_sum_to_one() {
        let g = Geometry::isotropic((3, 3, 3), 1.0).unwrap();
        for p in [
            Vec3::new(0.3, 1.7, 0.5),
            Vec3::new(-0.4, 2.4, 1.0),
            Vec3::new(2.2, 0.0, 0.1),
        ] {
            let s = Sampler::new(&g, &p, true).unwrap();
            let sum: f64 = s.iter().map(|(_, w)| w).sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
        assert!(Sampler::new(&g, &Vec3::new(2.5, 0.0, 0.0), true).is_none());
    }
}

//! 固定的半球采样方向表.

use once_cell::sync::Lazy;

use crate::Vec3;

/// 半球采样方向个数.
const HEMISPHERE_SIZE: usize = 200;

/// 邻居判定角度相对于平均采样间距的倍数.
const NEIGHBOUR_SPAN: f64 = 1.6;

/// ODF 与随机森林共用的半球方向表 (轴向对称, 每个方向代表 `±d`).
pub static SPHERE: Lazy<Sphere> = Lazy::new(|| Sphere::fibonacci_hemisphere(HEMISPHERE_SIZE));

/// 半球上的方向集合, 以及每个方向的邻居 (按轴向夹角计算).
#[derive(Debug, Clone)]
pub struct Sphere {
    dirs: Vec<Vec3>,
    neighbours: Vec<Vec<usize>>,
}

impl Sphere {
    /// 取 `2n` 点 Fibonacci 球面的上半部分 (`z > 0`), 得到 `n` 个近似均匀的方向.
    pub fn fibonacci_hemisphere(n: usize) -> Self {
        assert!(n >= 2);
        let golden = std::f64::consts::PI * (3.0 - 5f64.sqrt());
        let total = 2 * n;
        let dirs: Vec<Vec3> = (0..n)
            .map(|i| {
                let z = 1.0 - (2 * i + 1) as f64 / total as f64;
                let r = (1.0 - z * z).max(0.0).sqrt();
                let phi = golden * i as f64;
                Vec3::new(r * phi.cos(), r * phi.sin(), z)
            })
            .collect();

        // 半球面积 2π, 平均每点占 2π / n.
        let spacing = (2.0 * std::f64::consts::PI / n as f64).sqrt();
        let cos_span = (NEIGHBOUR_SPAN * spacing).cos();
        let neighbours = dirs
            .iter()
            .enumerate()
            .map(|(i, a)| {
                dirs.iter()
                    .enumerate()
                    .filter(|&(j, b)| j != i && a.dot(b).abs() >= cos_span)
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();
        Self { dirs, neighbours }
    }

    /// 方向个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    /// 是否为空. 固定表永远非空.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// 全部方向.
    #[inline]
    pub fn dirs(&self) -> &[Vec3] {
        &self.dirs
    }

    /// 第 `i` 个方向的邻居索引.
    #[inline]
    pub fn neighbours(&self, i: usize) -> &[usize] {
        &self.neighbours[i]
    }

    /// 在 `values` 上寻找局部极大值 (与所有邻居相比). 平台区取索引最小者.
    ///
    /// 只返回值不低于 `min_value` 的极大值.
    pub fn local_maxima(&self, values: &[f64], min_value: f64) -> Vec<usize> {
        debug_assert_eq!(values.len(), self.len());
        (0..self.len())
            .filter(|&i| {
                let v = values[i];
                v >= min_value
                    && v > 0.0
                    && self.neighbours[i]
                        .iter()
                        .all(|&j| if j < i { v > values[j] } else { v >= values[j] })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sphere_is_unit_hemisphere() {
        let s = &*SPHERE;
        assert_eq!(s.len(), HEMISPHERE_SIZE);
        for d in s.dirs() {
            assert!((d.norm() - 1.0).abs() < 1e-12);
            assert!(d.z > 0.0);
        }
        assert!((0..s.len()).all(|i| !s.neighbours(i).is_empty()));
    }

    #[test]
    fn test_single_lobe_has_one_maximum() {
        let s = &*SPHERE;
        let axis = Vec3::new(1.0, 0.0, 0.0);
        let values: Vec<f64> = s.dirs().iter().map(|d| d.dot(&axis).powi(8)).collect();
        let maxima = s.local_maxima(&values, 0.5);
        assert_eq!(maxima.len(), 1);
        assert!(s.dirs()[maxima[0]].dot(&axis).abs() > 0.97);
    }
}

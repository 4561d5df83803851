//! 合成体模.

use ndarray::{Array3, Array4};
use tract_berry::prelude::*;

/// 半圆形纤维束与一条水平直线束交叉的体模.
///
/// 向量场每个体素保存两个峰值 (6 通道): 半圆切向峰值幅值为 1,
/// 直线束峰值 `(1, 0, 0)` 幅值为 0.8. 只有直线束经过的体素把它放在第一个槽位.
pub struct Phantom {
    /// 峰值向量场.
    pub field: VectorField,

    /// 两条纤维束的并集.
    pub mask: ScalarImage,

    /// 半圆左端点附近的体素.
    pub seed: ScalarImage,

    /// 沿 x 方向线性增长的标量图, 用于 tractometry.
    pub scalar: ScalarImage,
}

/// 构建半径为 `radius` 个体素的半圆体模. 体素间距 2 mm.
pub fn arc_and_line(radius: usize) -> Phantom {
    let shape = (2 * radius + 7, radius + 7, 5);
    let geometry = Geometry::isotropic(shape, 2.0).unwrap();
    let r = radius as f64;
    let (cx, cy) = (r + 3.0, 3.0);
    let line_row = (cy + 0.5 * r).round() as usize;

    let mut peaks = Array4::<f32>::zeros((shape.0, shape.1, shape.2, 6));
    let mut mask = Array3::<f32>::zeros(shape);
    let mut seed = Array3::<f32>::zeros(shape);
    for i in 0..shape.0 {
        for j in 0..shape.1 {
            // 上下各留一层空白
            for k in 1..shape.2 - 1 {
                let (x, y) = (i as f64 - cx, j as f64 - cy);
                let mut slot = 0;
                if y >= 0.0 && ((x * x + y * y).sqrt() - r).abs() < 0.75 {
                    let t = Vec3::new(-y, x, 0.0).normalize();
                    peaks[[i, j, k, 0]] = t.x as f32;
                    peaks[[i, j, k, 1]] = t.y as f32;
                    mask[[i, j, k]] = 1.0;
                    if y < 1.0 && x < 0.0 {
                        seed[[i, j, k]] = 1.0;
                    }
                    slot = 3;
                }
                if j == line_row && (2..shape.0 - 2).contains(&i) {
                    peaks[[i, j, k, slot]] = 0.8;
                    mask[[i, j, k]] = 1.0;
                }
            }
        }
    }
    let scalar = Array3::from_shape_fn(shape, |(i, _, _)| i as f32);

    Phantom {
        field: VectorField::new(geometry.clone(), peaks).unwrap(),
        mask: ScalarImage::new(geometry.clone(), mask).unwrap(),
        seed: ScalarImage::new(geometry.clone(), seed).unwrap(),
        scalar: ScalarImage::new(geometry, scalar).unwrap(),
    }
}

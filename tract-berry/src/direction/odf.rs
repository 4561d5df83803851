//! 方向分布函数 (ODF) 模型.
//!
//! ODF 既可以是在固定半球 [`SPHERE`] 上直接采样的值, 也可以是
//! 实对称球谐系数 (偶数阶 `L`, 共 `(L+1)(L+2)/2` 个), 后者在构建时
//! 预先计算到半球上的基矩阵.

use ndarray::Array2;

use super::sphere::SPHERE;
use super::{Candidate, Flip};
use crate::track::ConfigError;
use crate::{Geometry, GeometryAttr, Vec3, VectorField};

/// 支持的最高球谐阶数.
const MAX_SH_ORDER: usize = 16;

/// ODF 的存储方式.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdfBasis {
    /// 在固定半球上的采样值.
    Sampled,

    /// 实对称球谐系数, `order` 为最高阶 (偶数).
    Sh {
        /// 最高阶.
        order: usize,
    },
}

/// ODF 追踪模型.
#[derive(Debug, Clone)]
pub struct OdfModel {
    field: VectorField,
    basis: OdfBasis,

    /// `[半球方向, 系数]` 的基矩阵. 采样存储时为 `None`.
    matrix: Option<Array2<f64>>,

    /// 锐化指数 (归一化后取幂).
    sharpen: f64,

    /// 归一化 ODF 的极大值阈值.
    pub(crate) odf_cutoff: f64,

    /// 翻转配置.
    pub(crate) flip: Flip,

    /// GFA 阈值.
    pub(crate) cutoff: f64,
}

impl OdfModel {
    fn with_basis(field: VectorField, basis: OdfBasis, matrix: Option<Array2<f64>>) -> Self {
        Self {
            field,
            basis,
            matrix,
            sharpen: 1.0,
            odf_cutoff: 0.1,
            flip: Flip::default(),
            cutoff: 0.1,
        }
    }

    /// 从球谐系数场构建. 通道数必须为某个偶数阶 `L` 的 `(L+1)(L+2)/2`.
    pub fn from_sh(field: VectorField) -> Result<Self, ConfigError> {
        let c = field.channels();
        let order = (0..=MAX_SH_ORDER)
            .step_by(2)
            .find(|l| num_sh_coefficients(*l) == c)
            .ok_or_else(|| ConfigError::ChannelMismatch {
                what: "sh",
                expected: "(L+1)(L+2)/2 for an even order L".to_owned(),
                found: c,
            })?;
        let matrix = sh_basis_matrix(order, SPHERE.dirs());
        Ok(Self::with_basis(field, OdfBasis::Sh { order }, Some(matrix)))
    }

    /// 从半球采样值构建. 通道数必须等于固定半球的方向个数.
    pub fn from_samples(field: VectorField) -> Result<Self, ConfigError> {
        if field.channels() != SPHERE.len() {
            return Err(ConfigError::ChannelMismatch {
                what: "odf",
                expected: SPHERE.len().to_string(),
                found: field.channels(),
            });
        }
        Ok(Self::with_basis(field, OdfBasis::Sampled, None))
    }

    /// 设置锐化指数 (必须为正).
    pub fn with_sharpen(mut self, power: f64) -> Result<Self, ConfigError> {
        if !(power > 0.0 && power.is_finite()) {
            return Err(ConfigError::invalid("sharpen", format!("{power} must be > 0")));
        }
        self.sharpen = power;
        Ok(self)
    }

    /// 设置极大值阈值 (归一化 ODF 值).
    pub fn with_odf_cutoff(mut self, cutoff: f64) -> Self {
        self.odf_cutoff = cutoff;
        self
    }

    /// 设置 GFA 阈值.
    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }

    /// 存储方式.
    #[inline]
    pub fn basis(&self) -> OdfBasis {
        self.basis
    }

    #[inline]
    pub(crate) fn geometry(&self) -> &Geometry {
        self.field.geometry()
    }

    /// 在 `p` 处计算半球上的 ODF 值 (未截断, 未归一化). 越界返回 `None`.
    fn odf_at(&self, p: &Vec3, interpolate: bool) -> Option<Vec<f64>> {
        let mut coeffs = vec![0f32; self.field.channels()];
        if !self.field.sample_into(p, interpolate, &mut coeffs) {
            return None;
        }
        let values: Vec<f64> = match &self.matrix {
            Some(m) => m
                .rows()
                .into_iter()
                .map(|row| {
                    row.iter()
                        .zip(coeffs.iter())
                        .map(|(b, c)| b * *c as f64)
                        .sum()
                })
                .collect(),
            None => coeffs.iter().map(|v| *v as f64).collect(),
        };
        values.iter().all(|v| v.is_finite()).then_some(values)
    }

    pub(crate) fn directions(
        &self,
        p: &Vec3,
        _prev: Option<&Vec3>,
        interpolate: bool,
        out: &mut Vec<Candidate>,
    ) {
        let Some(mut values) = self.odf_at(p, interpolate) else {
            return;
        };
        if generalized_fa(&values) < self.cutoff {
            return;
        }
        let max = values.iter().copied().fold(0.0, f64::max);
        if max <= 0.0 {
            return;
        }
        values.iter_mut().for_each(|v| {
            *v = (v.max(0.0) / max).powf(self.sharpen);
        });
        let dirs = SPHERE.dirs();
        out.extend(
            SPHERE
                .local_maxima(&values, self.odf_cutoff)
                .into_iter()
                .map(|i| Candidate {
                    dir: dirs[i],
                    weight: values[i],
                }),
        );
    }

    /// GFA.
    pub(crate) fn signal(&self, p: &Vec3, interpolate: bool) -> f64 {
        self.odf_at(p, interpolate)
            .map_or(0.0, |v| generalized_fa(&v))
    }
}

/// 广义各向异性分数: `std / rms`. 负值先截断为 0.
fn generalized_fa(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let (sum, sum2) = values
        .iter()
        .map(|v| v.max(0.0))
        .fold((0.0, 0.0), |(s, s2), v| (s + v, s2 + v * v));
    if sum2 <= f64::EPSILON {
        return 0.0;
    }
    let mean = sum / n;
    let var = (sum2 / n - mean * mean).max(0.0);
    (var * n / (n - 1.0) / (sum2 / n)).sqrt().min(1.0)
}

/// 偶数阶 `order` 对应的实对称球谐系数个数.
#[inline]
pub(crate) fn num_sh_coefficients(order: usize) -> usize {
    (order + 1) * (order + 2) / 2
}

/// 计算 `[dirs.len(), num_sh_coefficients(order)]` 的实对称球谐基矩阵.
///
/// 系数顺序: 对每个偶数阶 `l`, `m` 从 `-l` 到 `l`.
/// `m < 0` 取 `√2·N·P_l^|m|·sin(|m|φ)`, `m > 0` 取 `√2·N·P_l^m·cos(mφ)`.
pub(crate) fn sh_basis_matrix(order: usize, dirs: &[Vec3]) -> Array2<f64> {
    assert!(order % 2 == 0);
    let mut matrix = Array2::zeros((dirs.len(), num_sh_coefficients(order)));
    for (mut row, d) in matrix.rows_mut().into_iter().zip(dirs) {
        let cos_theta = d.z.clamp(-1.0, 1.0);
        let phi = d.y.atan2(d.x);
        let legendre = associated_legendre(order, cos_theta);
        for l in (0..=order).step_by(2) {
            let center = l * (l + 1) / 2;
            for m in 0..=l {
                let y = normalization(l, m) * legendre[l][m];
                if m == 0 {
                    row[center] = y;
                } else {
                    let mf = m as f64;
                    row[center + m] = std::f64::consts::SQRT_2 * y * (mf * phi).cos();
                    row[center - m] = std::f64::consts::SQRT_2 * y * (mf * phi).sin();
                }
            }
        }
    }
    matrix
}

/// `sqrt((2l+1)/(4π) · (l-m)!/(l+m)!)`.
fn normalization(l: usize, m: usize) -> f64 {
    let ratio: f64 = ((l - m + 1)..=(l + m)).map(|k| 1.0 / k as f64).product();
    ((2 * l + 1) as f64 / (4.0 * std::f64::consts::PI) * ratio).sqrt()
}

/// 关联勒让德函数 `P_l^m(x)` (含 Condon-Shortley 相位), `0 <= m <= l <= order`.
fn associated_legendre(order: usize, x: f64) -> Vec<Vec<f64>> {
    let mut p = vec![vec![0.0; order + 1]; order + 1];
    let s = (1.0 - x * x).max(0.0).sqrt();
    p[0][0] = 1.0;
    for m in 1..=order {
        p[m][m] = -((2 * m - 1) as f64) * s * p[m - 1][m - 1];
    }
    for m in 0..order {
        p[m + 1][m] = x * (2 * m + 1) as f64 * p[m][m];
    }
    for m in 0..=order {
        for l in (m + 2)..=order {
            p[l][m] = ((2 * l - 1) as f64 * x * p[l - 1][m] - (l + m - 1) as f64 * p[l - 2][m])
                / (l - m) as f64;
        }
    }
    p
}

//! 扩散张量模型.

use nalgebra::SymmetricEigen;

use super::{Candidate, Flip};
use crate::track::ConfigError;
use crate::{Geometry, GeometryAttr, Mat3, Vec3, VectorField};

/// 张量通道数, 依次为 `xx, xy, xz, yy, yz, zz`.
const TENSOR_CHANNELS: usize = 6;

/// 由特征值计算各向异性分数 (FA). 全零张量的 FA 为 0.
pub fn fractional_anisotropy(eigenvalues: &Vec3) -> f64 {
    let norm2 = eigenvalues.norm_squared();
    if norm2 <= f64::EPSILON {
        return 0.0;
    }
    let mean = eigenvalues.sum() / 3.0;
    let dev2: f64 = eigenvalues.iter().map(|l| (l - mean).powi(2)).sum();
    (1.5 * dev2 / norm2).sqrt().min(1.0)
}

/// 张量追踪模型.
///
/// 有上一步方向 `v` 时, 新方向为
/// `f·e1 + (1-f)·[g·normalize(T·v) + (1-g)·v]`, 其中 `e1` 为主特征向量.
/// `f = 1` 即 FACT, `f = 0, g = 1` 即 TEND.
#[derive(Debug, Clone)]
pub struct TensorModel {
    field: VectorField,
    f: f64,
    g: f64,

    /// 翻转配置.
    pub(crate) flip: Flip,

    /// FA 阈值.
    pub(crate) cutoff: f64,
}

impl TensorModel {
    /// 从 6 通道张量场构建.
    pub fn new(field: VectorField) -> Result<Self, ConfigError> {
        if field.channels() != TENSOR_CHANNELS {
            return Err(ConfigError::ChannelMismatch {
                what: "tensor",
                expected: TENSOR_CHANNELS.to_string(),
                found: field.channels(),
            });
        }
        Ok(Self {
            field,
            f: 1.0,
            g: 0.0,
            flip: Flip::default(),
            cutoff: 0.1,
        })
    }

    /// 设置偏转权重 `f` (FACT) 与 `g` (TEND). 二者均须在 `[0, 1]` 内.
    pub fn with_deflection(mut self, f: f64, g: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&f) {
            return Err(ConfigError::invalid("f", format!("{f} not in [0, 1]")));
        }
        if !(0.0..=1.0).contains(&g) {
            return Err(ConfigError::invalid("g", format!("{g} not in [0, 1]")));
        }
        self.f = f;
        self.g = g;
        Ok(self)
    }

    /// 设置 FA 阈值.
    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }

    #[inline]
    pub(crate) fn geometry(&self) -> &Geometry {
        self.field.geometry()
    }

    /// 在 `p` 处采样张量. 越界返回 `None`.
    fn tensor_at(&self, p: &Vec3, interpolate: bool) -> Option<Mat3> {
        let mut t = [0f32; TENSOR_CHANNELS];
        if !self.field.sample_into(p, interpolate, &mut t) {
            return None;
        }
        let [xx, xy, xz, yy, yz, zz] = t.map(|v| v as f64);
        let m = Mat3::new(xx, xy, xz, xy, yy, yz, xz, yz, zz);
        m.iter().all(|v| v.is_finite()).then_some(m)
    }

    /// `(主特征向量, FA)`.
    fn principal(t: Mat3) -> (Vec3, f64) {
        let eigen = SymmetricEigen::new(t);
        let i = eigen.eigenvalues.imax();
        let e1: Vec3 = eigen.eigenvectors.column(i).into_owned();
        (e1, fractional_anisotropy(&eigen.eigenvalues))
    }

    pub(crate) fn directions(
        &self,
        p: &Vec3,
        prev: Option<&Vec3>,
        interpolate: bool,
        out: &mut Vec<Candidate>,
    ) {
        let Some(t) = self.tensor_at(p, interpolate) else {
            return;
        };
        let (e1, fa) = Self::principal(t);
        if fa < self.cutoff {
            return;
        }
        let dir = match prev {
            Some(v) => {
                let e1 = if e1.dot(v) < 0.0 { -e1 } else { e1 };
                let tv = (t * v).try_normalize(f64::EPSILON).unwrap_or(*v);
                let tend = tv * self.g + *v * (1.0 - self.g);
                e1 * self.f + tend * (1.0 - self.f)
            }
            None => e1,
        };
        out.extend(Candidate::from_vec(dir, fa));
    }

    /// FA.
    pub(crate) fn signal(&self, p: &Vec3, interpolate: bool) -> f64 {
        self.tensor_at(p, interpolate)
            .map_or(0.0, |t| Self::principal(t).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(t: [f32; 6]) -> TensorModel {
        let g = Geometry::isotropic((3, 3, 3), 2.0).unwrap();
        TensorModel::new(VectorField::uniform(g, &t)).unwrap()
    }

    #[test]
    fn test_fa() {
        assert_eq!(fractional_anisotropy(&Vec3::zeros()), 0.0);
        assert!(fractional_anisotropy(&Vec3::new(1.0, 1.0, 1.0)).abs() < 1e-12);
        assert!((fractional_anisotropy(&Vec3::new(1.0, 0.0, 0.0)) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_principal_direction() {
        let m = model([0.2, 0.0, 0.0, 1.0, 0.0, 0.2]);
        let mut out = vec![];
        m.directions(&Vec3::new(2.0, 2.0, 2.0), None, true, &mut out);
        assert_eq!(out.len(), 1);
        assert!((out[0].dir.y.abs() - 1.0).abs() < 1e-9);
        assert!(out[0].weight > 0.5);
    }

    #[test]
    fn test_isotropic_below_cutoff() {
        let m = model([1.0, 0.0, 0.0, 1.0, 0.0, 1.0]);
        let mut out = vec![];
        m.directions(&Vec3::new(2.0, 2.0, 2.0), None, true, &mut out);
        assert!(out.is_empty());
        assert!(m.signal(&Vec3::new(2.0, 2.0, 2.0), true) < 1e-6);
    }

    #[test]
    fn test_deflection_keeps_previous() {
        let m = model([1.0, 0.0, 0.0, 0.1, 0.0, 0.1])
            .with_deflection(0.0, 0.0)
            .unwrap();
        let prev = Vec3::new(0.0, 0.0, -1.0);
        let mut out = vec![];
        m.directions(&Vec3::new(2.0, 2.0, 2.0), Some(&prev), true, &mut out);
        assert!((out[0].dir - prev).norm() < 1e-9);
        assert!(model([1.0; 6]).with_deflection(1.5, 0.0).is_err());
    }
}

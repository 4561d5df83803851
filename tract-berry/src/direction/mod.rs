//! 方向模型: 给定连续空间中的一点 (以及可选的上一步方向),
//! 给出候选传播方向及其权重.
//!
//! 四种模型 (峰值, 张量, ODF, 随机森林) 以和类型 [`DirectionModel`] 表示,
//! 在构建追踪器时确定一次, 积分热循环中不做任何向下转型.
//! 每种模型自己持有数据, 翻转与阈值配置, 没有共享的可变状态.

use std::fmt;
use std::str::FromStr;

use crate::track::ConfigError;
use crate::{Geometry, Vec3};

mod forest;
mod odf;
mod peaks;
mod sphere;
mod tensor;

pub use forest::{DecisionTree, Forest, ForestModel, TreeNode};
pub use odf::{OdfBasis, OdfModel};
pub use peaks::PeakModel;
pub use sphere::{Sphere, SPHERE};
pub use tensor::{fractional_anisotropy, TensorModel};

/// 候选方向. `dir` 为单位向量.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// 单位方向.
    pub dir: Vec3,

    /// 权重 (幅值, FA, 归一化 ODF 值或森林置信度).
    pub weight: f64,
}

impl Candidate {
    /// 以非零向量 `v` 构建. 零向量或非有限向量返回 `None`.
    #[inline]
    pub fn from_vec(v: Vec3, weight: f64) -> Option<Self> {
        let n = v.norm();
        (n > f64::EPSILON && n.is_finite()).then(|| Self {
            dir: v / n,
            weight,
        })
    }
}

/// 坐标轴翻转配置.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Flip {
    /// 翻转 x 分量.
    pub x: bool,

    /// 翻转 y 分量.
    pub y: bool,

    /// 翻转 z 分量.
    pub z: bool,
}

impl Flip {
    /// 以三个分量初始化.
    #[inline]
    pub const fn new(x: bool, y: bool, z: bool) -> Self {
        Self { x, y, z }
    }

    /// 对 `v` 施加翻转.
    #[inline]
    pub fn apply(&self, mut v: Vec3) -> Vec3 {
        if self.x {
            v.x = -v.x;
        }
        if self.y {
            v.y = -v.y;
        }
        if self.z {
            v.z = -v.z;
        }
        v
    }

    /// 对候选集合就地施加翻转.
    #[inline]
    pub(crate) fn apply_all(&self, candidates: &mut [Candidate]) {
        if *self != Self::default() {
            candidates
                .iter_mut()
                .for_each(|c| c.dir = self.apply(c.dir));
        }
    }
}

/// 方向模型种类. 可从字符串解析.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// 离散峰值.
    Peaks,

    /// 扩散张量.
    Tensor,

    /// 方向分布函数.
    Odf,

    /// 随机森林.
    RandomForest,
}

impl FromStr for ModelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "peaks" | "peak" => Ok(Self::Peaks),
            "tensor" | "dti" => Ok(Self::Tensor),
            "odf" | "csd" | "sh" => Ok(Self::Odf),
            "rf" | "forest" | "randomforest" | "random_forest" => Ok(Self::RandomForest),
            _ => Err(ConfigError::UnsupportedType("direction model", s.to_owned())),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Peaks => "peaks",
            Self::Tensor => "tensor",
            Self::Odf => "odf",
            Self::RandomForest => "random_forest",
        };
        f.write_str(s)
    }
}

/// 方向模型.
#[derive(Debug, Clone)]
pub enum DirectionModel {
    /// 离散峰值.
    Peaks(PeakModel),

    /// 扩散张量.
    Tensor(TensorModel),

    /// 方向分布函数.
    Odf(OdfModel),

    /// 随机森林.
    Forest(ForestModel),
}

impl From<PeakModel> for DirectionModel {
    fn from(m: PeakModel) -> Self {
        Self::Peaks(m)
    }
}

impl From<TensorModel> for DirectionModel {
    fn from(m: TensorModel) -> Self {
        Self::Tensor(m)
    }
}

impl From<OdfModel> for DirectionModel {
    fn from(m: OdfModel) -> Self {
        Self::Odf(m)
    }
}

impl From<ForestModel> for DirectionModel {
    fn from(m: ForestModel) -> Self {
        Self::Forest(m)
    }
}

macro_rules! dispatch {
    ($self: expr, $m: ident => $body: expr) => {
        match $self {
            DirectionModel::Peaks($m) => $body,
            DirectionModel::Tensor($m) => $body,
            DirectionModel::Odf($m) => $body,
            DirectionModel::Forest($m) => $body,
        }
    };
}

impl DirectionModel {
    /// 按模型种类, 以默认参数从向量场构建. 随机森林需要训练好的森林,
    /// 无法仅从向量场构建.
    pub fn from_kind(kind: ModelKind, field: crate::VectorField) -> Result<Self, ConfigError> {
        match kind {
            ModelKind::Peaks => PeakModel::new(field).map(Self::Peaks),
            ModelKind::Tensor => TensorModel::new(field).map(Self::Tensor),
            ModelKind::Odf => OdfModel::from_sh(field).map(Self::Odf),
            ModelKind::RandomForest => Err(ConfigError::MissingInput("forest")),
        }
    }

    /// 模型种类.
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Peaks(_) => ModelKind::Peaks,
            Self::Tensor(_) => ModelKind::Tensor,
            Self::Odf(_) => ModelKind::Odf,
            Self::Forest(_) => ModelKind::RandomForest,
        }
    }

    /// 模型数据所在的网格.
    pub fn geometry(&self) -> &Geometry {
        dispatch!(self, m => m.geometry())
    }

    /// 当前翻转配置.
    pub fn flip(&self) -> Flip {
        dispatch!(self, m => m.flip)
    }

    /// 设置翻转配置.
    pub fn set_flip(&mut self, flip: Flip) {
        dispatch!(self, m => m.flip = flip)
    }

    /// 设置数据阈值 (峰值幅值 / FA / GFA / 森林置信度).
    pub fn set_cutoff(&mut self, cutoff: f64) {
        dispatch!(self, m => m.cutoff = cutoff)
    }

    /// 设置 ODF 极大值的相对阈值. 只对 ODF 模型有效.
    pub fn set_odf_cutoff(&mut self, odf_cutoff: f64) {
        if let Self::Odf(m) = self {
            m.odf_cutoff = odf_cutoff;
        }
    }

    /// 在 `p` 处计算候选方向, 结果写入 `out` (先清空).
    ///
    /// 信号低于阈值, 越界或数据退化时 `out` 为空, 不会返回错误.
    /// 翻转已施加.
    pub fn directions(
        &self,
        p: &Vec3,
        prev: Option<&Vec3>,
        interpolate: bool,
        out: &mut Vec<Candidate>,
    ) {
        out.clear();
        dispatch!(self, m => m.directions(p, prev, interpolate, out));
        self.flip().apply_all(out);
    }

    /// 在 `p` 处的数据信号强度, 用于数据阈值停止判定.
    pub fn signal(&self, p: &Vec3, interpolate: bool) -> f64 {
        dispatch!(self, m => m.signal(p, interpolate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_kind_parse() {
        assert_eq!("Peaks".parse::<ModelKind>().unwrap(), ModelKind::Peaks);
        assert_eq!("dti".parse::<ModelKind>().unwrap(), ModelKind::Tensor);
        assert_eq!("CSD".parse::<ModelKind>().unwrap(), ModelKind::Odf);
        assert_eq!("rf".parse::<ModelKind>().unwrap(), ModelKind::RandomForest);
        assert!(matches!(
            "ball-and-stick".parse::<ModelKind>(),
            Err(ConfigError::UnsupportedType(_, _))
        ));
    }

    #[test]
    fn test_flip_apply() {
        let f = Flip::new(true, false, true);
        assert_eq!(f.apply(Vec3::new(1.0, 2.0, 3.0)), Vec3::new(-1.0, 2.0, -3.0));
        assert_eq!(Flip::default().apply(Vec3::new(1.0, 2.0, 3.0)), Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_candidate_rejects_zero() {
        assert!(Candidate::from_vec(Vec3::zeros(), 1.0).is_none());
        assert!(Candidate::from_vec(Vec3::new(f64::NAN, 0.0, 0.0), 1.0).is_none());
        let c = Candidate::from_vec(Vec3::new(0.0, 3.0, 4.0), 5.0).unwrap();
        assert!((c.dir.norm() - 1.0).abs() < 1e-12);
    }
}

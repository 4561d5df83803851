//! 体素网格几何信息.

use crate::{Idx3d, Mat3, Vec3};
use nifti::NiftiHeader;
use std::fmt;

/// 构建 [`Geometry`] 错误.
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// 网格在某个维度上为空.
    EmptyExtent(Idx3d),

    /// 体素分辨率必须为正有限值. 参数为非法的分辨率.
    InvalidSpacing([f64; 3]),

    /// 方向矩阵不可逆.
    SingularDirection,
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyExtent(e) => write!(f, "grid extent {e:?} is empty"),
            Self::InvalidSpacing(s) => write!(f, "invalid voxel spacing {s:?}"),
            Self::SingularDirection => write!(f, "direction matrix is singular"),
        }
    }
}

impl std::error::Error for GeometryError {}

/// 均匀网格几何: 分辨率 (毫米), 原点, 方向矩阵, 体素个数.
///
/// 世界坐标与连续体素索引的关系为 `w = origin + D · diag(spacing) · idx`.
/// 体素中心对应整数索引. 构建后不可变.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Geometry {
    shape: Idx3d,
    spacing: Vec3,
    origin: Vec3,
    direction: Mat3,

    /// `D · diag(spacing)`.
    index_to_world: Mat3,

    /// `(D · diag(spacing))^-1`.
    world_to_index: Mat3,
}

impl Geometry {
    /// 以完整参数初始化.
    pub fn new(
        shape: Idx3d,
        spacing: Vec3,
        origin: Vec3,
        direction: Mat3,
    ) -> Result<Self, GeometryError> {
        let (i, j, k) = shape;
        if i == 0 || j == 0 || k == 0 {
            return Err(GeometryError::EmptyExtent(shape));
        }
        if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(GeometryError::InvalidSpacing([
                spacing.x, spacing.y, spacing.z,
            ]));
        }
        let index_to_world = direction * Mat3::from_diagonal(&spacing);
        let world_to_index = index_to_world
            .try_inverse()
            .ok_or(GeometryError::SingularDirection)?;
        Ok(Self {
            shape,
            spacing,
            origin,
            direction,
            index_to_world,
            world_to_index,
        })
    }

    /// 原点为 0, 方向为单位阵, 各向同性分辨率为 `spacing` 的网格.
    pub fn isotropic(shape: Idx3d, spacing: f64) -> Result<Self, GeometryError> {
        Self::new(
            shape,
            Vec3::repeat(spacing),
            Vec3::zeros(),
            Mat3::identity(),
        )
    }

    /// 从 nifti header 中读取几何信息.
    ///
    /// 优先使用 sform; 否则使用 qform (四元数 + qfac); 都缺失时退化为
    /// `pixdim` 对角阵.
    pub fn from_nifti_header(h: &NiftiHeader) -> Result<Self, GeometryError> {
        let [_, i, j, k, ..] = h.dim;
        let shape = (i.max(1) as usize, j.max(1) as usize, k.max(1) as usize);
        let spacing = Vec3::new(
            h.pixdim[1].abs() as f64,
            h.pixdim[2].abs() as f64,
            h.pixdim[3].abs() as f64,
        );

        if h.sform_code > 0 {
            let rows = [h.srow_x, h.srow_y, h.srow_z];
            let affine = Mat3::from_fn(|r, c| rows[r][c] as f64);
            let origin = Vec3::new(rows[0][3] as f64, rows[1][3] as f64, rows[2][3] as f64);
            // 从仿射矩阵的列向量中拆出分辨率.
            let spacing = Vec3::from_fn(|c, _| affine.column(c).norm());
            let direction = Mat3::from_fn(|r, c| affine[(r, c)] / spacing[c]);
            return Self::new(shape, spacing, origin, direction);
        }

        let origin = Vec3::new(
            h.quatern_x as f64,
            h.quatern_y as f64,
            h.quatern_z as f64,
        );
        let direction = if h.qform_code > 0 {
            let (b, c, d) = (
                h.quatern_b as f64,
                h.quatern_c as f64,
                h.quatern_d as f64,
            );
            let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
            let qfac = if h.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
            let mut r = Mat3::new(
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - b * b - c * c,
            );
            r.column_mut(2).scale_mut(qfac);
            r
        } else {
            Mat3::identity()
        };
        Self::new(shape, spacing, origin, direction)
    }

    /// 体素个数 `(i, j, k)`.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.shape
    }

    /// 体素分辨率 (毫米).
    #[inline]
    pub fn spacing(&self) -> &Vec3 {
        &self.spacing
    }

    /// 原点 (体素 `(0, 0, 0)` 中心的世界坐标).
    #[inline]
    pub fn origin(&self) -> &Vec3 {
        &self.origin
    }

    /// 方向矩阵.
    #[inline]
    pub fn direction(&self) -> &Mat3 {
        &self.direction
    }

    /// 连续体素索引 -> 世界坐标.
    #[inline]
    pub fn index_to_world(&self, idx: &Vec3) -> Vec3 {
        self.origin + self.index_to_world * idx
    }

    /// 世界坐标 -> 连续体素索引.
    #[inline]
    pub fn world_to_index(&self, p: &Vec3) -> Vec3 {
        self.world_to_index * (p - self.origin)
    }

    /// 体素中心的世界坐标.
    #[inline]
    pub fn voxel_center(&self, (i, j, k): Idx3d) -> Vec3 {
        self.index_to_world(&Vec3::new(i as f64, j as f64, k as f64))
    }

    /// 连续索引是否落在网格内, 即每个分量都位于 `[-0.5, n - 0.5)`.
    #[inline]
    pub fn contains_index(&self, idx: &Vec3) -> bool {
        let (i, j, k) = self.shape;
        let inside = |v: f64, n: usize| v >= -0.5 && v < n as f64 - 0.5;
        inside(idx.x, i) && inside(idx.y, j) && inside(idx.z, k)
    }

    /// 世界坐标所在的 (最近) 体素. 越界时返回 `None`.
    #[inline]
    pub fn nearest_voxel(&self, p: &Vec3) -> Option<Idx3d> {
        let idx = self.world_to_index(p);
        self.contains_index(&idx).then(|| {
            (
                (idx.x + 0.5).floor() as usize,
                (idx.y + 0.5).floor() as usize,
                (idx.z + 0.5).floor() as usize,
            )
        })
    }

    /// 两个几何描述的是否是同一个网格 (允许浮点误差).
    pub fn is_same_grid(&self, other: &Self) -> bool {
        const EPS: f64 = 1e-4;
        self.shape == other.shape
            && (self.spacing - other.spacing).amax() < EPS
            && (self.origin - other.origin).amax() < EPS
            && (self.direction - other.direction).amax() < EPS
    }

    /// 网格外包盒对角线长度 (毫米).
    pub fn diagonal_mm(&self) -> f64 {
        let (i, j, k) = self.shape;
        Vec3::new(
            i as f64 * self.spacing.x,
            j as f64 * self.spacing.y,
            k as f64 * self.spacing.z,
        )
        .norm()
    }
}

/// 网格图像的共用属性.
pub trait GeometryAttr {
    /// 获取几何信息.
    fn geometry(&self) -> &Geometry;

    /// 最小体素分辨率, 以毫米为单位. 步长以此为基准.
    #[inline]
    fn min_spacing(&self) -> f64 {
        self.geometry().spacing().min()
    }
}

impl GeometryAttr for Geometry {
    #[inline]
    fn geometry(&self) -> &Geometry {
        self
    }
}

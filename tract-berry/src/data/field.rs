//! 多通道体素场. 峰值, 张量, ODF/球谐系数等逐体素向量均存放于此.

use std::path::Path;

use ndarray::{Array4, ArrayView1, Axis, Ix4};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};

use super::interp::Sampler;
use super::{Geometry, GeometryAttr, ImageError};
use crate::{Idx3d, Vec3};

/// 均匀网格上的逐体素定长向量场, 数据按 `[i, j, k, channel]` 排列.
///
/// 采样过程只读且无内部缓存, 可以被多个线程同时使用.
#[derive(Debug, Clone)]
pub struct VectorField {
    geometry: Geometry,
    data: Array4<f32>,
}

impl GeometryAttr for VectorField {
    #[inline]
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}

impl VectorField {
    /// 由几何信息和 `[i, j, k, c]` 排列的数据构建. 通道数必须非零.
    pub fn new(geometry: Geometry, data: Array4<f32>) -> Result<Self, ImageError> {
        let (i, j, k) = geometry.shape();
        let dim = data.shape();
        if dim[..3] != [i, j, k] || dim[3] == 0 {
            return Err(ImageError::ShapeMismatch(
                vec![i, j, k, dim[3].max(1)],
                dim.to_vec(),
            ));
        }
        Ok(Self { geometry, data })
    }

    /// 每个体素上的向量都等于 `value` 的均匀向量场.
    pub fn uniform(geometry: Geometry, value: &[f32]) -> Self {
        assert!(!value.is_empty());
        let (i, j, k) = geometry.shape();
        let data = Array4::from_shape_fn((i, j, k, value.len()), |(_, _, _, c)| value[c]);
        Self { geometry, data }
    }

    /// 打开 4D nii 文件. 第四维被视为通道.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let geometry = Geometry::from_nifti_header(obj.header())?;
        let data = obj.into_volume().into_ndarray::<f32>()?;
        let shape = data.shape().to_vec();
        let data = data
            .into_dimensionality::<Ix4>()
            .map_err(|_| {
                let (i, j, k) = geometry.shape();
                ImageError::ShapeMismatch(vec![i, j, k, 0], shape)
            })?
            .as_standard_layout()
            .into_owned();
        Self::new(geometry, data)
    }

    /// 每个体素的通道数.
    #[inline]
    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    /// 获取体素 `pos` 处的原始向量. 越界时 panic.
    #[inline]
    pub fn voxel(&self, (i, j, k): Idx3d) -> ArrayView1<'_, f32> {
        self.data
            .index_axis(Axis(0), i)
            .index_axis_move(Axis(0), j)
            .index_axis_move(Axis(0), k)
    }

    /// 在世界坐标 `p` 处采样到 `out` 中 (`out.len()` 必须等于通道数).
    ///
    /// 越界时 `out` 被清零并返回 `false`.
    pub fn sample_into(&self, p: &Vec3, interpolate: bool, out: &mut [f32]) -> bool {
        debug_assert_eq!(out.len(), self.channels());
        out.fill(0.0);
        let Some(s) = Sampler::new(&self.geometry, p, interpolate) else {
            return false;
        };
        for (pos, w) in s.iter() {
            let w = w as f32;
            for (o, v) in out.iter_mut().zip(self.voxel(pos).iter()) {
                *o += w * *v;
            }
        }
        true
    }

    /// 在世界坐标 `p` 处采样. 越界返回全零向量.
    #[inline]
    pub fn sample(&self, p: &Vec3, interpolate: bool) -> Vec<f32> {
        let mut out = vec![0.0; self.channels()];
        self.sample_into(p, interpolate, &mut out);
        out
    }
}

use std::fmt;
use std::ops::{Index, IndexMut};
use std::path::Path;

use ndarray::{Array3, ArrayView, ArrayViewMut, Ix3};
use ndarray_npy::WriteNpyError;
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};

use crate::{Idx3d, Vec3};

mod field;
mod geometry;
pub(crate) mod interp;

pub use field::VectorField;
pub use geometry::{Geometry, GeometryAttr, GeometryError};

use interp::Sampler;

/// 构建或加载网格图像时的错误.
#[derive(Debug)]
pub enum ImageError {
    /// 读取 nifti 文件错误.
    Nifti(nifti::NiftiError),

    /// 几何信息非法.
    Geometry(GeometryError),

    /// 数据形状与几何信息不一致. `(期望, 实际)`.
    ShapeMismatch(Vec<usize>, Vec<usize>),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nifti(e) => write!(f, "nifti error: {e}"),
            Self::Geometry(e) => write!(f, "geometry error: {e}"),
            Self::ShapeMismatch(exp, got) => {
                write!(f, "data shape {got:?} does not match grid {exp:?}")
            }
        }
    }
}

impl std::error::Error for ImageError {}

impl From<nifti::NiftiError> for ImageError {
    fn from(e: nifti::NiftiError) -> Self {
        Self::Nifti(e)
    }
}

impl From<GeometryError> for ImageError {
    fn from(e: GeometryError) -> Self {
        Self::Geometry(e)
    }
}

/// 以 `(i, j, k)` 形状校验 3D 数据.
#[inline]
fn check_shape3(geometry: &Geometry, dim: &[usize]) -> Result<(), ImageError> {
    let (i, j, k) = geometry.shape();
    if dim == [i, j, k] {
        Ok(())
    } else {
        Err(ImageError::ShapeMismatch(vec![i, j, k], dim.to_vec()))
    }
}

/// 标量图像, 体素值以 `f32` 保存. 掩膜, ROI, FA 等标量图均使用该类型.
#[derive(Debug, Clone)]
pub struct ScalarImage {
    geometry: Geometry,
    data: Array3<f32>,
}

impl GeometryAttr for ScalarImage {
    #[inline]
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}

impl Index<Idx3d> for ScalarImage {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for ScalarImage {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl ScalarImage {
    /// 由几何信息和 `[i, j, k]` 排列的数据构建.
    pub fn new(geometry: Geometry, data: Array3<f32>) -> Result<Self, ImageError> {
        check_shape3(&geometry, data.shape())?;
        Ok(Self { geometry, data })
    }

    /// 构建所有体素值均为 `value` 的图像.
    pub fn filled(geometry: Geometry, value: f32) -> Self {
        let data = Array3::from_elem(geometry.shape(), value);
        Self { geometry, data }
    }

    /// 打开 nii 文件格式的 3D 标量图像. 几何信息取自 header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let geometry = Geometry::from_nifti_header(obj.header())?;
        let data = obj.into_volume().into_ndarray::<f32>()?;
        let shape = data.shape().to_vec();
        let data = data
            .into_dimensionality::<Ix3>()
            .map_err(|_| {
                let (i, j, k) = geometry.shape();
                ImageError::ShapeMismatch(vec![i, j, k], shape)
            })?
            .as_standard_layout()
            .into_owned();
        Self::new(geometry, data)
    }

    /// 在世界坐标 `p` 处采样. 越界返回 `0.0`.
    #[inline]
    pub fn sample(&self, p: &Vec3, interpolate: bool) -> f32 {
        match Sampler::new(&self.geometry, p, interpolate) {
            Some(s) => s
                .iter()
                .map(|(v, w)| self.data[v] as f64 * w)
                .sum::<f64>() as f32,
            None => 0.0,
        }
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, f32, Ix3> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, f32, Ix3> {
        self.data.view_mut()
    }

    /// 收集值大于 `threshold` 的体素索引, 结果按行优先存储.
    pub fn filter_pos(&self, threshold: f32) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(pos, v)| (*v > threshold).then_some(pos))
            .collect()
    }

    /// 以 `.npy` 格式保存原始数据.
    pub fn save_npy<P: AsRef<Path>>(&self, path: P) -> Result<(), WriteNpyError> {
        ndarray_npy::write_npy(path, &self.data)
    }
}

/// 标签图像, 体素值以 `u8` 保存. 0 代表背景.
#[derive(Debug, Clone)]
pub struct LabelImage {
    geometry: Geometry,
    data: Array3<u8>,
}

impl GeometryAttr for LabelImage {
    #[inline]
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}

impl Index<Idx3d> for LabelImage {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl IndexMut<Idx3d> for LabelImage {
    #[inline]
    fn index_mut(&mut self, index: Idx3d) -> &mut Self::Output {
        &mut self.data[index]
    }
}

impl LabelImage {
    /// 由几何信息和 `[i, j, k]` 排列的数据构建.
    pub fn new(geometry: Geometry, data: Array3<u8>) -> Result<Self, ImageError> {
        check_shape3(&geometry, data.shape())?;
        Ok(Self { geometry, data })
    }

    /// 全背景标签图像.
    pub fn zeros(geometry: Geometry) -> Self {
        let data = Array3::zeros(geometry.shape());
        Self { geometry, data }
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, u8, Ix3> {
        self.data.view()
    }

    /// 获得数据的一份可变 shallow copy.
    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut<'_, u8, Ix3> {
        self.data.view_mut()
    }

    /// 非背景体素个数.
    #[inline]
    pub fn count_nonzero(&self) -> usize {
        self.data.iter().filter(|p| **p != 0).count()
    }

    /// 最大标签值.
    #[inline]
    pub fn max_label(&self) -> u8 {
        self.data.iter().copied().max().unwrap_or(0)
    }

    /// 收集满足谓词 `pred` 的所有体素对应的下标, 结果按行优先存储.
    pub fn filter_pos<F: Fn(u8) -> bool>(&self, pred: F) -> Vec<Idx3d> {
        self.data
            .indexed_iter()
            .filter_map(|(pos, pixel)| pred(*pixel).then_some(pos))
            .collect()
    }

    /// 对标签 `1..=num_labels` 各生成一个 0/1 二值掩膜.
    ///
    /// 返回值恰好包含 `num_labels` 个掩膜, 两两不相交,
    /// 其并集等于标签值在 `1..=num_labels` 内的所有体素.
    pub fn binary_split(&self, num_labels: u8) -> Vec<LabelImage> {
        (1..=num_labels)
            .map(|label| LabelImage {
                geometry: self.geometry.clone(),
                data: self.data.mapv(|v| u8::from(v == label)),
            })
            .collect()
    }

    /// 以 `.npy` 格式保存原始数据.
    pub fn save_npy<P: AsRef<Path>>(&self, path: P) -> Result<(), WriteNpyError> {
        ndarray_npy::write_npy(path, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ramp() -> ScalarImage {
        let g = Geometry::isotropic((4, 5, 6), 2.0).unwrap();
        let data = Array3::from_shape_fn((4, 5, 6), |(i, j, k)| (i * 100 + j * 10 + k) as f32);
        ScalarImage::new(g, data).unwrap()
    }

    #[test]
    fn test_shape_mismatch() {
        let g = Geometry::isotropic((2, 2, 2), 1.0).unwrap();
        let e = ScalarImage::new(g, Array3::zeros((2, 2, 3))).unwrap_err();
        assert!(matches!(e, ImageError::ShapeMismatch(_, _)));
    }

    #[test]
    fn test_sample_exact_at_nodes() {
        let img = ramp();
        for pos in [(0, 0, 0), (1, 2, 3), (3, 4, 5), (2, 0, 5)] {
            let p = img.geometry().voxel_center(pos);
            assert_eq!(img.sample(&p, true), img[pos]);
            assert_eq!(img.sample(&p, false), img[pos]);
        }
    }

    #[test]
    fn test_sample_outside_is_zero() {
        let img = ramp();
        for p in [
            Vec3::new(-1.5, 0.0, 0.0),
            Vec3::new(0.0, 9.0, 0.0),
            Vec3::new(0.0, 0.0, 1e9),
            Vec3::new(f64::NAN, 0.0, 0.0),
        ] {
            assert_eq!(img.sample(&p, true), 0.0);
            assert_eq!(img.sample(&p, false), 0.0);
        }
    }

    #[test]
    fn test_sample_midpoint_is_linear() {
        let img = ramp();
        // (1, 1, 1) 与 (2, 1, 1) 的中点.
        let p = Vec3::new(3.0, 2.0, 2.0);
        assert!((img.sample(&p, true) - 161.0).abs() < 1e-4);
    }

    #[test]
    fn test_binary_split_partitions() {
        let g = Geometry::isotropic((3, 3, 3), 1.0).unwrap();
        let data = Array3::from_shape_fn((3, 3, 3), |(i, j, k)| ((i + j + k) % 4) as u8);
        let labels = LabelImage::new(g, data).unwrap();
        let masks = labels.binary_split(3);
        assert_eq!(masks.len(), 3);
        for pos in labels.filter_pos(|_| true) {
            let hits = masks.iter().filter(|m| m[pos] == 1).count();
            assert_eq!(hits, usize::from(labels[pos] != 0));
        }
    }
}

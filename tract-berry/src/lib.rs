#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 提供扩散磁共振纤维追踪 (streamline tractography),
//! 纤维束聚类, 沿束分区 (parcellation) 与 tractometry 的基础算法.
//!
//! 图像的解码 (nifti 以外), 可视化与 GUI 不在本 crate 的范围内.
//! 输入图像均以解码后的体素网格 + 几何信息的形式给出.
//!
//! # 注意
//!
//! 1. 所有体素数组均按 `[i, j, k]` 索引, 与 nifti 磁盘上的体素顺序一致.
//!   世界坐标单位为毫米.
//! 2. 数值退化 (零向量, 奇异张量, 越界采样) 一律在局部消化,
//!   表现为 "无方向" 或 "停止", 不会让整次运行失败.
//! 3. 配置错误会在追踪开始前以 `Err` 的形式返回.
//!
//! # 开发计划
//!
//! ### 网格几何与三线性采样 ✅
//!
//! 实现位于 `tract-berry/src/data`.
//!
//! ### 方向模型: 峰值, 张量, ODF, 随机森林 ✅
//!
//! 随机森林只负责预测, 不负责训练.
//!
//! 实现位于 `tract-berry/src/direction`.
//!
//! ### 流线追踪: 积分器, 停止策略, 并行播种 ✅
//!
//! 1. 一阶/二阶积分, 邻域投票, 环路检测. ✅
//! 2. 掩膜/停止/排除/目标区域与七种端点约束. ✅
//! 3. 固定随机种子时, 结果与线程调度无关. ✅
//! 4. 外部中止信号. ✅
//!
//! 实现位于 `tract-berry/src/track`.
//!
//! ### 纤维束几何操作 ✅
//!
//! 重采样, 压缩, 长度统计, 仿射变换, 纤维密度图 (TDI), 持久化.
//!
//! 实现位于 `tract-berry/src/bundle`.
//!
//! ### 纤维聚类与质心 ✅
//!
//! 实现位于 `tract-berry/src/cluster`.
//!
//! ### 沿束分区与多数投票后处理 ✅
//!
//! 阈值扩张循环有显式上限, 无法标注的体素保持为背景.
//!
//! 实现位于 `tract-berry/src/parcel`.
//!
//! ### Tractometry ✅
//!
//! 实现位于 `tract-berry/src/tractometry.rs`.

/// 三维索引 `(i, j, k)`.
pub type Idx3d = (usize, usize, usize);

/// 三维实向量. 世界坐标, 方向, 连续索引均使用该类型.
pub type Vec3 = nalgebra::Vector3<f64>;

/// 3x3 实矩阵.
pub type Mat3 = nalgebra::Matrix3<f64>;

/// 网格图像与向量场.
pub mod data;

pub use data::{Geometry, GeometryAttr, ImageError, LabelImage, ScalarImage, VectorField};

pub mod consts;

pub mod direction;

pub mod track;

pub mod bundle;

pub mod cluster;

pub mod parcel;

pub mod tractometry;

mod par;

#[cfg(feature = "serde")]
pub mod persist;

pub mod prelude;

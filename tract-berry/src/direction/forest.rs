//! 随机森林方向模型. 只做预测, 训练不在本 crate 的范围内.
//!
//! 特征向量在运行时拼接: 上一步方向 (3 维, 无则为 0) 之后依次是
//! 每张特征图在当前点的采样值. 叶结点存放固定半球 [`SPHERE`]
//! 上每个方向的概率, 最后一个类别表示 "无纤维".

use super::sphere::SPHERE;
use super::{Candidate, Flip};
use crate::track::ConfigError;
use crate::{Geometry, GeometryAttr, Vec3, VectorField};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 决策树结点.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TreeNode {
    /// `x[feature] <= threshold` 时走向 `left`, 否则走向 `right`.
    Split {
        /// 特征下标.
        feature: usize,

        /// 阈值.
        threshold: f32,

        /// 左子结点下标.
        left: usize,

        /// 右子结点下标.
        right: usize,
    },

    /// 叶结点: 各类别的概率.
    Leaf {
        /// 长度为半球方向数 + 1.
        probabilities: Vec<f32>,
    },
}

/// 以数组存放的决策树, 根结点下标为 0.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DecisionTree {
    /// 结点.
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    /// 到达的叶结点概率. 调用前必须通过 [`Forest::validate`].
    fn leaf(&self, x: &[f32]) -> &[f32] {
        let mut i = 0;
        loop {
            match &self.nodes[i] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => i = if x[*feature] <= *threshold { *left } else { *right },
                TreeNode::Leaf { probabilities } => return probabilities,
            }
        }
    }
}

/// 训练好的随机森林.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Forest {
    /// 决策树.
    pub trees: Vec<DecisionTree>,

    /// 特征向量长度.
    pub num_features: usize,
}

impl Forest {
    /// 类别数: 半球方向数 + "无纤维".
    #[inline]
    pub fn num_classes() -> usize {
        SPHERE.len() + 1
    }

    /// 检查森林结构: 非空, 子结点下标严格递增且不越界,
    /// 特征下标小于 `num_features`, 叶结点长度等于类别数.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trees.is_empty() {
            return Err(ConfigError::InvalidForest("no trees".to_owned()));
        }
        let classes = Self::num_classes();
        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return Err(ConfigError::InvalidForest(format!("tree {t} is empty")));
            }
            let n = tree.nodes.len();
            for (i, node) in tree.nodes.iter().enumerate() {
                let bad = match node {
                    TreeNode::Split {
                        feature,
                        threshold,
                        left,
                        right,
                    } => {
                        *feature >= self.num_features
                            || !threshold.is_finite()
                            || *left <= i
                            || *right <= i
                            || *left >= n
                            || *right >= n
                    }
                    TreeNode::Leaf { probabilities } => probabilities.len() != classes,
                };
                if bad {
                    return Err(ConfigError::InvalidForest(format!(
                        "tree {t} node {i} is malformed"
                    )));
                }
            }
        }
        Ok(())
    }

    /// 对特征向量 `x` 预测各类别的平均概率.
    pub fn predict(&self, x: &[f32]) -> Vec<f32> {
        assert_eq!(x.len(), self.num_features);
        let mut acc = vec![0f32; Self::num_classes()];
        for tree in &self.trees {
            for (a, p) in acc.iter_mut().zip(tree.leaf(x)) {
                *a += *p;
            }
        }
        let n = self.trees.len() as f32;
        acc.iter_mut().for_each(|a| *a /= n);
        acc
    }

    /// 读取 [`Forest::save`] 保存的森林并检查结构.
    #[cfg(feature = "serde")]
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, crate::persist::PersistError> {
        let forest: Self = crate::persist::load(path)?;
        forest
            .validate()
            .map_err(|e| crate::persist::PersistError::Invalid(e.to_string()))?;
        Ok(forest)
    }

    /// 压缩保存.
    #[cfg(feature = "serde")]
    pub fn save<P: AsRef<std::path::Path>>(
        &self,
        path: P,
    ) -> Result<(), crate::persist::PersistError> {
        crate::persist::save(self, path)
    }
}

/// 随机森林追踪模型.
#[derive(Debug, Clone)]
pub struct ForestModel {
    forest: Forest,
    features: Vec<VectorField>,

    /// 翻转配置.
    pub(crate) flip: Flip,

    /// 纤维置信度 (`1 - p(无纤维)`) 阈值.
    pub(crate) cutoff: f64,
}

impl ForestModel {
    /// 以森林与特征图构建. 特征图至少一张, 且必须位于同一网格上;
    /// 森林的特征长度必须等于 `3 + Σ 通道数`.
    pub fn new(forest: Forest, features: Vec<VectorField>) -> Result<Self, ConfigError> {
        let Some(first) = features.first() else {
            return Err(ConfigError::MissingInput("feature images"));
        };
        if features
            .iter()
            .any(|f| !f.geometry().is_same_grid(first.geometry()))
        {
            return Err(ConfigError::GeometryMismatch("feature images"));
        }
        let expected = 3 + features.iter().map(|f| f.channels()).sum::<usize>();
        if forest.num_features != expected {
            return Err(ConfigError::ChannelMismatch {
                what: "forest features",
                expected: expected.to_string(),
                found: forest.num_features,
            });
        }
        forest.validate()?;
        Ok(Self {
            forest,
            features,
            flip: Flip::default(),
            cutoff: 0.5,
        })
    }

    /// 设置置信度阈值.
    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }

    /// 森林.
    #[inline]
    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    #[inline]
    pub(crate) fn geometry(&self) -> &Geometry {
        self.features[0].geometry()
    }

    /// 拼接特征向量并预测. 越界返回 `None`.
    fn predict_at(&self, p: &Vec3, prev: Option<&Vec3>, interpolate: bool) -> Option<Vec<f32>> {
        let mut x = vec![0f32; self.forest.num_features];
        if let Some(v) = prev {
            x[0] = v.x as f32;
            x[1] = v.y as f32;
            x[2] = v.z as f32;
        }
        let mut offset = 3;
        for f in &self.features {
            let c = f.channels();
            if !f.sample_into(p, interpolate, &mut x[offset..offset + c]) {
                return None;
            }
            offset += c;
        }
        Some(self.forest.predict(&x))
    }

    pub(crate) fn directions(
        &self,
        p: &Vec3,
        prev: Option<&Vec3>,
        interpolate: bool,
        out: &mut Vec<Candidate>,
    ) {
        let Some(probs) = self.predict_at(p, prev, interpolate) else {
            return;
        };
        let (dirs, no_fiber) = probs.split_at(SPHERE.len());
        if 1.0 - (no_fiber[0] as f64) < self.cutoff {
            return;
        }
        out.extend(
            dirs.iter()
                .zip(SPHERE.dirs())
                .filter(|(p, _)| **p > 0.0)
                .map(|(p, d)| Candidate {
                    dir: *d,
                    weight: *p as f64,
                }),
        );
    }

    /// `1 - p(无纤维)`.
    pub(crate) fn signal(&self, p: &Vec3, interpolate: bool) -> f64 {
        self.predict_at(p, None, interpolate)
            .map_or(0.0, |probs| 1.0 - probs[SPHERE.len()] as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 一棵树: 特征 3 (第一张特征图) <= 0.5 时无纤维, 否则沿 `axis`.
    fn stump(axis: usize) -> Forest {
        let n = Forest::num_classes();
        let mut fiber = vec![0f32; n];
        fiber[axis] = 1.0;
        let mut empty = vec![0f32; n];
        empty[n - 1] = 1.0;
        Forest {
            trees: vec![DecisionTree {
                nodes: vec![
                    TreeNode::Split {
                        feature: 3,
                        threshold: 0.5,
                        left: 1,
                        right: 2,
                    },
                    TreeNode::Leaf {
                        probabilities: empty,
                    },
                    TreeNode::Leaf {
                        probabilities: fiber,
                    },
                ],
            }],
            num_features: 4,
        }
    }

    fn geometry() -> Geometry {
        Geometry::isotropic((2, 2, 2), 1.0).unwrap()
    }

    #[test]
    fn test_validate() {
        assert!(stump(0).validate().is_ok());
        let mut f = stump(0);
        f.trees[0].nodes[0] = TreeNode::Split {
            feature: 3,
            threshold: 0.5,
            left: 0,
            right: 2,
        };
        assert!(f.validate().is_err());
        let f = Forest {
            trees: vec![],
            num_features: 4,
        };
        assert!(f.validate().is_err());
    }

    #[test]
    fn test_feature_count() {
        let features = vec![VectorField::uniform(geometry(), &[1.0, 0.0])];
        assert!(matches!(
            ForestModel::new(stump(0), features),
            Err(ConfigError::ChannelMismatch { .. })
        ));
        assert!(matches!(
            ForestModel::new(stump(0), vec![]),
            Err(ConfigError::MissingInput(_))
        ));
    }

    #[test]
    fn test_forest_directions() {
        let p = Vec3::new(0.5, 0.5, 0.5);
        let fiber = ForestModel::new(stump(7), vec![VectorField::uniform(geometry(), &[1.0])])
            .unwrap();
        let mut out = vec![];
        fiber.directions(&p, None, true, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dir, SPHERE.dirs()[7]);
        assert_eq!(fiber.signal(&p, true), 1.0);

        let empty = ForestModel::new(stump(7), vec![VectorField::uniform(geometry(), &[0.0])])
            .unwrap();
        out.clear();
        empty.directions(&p, None, true, &mut out);
        assert!(out.is_empty());
        assert_eq!(empty.signal(&p, true), 0.0);
    }
}

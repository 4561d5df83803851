//! 配置错误.

use std::fmt;

/// 追踪开始前即可发现的配置错误.
///
/// 该类错误总是在构建阶段 fail fast, 从不以默认值静默替代必需的输入.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// 缺少必需的输入 (参数为输入名称).
    MissingInput(&'static str),

    /// 无法识别的类型字符串. `(类别, 字符串)`.
    UnsupportedType(&'static str, String),

    /// 向量场通道数不符合模型要求.
    ChannelMismatch {
        /// 出错的输入.
        what: &'static str,

        /// 期望的通道数描述.
        expected: String,

        /// 实际通道数.
        found: usize,
    },

    /// 两个输入的网格几何不一致 (参数为出错的输入名称).
    GeometryMismatch(&'static str),

    /// 参数取值非法.
    InvalidParameter {
        /// 参数名.
        name: &'static str,

        /// 原因.
        reason: String,
    },

    /// 随机森林结构非法.
    InvalidForest(String),
}

impl ConfigError {
    #[inline]
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingInput(what) => write!(f, "missing mandatory input `{what}`"),
            Self::UnsupportedType(kind, s) => write!(f, "unsupported {kind} `{s}`"),
            Self::ChannelMismatch {
                what,
                expected,
                found,
            } => write!(f, "`{what}` has {found} channels, expected {expected}"),
            Self::GeometryMismatch(what) => {
                write!(f, "`{what}` is not defined on the tracking grid")
            }
            Self::InvalidParameter { name, reason } => {
                write!(f, "invalid parameter `{name}`: {reason}")
            }
            Self::InvalidForest(reason) => write!(f, "invalid random forest: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

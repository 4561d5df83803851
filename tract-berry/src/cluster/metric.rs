//! 纤维间距离度量. 输入纤维均已重采样为相同点数.

use std::fmt;
use std::str::FromStr;

use itertools::izip;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::track::ConfigError;
use crate::Vec3;

/// 单项度量.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Metric {
    /// 逐点距离的平均值.
    EuclideanMean,

    /// 逐点距离的最大值.
    EuclideanMax,

    /// 逐点距离的 (总体) 标准差.
    EuclideanStd,

    /// 长度差的绝对值.
    Length,
}

impl FromStr for Metric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "euclidean_mean" | "mean" => Ok(Self::EuclideanMean),
            "euclidean_max" | "max" => Ok(Self::EuclideanMax),
            "euclidean_std" | "std" => Ok(Self::EuclideanStd),
            "length" => Ok(Self::Length),
            _ => Err(ConfigError::UnsupportedType("metric", s.to_owned())),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EuclideanMean => "euclidean_mean",
            Self::EuclideanMax => "euclidean_max",
            Self::EuclideanStd => "euclidean_std",
            Self::Length => "length",
        })
    }
}

/// 已重采样的纤维及其原始长度.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fiber<'a> {
    pub points: &'a [Vec3],
    pub length: f64,
}

/// 一个方向上的逐点距离统计 `(平均, 最大, 标准差)`.
fn pointwise<'a, I>(a: &[Vec3], b: I) -> (f64, f64, f64)
where
    I: Iterator<Item = &'a Vec3>,
{
    let n = a.len().max(1) as f64;
    let (mut sum, mut sum2, mut max) = (0.0, 0.0, 0.0f64);
    for (p, q) in izip!(a, b) {
        let d = (p - q).norm();
        sum += d;
        sum2 += d * d;
        max = max.max(d);
    }
    let mean = sum / n;
    let var = (sum2 / n - mean * mean).max(0.0);
    (mean, max, var.sqrt())
}

/// 加权组合度量: 各项距离分别在正/反两个方向中取较小者后加权求和.
pub(crate) fn combined(metrics: &[(Metric, f64)], a: Fiber<'_>, b: Fiber<'_>) -> f64 {
    let needs_points = metrics.iter().any(|(m, _)| *m != Metric::Length);
    let (fwd, rev) = if needs_points {
        (
            pointwise(a.points, b.points.iter()),
            pointwise(a.points, b.points.iter().rev()),
        )
    } else {
        ((0.0, 0.0, 0.0), (0.0, 0.0, 0.0))
    };
    metrics
        .iter()
        .map(|&(m, w)| {
            let d = match m {
                Metric::EuclideanMean => fwd.0.min(rev.0),
                Metric::EuclideanMax => fwd.1.min(rev.1),
                Metric::EuclideanStd => fwd.2.min(rev.2),
                Metric::Length => (a.length - b.length).abs(),
            };
            w * d
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(y: f64) -> Vec<Vec3> {
        (0..5).map(|i| Vec3::new(i as f64, y, 0.0)).collect()
    }

    #[test]
    fn test_reversed_fibers_are_close() {
        let a = line(0.0);
        let mut b = a.clone();
        b.reverse();
        let fa = Fiber { points: &a, length: 4.0 };
        let fb = Fiber { points: &b, length: 4.0 };
        let all = [
            (Metric::EuclideanMean, 1.0),
            (Metric::EuclideanMax, 1.0),
            (Metric::EuclideanStd, 1.0),
            (Metric::Length, 1.0),
        ];
        assert!(combined(&all, fa, fb).abs() < 1e-12);
    }

    #[test]
    fn test_parallel_offset() {
        let a = line(0.0);
        let b = line(2.0);
        let fa = Fiber { points: &a, length: 4.0 };
        let fb = Fiber { points: &b, length: 3.0 };
        assert!((combined(&[(Metric::EuclideanMean, 1.0)], fa, fb) - 2.0).abs() < 1e-12);
        assert!((combined(&[(Metric::EuclideanMax, 0.5)], fa, fb) - 1.0).abs() < 1e-12);
        assert!(combined(&[(Metric::EuclideanStd, 1.0)], fa, fb).abs() < 1e-6);
        assert!((combined(&[(Metric::Length, 1.0)], fa, fb) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_parse() {
        assert_eq!("Euclidean-Max".parse::<Metric>().unwrap(), Metric::EuclideanMax);
        assert!("hausdorff".parse::<Metric>().is_err());
    }
}

//! 流线追踪.
//!
//! [`StreamlineTracker`] 负责播种与并行调度, 单条流线的积分由内部的
//! 积分器完成, 停止与端点判定由 [`StoppingPolicy`] 给出.

mod error;
mod integrator;
mod params;
mod stopping;
mod tracker;

pub use error::ConfigError;
pub use params::{EpConstraint, Mode, TrackingParams};
pub use stopping::{StoppingPolicy, Verdict};
pub use tracker::{AbortHandle, ProbabilityMap, StreamlineTracker, TrackingResult, TrackingStats};

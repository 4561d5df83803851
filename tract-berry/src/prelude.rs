//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Mat3, Vec3};

pub use crate::data::{Geometry, GeometryAttr, ImageError, LabelImage, ScalarImage, VectorField};

pub use crate::direction::{
    Candidate, DirectionModel, Flip, Forest, ForestModel, ModelKind, OdfBasis, OdfModel,
    PeakModel, TensorModel,
};

pub use crate::track::{
    AbortHandle, ConfigError, EpConstraint, Mode, ProbabilityMap, StoppingPolicy,
    StreamlineTracker, TrackingParams, TrackingResult, TrackingStats,
};

pub use crate::bundle::{BundleError, FiberBundle, LengthStats};

pub use crate::cluster::{ClusterParams, Clustering, Metric, TractClusterer};

pub use crate::parcel::{parcellate, ParcelError, ParcelParams, Parcellation};

pub use crate::tractometry::{
    centroid_profile, estimate_num_sampling_points, static_profile, BinStats,
    CentroidProfileParams, StaticProfile,
};

#[cfg(feature = "serde")]
pub use crate::persist::PersistError;

//! 播种与并行调度.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use either::Either;
use itertools::iproduct;
use log::{debug, info, warn};
use ndarray::{Array3, ArrayView3};
use ndarray_npy::WriteNpyError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::integrator::{Integrator, Outcome};
use super::{ConfigError, EpConstraint, Mode, StoppingPolicy, TrackingParams};
use crate::bundle::{self, FiberBundle};
use crate::consts::tracking::SEED_BATCH;
use crate::direction::DirectionModel;
use crate::{par, Geometry, GeometryAttr, Idx3d, ScalarImage, Vec3};

/// 中止信号. 可以克隆后交给其它线程, 在追踪过程中调用 [`AbortHandle::abort`].
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// 请求中止.
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// 是否已请求中止.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// 清除中止信号, 以便再次追踪.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// 概率图: 每个体素被多少条被接受的流线经过 (每条流线每个体素至多计一次).
#[derive(Debug, Clone)]
pub struct ProbabilityMap {
    geometry: Geometry,
    counts: Array3<u32>,
    num_streamlines: usize,
}

impl GeometryAttr for ProbabilityMap {
    #[inline]
    fn geometry(&self) -> &Geometry {
        &self.geometry
    }
}

impl ProbabilityMap {
    /// 全零概率图.
    pub fn new(geometry: Geometry) -> Self {
        let counts = Array3::zeros(geometry.shape());
        Self {
            geometry,
            counts,
            num_streamlines: 0,
        }
    }

    /// 累加一条流线.
    pub fn add_streamline(&mut self, points: &[Vec3]) {
        for v in bundle::visited_voxels(points, &self.geometry) {
            self.counts[v] += 1;
        }
        self.num_streamlines += 1;
    }

    /// 访问计数.
    #[inline]
    pub fn counts(&self) -> ArrayView3<'_, u32> {
        self.counts.view()
    }

    /// 已累加的流线条数.
    #[inline]
    pub fn num_streamlines(&self) -> usize {
        self.num_streamlines
    }

    /// 转为标量图像: 经过该体素的流线占全部流线的比例.
    pub fn to_image(&self) -> ScalarImage {
        let n = self.num_streamlines.max(1) as f32;
        let mut img = ScalarImage::filled(self.geometry.clone(), 0.0);
        img.data_mut()
            .zip_mut_with(&self.counts, |o, &c| *o = c as f32 / n);
        img
    }

    /// 以 `.npy` 格式保存访问计数.
    pub fn save_npy<P: AsRef<Path>>(&self, path: P) -> Result<(), WriteNpyError> {
        ndarray_npy::write_npy(path, &self.counts)
    }
}

/// 追踪统计.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingStats {
    /// 种子点总数.
    pub seeds: usize,

    /// 被接受的流线条数.
    pub accepted: usize,

    /// 被丢弃的种子数 (概率模式下为所有尝试均失败的种子).
    pub discarded: usize,

    /// 概率模式下的重试次数.
    pub retries: usize,

    /// 是否被中止.
    pub aborted: bool,
}

/// 追踪结果.
#[derive(Debug, Clone)]
pub struct TrackingResult {
    /// 纤维束, 或 `output_prob_map` 打开时的概率图.
    pub output: Either<FiberBundle, ProbabilityMap>,

    /// 统计信息.
    pub stats: TrackingStats,
}

impl TrackingResult {
    /// 纤维束输出.
    pub fn bundle(&self) -> Option<&FiberBundle> {
        self.output.as_ref().left()
    }

    /// 概率图输出.
    pub fn probability_map(&self) -> Option<&ProbabilityMap> {
        self.output.as_ref().right()
    }

    /// 取出纤维束.
    pub fn into_bundle(self) -> Option<FiberBundle> {
        self.output.left()
    }
}

/// 流线追踪器. 构建时完成全部配置检查, [`StreamlineTracker::track`]
/// 期间所有输入只读.
#[derive(Debug)]
pub struct StreamlineTracker {
    model: DirectionModel,
    prior: Option<DirectionModel>,
    policy: StoppingPolicy,
    params: TrackingParams,
    seed_image: Option<ScalarImage>,
    abort: AbortHandle,
}

impl StreamlineTracker {
    /// 以方向模型, 停止策略和参数构建. 参数中的翻转与阈值会写入模型.
    pub fn new(
        mut model: DirectionModel,
        mut policy: StoppingPolicy,
        params: TrackingParams,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        model.set_flip(params.flip);
        model.set_cutoff(params.cutoff);
        model.set_odf_cutoff(params.odf_cutoff);
        policy.configure(
            model.geometry(),
            params.ep_constraint,
            params.cutoff,
            params.interpolate_masks,
            params.interpolate_data,
        )?;
        Ok(Self {
            model,
            prior: None,
            policy,
            params,
            seed_image: None,
            abort: AbortHandle::default(),
        })
    }

    /// 种子图像. 必须与方向模型在同一网格上.
    pub fn with_seed_image(mut self, seed: ScalarImage) -> Result<Self, ConfigError> {
        if !seed.geometry().is_same_grid(self.model.geometry()) {
            return Err(ConfigError::GeometryMismatch("seed image"));
        }
        self.seed_image = Some(seed);
        Ok(self)
    }

    /// 先验方向模型 (如纤维束图谱的峰值). 翻转取 `prior_flip`.
    pub fn with_prior(mut self, mut prior: DirectionModel) -> Self {
        prior.set_flip(self.params.prior_flip);
        self.prior = Some(prior);
        self
    }

    /// 参数.
    #[inline]
    pub fn params(&self) -> &TrackingParams {
        &self.params
    }

    /// 中止信号的句柄.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// 播种的体素, 按行优先顺序.
    fn seed_voxels(&self, region: Option<&ScalarImage>) -> Vec<Idx3d> {
        match region {
            Some(r) => r.filter_pos(0.0),
            None => {
                let (i, j, k) = self.model.geometry().shape();
                iproduct!(0..i, 0..j, 0..k).collect()
            }
        }
    }

    /// 执行追踪.
    ///
    /// 中止时返回已接受的流线, `stats.aborted` 为 `true`.
    pub fn track(&self) -> Result<TrackingResult, ConfigError> {
        let region = self.seed_image.as_ref().or(self.policy.mask());
        if self.params.ep_constraint == EpConstraint::EpsInSeedAndTarget && region.is_none() {
            return Err(ConfigError::MissingInput("seed image"));
        }

        let grid = self.model.geometry();
        let voxels = self.seed_voxels(region);
        let per_voxel = self.params.seeds_per_voxel;
        let num_seeds = voxels.len() * per_voxel;
        let base_seed = if self.params.fix_random_seed {
            self.params.random_seed
        } else {
            rand::random()
        };
        let trials = match self.params.mode {
            Mode::Deterministic => 1,
            Mode::Probabilistic => self.params.trials_per_seed,
        };
        let limit = usize::try_from(self.params.max_num_fibers).ok();

        let abort = &*self.abort.0;
        let integrator = Integrator::new(
            &self.model,
            self.prior.as_ref(),
            &self.policy,
            &self.params,
            region,
            abort,
        );
        info!(
            "追踪开始: 模型 {}, {} 模式, 步长 {:.3} mm, {} 个种子体素, 共 {num_seeds} 个种子",
            self.model.kind(),
            self.params.mode,
            integrator.step_mm(),
            voxels.len()
        );

        // 每个种子拥有独立的随机数流, 结果与线程调度无关.
        let trace_seed = |index: usize| -> (Outcome, usize) {
            if abort.load(Ordering::Relaxed) {
                return (Outcome::Aborted, 0);
            }
            let mut rng = ChaCha8Rng::seed_from_u64(base_seed);
            rng.set_stream(index as u64);
            let (i, j, k) = voxels[index / per_voxel];
            let jitter = Vec3::from_fn(|_, _| rng.gen_range(-0.5..0.5));
            let seed = grid.index_to_world(&(Vec3::new(i as f64, j as f64, k as f64) + jitter));
            let mut outcome = Outcome::Discarded;
            let mut attempts = 0;
            while attempts < trials && outcome == Outcome::Discarded {
                outcome = integrator.trace(seed, &mut rng);
                attempts += 1;
            }
            (outcome, attempts.saturating_sub(1))
        };

        let mut stats = TrackingStats {
            seeds: num_seeds,
            ..Default::default()
        };
        let mut fibers = FiberBundle::with_geometry(grid.clone());
        let mut map = self
            .params
            .output_prob_map
            .then(|| ProbabilityMap::new(grid.clone()));
        let full = |stats: &TrackingStats| limit.is_some_and(|l| stats.accepted >= l);

        let mut start = 0;
        while start < num_seeds && !full(&stats) {
            if self.abort.is_aborted() {
                stats.aborted = true;
                break;
            }
            let len = SEED_BATCH.min(num_seeds - start);
            let results = par::map_indexed(len, |i| trace_seed(start + i));
            for (outcome, retries) in results {
                if full(&stats) {
                    break;
                }
                stats.retries += retries;
                match outcome {
                    Outcome::Accepted(points) => {
                        stats.accepted += 1;
                        match &mut map {
                            Some(m) => m.add_streamline(&points),
                            None if self.params.compress_fibers => {
                                fibers.push(&bundle::compress(&points, self.params.compression_error));
                            }
                            None => {
                                fibers.push(&points);
                            }
                        }
                    }
                    Outcome::Discarded => stats.discarded += 1,
                    Outcome::Aborted => stats.aborted = true,
                }
            }
            start += len;
            debug!(
                "已处理 {start}/{num_seeds} 个种子, 接受 {} 条",
                stats.accepted
            );
        }

        if stats.aborted {
            warn!("追踪被中止, 保留已接受的 {} 条流线", stats.accepted);
        }
        info!(
            "追踪结束: 接受 {}, 丢弃 {}, 重试 {}",
            stats.accepted, stats.discarded, stats.retries
        );
        let output = match map {
            Some(m) => Either::Right(m),
            None => Either::Left(fibers),
        };
        Ok(TrackingResult { output, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction::PeakModel;
    use crate::VectorField;
    use ndarray::Array4;

    /// 测试日志. 多个测试重复调用时忽略已初始化的错误.
    fn init_logger() {
        let _ = simple_logger::SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init();
    }

    fn grid() -> Geometry {
        Geometry::isotropic((20, 5, 5), 1.0).unwrap()
    }

    fn straight_model() -> DirectionModel {
        PeakModel::new(VectorField::uniform(grid(), &[1.0, 0.0, 0.0]))
            .unwrap()
            .into()
    }

    fn single_voxel_seed(v: Idx3d) -> ScalarImage {
        let mut s = ScalarImage::filled(grid(), 0.0);
        s[v] = 1.0;
        s
    }

    fn params() -> TrackingParams {
        TrackingParams::default()
            .with_step_size_vox(1.0)
            .with_length_range(10.0, 400.0)
            .with_seeds_per_voxel(3)
            .with_fixed_seed(7)
    }

    fn is_straight(f: &[Vec3]) -> bool {
        f.iter()
            .all(|p| (p.y - f[0].y).abs() < 1e-9 && (p.z - f[0].z).abs() < 1e-9)
            && f.windows(2).all(|w| ((w[1].x - w[0].x).abs() - 1.0).abs() < 1e-9)
    }

    #[test]
    fn test_single_voxel_straight_field() {
        init_logger();
        let tracker = StreamlineTracker::new(straight_model(), StoppingPolicy::new(), params())
            .unwrap()
            .with_seed_image(single_voxel_seed((10, 2, 2)))
            .unwrap();
        let res = tracker.track().unwrap();
        let b = res.bundle().unwrap();
        assert_eq!(b.len(), 3);
        assert_eq!(res.stats.seeds, 3);
        assert_eq!(res.stats.accepted, 3);
        assert!(b.iter().all(is_straight));
        assert!(b.iter().all(|f| f.len() >= 19));
    }

    #[test]
    fn test_edge_voxel_seeds_are_kept() {
        init_logger();
        let params = params().with_length_range(5.0, 400.0);
        let tracker = StreamlineTracker::new(straight_model(), StoppingPolicy::new(), params)
            .unwrap()
            .with_seed_image(single_voxel_seed((19, 2, 2)))
            .unwrap();
        let res = tracker.track().unwrap();
        assert_eq!(res.stats.accepted, 3);
        assert_eq!(res.stats.discarded, 0);
        let b = res.bundle().unwrap();
        assert!(b.iter().all(is_straight));
        assert!(b.lengths().iter().all(|&l| l >= 18.0));
    }

    #[test]
    fn test_single_thread_pool_gives_same_result() {
        let params = params()
            .with_mode(Mode::Probabilistic)
            .with_seeds_per_voxel(6);
        let run = || {
            StreamlineTracker::new(straight_model(), StoppingPolicy::new(), params.clone())
                .unwrap()
                .with_seed_image(single_voxel_seed((10, 2, 2)))
                .unwrap()
                .track()
                .unwrap()
                .into_bundle()
                .unwrap()
        };
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        assert_eq!(pool.install(|| run()), run());
    }

    #[test]
    fn test_exclusion_everywhere_discards_all() {
        let policy = StoppingPolicy::new().with_exclusion(ScalarImage::filled(grid(), 1.0));
        let tracker = StreamlineTracker::new(straight_model(), policy, params())
            .unwrap()
            .with_seed_image(single_voxel_seed((10, 2, 2)))
            .unwrap();
        let res = tracker.track().unwrap();
        assert!(res.bundle().unwrap().is_empty());
        assert_eq!(res.stats.discarded, 3);
    }

    #[test]
    fn test_zero_angular_threshold_stops_at_bend() {
        // i < 10 沿 x, 其余沿 y.
        let g = Geometry::isotropic((20, 20, 5), 1.0).unwrap();
        let data = Array4::from_shape_fn((20, 20, 5, 3), |(i, _, _, c)| match (i < 10, c) {
            (true, 0) | (false, 1) => 1.0,
            _ => 0.0,
        });
        let model = PeakModel::new(VectorField::new(g.clone(), data).unwrap()).unwrap();
        let mut seed = ScalarImage::filled(g, 0.0);
        seed[(5, 10, 2)] = 1.0;
        let params = params()
            .with_seeds_per_voxel(1)
            .with_length_range(0.0, 400.0)
            .with_angular_threshold_deg(0.0);
        let tracker = StreamlineTracker::new(model.into(), StoppingPolicy::new(), params)
            .unwrap()
            .with_seed_image(seed)
            .unwrap();
        let res = tracker.track().unwrap();
        let b = res.bundle().unwrap();
        assert_eq!(b.len(), 1);
        let f = b.fiber(0);
        assert!(f.iter().all(|p| p.x < 10.0));
        assert!(f.iter().all(|p| (p.y - f[0].y).abs() < 1e-9));
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let params = params()
            .with_mode(Mode::Probabilistic)
            .with_seeds_per_voxel(4);
        let run = || {
            StreamlineTracker::new(straight_model(), StoppingPolicy::new(), params.clone())
                .unwrap()
                .with_seed_image(single_voxel_seed((10, 2, 2)))
                .unwrap()
                .track()
                .unwrap()
                .into_bundle()
                .unwrap()
        };
        let a = run();
        assert!(!a.is_empty());
        assert_eq!(a, run());
    }

    #[test]
    fn test_max_num_fibers() {
        let params = params().with_seeds_per_voxel(5).with_max_num_fibers(2);
        let tracker = StreamlineTracker::new(straight_model(), StoppingPolicy::new(), params)
            .unwrap()
            .with_seed_image(single_voxel_seed((10, 2, 2)))
            .unwrap();
        let res = tracker.track().unwrap();
        assert_eq!(res.bundle().unwrap().len(), 2);
        assert_eq!(res.stats.accepted, 2);
    }

    #[test]
    fn test_abort_before_start() {
        init_logger();
        let tracker =
            StreamlineTracker::new(straight_model(), StoppingPolicy::new(), params()).unwrap();
        tracker.abort_handle().abort();
        let res = tracker.track().unwrap();
        assert!(res.stats.aborted);
        assert!(res.bundle().unwrap().is_empty());
    }

    #[test]
    fn test_probability_map() {
        let mut params = params();
        params.output_prob_map = true;
        let tracker = StreamlineTracker::new(straight_model(), StoppingPolicy::new(), params)
            .unwrap()
            .with_seed_image(single_voxel_seed((10, 2, 2)))
            .unwrap();
        let res = tracker.track().unwrap();
        let map = res.probability_map().unwrap();
        assert_eq!(map.num_streamlines(), 3);
        assert_eq!(map.counts()[(10, 2, 2)], 3);
        assert_eq!(map.to_image()[(10, 2, 2)], 1.0);
        assert_eq!(map.counts()[(10, 0, 0)], 0);
    }

    #[test]
    fn test_configuration_errors() {
        let other = Geometry::isotropic((4, 4, 4), 1.0).unwrap();
        let tracker =
            StreamlineTracker::new(straight_model(), StoppingPolicy::new(), params()).unwrap();
        assert!(matches!(
            tracker.with_seed_image(ScalarImage::filled(other, 1.0)),
            Err(ConfigError::GeometryMismatch("seed image"))
        ));

        let bad = params().with_length_range(50.0, 10.0);
        assert!(StreamlineTracker::new(straight_model(), StoppingPolicy::new(), bad).is_err());

        let policy = StoppingPolicy::new().with_target(ScalarImage::filled(grid(), 1.0));
        let params = params().with_ep_constraint(EpConstraint::EpsInSeedAndTarget);
        let tracker = StreamlineTracker::new(straight_model(), policy, params).unwrap();
        assert!(matches!(
            tracker.track(),
            Err(ConfigError::MissingInput("seed image"))
        ));
    }
}

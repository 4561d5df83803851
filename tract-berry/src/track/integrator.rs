//! 单条流线的逐步积分.
//!
//! 每个半流线的状态: 播种 -> 推进 -> {正常结束, 停止, 丢弃}.
//! 两个半流线在种子处连接后, 再统一检查长度与端点约束.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;

use super::{Mode, StoppingPolicy, TrackingParams, Verdict};
use crate::consts::tracking::{ABORT_POLL_STEPS, JITTER_RETRIES, MAX_STEPS_PER_HALF};
use crate::direction::{Candidate, DirectionModel};
use crate::{GeometryAttr, ScalarImage, Vec3};

/// 夹角余弦比较时的容差.
const ANGLE_EPS: f64 = 1e-9;

/// 半流线的结束方式.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// 达到最大长度 (截断).
    Normal,

    /// 停止条件, 无方向, 越界或环路.
    Stop,

    /// 进入排除区域.
    Discard,

    /// 收到中止信号.
    Aborted,
}

/// 追踪一个半流线的结果. `points[0]` 为种子.
#[derive(Debug)]
pub(crate) struct HalfTrace {
    pub points: Vec<Vec3>,
    pub length: f64,
    pub end: Termination,
}

/// 一次完整 (双向) 追踪的结果.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    /// 通过长度与端点约束的流线.
    Accepted(Vec<Vec3>),

    /// 被丢弃.
    Discarded,

    /// 中止, 部分结果被丢弃.
    Aborted,
}

/// 积分器. 只借用只读输入, 可在多个线程间共享.
pub(crate) struct Integrator<'a> {
    model: &'a DirectionModel,
    prior: Option<&'a DirectionModel>,
    policy: &'a StoppingPolicy,
    params: &'a TrackingParams,
    seed_region: Option<&'a ScalarImage>,
    abort: &'a AtomicBool,
    step_mm: f64,
    sampling_mm: f64,
    cos_threshold: f64,
    loop_window: usize,
}

impl<'a> Integrator<'a> {
    pub fn new(
        model: &'a DirectionModel,
        prior: Option<&'a DirectionModel>,
        policy: &'a StoppingPolicy,
        params: &'a TrackingParams,
        seed_region: Option<&'a ScalarImage>,
        abort: &'a AtomicBool,
    ) -> Self {
        let min_spacing = model.geometry().min_spacing();
        Self {
            model,
            prior,
            policy,
            params,
            seed_region,
            abort,
            step_mm: params.step_size_vox * min_spacing,
            sampling_mm: params.sampling_distance_vox * min_spacing,
            cos_threshold: params.effective_angular_threshold_deg().to_radians().cos(),
            loop_window: params.loop_window(),
        }
    }

    /// 步长 (毫米).
    #[inline]
    pub fn step_mm(&self) -> f64 {
        self.step_mm
    }

    /// 从 `seed` 双向追踪一条流线.
    ///
    /// 种子处的方向 `d0` 只求一次, 两个半流线分别以 `d0` 与 `-d0` 为参考方向出发.
    /// 某一侧一步也走不出 (如种子位于边界体素且方向朝外) 时, 另一侧照常追踪.
    pub fn trace<R: Rng>(&self, seed: Vec3, rng: &mut R) -> Outcome {
        let Some(d0) = self.next_direction(&seed, None, rng) else {
            return Outcome::Discarded;
        };
        let max = self.params.max_tract_length_mm;
        let forward = self.trace_half(seed, Some(d0), max, rng);
        match forward.end {
            Termination::Discard => return Outcome::Discarded,
            Termination::Aborted => return Outcome::Aborted,
            _ => {}
        }
        let backward = self.trace_half(seed, Some(-d0), max - forward.length, rng);
        match backward.end {
            Termination::Discard => return Outcome::Discarded,
            Termination::Aborted => return Outcome::Aborted,
            _ => {}
        }

        let length = forward.length + backward.length;
        if length < self.params.min_tract_length_mm {
            return Outcome::Discarded;
        }
        let mut points = backward.points;
        points.reverse();
        points.pop();
        points.extend(forward.points);
        if points.len() < 2 {
            return Outcome::Discarded;
        }
        let (a, b) = (points[0], points[points.len() - 1]);
        if !self.policy.accept_endpoints(&a, &b, self.seed_region) {
            return Outcome::Discarded;
        }
        Outcome::Accepted(points)
    }

    /// 从 `seed` 沿单方向追踪, 累计长度不超过 `budget_mm`.
    ///
    /// `initial` 为起始参考方向.
    pub(crate) fn trace_half<R: Rng>(
        &self,
        seed: Vec3,
        initial: Option<Vec3>,
        budget_mm: f64,
        rng: &mut R,
    ) -> HalfTrace {
        let mut trace = HalfTrace {
            points: vec![seed],
            length: 0.0,
            end: Termination::Normal,
        };
        match self.policy.check(&seed, self.model) {
            Verdict::Continue => {}
            Verdict::Stop => {
                trace.end = Termination::Stop;
                return trace;
            }
            Verdict::Discard => {
                trace.end = Termination::Discard;
                return trace;
            }
        }

        let mut pos = seed;
        let mut prev = initial;
        let mut window = VecDeque::with_capacity(self.loop_window);
        for step in 1..=MAX_STEPS_PER_HALF {
            if step % ABORT_POLL_STEPS == 0 && self.abort.load(Ordering::Relaxed) {
                trace.end = Termination::Aborted;
                return trace;
            }
            let Some(dir) = self.next_direction(&pos, prev.as_ref(), rng) else {
                trace.end = Termination::Stop;
                return trace;
            };
            if trace.length + self.step_mm > budget_mm + ANGLE_EPS {
                trace.end = Termination::Normal;
                return trace;
            }
            let next = pos + dir * self.step_mm;
            match self.policy.check(&next, self.model) {
                Verdict::Continue => {}
                Verdict::Stop => {
                    trace.end = Termination::Stop;
                    return trace;
                }
                Verdict::Discard => {
                    trace.end = Termination::Discard;
                    return trace;
                }
            }
            trace.points.push(next);
            trace.length += self.step_mm;
            pos = next;
            prev = Some(dir);
            if self.is_loop(&mut window, dir) {
                trace.end = Termination::Stop;
                return trace;
            }
        }
        trace
    }

    /// 一阶方向; 二阶积分时在半步处再取一次方向, 中点无方向时退回一阶.
    fn next_direction<R: Rng>(&self, pos: &Vec3, prev: Option<&Vec3>, rng: &mut R) -> Option<Vec3> {
        let d1 = self.propagation(pos, prev, rng)?;
        if !self.params.second_order {
            return Some(d1);
        }
        let mid = pos + d1 * (0.5 * self.step_mm);
        let d2 = self
            .propagation(&mid, Some(&d1), rng)
            .filter(|d| prev.map_or(true, |p| self.within_angle(d, p)));
        Some(d2.unwrap_or(d1))
    }

    #[inline]
    fn within_angle(&self, d: &Vec3, prev: &Vec3) -> bool {
        d.dot(prev) >= self.cos_threshold - ANGLE_EPS
    }

    /// 数据方向与先验方向混合后的传播方向, 并再次检查角度.
    fn propagation<R: Rng>(&self, pos: &Vec3, prev: Option<&Vec3>, rng: &mut R) -> Option<Vec3> {
        let data = self.vote(pos, prev, rng);
        let dir = match self.prior {
            None => data,
            Some(prior) => {
                let mut buf = Vec::new();
                prior.directions(pos, prev, self.params.interpolate_data, &mut buf);
                let p = self.select_deterministic(&buf, prev);
                let w = self.params.prior_weight;
                match (data, p) {
                    (Some(d), Some(p)) => {
                        let p = align(p, &d);
                        (p * w + d * (1.0 - w)).try_normalize(f64::EPSILON)
                    }
                    (None, Some(p)) if self.params.new_directions_from_prior => Some(p),
                    (Some(_), None) if self.params.restrict_to_prior => None,
                    (d, _) => d,
                }
            }
        };
        dir.filter(|d| prev.map_or(true, |p| self.within_angle(d, p)))
    }

    /// 在 `pos` 及其邻域上分别选取方向并投票.
    /// 超过一半的采样位置无方向时返回 `None`.
    fn vote<R: Rng>(&self, pos: &Vec3, prev: Option<&Vec3>, rng: &mut R) -> Option<Vec3> {
        let mut locations = vec![*pos];
        let k = self.params.num_neighborhood_samples;
        if k > 0 {
            let axis = prev.copied().unwrap_or_else(Vec3::z);
            let (u, v) = orthonormal_basis(&axis);
            let offset = match self.params.mode {
                Mode::Deterministic => 0.0,
                Mode::Probabilistic => rng.gen::<f64>() * std::f64::consts::TAU,
            };
            locations.extend((0..k).map(|i| {
                let t = offset + std::f64::consts::TAU * i as f64 / k as f64;
                pos + (u * t.cos() + v * t.sin()) * self.sampling_mm
            }));
        }

        let mut buf = Vec::new();
        let mut sum = Vec3::zeros();
        let mut valid = 0usize;
        for loc in &locations {
            self.model
                .directions(loc, prev, self.params.interpolate_data, &mut buf);
            if let Some(d) = self.select(&buf, prev, rng) {
                let reference = prev.copied().unwrap_or(sum);
                sum += align(d, &reference);
                valid += 1;
            }
        }
        if 2 * (locations.len() - valid) > locations.len() {
            return None;
        }
        sum.try_normalize(f64::EPSILON)
    }

    fn select<R: Rng>(&self, candidates: &[Candidate], prev: Option<&Vec3>, rng: &mut R) -> Option<Vec3> {
        match self.params.mode {
            Mode::Deterministic => self.select_deterministic(candidates, prev),
            Mode::Probabilistic => self.select_probabilistic(candidates, prev, rng),
        }
    }

    /// 与上一步方向对齐后, 取角度阈值内 `weight · cos` 最大者.
    fn select_deterministic(&self, candidates: &[Candidate], prev: Option<&Vec3>) -> Option<Vec3> {
        candidates
            .iter()
            .filter_map(|c| {
                let d = prev.map_or(c.dir, |p| align(c.dir, p));
                let cos = prev.map_or(1.0, |p| d.dot(p));
                (cos >= self.cos_threshold - ANGLE_EPS).then_some((c.weight * cos, d))
            })
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, d)| d)
    }

    /// 在权重超过 `odf_cutoff` 且满足角度阈值的候选中按权重抽样, 再加抖动.
    /// 抖动后的方向同样满足角度阈值.
    fn select_probabilistic<R: Rng>(
        &self,
        candidates: &[Candidate],
        prev: Option<&Vec3>,
        rng: &mut R,
    ) -> Option<Vec3> {
        let accepted: Vec<(f64, Vec3)> = candidates
            .iter()
            .filter(|c| c.weight > self.params.odf_cutoff)
            .filter_map(|c| {
                let d = prev.map_or(c.dir, |p| align(c.dir, p));
                prev.map_or(true, |p| self.within_angle(&d, p))
                    .then_some((c.weight, d))
            })
            .collect();
        let total: f64 = accepted.iter().map(|(w, _)| w).sum();
        if !(total > 0.0) {
            return None;
        }
        let mut r = rng.gen::<f64>() * total;
        let mut dir = accepted[accepted.len() - 1].1;
        for (w, d) in &accepted {
            if r < *w {
                dir = *d;
                break;
            }
            r -= w;
        }
        let jitter = self.params.peak_jitter;
        if jitter <= 0.0 {
            return Some(dir);
        }
        // 抖动后超出角度阈值时重抽, 全部失败则不加抖动.
        for _ in 0..JITTER_RETRIES {
            let Some(j) = (dir + random_unit(rng) * (jitter * dir.norm())).try_normalize(f64::EPSILON)
            else {
                continue;
            };
            if prev.map_or(true, |p| self.within_angle(&j, p)) {
                return Some(j);
            }
        }
        Some(dir)
    }

    /// 记录方向并做环路检测: 窗口内方向相对平均方向的均方根夹角超过阈值即为环路.
    fn is_loop(&self, window: &mut VecDeque<Vec3>, dir: Vec3) -> bool {
        let Some(limit) = self.params.loop_check_deg else {
            return false;
        };
        if window.len() == self.loop_window {
            window.pop_front();
        }
        window.push_back(dir);
        if window.len() < self.loop_window {
            return false;
        }
        let Some(mean) = window
            .iter()
            .fold(Vec3::zeros(), |acc, d| acc + d)
            .try_normalize(f64::EPSILON)
        else {
            return true;
        };
        let n = window.len() as f64;
        let ms = window
            .iter()
            .map(|d| d.dot(&mean).clamp(-1.0, 1.0).acos().powi(2))
            .sum::<f64>()
            / n;
        ms.sqrt().to_degrees() > limit
    }
}

/// 将轴向方向 `d` 的符号对齐到 `reference`.
#[inline]
fn align(d: Vec3, reference: &Vec3) -> Vec3 {
    if d.dot(reference) < 0.0 {
        -d
    } else {
        d
    }
}

/// 与 `axis` 正交的一组单位向量.
fn orthonormal_basis(axis: &Vec3) -> (Vec3, Vec3) {
    let a = if axis.x.abs() < 0.9 { Vec3::x() } else { Vec3::y() };
    let u = axis.cross(&a).normalize();
    let v = axis.cross(&u).normalize();
    (u, v)
}

/// 单位球面上均匀分布的随机向量 (拒绝采样).
fn random_unit<R: Rng>(rng: &mut R) -> Vec3 {
    loop {
        let v = Vec3::new(
            rng.gen_range(-1.0..=1.0),
            rng.gen_range(-1.0..=1.0),
            rng.gen_range(-1.0..=1.0),
        );
        let n2 = v.norm_squared();
        if n2 > 1e-6 && n2 <= 1.0 {
            return v / n2.sqrt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direction::PeakModel;
    use crate::track::EpConstraint;
    use crate::{Geometry, VectorField};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn straight_model() -> DirectionModel {
        let g = Geometry::isotropic((20, 5, 5), 1.0).unwrap();
        PeakModel::new(VectorField::uniform(g, &[1.0, 0.0, 0.0]))
            .unwrap()
            .into()
    }

    fn configured(model: &DirectionModel, params: &TrackingParams) -> StoppingPolicy {
        let mut policy = StoppingPolicy::new();
        policy
            .configure(
                model.geometry(),
                EpConstraint::None,
                params.cutoff,
                params.interpolate_masks,
                params.interpolate_data,
            )
            .unwrap();
        policy
    }

    #[test]
    fn test_straight_trace_spans_grid() {
        let model = straight_model();
        let params = TrackingParams::default()
            .with_step_size_vox(1.0)
            .with_length_range(0.0, 400.0);
        let policy = configured(&model, &params);
        let abort = AtomicBool::new(false);
        let it = Integrator::new(&model, None, &policy, &params, None, &abort);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let Outcome::Accepted(points) = it.trace(Vec3::new(10.0, 2.0, 2.0), &mut rng) else {
            panic!("expected a streamline");
        };
        assert_eq!(points.len(), 20);
        assert!((points[0].x - 0.0).abs() < 1e-9 || (points[0].x - 19.0).abs() < 1e-9);
        assert!(points.iter().all(|p| (p.y - 2.0).abs() < 1e-12));
    }

    #[test]
    fn test_edge_seed_traces_backward_half() {
        let model = straight_model();
        let params = TrackingParams::default()
            .with_step_size_vox(1.0)
            .with_length_range(5.0, 400.0);
        let policy = configured(&model, &params);
        let abort = AtomicBool::new(false);
        let it = Integrator::new(&model, None, &policy, &params, None, &abort);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        // 最后一个体素, 正向第一步即越界.
        let Outcome::Accepted(points) = it.trace(Vec3::new(19.0, 2.0, 2.0), &mut rng) else {
            panic!("expected a streamline");
        };
        assert_eq!(points.len(), 20);
        assert!((points[0].x - 0.0).abs() < 1e-9 || (points[0].x - 19.0).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_respects_angular_threshold() {
        let model = straight_model();
        let params = TrackingParams {
            peak_jitter: 0.3,
            ..TrackingParams::default()
        }
        .with_mode(Mode::Probabilistic)
        .with_angular_threshold_deg(10.0);
        let policy = configured(&model, &params);
        let abort = AtomicBool::new(false);
        let it = Integrator::new(&model, None, &policy, &params, None, &abort);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let candidates = [Candidate {
            dir: Vec3::x(),
            weight: 1.0,
        }];
        let cos = 10f64.to_radians().cos();
        let dirs: Vec<Vec3> = (0..200)
            .map(|_| {
                it.select_probabilistic(&candidates, Some(&Vec3::x()), &mut rng)
                    .unwrap()
            })
            .collect();
        assert!(dirs.iter().all(|d| d.dot(&Vec3::x()) >= cos - 1e-9));
        assert!(dirs.iter().any(|d| (d - Vec3::x()).norm() > 1e-6));
    }

    #[test]
    fn test_max_length_truncates() {
        let model = straight_model();
        let params = TrackingParams::default()
            .with_step_size_vox(1.0)
            .with_length_range(0.0, 6.0);
        let policy = configured(&model, &params);
        let abort = AtomicBool::new(false);
        let it = Integrator::new(&model, None, &policy, &params, None, &abort);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let Outcome::Accepted(points) = it.trace(Vec3::new(10.0, 2.0, 2.0), &mut rng) else {
            panic!("expected a streamline");
        };
        assert_eq!(points.len(), 7);
    }

    #[test]
    fn test_min_length_discards() {
        let model = straight_model();
        let params = TrackingParams::default()
            .with_step_size_vox(1.0)
            .with_length_range(100.0, 400.0);
        let policy = configured(&model, &params);
        let abort = AtomicBool::new(false);
        let it = Integrator::new(&model, None, &policy, &params, None, &abort);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(
            it.trace(Vec3::new(10.0, 2.0, 2.0), &mut rng),
            Outcome::Discarded
        );
    }

    #[test]
    fn test_loop_detection() {
        let model = straight_model();
        let params = TrackingParams {
            loop_check_deg: Some(30.0),
            ..TrackingParams::default()
        };
        let policy = configured(&model, &params);
        let abort = AtomicBool::new(false);
        let it = Integrator::new(&model, None, &policy, &params, None, &abort);
        let mut window = VecDeque::new();
        let straight = Vec3::x();
        assert!((0..10).all(|_| !it.is_loop(&mut window, straight)));
        let mut window = VecDeque::new();
        let looped = (0..8).any(|i| {
            let t = i as f64 * std::f64::consts::FRAC_PI_2;
            it.is_loop(&mut window, Vec3::new(t.cos(), t.sin(), 0.0))
        });
        assert!(looped);
    }

    #[test]
    fn test_abort_discards_partial() {
        let model = straight_model();
        let params = TrackingParams::default()
            .with_step_size_vox(0.001)
            .with_length_range(0.0, 400.0);
        let policy = configured(&model, &params);
        let abort = AtomicBool::new(true);
        let it = Integrator::new(&model, None, &policy, &params, None, &abort);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(
            it.trace(Vec3::new(10.0, 2.0, 2.0), &mut rng),
            Outcome::Aborted
        );
    }

    #[test]
    fn test_neighbourhood_vote() {
        let model = straight_model();
        let params = TrackingParams {
            num_neighborhood_samples: 4,
            sampling_distance_vox: 0.5,
            ..TrackingParams::default()
        };
        let policy = configured(&model, &params);
        let abort = AtomicBool::new(false);
        let it = Integrator::new(&model, None, &policy, &params, None, &abort);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let d = it
            .vote(&Vec3::new(10.0, 2.0, 2.0), Some(&Vec3::x()), &mut rng)
            .unwrap();
        assert!((d - Vec3::x()).norm() < 1e-12);
        // 网格外侧, 大多数邻域点越界.
        let edge = Vec3::new(10.0, -0.7, 2.0);
        assert!(it.vote(&edge, Some(&Vec3::x()), &mut rng).is_none());
    }
}

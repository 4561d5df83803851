mod profile;

use log::warn;
use tract_berry::prelude::*;
use utils::phantom::Phantom;

pub use profile::Profile;

/// 每个分区至少跨越的体素数.
const VOXELS_PER_PARCEL: f64 = 2.0;

/// 所有变体共用的追踪参数.
fn base_params() -> TrackingParams {
    TrackingParams {
        loop_check_deg: Some(60.0),
        ..TrackingParams::default()
    }
    .with_seeds_per_voxel(8)
    .with_length_range(20.0, 200.0)
    .with_fixed_seed(2024)
}

/// 追踪, 聚类, 分区, tractometry 全流程. 结果写入输出目录下的 `name` 子目录.
fn run(name: &str, phantom: &Phantom, params: TrackingParams) -> Profile {
    let mut profile = Profile::new();

    let model = PeakModel::new(phantom.field.clone()).unwrap();
    let policy = StoppingPolicy::new().with_mask(phantom.mask.clone());
    let tracker = StreamlineTracker::new(model.into(), policy, params)
        .unwrap()
        .with_seed_image(phantom.seed.clone())
        .unwrap();

    profile.tracking_start();
    let result = tracker.track().unwrap();
    profile.tracking_elapsed();
    profile.record_tracking(&result.stats);

    let Some(bundle) = result.into_bundle() else {
        return profile.finish();
    };
    if bundle.is_empty() {
        warn!("{name}: 没有被接受的流线");
        return profile.finish();
    }
    profile.record_lengths(bundle.length_stats());

    profile.analysis_start();
    let clustering = TractClusterer::new(ClusterParams::default().with_num_centroids(2))
        .unwrap()
        .cluster(&bundle);
    let parcels = parcellate(
        &bundle,
        phantom.mask.geometry(),
        &ParcelParams::default().with_num_parcels(8),
        None,
    )
    .unwrap();
    let num_points = estimate_num_sampling_points(
        phantom.scalar.geometry().min_spacing(),
        bundle.mean_length(),
        VOXELS_PER_PARCEL,
    );
    let tm = static_profile(&phantom.scalar, &bundle, num_points, None, true);
    profile.analysis_elapsed();
    profile.record_analysis(
        clustering.len(),
        parcels.postprocessed.count_nonzero(),
        tm.stats.len(),
    );

    let dir = utils::paths::output_dir_with(name);
    bundle.save(dir.join("bundle.bin")).unwrap();
    parcels.postprocessed.save_npy(dir.join("parcels.npy")).unwrap();

    profile.finish()
}

/// 确定性追踪, 二阶积分.
pub fn deterministic(phantom: &Phantom) -> Profile {
    run("deterministic", phantom, base_params())
}

/// 概率追踪.
pub fn probabilistic(phantom: &Phantom) -> Profile {
    run(
        "probabilistic",
        phantom,
        base_params().with_mode(Mode::Probabilistic),
    )
}

/// 确定性追踪, 8 个邻域采样点投票.
pub fn neighbourhood(phantom: &Phantom) -> Profile {
    let params = TrackingParams {
        num_neighborhood_samples: 8,
        ..base_params()
    };
    run("neighbourhood", phantom, params)
}

/// 确定性追踪, 一阶积分.
pub fn first_order(phantom: &Phantom) -> Profile {
    let params = TrackingParams {
        second_order: false,
        ..base_params()
    };
    run("first_order", phantom, params)
}

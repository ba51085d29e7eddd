use approx::assert_relative_eq;
use ct_icp::{
    config::{
        Initialization, LossFunction, MapOptions, MotionCompensation, OdometryOptions, SolverKind,
    },
    lie_group::transform_point,
    odometry::{FrameResult, FrameStatus, Odometry},
    parametrization::FramePose,
    point3d::{frame_from_points, TimedPoint},
};
use nalgebra as na;

fn map_options() -> MapOptions {
    MapOptions {
        size_voxel_map: 1.0,
        max_num_points_in_voxel: 2000,
        min_distance_points: 0.04,
        voxel_neighborhood: 1,
    }
}

fn options(rigid: bool) -> OdometryOptions {
    let mut options = if rigid {
        OdometryOptions::rigid()
    } else {
        OdometryOptions::default()
    };
    options.initialization = Initialization::None;
    options.init_num_frames = 0;
    options.voxel_size = 0.05;
    options.sample_voxel_size = 0.05;
    options.map = map_options();
    options.registration.num_iters_icp = 20;
    options.registration.ls_num_threads = 2;
    options
}

fn grid(start: f64, step: f64, n: usize) -> impl Iterator<Item = (f64, f64)> + Clone {
    (0..n).flat_map(move |i| (0..n).map(move |j| (start + i as f64 * step, start + j as f64 * step)))
}

/// Three orthogonal walls meeting at the origin.
fn corner(start: f64, step: f64, n: usize) -> Vec<na::Vector3<f64>> {
    let cells = grid(start, step, n);
    cells
        .clone()
        .map(|(u, v)| na::Vector3::new(u, v, 0.0))
        .chain(cells.clone().map(|(u, v)| na::Vector3::new(u, 0.0, v)))
        .chain(cells.map(|(u, v)| na::Vector3::new(0.0, u, v)))
        .collect()
}

fn corner_map() -> Vec<na::Vector3<f64>> {
    corner(0.0, 0.05, 49)
}

/// Wall points away from the edges, so that every neighborhood is planar.
fn corner_scene() -> Vec<na::Vector3<f64>> {
    corner(0.3, 0.1, 18)
}

/// Sweep of `scene` by a sensor moving from `poses.begin` to `poses.end`,
/// timestamps spread over the sweep.
fn sweep(scene: &[na::Vector3<f64>], poses: &FramePose) -> Vec<TimedPoint> {
    let n = scene.len();
    let points: Vec<_> = scene
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let t = ((i * 7919) % n) as f64 / (n - 1) as f64;
            (transform_point(&poses.interpolate(t).inverse(), p), t)
        })
        .collect();
    frame_from_points(&points)
}

/// Odometry over a dense horizontal plane, and a frame `height` above it.
fn plane_setup(options: OdometryOptions, height: f64) -> (Odometry, Vec<TimedPoint>) {
    let mut options = options;
    options.voxel_size = 0.1;
    options.sample_voxel_size = 0.1;
    options.map.max_num_points_in_voxel = 200;
    options.map.min_distance_points = 0.05;
    let mut odometry = Odometry::new(options).unwrap();

    let map: Vec<_> = (0..100)
        .flat_map(|i| (0..70).map(move |j| (i, j)))
        .map(|(i, j)| na::Vector3::new(-1.0 + i as f64 * 0.1, -1.0 + j as f64 * 0.1, 0.0))
        .collect();
    odometry.map_mut().add_points(&map);

    let frame: Vec<_> = (0..40)
        .flat_map(|i| (0..25).map(move |j| (i, j)))
        .map(|(i, j)| (na::Vector3::new(i as f64 * 0.2, j as f64 * 0.2, height), 0.0))
        .collect();
    (odometry, frame_from_points(&frame))
}

#[test]
fn plane_offset_along_its_normal_is_recovered() {
    let (mut odometry, frame) = plane_setup(options(true), 0.2);
    assert_eq!(frame.len(), 1000);
    let result = odometry.register_frame(&frame);

    assert_eq!(result.status, FrameStatus::Converged);
    assert_eq!(result.num_keypoints, 1000);
    let t = result.poses.end.translation.vector;
    assert_relative_eq!(t, na::Vector3::new(0.0, 0.0, -0.2), epsilon = 1e-3);
    assert!(result.poses.end.rotation.angle() < 1e-3);
    let error = result.frame_to_map_error.unwrap();
    assert_relative_eq!(error.translation, 0.2, epsilon = 1e-3);
    assert!(result.inserted);
    // inserted points land on the map plane
    assert_eq!(odometry.map().map_len(), 7000);
}

#[test]
fn large_frame_to_map_error_blocks_insertion() {
    let mut strict = options(true);
    strict.distance_error_threshold = 0.1;
    let (mut odometry, frame) = plane_setup(strict.clone(), 0.2);
    let result = odometry.register_frame(&frame);
    assert_eq!(result.status, FrameStatus::Converged);
    assert!(result.frame_to_map_error.unwrap().translation > 0.1);
    assert!(!result.inserted);
    assert_eq!(result.num_inserted_points, 0);

    strict.always_insert = true;
    let (mut odometry, frame) = plane_setup(strict, 0.2);
    assert!(odometry.register_frame(&frame).inserted);
}

#[test]
fn rotation_error_blocks_insertion() {
    let truth = FramePose::rigid(na::Isometry3::from_parts(
        na::Translation3::new(0.0, 0.0, 0.0),
        na::UnitQuaternion::from_euler_angles(0.0, 0.0, 0.01),
    ));
    let frame = sweep(&corner_scene(), &truth);
    let register = |orientation_error_threshold: f64| -> FrameResult {
        let mut options = options(true);
        options.orientation_error_threshold = orientation_error_threshold;
        let mut odometry = Odometry::new(options).unwrap();
        odometry.map_mut().add_points(&corner_map());
        odometry.register_frame(&frame)
    };

    let strict = register(0.2);
    assert_eq!(strict.status, FrameStatus::Converged);
    assert_relative_eq!(
        strict.frame_to_map_error.unwrap().orientation_deg,
        0.01_f64.to_degrees(),
        epsilon = 0.05
    );
    assert!(!strict.inserted);
    assert!(register(1.0).inserted);
}

#[test]
fn frame_beyond_the_truncation_distance_is_degraded() {
    let mut robust = options(true);
    robust.registration.solver = SolverKind::Robust;
    robust.registration.loss_function = LossFunction::Truncated;
    robust.registration.outlier_distance = 0.3;
    let (mut odometry, frame) = plane_setup(robust, 0.6);
    let map_len = odometry.map().map_len();
    let result = odometry.register_frame(&frame);
    assert_eq!(result.status, FrameStatus::Degraded);
    assert_eq!(result.poses, FramePose::default());
    assert!(result.frame_to_map_error.is_none());
    assert!(!result.inserted);
    assert_eq!(odometry.map().map_len(), map_len);
}

#[test]
fn continuous_time_without_distortion_matches_rigid() {
    let truth = FramePose::rigid(na::Isometry3::from_parts(
        na::Translation3::new(0.05, -0.04, 0.03),
        na::UnitQuaternion::from_euler_angles(0.0, 0.0, 0.01),
    ));
    let frame = sweep(&corner_scene(), &truth);

    let mut continuous = options(false);
    continuous.registration.point_to_plane_with_distortion = false;
    let mut ends = Vec::new();
    for options in [options(true), continuous] {
        let mut odometry = Odometry::new(options).unwrap();
        odometry.map_mut().add_points(&corner_map());
        let result = odometry.register_frame(&frame);
        ends.push(result.poses.end);
    }
    assert_eq!(ends[0], ends[1]);
    assert_relative_eq!(ends[0].translation.vector, truth.end.translation.vector, epsilon = 2e-3);
}

#[test]
fn continuous_time_corrects_the_distortion_of_a_moving_sensor() {
    let truth = FramePose::new(
        na::Isometry3::identity(),
        na::Isometry3::from_parts(
            na::Translation3::new(0.1, 0.05, -0.05),
            na::UnitQuaternion::from_euler_angles(0.0, 0.0, 0.02),
        ),
    );
    let frame = sweep(&corner_scene(), &truth);

    let mut continuous = Odometry::new(options(false)).unwrap();
    continuous.map_mut().add_points(&corner_map());
    let result = continuous.register_frame(&frame);
    assert_eq!(result.status, FrameStatus::Converged);
    assert_relative_eq!(
        result.poses.end.translation.vector,
        truth.end.translation.vector,
        epsilon = 5e-3
    );
    assert_relative_eq!(
        result.poses.begin.translation.vector,
        truth.begin.translation.vector,
        epsilon = 5e-3
    );
    assert!(result.poses.end.rotation.angle_to(&truth.end.rotation) < 2e-3);

    let mut rigid = Odometry::new(options(true)).unwrap();
    rigid.map_mut().add_points(&corner_map());
    let rigid_end = rigid.register_frame(&frame).poses.end;
    assert!((rigid_end.translation.vector - truth.end.translation.vector).norm() > 1e-2);
}

#[test]
fn sparse_map_degrades_without_touching_the_map() {
    let mut odometry = Odometry::new(options(true)).unwrap();
    odometry.map_mut().add_points(&[
        na::Vector3::new(0.0, 0.0, 0.0),
        na::Vector3::new(1.0, 0.0, 0.0),
        na::Vector3::new(0.0, 1.0, 0.0),
    ]);
    let frame = sweep(&corner_scene(), &FramePose::default());
    let result = odometry.register_frame(&frame);
    assert_eq!(result.status, FrameStatus::Degraded);
    assert_eq!(result.poses, FramePose::default());
    assert!(result.frame_to_map_error.is_none());
    assert!(!result.inserted);
    assert_eq!(odometry.map().map_len(), 3);
}

#[test]
fn sequence_follows_a_moving_sensor() {
    let mut options = options(false);
    options.initialization = Initialization::ConstantVelocity;
    let mut odometry = Odometry::new(options).unwrap();
    odometry.map_mut().add_points(&corner_map());
    let scene = corner_scene();

    for k in 0..6 {
        let pose = na::Isometry3::translation(0.04 * k as f64, 0.02 * k as f64, 0.0);
        let static_points: Vec<_> = scene
            .iter()
            .map(|p| (transform_point(&pose.inverse(), p), 0.0))
            .collect();
        let result = odometry.register_frame(&frame_from_points(&static_points));
        assert_eq!(result.status, FrameStatus::Converged, "frame {}", k);
        assert_relative_eq!(
            result.poses.end.translation.vector,
            pose.translation.vector,
            epsilon = 5e-3
        );
    }
    assert_eq!(odometry.trajectory().len(), 6);
}

#[test]
fn result_does_not_depend_on_the_thread_count() {
    let truth = FramePose::new(
        na::Isometry3::identity(),
        na::Isometry3::translation(0.06, -0.02, 0.03),
    );
    let frame = sweep(&corner_scene(), &truth);
    let ends: Vec<_> = [1, 4]
        .into_iter()
        .map(|threads| {
            let mut options = options(false);
            options.registration.ls_num_threads = threads;
            let mut odometry = Odometry::new(options).unwrap();
            odometry.map_mut().add_points(&corner_map());
            odometry.register_frame(&frame).poses
        })
        .collect();
    assert_eq!(ends[0], ends[1]);
}

/// End pose of frame `k` of a sensor moving at a constant velocity.
fn constant_velocity_end(k: usize) -> na::Isometry3<f64> {
    na::Isometry3::translation(0.04 * k as f64, 0.02 * k as f64, 0.0)
}

fn constant_velocity_sweep(k: usize) -> Vec<TimedPoint> {
    let begin = constant_velocity_end(k.saturating_sub(1));
    sweep(&corner_scene(), &FramePose::new(begin, constant_velocity_end(k)))
}

#[test]
fn iterative_compensation_starts_each_frame_at_the_previous_end() {
    let mut options = options(true);
    options.motion_compensation = MotionCompensation::Iterative;
    options.initialization = Initialization::ConstantVelocity;
    options.do_no_insert = true;
    let mut odometry = Odometry::new(options).unwrap();
    odometry.map_mut().add_points(&corner_map());

    for k in 0..6 {
        let previous_end = odometry.trajectory().last().map(|poses| poses.end);
        let result = odometry.register_frame(&constant_velocity_sweep(k));
        assert_eq!(result.status, FrameStatus::Converged, "frame {}", k);
        assert_eq!(
            result.poses.begin,
            previous_end.unwrap_or_else(na::Isometry3::identity)
        );
        assert_relative_eq!(
            result.poses.end.translation.vector,
            constant_velocity_end(k).translation.vector,
            epsilon = 5e-3
        );
    }
}

#[test]
fn constant_velocity_compensation_reduces_the_lag_of_a_rigid_registration() {
    let final_error = |compensation: MotionCompensation| -> f64 {
        let mut options = options(true);
        options.motion_compensation = compensation;
        options.initialization = Initialization::ConstantVelocity;
        options.do_no_insert = true;
        let mut odometry = Odometry::new(options).unwrap();
        odometry.map_mut().add_points(&corner_map());
        let mut error = 0.0;
        for k in 0..10 {
            let result = odometry.register_frame(&constant_velocity_sweep(k));
            assert_eq!(result.status, FrameStatus::Converged, "frame {}", k);
            error = (result.poses.end.translation.vector
                - constant_velocity_end(k).translation.vector)
                .norm();
        }
        error
    };

    let uncompensated = final_error(MotionCompensation::None);
    let compensated = final_error(MotionCompensation::ConstantVelocity);
    // a rigid pose over a moving sweep lags behind the end of the frame
    assert!(uncompensated > 1e-2);
    assert!(compensated < 1e-2);
    assert!(compensated < 0.5 * uncompensated);
}

use crate::{point3d::TimedPoint, voxel_hash_map::Voxel};
use nalgebra as na;
use std::collections::HashSet;

/// Voxel size growth between two rounds of adaptive sampling.
const ADAPTIVE_GROWTH: f64 = 1.25;
const ADAPTIVE_MAX_ROUNDS: usize = 12;

pub fn na_vec_to_voxel(point: &na::Vector3<f64>, voxel_size: f64) -> Voxel {
    Voxel::new(
        (point.x / voxel_size).floor() as i32,
        (point.y / voxel_size).floor() as i32,
        (point.z / voxel_size).floor() as i32,
    )
}

/// Keeps the first point falling in each voxel, in input order.
pub fn voxel_downsample(frame: &[TimedPoint], voxel_size: f64) -> Vec<TimedPoint> {
    let mut grid: HashSet<Voxel> = HashSet::with_capacity(frame.len());
    frame
        .iter()
        .filter(|pt| grid.insert(na_vec_to_voxel(&pt.raw_point, voxel_size)))
        .copied()
        .collect()
}

/// Regular stride decimation down to at most `max_points`.
pub fn cap_points(points: Vec<TimedPoint>, max_points: usize) -> Vec<TimedPoint> {
    if points.len() <= max_points {
        return points;
    }
    let n = points.len();
    (0..max_points).map(|i| points[i * n / max_points]).collect()
}

/// Grid sampling whose voxel grows until the sample fits in `max_points`.
/// Dense frames end up with coarser voxels, sparse frames keep the requested size.
pub fn adaptive_downsample(
    frame: &[TimedPoint],
    voxel_size: f64,
    max_points: usize,
) -> Vec<TimedPoint> {
    let mut size = voxel_size;
    let mut sample = voxel_downsample(frame, size);
    for _ in 0..ADAPTIVE_MAX_ROUNDS {
        if sample.len() <= max_points {
            break;
        }
        size *= ADAPTIVE_GROWTH;
        sample = voxel_downsample(&sample, size);
    }
    cap_points(sample, max_points)
}

use nalgebra as na;
use pcd_rs::PcdDeserialize;
use rayon::prelude::*;

/// Raw point as stored in a pcd file.
#[derive(PcdDeserialize, Debug, Clone, Copy)]
pub struct Point3d {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub intensity: f32,
}

impl Point3d {
    pub fn to_na_vec_f64(&self) -> na::Vector3<f64> {
        na::Vector3::<f64>::new(self.x as f64, self.y as f64, self.z as f64)
    }
}

/// A lidar point with its acquisition time.
///
/// `raw_point` is in the sensor frame, `point` in the world frame under the
/// current pose estimate. `alpha_timestamp` is the timestamp normalized to
/// `[0, 1]` over the frame and drives the pose interpolation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedPoint {
    pub raw_point: na::Vector3<f64>,
    pub point: na::Vector3<f64>,
    pub timestamp: f64,
    pub alpha_timestamp: f64,
}

impl TimedPoint {
    pub fn new(raw_point: na::Vector3<f64>, timestamp: f64) -> TimedPoint {
        TimedPoint {
            raw_point,
            point: raw_point,
            timestamp,
            alpha_timestamp: 1.0,
        }
    }
}

/// Builds a frame from raw coordinates and timestamps and normalizes the
/// timestamps. A frame whose points share one timestamp gets `alpha = 1`.
pub fn frame_from_points(points: &[(na::Vector3<f64>, f64)]) -> Vec<TimedPoint> {
    let mut frame: Vec<TimedPoint> = points
        .iter()
        .map(|(p, t)| TimedPoint::new(*p, *t))
        .collect();
    normalize_timestamps(&mut frame);
    frame
}

pub fn normalize_timestamps(frame: &mut [TimedPoint]) {
    let (min_t, max_t) = frame
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), pt| {
            (lo.min(pt.timestamp), hi.max(pt.timestamp))
        });
    let span = max_t - min_t;
    frame.par_iter_mut().for_each(|pt| {
        pt.alpha_timestamp = if span > 0.0 {
            ((pt.timestamp - min_t) / span).clamp(0.0, 1.0)
        } else {
            1.0
        };
    });
}

pub fn clip_point_cloud_by_distance(
    point_cloud: &[TimedPoint],
    min_distance: f64,
    max_distance: f64,
) -> Vec<TimedPoint> {
    let min2 = min_distance * min_distance;
    let max2 = max_distance * max_distance;
    point_cloud
        .par_iter()
        .filter_map(|pt| {
            let s = pt.raw_point.norm_squared();
            if s < min2 || s > max2 {
                None
            } else {
                Some(*pt)
            }
        })
        .collect()
}

use nalgebra as na;
use rayon::prelude::*;

use crate::{
    config::{MotionCompensation, OdometryOptions, ParametrizationKind},
    lie_group::{angular_distance_deg, box_plus, transform_point, Hat},
    point3d::TimedPoint,
};

/// Increments are laid out `[dt_0, dw_0, dt_1, dw_1]`; six-parameter
/// variants only use the first block.
pub const NUM_PARAMS: usize = 12;
pub type Jacobian = na::SMatrix<f64, 3, NUM_PARAMS>;
pub type Increment = na::SVector<f64, NUM_PARAMS>;
pub type Hessian = na::SMatrix<f64, NUM_PARAMS, NUM_PARAMS>;

/// Poses at the first and the last timestamp of a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramePose {
    pub begin: na::Isometry3<f64>,
    pub end: na::Isometry3<f64>,
}

impl Default for FramePose {
    fn default() -> Self {
        FramePose::rigid(na::Isometry3::identity())
    }
}

impl FramePose {
    pub fn new(begin: na::Isometry3<f64>, end: na::Isometry3<f64>) -> FramePose {
        FramePose { begin, end }
    }

    pub fn rigid(pose: na::Isometry3<f64>) -> FramePose {
        FramePose {
            begin: pose,
            end: pose,
        }
    }

    pub fn interpolate(&self, alpha: f64) -> na::Isometry3<f64> {
        let rotation = self
            .begin
            .rotation
            .try_slerp(&self.end.rotation, alpha, 1e-12)
            .unwrap_or_else(|| self.begin.rotation.nlerp(&self.end.rotation, alpha));
        let translation =
            self.begin.translation.vector * (1.0 - alpha) + self.end.translation.vector * alpha;
        na::Isometry3::from_parts(translation.into(), rotation)
    }

    /// Rotation (degrees) accumulated by the sensor during the frame.
    pub fn ego_orientation_deg(&self) -> f64 {
        angular_distance_deg(&self.begin.rotation, &self.end.rotation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parametrization {
    /// One pose (the end pose) for every point.
    Rigid,
    /// Interpolation between a fixed begin pose and the estimated end pose.
    FixedBegin,
    /// Begin and end poses are both estimated.
    Continuous { distortion: bool },
}

impl Parametrization {
    pub fn from_options(options: &OdometryOptions) -> Parametrization {
        match (
            options.registration.parametrization,
            options.motion_compensation,
        ) {
            (ParametrizationKind::ContinuousTime, _) => Parametrization::Continuous {
                distortion: options.registration.point_to_plane_with_distortion,
            },
            (ParametrizationKind::Simple, MotionCompensation::Iterative) => {
                Parametrization::FixedBegin
            }
            (ParametrizationKind::Simple, _) => Parametrization::Rigid,
        }
    }

    /// Leading entries of the increment the parametrization reads.
    pub fn num_params(&self) -> usize {
        match self {
            Parametrization::Rigid | Parametrization::FixedBegin => 6,
            Parametrization::Continuous { .. } => NUM_PARAMS,
        }
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, Parametrization::Continuous { .. })
    }

    /// Pose applied to a point acquired at `alpha`.
    pub fn point_pose(&self, poses: &FramePose, alpha: f64) -> na::Isometry3<f64> {
        match self {
            Parametrization::Rigid | Parametrization::Continuous { distortion: false } => poses.end,
            Parametrization::FixedBegin | Parametrization::Continuous { distortion: true } => {
                poses.interpolate(alpha)
            }
        }
    }

    pub fn world_point(&self, poses: &FramePose, pt: &TimedPoint) -> na::Vector3<f64> {
        transform_point(&self.point_pose(poses, pt.alpha_timestamp), &pt.raw_point)
    }

    /// Derivative of the world point with respect to the increment.
    pub fn jacobian(&self, poses: &FramePose, pt: &TimedPoint) -> Jacobian {
        let pose = self.point_pose(poses, pt.alpha_timestamp);
        let rotated = pose.rotation * pt.raw_point;
        let alpha = pt.alpha_timestamp;
        let mut jacobian = Jacobian::zeros();
        let mut fill = |block: usize, scale: f64| {
            jacobian
                .fixed_view_mut::<3, 3>(0, 6 * block)
                .copy_from(&(na::Matrix3::identity() * scale));
            jacobian
                .fixed_view_mut::<3, 3>(0, 6 * block + 3)
                .copy_from(&(-scale * rotated.hat()));
        };
        match self {
            Parametrization::Rigid => fill(0, 1.0),
            Parametrization::FixedBegin => fill(0, alpha),
            Parametrization::Continuous { distortion: false } => fill(1, 1.0),
            Parametrization::Continuous { distortion: true } => {
                fill(0, 1.0 - alpha);
                fill(1, alpha);
            }
        }
        jacobian
    }

    pub fn apply(&self, poses: &FramePose, dx: &Increment) -> FramePose {
        let first = dx.fixed_rows::<6>(0).into_owned();
        let second = dx.fixed_rows::<6>(6).into_owned();
        match self {
            Parametrization::Rigid => FramePose::rigid(box_plus(&poses.end, &first)),
            Parametrization::FixedBegin => FramePose::new(poses.begin, box_plus(&poses.end, &first)),
            Parametrization::Continuous { .. } => FramePose::new(
                box_plus(&poses.begin, &first),
                box_plus(&poses.end, &second),
            ),
        }
    }

    /// Largest rotation (radians) and translation change between two
    /// estimates, over the estimated poses only.
    pub fn pose_change(&self, before: &FramePose, after: &FramePose) -> (f64, f64) {
        let change = |a: &na::Isometry3<f64>, b: &na::Isometry3<f64>| {
            (
                a.rotation.angle_to(&b.rotation),
                (a.translation.vector - b.translation.vector).norm(),
            )
        };
        let (rot, trans) = change(&before.end, &after.end);
        if self.is_continuous() {
            let (rot_begin, trans_begin) = change(&before.begin, &after.begin);
            (rot.max(rot_begin), trans.max(trans_begin))
        } else {
            (rot, trans)
        }
    }

    /// Moves every point of `frame` to the world under `poses`.
    pub fn transform_frame(&self, poses: &FramePose, frame: &mut [TimedPoint]) {
        frame.par_iter_mut().for_each(|pt| {
            pt.point = self.world_point(poses, pt);
        });
    }
}

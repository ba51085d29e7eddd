use nalgebra as na;

pub trait Hat {
    fn hat(&self) -> na::Matrix3<f64>;
}

impl Hat for na::Vector3<f64> {
    fn hat(&self) -> na::Matrix3<f64> {
        na::Matrix3::new(
            0.0, -self.z, self.y, //
            self.z, 0.0, -self.x, //
            -self.y, self.x, 0.0,
        )
    }
}

pub trait Exp {
    type Output;
    fn exp(&self) -> Self::Output;
}

impl Exp for na::Vector3<f64> {
    type Output = na::UnitQuaternion<f64>;
    fn exp(&self) -> na::UnitQuaternion<f64> {
        na::UnitQuaternion::from_scaled_axis(*self)
    }
}

impl Exp for na::Vector6<f64> {
    type Output = na::Isometry3<f64>;
    fn exp(&self) -> na::Isometry3<f64> {
        let translation = self.fixed_rows::<3>(0).into_owned();
        let rotation = self.fixed_rows::<3>(3).into_owned();
        na::Isometry3::from_parts(translation.into(), rotation.exp())
    }
}

/// Moves the point at `coords` by `pose`, rotation and translation.
#[inline]
pub fn transform_point(pose: &na::Isometry3<f64>, coords: &na::Vector3<f64>) -> na::Vector3<f64> {
    (pose * na::Point3::from(*coords)).coords
}

/// Applies a `[dt, dw]` increment to `pose`: `dw` on the left of the
/// rotation, `dt` added to the translation.
pub fn box_plus(pose: &na::Isometry3<f64>, delta: &na::Vector6<f64>) -> na::Isometry3<f64> {
    let step = delta.exp();
    let rotation = step.rotation * pose.rotation;
    na::Isometry3::from_parts(
        (pose.translation.vector + step.translation.vector).into(),
        // bug in nalgebra: drift accumulates without renormalization
        na::UnitQuaternion::from_quaternion(rotation.normalize()),
    )
}

/// Angle (degrees) of the rotation taking `a` to `b`.
pub fn angular_distance_deg(a: &na::UnitQuaternion<f64>, b: &na::UnitQuaternion<f64>) -> f64 {
    a.angle_to(b).to_degrees()
}

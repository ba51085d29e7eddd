use log::Level;
use nalgebra as na;
use std::sync::Arc;

use crate::{
    config::MotionModelOptions,
    lie_group::angular_distance_deg,
    logging::LogSink,
    parametrization::{FramePose, Hessian, Increment, Jacobian},
};

const BEGIN_TRANSLATION: usize = 0;
const BEGIN_ROTATION: usize = 3;
const END_TRANSLATION: usize = 6;

const LOCATION_BLOCKS: &[(usize, f64)] = &[(BEGIN_TRANSLATION, 1.0)];
const VELOCITY_BLOCKS: &[(usize, f64)] = &[(BEGIN_TRANSLATION, -1.0), (END_TRANSLATION, 1.0)];
const ORIENTATION_BLOCKS: &[(usize, f64)] = &[(BEGIN_ROTATION, 1.0)];

/// `0.5 * weight * |residual|^2`, the residual moving by `sign * d` with each
/// listed 3-parameter block of the increment.
#[derive(Debug, Clone, Copy)]
pub struct PriorTerm {
    pub blocks: &'static [(usize, f64)],
    pub residual: na::Vector3<f64>,
    pub weight: f64,
}

impl PriorTerm {
    pub fn jacobian(&self) -> Jacobian {
        let mut jacobian = Jacobian::zeros();
        for &(block, sign) in self.blocks {
            jacobian
                .fixed_view_mut::<3, 3>(0, block)
                .copy_from(&(na::Matrix3::identity() * sign));
        }
        jacobian
    }

    pub fn cost(&self) -> f64 {
        0.5 * self.weight * self.residual.norm_squared()
    }
}

/// Quadratic motion prior of a continuous-time registration: location
/// consistency, constant velocity, small velocity and orientation consistency.
#[derive(Debug, Clone)]
pub struct MotionRegularizer {
    previous: FramePose,
    options: MotionModelOptions,
}

impl MotionRegularizer {
    pub fn new(previous: FramePose, options: MotionModelOptions) -> MotionRegularizer {
        MotionRegularizer { previous, options }
    }

    /// Terms with a positive beta, betas multiplied by `scale`.
    pub fn terms(&self, poses: &FramePose, scale: f64) -> Vec<PriorTerm> {
        let o = &self.options;
        let begin_t = poses.begin.translation.vector;
        let end_t = poses.end.translation.vector;
        let previous_end_t = self.previous.end.translation.vector;
        let previous_velocity = previous_end_t - self.previous.begin.translation.vector;
        let orientation = (poses.begin.rotation * self.previous.end.rotation.inverse()).scaled_axis();
        [
            (o.beta_location_consistency, LOCATION_BLOCKS, begin_t - previous_end_t),
            (
                o.beta_constant_velocity,
                VELOCITY_BLOCKS,
                (end_t - begin_t) - previous_velocity,
            ),
            (o.beta_small_velocity, VELOCITY_BLOCKS, end_t - begin_t),
            (o.beta_orientation_consistency, ORIENTATION_BLOCKS, orientation),
        ]
        .into_iter()
        .filter(|(beta, _, _)| *beta > 0.0)
        .map(|(beta, blocks, residual)| PriorTerm {
            blocks,
            residual,
            weight: beta * scale,
        })
        .collect()
    }

    /// Adds the prior at `poses` to the normal equations and returns its cost.
    /// `scale` is the number of residuals of the registration.
    pub fn add_to(
        &self,
        poses: &FramePose,
        scale: f64,
        hessian: &mut Hessian,
        gradient: &mut Increment,
    ) -> f64 {
        self.terms(poses, scale)
            .iter()
            .map(|term| {
                let j_tw = term.jacobian().transpose() * term.weight;
                *hessian += j_tw * term.jacobian();
                *gradient += j_tw * term.residual;
                term.cost()
            })
            .sum()
    }
}

pub struct MotionModel {
    options: MotionModelOptions,
    sink: Arc<dyn LogSink>,
    previous: Option<FramePose>,
    before_previous: Option<FramePose>,
}

impl MotionModel {
    pub fn new(options: MotionModelOptions, sink: Arc<dyn LogSink>) -> MotionModel {
        MotionModel {
            options,
            sink,
            previous: None,
            before_previous: None,
        }
    }

    pub fn previous(&self) -> Option<&FramePose> {
        self.previous.as_ref()
    }

    /// Share of the previous velocity carried into the prediction.
    fn velocity_factor(&self) -> f64 {
        let cv = self.options.beta_constant_velocity.max(0.0);
        let sv = self.options.beta_small_velocity.max(0.0);
        if cv + sv > 0.0 {
            cv / (cv + sv)
        } else {
            0.0
        }
    }

    /// Seed for the next frame. Falls back to the last confirmed pose when the
    /// prediction moves too far from it, and to the identity without history.
    pub fn predict(&self) -> FramePose {
        let Some(previous) = self.previous else {
            return FramePose::default();
        };
        let begin = previous.end;
        let Some(before) = self.before_previous else {
            return FramePose::rigid(begin);
        };

        let f = self.velocity_factor();
        let velocity = previous.end.translation.vector - before.end.translation.vector;
        let rotation_step = previous.end.rotation * before.end.rotation.inverse();
        let end = na::Isometry3::from_parts(
            (begin.translation.vector + velocity * f).into(),
            rotation_step.powf(f) * begin.rotation,
        );
        let prediction = FramePose::new(begin, end);

        let orientation = angular_distance_deg(&previous.end.rotation, &end.rotation);
        let translation = (end.translation.vector - previous.end.translation.vector).norm();
        if orientation > self.options.threshold_orientation_deg
            || translation > self.options.threshold_translation_diff
        {
            if self.options.log_if_invalid {
                self.sink.log(
                    Level::Warn,
                    &format!(
                        "invalid motion prediction ({:.2} deg, {:.3} m), using the last pose",
                        orientation, translation
                    ),
                );
            }
            return FramePose::rigid(previous.end);
        }
        prediction
    }

    pub fn regularizer(&self) -> Option<MotionRegularizer> {
        self.previous
            .map(|previous| MotionRegularizer::new(previous, self.options.clone()))
    }

    /// Records the final estimate of a frame. Called once per frame.
    pub fn update(&mut self, poses: FramePose) {
        self.before_previous = self.previous.replace(poses);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use approx::assert_relative_eq;

    fn translation(x: f64, y: f64) -> na::Isometry3<f64> {
        na::Isometry3::translation(x, y, 0.0)
    }

    fn model(options: MotionModelOptions) -> (MotionModel, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (MotionModel::new(options, sink.clone()), sink)
    }

    #[test]
    fn identity_without_history() {
        let (model, _) = model(MotionModelOptions::default());
        assert_eq!(model.predict(), FramePose::default());
        assert!(model.regularizer().is_none());
    }

    #[test]
    fn constant_velocity_prediction() {
        let (mut model, sink) = model(MotionModelOptions::default());
        model.update(FramePose::rigid(translation(0.0, 0.0)));
        model.update(FramePose::new(
            translation(0.0, 0.0),
            na::Isometry3::from_parts(
                na::Translation3::new(1.0, 0.5, 0.0),
                na::UnitQuaternion::from_euler_angles(0.0, 0.0, 0.1),
            ),
        ));
        let prediction = model.predict();
        assert_relative_eq!(prediction.begin.translation.vector.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(prediction.end.translation.vector, na::Vector3::new(2.0, 1.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(prediction.end.rotation.angle(), 0.2, epsilon = 1e-9);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn small_velocity_shrinks_the_prediction() {
        let options = MotionModelOptions {
            beta_constant_velocity: 1.0,
            beta_small_velocity: 1.0,
            ..MotionModelOptions::default()
        };
        let (mut model, _) = model(options);
        model.update(FramePose::rigid(translation(0.0, 0.0)));
        model.update(FramePose::rigid(translation(1.0, 0.0)));
        assert_relative_eq!(model.predict().end.translation.vector.x, 1.5, epsilon = 1e-12);
    }

    #[test]
    fn invalid_prediction_falls_back_and_is_logged() {
        let (mut model, sink) = model(MotionModelOptions::default());
        model.update(FramePose::rigid(translation(0.0, 0.0)));
        model.update(FramePose::rigid(translation(5.0, 0.0)));
        let prediction = model.predict();
        assert_eq!(prediction, FramePose::rigid(translation(5.0, 0.0)));
        assert_eq!(sink.count(Level::Warn), 1);

        let silent = MotionModelOptions {
            log_if_invalid: false,
            ..MotionModelOptions::default()
        };
        let (mut model, sink) = self::model(silent);
        model.update(FramePose::rigid(translation(0.0, 0.0)));
        model.update(FramePose::rigid(translation(5.0, 0.0)));
        model.predict();
        assert!(sink.events().is_empty());
    }

    #[test]
    fn regularizer_pulls_towards_the_previous_end() {
        let previous = FramePose::new(translation(0.0, 0.0), translation(1.0, 0.0));
        let options = MotionModelOptions {
            beta_location_consistency: 1.0,
            beta_constant_velocity: 0.0,
            ..MotionModelOptions::default()
        };
        let regularizer = MotionRegularizer::new(previous, options);
        let mut hessian = Hessian::zeros();
        let mut gradient = Increment::zeros();
        let poses = FramePose::new(translation(1.5, 0.0), translation(2.0, 0.0));
        let cost = regularizer.add_to(&poses, 2.0, &mut hessian, &mut gradient);
        assert_relative_eq!(cost, 0.25, epsilon = 1e-12);
        assert_relative_eq!(hessian[(0, 0)], 2.0);
        assert_relative_eq!(gradient[0], 1.0, epsilon = 1e-12);
        // solving the prior alone brings the begin back
        let step = -gradient[0] / hessian[(0, 0)];
        assert_relative_eq!(1.5 + step, 1.0, epsilon = 1e-12);
        assert_eq!(hessian.fixed_view::<6, 6>(6, 6).into_owned(), na::Matrix6::zeros());
    }

    #[test]
    fn constant_velocity_term_couples_begin_and_end() {
        let previous = FramePose::new(translation(0.0, 0.0), translation(1.0, 0.0));
        let options = MotionModelOptions {
            beta_location_consistency: 0.0,
            beta_constant_velocity: 1.0,
            ..MotionModelOptions::default()
        };
        let regularizer = MotionRegularizer::new(previous, options);
        let mut hessian = Hessian::zeros();
        let mut gradient = Increment::zeros();
        let poses = FramePose::new(translation(1.0, 0.0), translation(3.0, 0.0));
        regularizer.add_to(&poses, 1.0, &mut hessian, &mut gradient);
        assert_eq!(hessian[(0, 6)], -1.0);
        assert_eq!(hessian[(6, 6)], 1.0);
        assert_relative_eq!(gradient[0], -1.0, epsilon = 1e-12);
        assert_relative_eq!(gradient[6], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn prior_terms_follow_the_positive_betas() {
        let previous = FramePose::new(translation(0.0, 0.0), translation(1.0, 0.0));
        let options = MotionModelOptions {
            beta_small_velocity: 0.5,
            ..MotionModelOptions::default()
        };
        let regularizer = MotionRegularizer::new(previous, options);
        let poses = FramePose::new(translation(1.0, 0.0), translation(2.5, 0.0));
        let terms = regularizer.terms(&poses, 10.0);
        // location, constant velocity, small velocity; orientation is off
        assert_eq!(terms.len(), 3);
        assert_relative_eq!(terms[1].residual.x, 0.5, epsilon = 1e-12);
        assert_relative_eq!(terms[2].weight, 5.0, epsilon = 1e-12);
        let jacobian = terms[1].jacobian();
        assert_eq!(jacobian[(0, 0)], -1.0);
        assert_eq!(jacobian[(0, 6)], 1.0);
        assert_eq!(jacobian.columns(3, 3).norm(), 0.0);
    }
}

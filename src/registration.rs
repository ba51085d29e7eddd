use log::Level;
use nalgebra as na;
use std::sync::Arc;

use crate::{
    config::{OdometryOptions, RegistrationOptions},
    error::AttemptFailure,
    lie_group::angular_distance_deg,
    logging::LogSink,
    motion_model::MotionRegularizer,
    neighborhood::{NeighborhoodStrategy, SearchParams},
    parametrization::FramePose,
    point3d::TimedPoint,
    solver::{Solver, SolverContext, SolverSummary},
    voxel_hash_map::VoxelHashMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Init,
    Attempt,
    Escalate,
    Converged,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Converged,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub level: usize,
    pub voxel_neighborhood: i32,
    /// Minimal share of keypoints with a full neighborhood, robust mode only.
    pub full_voxel_threshold: Option<f64>,
    pub failure: Option<AttemptFailure>,
    pub relative_orientation_deg: Option<f64>,
    pub ego_orientation_deg: Option<f64>,
    pub num_residuals: usize,
}

#[derive(Debug, Clone)]
pub struct RegistrationResult {
    pub outcome: RegistrationOutcome,
    pub poses: FramePose,
    /// Solver output behind `poses`, absent when no attempt could be solved.
    pub summary: Option<SolverSummary>,
    pub attempts: Vec<AttemptReport>,
    pub states: Vec<RegistrationState>,
}

impl RegistrationResult {
    pub fn num_attempts(&self) -> usize {
        self.attempts.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustPolicy {
    pub enabled: bool,
    pub minimal_level: usize,
    pub num_attempts: usize,
    pub fail_early: bool,
    pub max_voxel_neighborhood: i32,
    pub full_voxel_threshold: f64,
    pub threshold_relative_orientation: f64,
    pub threshold_ego_orientation: f64,
}

impl RobustPolicy {
    pub fn from_options(options: &OdometryOptions) -> RobustPolicy {
        RobustPolicy {
            enabled: options.robust_registration,
            minimal_level: options.robust_minimal_level,
            num_attempts: options.robust_num_attempts,
            fail_early: options.robust_fail_early,
            max_voxel_neighborhood: options.robust_max_voxel_neighborhood,
            full_voxel_threshold: options.robust_full_voxel_threshold,
            threshold_relative_orientation: options.robust_threshold_relative_orientation,
            threshold_ego_orientation: options.robust_threshold_ego_orientation,
        }
    }

    fn voxel_neighborhood(&self, base: i32, level: usize) -> i32 {
        if self.enabled {
            (base + level as i32).min(self.max_voxel_neighborhood)
        } else {
            base
        }
    }

    fn full_voxel_threshold(&self, level: usize) -> Option<f64> {
        self.enabled
            .then(|| self.full_voxel_threshold * 0.5_f64.powi(level as i32))
    }
}

/// Inputs of one frame's registration.
pub struct RegistrationInput<'a> {
    pub keypoints: &'a [TimedPoint],
    pub seed: FramePose,
    pub previous_end: Option<na::Isometry3<f64>>,
    pub map: &'a VoxelHashMap,
    pub strategy: &'a dyn NeighborhoodStrategy,
    pub regularizer: Option<&'a MotionRegularizer>,
}

/// Retries a failed attempt with a wider neighborhood search until it
/// succeeds or the attempt budget is spent.
pub struct RobustRegistration {
    policy: RobustPolicy,
    solver: Solver,
    base_voxel_neighborhood: i32,
    max_number_neighbors: usize,
    sink: Arc<dyn LogSink>,
}

impl RobustRegistration {
    pub fn new(
        policy: RobustPolicy,
        solver: Solver,
        base_voxel_neighborhood: i32,
        max_number_neighbors: usize,
        sink: Arc<dyn LogSink>,
    ) -> RobustRegistration {
        RobustRegistration {
            policy,
            solver,
            base_voxel_neighborhood,
            max_number_neighbors,
            sink,
        }
    }

    pub fn solver(&self) -> &Solver {
        &self.solver
    }

    fn classify(
        &self,
        summary: &SolverSummary,
        previous_end: Option<&na::Isometry3<f64>>,
        full_voxel_threshold: Option<f64>,
    ) -> (f64, f64, Option<AttemptFailure>) {
        let relative = previous_end
            .map(|previous| angular_distance_deg(&previous.rotation, &summary.poses.end.rotation))
            .unwrap_or(0.0);
        let ego = summary.poses.ego_orientation_deg();
        let failure = if relative > self.policy.threshold_relative_orientation {
            Some(AttemptFailure::RelativeOrientation(relative))
        } else if ego > self.policy.threshold_ego_orientation {
            Some(AttemptFailure::EgoOrientation(ego))
        } else {
            full_voxel_threshold
                .filter(|threshold| summary.valid_neighborhood_ratio < *threshold)
                .map(|_| AttemptFailure::SparseNeighborhood(summary.valid_neighborhood_ratio))
        };
        (relative, ego, failure)
    }

    pub fn run(&self, input: &RegistrationInput) -> RegistrationResult {
        let mut states = vec![RegistrationState::Init];
        let mut attempts = Vec::new();
        let mut level = if self.policy.enabled {
            self.policy.minimal_level
        } else {
            0
        };
        let max_attempts = if self.policy.enabled {
            self.policy.num_attempts.max(1)
        } else {
            1
        };
        // solved attempts, kept for the fallback estimate
        let mut best: Option<(f64, SolverSummary)> = None;

        loop {
            states.push(RegistrationState::Attempt);
            let voxel_neighborhood = self
                .policy
                .voxel_neighborhood(self.base_voxel_neighborhood, level);
            let full_voxel_threshold = self.policy.full_voxel_threshold(level);
            let ctx = SolverContext {
                map: input.map,
                strategy: input.strategy,
                search: SearchParams {
                    voxel_neighborhood,
                    max_number_neighbors: self.max_number_neighbors,
                },
                regularizer: input.regularizer,
            };

            let mut report = AttemptReport {
                level,
                voxel_neighborhood,
                full_voxel_threshold,
                failure: None,
                relative_orientation_deg: None,
                ego_orientation_deg: None,
                num_residuals: 0,
            };
            match self.solver.solve(input.keypoints, input.seed, &ctx) {
                Err(failure) => report.failure = Some(failure),
                Ok(summary) => {
                    let (relative, ego, failure) =
                        self.classify(&summary, input.previous_end.as_ref(), full_voxel_threshold);
                    report.relative_orientation_deg = Some(relative);
                    report.ego_orientation_deg = Some(ego);
                    report.num_residuals = summary.num_residuals();
                    report.failure = failure;
                    if failure.is_none() {
                        attempts.push(report);
                        states.push(RegistrationState::Converged);
                        return RegistrationResult {
                            outcome: RegistrationOutcome::Converged,
                            poses: summary.poses,
                            summary: Some(summary),
                            attempts,
                            states,
                        };
                    }
                    if best.as_ref().map_or(true, |(b, _)| relative < *b) {
                        best = Some((relative, summary));
                    }
                }
            }

            let failure = report.failure;
            attempts.push(report);
            if (self.policy.enabled && self.policy.fail_early) || attempts.len() >= max_attempts {
                states.push(RegistrationState::Aborted);
                if let Some(failure) = failure {
                    self.sink.log(
                        Level::Warn,
                        &format!(
                            "registration aborted after {} attempt(s): {}",
                            attempts.len(),
                            failure
                        ),
                    );
                }
                let (poses, summary) = match best {
                    Some((_, summary)) => (summary.poses, Some(summary)),
                    None => (input.seed, None),
                };
                return RegistrationResult {
                    outcome: RegistrationOutcome::Aborted,
                    poses,
                    summary,
                    attempts,
                    states,
                };
            }

            states.push(RegistrationState::Escalate);
            level += 1;
            self.sink.log(
                Level::Debug,
                &format!(
                    "attempt {} failed, escalating to level {}",
                    attempts.len(),
                    level
                ),
            );
        }
    }
}

/// Per-correspondence outputs of a registration, filled according to the
/// `output_*` toggles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationDiagnostics {
    pub num_correspondences: usize,
    pub normals: Option<Vec<na::Vector3<f64>>>,
    pub lines: Option<Vec<na::Vector3<f64>>>,
    pub weights: Option<Vec<f64>>,
    pub residuals: Option<Vec<f64>>,
    /// Linearity, planarity and scattering of each neighborhood.
    pub neighborhood_info: Option<Vec<[f64; 3]>>,
}

impl RegistrationDiagnostics {
    pub fn collect(
        options: &RegistrationOptions,
        solver: &Solver,
        keypoints: &[TimedPoint],
        summary: &SolverSummary,
    ) -> RegistrationDiagnostics {
        let correspondences = &summary.correspondences;
        let parametrization = solver.parametrization();
        let model = solver.residual_model();
        RegistrationDiagnostics {
            num_correspondences: correspondences.len(),
            normals: options
                .output_normals
                .then(|| correspondences.iter().filter_map(|c| c.normal).collect()),
            lines: options
                .output_lines
                .then(|| correspondences.iter().filter_map(|c| c.line).collect()),
            weights: options
                .output_weights
                .then(|| correspondences.iter().map(|c| c.weight).collect()),
            residuals: options.output_residuals.then(|| {
                correspondences
                    .iter()
                    .map(|c| {
                        let world_point =
                            parametrization.world_point(&summary.poses, &keypoints[c.index]);
                        model.signed_residual(c, &world_point)
                    })
                    .collect()
            }),
            neighborhood_info: options
                .output_neighborhood_info
                .then(|| correspondences.iter().filter_map(|c| c.scores).collect()),
        }
    }
}

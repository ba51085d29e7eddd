use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::Level;
use nalgebra as na;
use rayon::prelude::*;
use std::sync::Arc;

use crate::{
    config::{RegistrationOptions, SolverKind},
    error::{AttemptFailure, ConfigError},
    logging::LogSink,
    loss::RobustLoss,
    motion_model::MotionRegularizer,
    neighborhood::{NeighborhoodStrategy, SearchParams},
    parametrization::{FramePose, Hessian, Increment, Jacobian, Parametrization, NUM_PARAMS},
    point3d::TimedPoint,
    residual::{Correspondence, ResidualModel},
    voxel_hash_map::VoxelHashMap,
};

/// Relative cutoff of the pseudo-inverse; smaller singular values get no update.
const PSEUDO_INVERSE_EPS: f64 = 1e-10;
const LINEARIZATION_CHUNK: usize = 256;

/// What an attempt reads from the outside world.
#[derive(Clone, Copy)]
pub struct SolverContext<'a> {
    pub map: &'a VoxelHashMap,
    pub strategy: &'a dyn NeighborhoodStrategy,
    pub search: SearchParams,
    pub regularizer: Option<&'a MotionRegularizer>,
}

#[derive(Debug, Clone, Default)]
pub struct Association {
    pub correspondences: Vec<Correspondence>,
    /// Keypoints with at least `min_number_neighbors` neighbors.
    pub num_valid_neighborhoods: usize,
    pub num_keypoints: usize,
}

impl Association {
    pub fn valid_neighborhood_ratio(&self) -> f64 {
        if self.num_keypoints == 0 {
            0.0
        } else {
            self.num_valid_neighborhoods as f64 / self.num_keypoints as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub poses: FramePose,
    /// Correspondences of the last iteration.
    pub correspondences: Vec<Correspondence>,
    pub num_iterations: usize,
    pub converged: bool,
    pub valid_neighborhood_ratio: f64,
}

impl SolverSummary {
    pub fn num_residuals(&self) -> usize {
        self.correspondences.len()
    }
}

pub struct Solver {
    kind: SolverKind,
    num_iters_icp: usize,
    ls_max_num_iters: usize,
    threshold_orientation_norm: f64,
    threshold_translation_norm: f64,
    min_number_neighbors: usize,
    min_num_residuals: usize,
    max_num_residuals: Option<usize>,
    model: ResidualModel,
    loss: RobustLoss,
    parametrization: Parametrization,
    pool: rayon::ThreadPool,
    sink: Arc<dyn LogSink>,
}

/// Pseudo-inverse solution of `H dx = -g` over the parameters the system
/// actually involves. Untouched parameters get a zero update.
fn solve_normal_equations(hessian: &Hessian, gradient: &Increment) -> Increment {
    let active: Vec<usize> = (0..NUM_PARAMS).filter(|&i| hessian[(i, i)] != 0.0).collect();
    let mut dx = Increment::zeros();
    if active.is_empty() {
        return dx;
    }
    let n = active.len();
    let h = na::DMatrix::from_fn(n, n, |r, c| hessian[(active[r], active[c])]);
    let rhs = na::DVector::from_fn(n, |r, _| -gradient[active[r]]);
    let svd = h.svd(true, true);
    let eps = PSEUDO_INVERSE_EPS * svd.singular_values.max();
    if let Ok(solution) = svd.solve(&rhs, eps) {
        for (k, &i) in active.iter().enumerate() {
            dx[i] = solution[k];
        }
    }
    dx
}

impl Solver {
    pub fn new(
        options: &RegistrationOptions,
        parametrization: Parametrization,
        sink: Arc<dyn LogSink>,
    ) -> Result<Solver, ConfigError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.ls_num_threads)
            .build()?;
        Ok(Solver {
            kind: options.solver,
            num_iters_icp: options.num_iters_icp,
            ls_max_num_iters: options.ls_max_num_iters,
            threshold_orientation_norm: options.threshold_orientation_norm,
            threshold_translation_norm: options.threshold_translation_norm,
            min_number_neighbors: options.min_number_neighbors,
            min_num_residuals: options.min_num_residuals,
            max_num_residuals: options.max_num_residuals,
            model: ResidualModel::new(options),
            loss: RobustLoss::new(options),
            parametrization,
            pool,
            sink,
        })
    }

    pub fn parametrization(&self) -> Parametrization {
        self.parametrization
    }

    pub fn residual_model(&self) -> &ResidualModel {
        &self.model
    }

    /// Finds the correspondences of `keypoints` placed in the world by `poses`.
    pub fn associate(
        &self,
        keypoints: &[TimedPoint],
        poses: &FramePose,
        ctx: &SolverContext,
    ) -> Association {
        let gate_outliers = self.kind != SolverKind::Robust;
        let matches: Vec<(bool, Option<Correspondence>)> = keypoints
            .par_iter()
            .enumerate()
            .map(|(index, keypoint)| {
                let world_point = self.parametrization.world_point(poses, keypoint);
                let neighbors = ctx.strategy.search(ctx.map, &world_point, &ctx.search);
                if neighbors.len() < self.min_number_neighbors {
                    return (false, None);
                }
                let correspondence = self
                    .model
                    .build(index, &world_point, &neighbors)
                    .filter(|c| !(gate_outliers && self.model.is_outlier(c, &world_point)));
                (true, correspondence)
            })
            .collect();

        let num_valid_neighborhoods = matches.iter().filter(|(valid, _)| *valid).count();
        let mut correspondences: Vec<Correspondence> =
            matches.into_iter().filter_map(|(_, c)| c).collect();
        if self.kind == SolverKind::Robust {
            if let Some(max) = self.max_num_residuals {
                if correspondences.len() > max {
                    // most confident first, ties keep the keypoint order
                    correspondences.sort_by(|a, b| b.weight.total_cmp(&a.weight));
                    correspondences.truncate(max);
                    correspondences.sort_by_key(|c| c.index);
                }
            }
        }
        Association {
            correspondences,
            num_valid_neighborhoods,
            num_keypoints: keypoints.len(),
        }
    }

    /// Loss weight of each correspondence at `poses`.
    pub fn robust_weights(
        &self,
        keypoints: &[TimedPoint],
        correspondences: &[Correspondence],
        poses: &FramePose,
    ) -> Vec<f64> {
        correspondences
            .par_iter()
            .map(|c| {
                let world_point = self.parametrization.world_point(poses, &keypoints[c.index]);
                self.loss
                    .weight(self.model.geometric_residual(c, &world_point).norm())
            })
            .collect()
    }

    fn build_linear_system(
        &self,
        keypoints: &[TimedPoint],
        correspondences: &[Correspondence],
        poses: &FramePose,
        regularizer: Option<&MotionRegularizer>,
    ) -> (Hessian, Increment) {
        let robust = self.kind == SolverKind::Robust;
        let accumulate = |(h, g): (Hessian, Increment), c: &Correspondence| {
            let keypoint = &keypoints[c.index];
            let (residual, j_r) = self
                .model
                .evaluate(c, keypoint, &self.parametrization, poses);
            let w = if robust {
                let world_point = self.parametrization.world_point(poses, keypoint);
                self.loss
                    .weight(self.model.geometric_residual(c, &world_point).norm())
            } else {
                1.0
            };
            let j_tw = j_r.transpose() * w;
            (h + j_tw * j_r, g + j_tw * residual)
        };
        // fixed chunks summed in order keep the result independent of the scheduling
        let partials: Vec<(Hessian, Increment)> = correspondences
            .par_chunks(LINEARIZATION_CHUNK)
            .map(|chunk| {
                chunk
                    .iter()
                    .fold((Hessian::zeros(), Increment::zeros()), &accumulate)
            })
            .collect();
        let (mut hessian, mut gradient) = partials.into_iter().fold(
            (Hessian::zeros(), Increment::zeros()),
            |(h_a, g_a), (h_b, g_b)| (h_a + h_b, g_a + g_b),
        );
        if let (true, Some(regularizer)) = (self.parametrization.is_continuous(), regularizer) {
            regularizer.add_to(
                poses,
                correspondences.len() as f64,
                &mut hessian,
                &mut gradient,
            );
        }
        (hessian, gradient)
    }

    /// Runs the configured minimization from `initial`.
    pub fn solve(
        &self,
        keypoints: &[TimedPoint],
        initial: FramePose,
        ctx: &SolverContext,
    ) -> Result<SolverSummary, AttemptFailure> {
        self.pool.install(|| self.solve_in_pool(keypoints, initial, ctx))
    }

    fn solve_in_pool(
        &self,
        keypoints: &[TimedPoint],
        initial: FramePose,
        ctx: &SolverContext,
    ) -> Result<SolverSummary, AttemptFailure> {
        let mut poses = initial;
        let mut association = Association::default();
        let mut converged = false;
        let mut num_iterations = 0;

        for _ in 0..self.num_iters_icp {
            association = self.associate(keypoints, &poses, ctx);
            let found = match self.kind {
                // zero-weight residuals do not constrain the robust solve
                SolverKind::Robust => self
                    .robust_weights(keypoints, &association.correspondences, &poses)
                    .iter()
                    .filter(|w| **w > 0.0)
                    .count(),
                _ => association.correspondences.len(),
            };
            if found < self.min_num_residuals {
                return Err(AttemptFailure::NotEnoughResiduals {
                    found,
                    required: self.min_num_residuals,
                });
            }

            let updated = match self.kind {
                SolverKind::Gn => {
                    let (hessian, gradient) = self.build_linear_system(
                        keypoints,
                        &association.correspondences,
                        &poses,
                        ctx.regularizer,
                    );
                    let dx = solve_normal_equations(&hessian, &gradient);
                    self.parametrization.apply(&poses, &dx)
                }
                SolverKind::Robust => (0..self.ls_max_num_iters).fold(poses, |current, _| {
                    let (hessian, gradient) = self.build_linear_system(
                        keypoints,
                        &association.correspondences,
                        &current,
                        ctx.regularizer,
                    );
                    let dx = solve_normal_equations(&hessian, &gradient);
                    self.parametrization.apply(&current, &dx)
                }),
                SolverKind::ExternalNls => {
                    let problem = FixedCorrespondences::new(
                        self,
                        keypoints,
                        &association.correspondences,
                        ctx.regularizer,
                        poses,
                    );
                    let (problem, report) = LevenbergMarquardt::new()
                        .with_patience(self.ls_max_num_iters.max(1))
                        .minimize(problem);
                    if !report.termination.was_successful() {
                        self.sink.log(
                            Level::Debug,
                            &format!("levenberg-marquardt stopped: {:?}", report.termination),
                        );
                    }
                    problem.poses
                }
            };

            num_iterations += 1;
            let (rotation, translation) = self.parametrization.pose_change(&poses, &updated);
            poses = updated;
            if rotation < self.threshold_orientation_norm
                && translation < self.threshold_translation_norm
            {
                converged = true;
                break;
            }
        }

        if !converged {
            self.sink.log(
                Level::Debug,
                &format!(
                    "{:?} solver stopped after {} iterations without converging",
                    self.kind, num_iterations
                ),
            );
        }
        Ok(SolverSummary {
            poses,
            valid_neighborhood_ratio: association.valid_neighborhood_ratio(),
            correspondences: association.correspondences,
            num_iterations,
            converged,
        })
    }
}

/// Least-squares problem over the frame poses with the correspondences
/// frozen. Parameters are the leading entries of an increment from `origin`.
struct FixedCorrespondences<'a> {
    solver: &'a Solver,
    keypoints: &'a [TimedPoint],
    correspondences: &'a [Correspondence],
    regularizer: Option<&'a MotionRegularizer>,
    origin: FramePose,
    params: na::DVector<f64>,
    poses: FramePose,
}

impl<'a> FixedCorrespondences<'a> {
    fn new(
        solver: &'a Solver,
        keypoints: &'a [TimedPoint],
        correspondences: &'a [Correspondence],
        regularizer: Option<&'a MotionRegularizer>,
        origin: FramePose,
    ) -> Self {
        FixedCorrespondences {
            solver,
            keypoints,
            correspondences,
            regularizer,
            origin,
            params: na::DVector::zeros(solver.parametrization.num_params()),
            poses: origin,
        }
    }

    /// Residual blocks and their jacobians at the current poses, the motion
    /// prior last.
    fn blocks(&self) -> Vec<(na::Vector3<f64>, Jacobian)> {
        let solver = self.solver;
        let mut blocks: Vec<_> = self
            .correspondences
            .par_iter()
            .map(|c| {
                solver.model.evaluate(
                    c,
                    &self.keypoints[c.index],
                    &solver.parametrization,
                    &self.poses,
                )
            })
            .collect();
        if let (true, Some(regularizer)) = (solver.parametrization.is_continuous(), self.regularizer)
        {
            let scale = self.correspondences.len() as f64;
            blocks.extend(regularizer.terms(&self.poses, scale).iter().map(|term| {
                let sqrt_weight = term.weight.sqrt();
                (term.residual * sqrt_weight, term.jacobian() * sqrt_weight)
            }));
        }
        blocks
    }
}

impl LeastSquaresProblem<f64, na::Dyn, na::Dyn> for FixedCorrespondences<'_> {
    type ResidualStorage = na::storage::Owned<f64, na::Dyn>;
    type JacobianStorage = na::storage::Owned<f64, na::Dyn, na::Dyn>;
    type ParameterStorage = na::storage::Owned<f64, na::Dyn>;

    fn set_params(&mut self, x: &na::DVector<f64>) {
        self.params.clone_from(x);
        let mut dx = Increment::zeros();
        dx.rows_mut(0, x.len()).copy_from(x);
        self.poses = self.solver.parametrization.apply(&self.origin, &dx);
    }

    fn params(&self) -> na::DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<na::DVector<f64>> {
        let blocks = self.blocks();
        Some(na::DVector::from_iterator(
            3 * blocks.len(),
            blocks.iter().flat_map(|(residual, _)| residual.iter().copied()),
        ))
    }

    fn jacobian(&self) -> Option<na::DMatrix<f64>> {
        let blocks = self.blocks();
        let num_params = self.params.len();
        let mut jacobian = na::DMatrix::zeros(3 * blocks.len(), num_params);
        for (k, (_, block)) in blocks.iter().enumerate() {
            jacobian
                .view_mut((3 * k, 0), (3, num_params))
                .copy_from(&block.columns(0, num_params));
        }
        Some(jacobian)
    }
}

use log::Level;
use nalgebra as na;
use std::sync::Arc;

use crate::{
    config::{Initialization, MotionCompensation, OdometryOptions, Sampling},
    error::ConfigError,
    lie_group::{angular_distance_deg, transform_point},
    logging::{LogCrateSink, LogSink},
    motion_model::MotionModel,
    neighborhood::{build_strategy, NeighborhoodStrategy},
    parametrization::{FramePose, Parametrization},
    point3d::TimedPoint,
    registration::{
        RegistrationDiagnostics, RegistrationInput, RegistrationOutcome, RegistrationResult,
        RobustPolicy, RobustRegistration,
    },
    solver::Solver,
    voxel_hash_map::VoxelHashMap,
    voxel_util,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Nothing to register against, the seed was kept.
    Initial,
    Converged,
    /// Every attempt failed, the best available estimate was kept.
    Degraded,
}

/// Deviation of the registered end pose from the seed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameToMapError {
    pub translation: f64,
    pub orientation_deg: f64,
}

#[derive(Debug, Clone)]
pub struct FrameResult {
    pub frame_index: usize,
    pub poses: FramePose,
    pub status: FrameStatus,
    pub num_attempts: usize,
    pub num_keypoints: usize,
    /// `None` when the frame was not registered or had no correspondences.
    pub frame_to_map_error: Option<FrameToMapError>,
    pub inserted: bool,
    pub num_inserted_points: usize,
    pub diagnostics: RegistrationDiagnostics,
}

pub struct Odometry {
    options: OdometryOptions,
    parametrization: Parametrization,
    registration: RobustRegistration,
    strategy: Box<dyn NeighborhoodStrategy>,
    motion_model: MotionModel,
    map: VoxelHashMap,
    trajectory: Vec<FramePose>,
    sink: Arc<dyn LogSink>,
}

/// Moves raw points to the end of the frame under a constant-velocity motion.
fn deskew(frame: &mut [TimedPoint], poses: &FramePose) {
    let end_inverse = poses.end.inverse();
    for pt in frame.iter_mut() {
        pt.raw_point = transform_point(
            &(end_inverse * poses.interpolate(pt.alpha_timestamp)),
            &pt.raw_point,
        );
    }
}

impl Odometry {
    pub fn new(options: OdometryOptions) -> Result<Odometry, ConfigError> {
        Odometry::with_sink(options, Arc::new(LogCrateSink))
    }

    pub fn with_sink(
        options: OdometryOptions,
        sink: Arc<dyn LogSink>,
    ) -> Result<Odometry, ConfigError> {
        options.validate()?;
        let parametrization = Parametrization::from_options(&options);
        let solver = Solver::new(&options.registration, parametrization, sink.clone())?;
        let registration = RobustRegistration::new(
            RobustPolicy::from_options(&options),
            solver,
            options.map.voxel_neighborhood,
            options.registration.max_number_neighbors,
            sink.clone(),
        );
        Ok(Odometry {
            strategy: build_strategy(&options.neighborhood_strategy)?,
            motion_model: MotionModel::new(options.motion_model.clone(), sink.clone()),
            map: VoxelHashMap::new(&options.map, options.max_distance),
            parametrization,
            registration,
            trajectory: Vec::new(),
            options,
            sink,
        })
    }

    pub fn options(&self) -> &OdometryOptions {
        &self.options
    }

    pub fn map(&self) -> &VoxelHashMap {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut VoxelHashMap {
        &mut self.map
    }

    pub fn trajectory(&self) -> &[FramePose] {
        &self.trajectory
    }

    fn previous_end(&self) -> Option<na::Isometry3<f64>> {
        self.trajectory.last().map(|poses| poses.end)
    }

    /// Initial guess, before it is fitted to the parametrization.
    fn prediction(&self) -> FramePose {
        match self.options.initialization {
            Initialization::None => self
                .previous_end()
                .map(FramePose::rigid)
                .unwrap_or_default(),
            Initialization::ConstantVelocity => self.motion_model.predict(),
        }
    }

    fn seed(&self, prediction: &FramePose) -> FramePose {
        match self.parametrization {
            Parametrization::Rigid => FramePose::rigid(prediction.end),
            Parametrization::FixedBegin => FramePose::new(
                self.previous_end().unwrap_or_else(na::Isometry3::identity),
                prediction.end,
            ),
            Parametrization::Continuous { .. } => *prediction,
        }
    }

    fn sample_keypoints(&self, frame: &[TimedPoint], sample_voxel_size: f64) -> Vec<TimedPoint> {
        let max = self.options.max_num_keypoints;
        match self.options.sampling {
            Sampling::None => voxel_util::cap_points(frame.to_vec(), max),
            Sampling::Grid => {
                voxel_util::cap_points(voxel_util::voxel_downsample(frame, sample_voxel_size), max)
            }
            Sampling::Adaptive => voxel_util::adaptive_downsample(frame, sample_voxel_size, max),
        }
    }

    fn should_insert(
        &self,
        initial_frame: bool,
        map_was_empty: bool,
        error: Option<&FrameToMapError>,
    ) -> bool {
        if self.options.do_no_insert {
            return false;
        }
        if self.options.always_insert || initial_frame || map_was_empty {
            return true;
        }
        error.is_some_and(|e| {
            e.translation < self.options.distance_error_threshold
                && e.orientation_deg < self.options.orientation_error_threshold
        })
    }

    /// Registers one frame against the map, then updates the motion model,
    /// the map and the trajectory.
    pub fn register_frame(&mut self, frame: &[TimedPoint]) -> FrameResult {
        let frame_index = self.trajectory.len();
        let initial_frame = frame_index < self.options.init_num_frames;
        let (voxel_size, sample_voxel_size) = if initial_frame {
            (self.options.init_voxel_size, self.options.init_sample_voxel_size)
        } else {
            (self.options.voxel_size, self.options.sample_voxel_size)
        };

        let prediction = self.prediction();
        let seed = self.seed(&prediction);

        let mut frame = voxel_util::voxel_downsample(frame, voxel_size);
        if self.options.motion_compensation == MotionCompensation::ConstantVelocity {
            deskew(&mut frame, &prediction);
        }
        let keypoints = self.sample_keypoints(&frame, sample_voxel_size);

        let map_was_empty = self.map.is_empty();
        let registration: Option<RegistrationResult> = if map_was_empty {
            None
        } else {
            let regularizer = self.motion_model.regularizer();
            let input = RegistrationInput {
                keypoints: &keypoints,
                seed,
                previous_end: self.previous_end(),
                map: &self.map,
                strategy: self.strategy.as_ref(),
                regularizer: regularizer.as_ref(),
            };
            Some(self.registration.run(&input))
        };

        let (poses, status, num_attempts) = match &registration {
            None => (seed, FrameStatus::Initial, 0),
            Some(result) => (
                result.poses,
                match result.outcome {
                    RegistrationOutcome::Converged => FrameStatus::Converged,
                    RegistrationOutcome::Aborted => FrameStatus::Degraded,
                },
                result.num_attempts(),
            ),
        };
        let summary = registration.as_ref().and_then(|r| r.summary.as_ref());
        let frame_to_map_error = summary
            .filter(|s| s.num_residuals() > 0)
            .map(|s| FrameToMapError {
                translation: (s.poses.end.translation.vector - seed.end.translation.vector).norm(),
                orientation_deg: angular_distance_deg(&s.poses.end.rotation, &seed.end.rotation),
            });
        let diagnostics = summary
            .map(|s| {
                RegistrationDiagnostics::collect(
                    &self.options.registration,
                    self.registration.solver(),
                    &keypoints,
                    s,
                )
            })
            .unwrap_or_default();

        self.motion_model.update(poses);
        self.trajectory.push(poses);

        let inserted =
            self.should_insert(initial_frame, map_was_empty, frame_to_map_error.as_ref());
        let num_inserted_points = if inserted {
            self.parametrization.transform_frame(&poses, &mut frame);
            let world_points: Vec<na::Vector3<f64>> = frame.iter().map(|pt| pt.point).collect();
            self.map.add_points(&world_points)
        } else {
            0
        };
        self.map.remove_points_too_far(&poses.end.translation.vector);

        let level = if status == FrameStatus::Degraded {
            Level::Warn
        } else {
            Level::Debug
        };
        self.sink.log(
            level,
            &format!(
                "frame {}: {:?} after {} attempt(s), {} keypoints, {} points inserted, map of {} points",
                frame_index,
                status,
                num_attempts,
                keypoints.len(),
                num_inserted_points,
                self.map.map_len()
            ),
        );

        FrameResult {
            frame_index,
            poses,
            status,
            num_attempts,
            num_keypoints: keypoints.len(),
            frame_to_map_error,
            inserted,
            num_inserted_points,
            diagnostics,
        }
    }
}

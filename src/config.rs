use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistanceMetric {
    #[default]
    PointToPlane,
    PointToLine,
    PointToPoint,
    PointToDistribution,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParametrizationKind {
    Simple,
    #[default]
    ContinuousTime,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolverKind {
    #[default]
    Gn,
    #[serde(alias = "CERES")]
    ExternalNls,
    Robust,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LossFunction {
    #[default]
    Standard,
    Cauchy,
    Huber,
    Tolerant,
    Truncated,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sampling {
    None,
    #[default]
    Grid,
    Adaptive,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Initialization {
    #[serde(alias = "INIT_NONE")]
    None,
    #[default]
    #[serde(alias = "INIT_CONSTANT_VELOCITY")]
    ConstantVelocity,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MotionCompensation {
    None,
    ConstantVelocity,
    Iterative,
    #[default]
    Continuous,
}

/// Which neighborhood strategy the odometry builds, see [`crate::neighborhood`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NeighborhoodStrategyOptions {
    #[default]
    DefaultNearestNeighbor,
    DistanceBased {
        radius: f64,
    },
}

/// Parses an enum tag the way the options loader does, so that command line
/// overrides and documents reject the same strings.
pub fn parse_tag<T: DeserializeOwned>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(value.to_owned())).map_err(|_| {
        ConfigError::UnknownVariant {
            field,
            value: value.to_owned(),
        }
    })
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RegistrationOptions {
    pub distance: DistanceMetric,
    pub parametrization: ParametrizationKind,
    pub solver: SolverKind,
    pub loss_function: LossFunction,

    // iteration budget
    pub num_iters_icp: usize,
    pub ls_max_num_iters: usize,
    pub ls_num_threads: usize,

    // convergence
    pub threshold_orientation_norm: f64,
    pub threshold_translation_norm: f64,

    // neighborhood gating
    pub threshold_linearity: f64,
    pub threshold_planarity: f64,
    pub outlier_distance: f64,
    pub min_number_neighbors: usize,
    pub max_number_neighbors: usize,
    pub num_closest_neighbors: usize,

    // robust solver
    pub ls_sigma: f64,
    pub ls_tolerant_min_threshold: f64,
    pub min_num_residuals: usize,
    pub max_num_residuals: Option<usize>,

    // weighting
    pub power_planarity: f64,
    pub weight_alpha: f64,
    pub weight_neighborhood: f64,
    pub weight_point_to_point: f64,

    pub point_to_plane_with_distortion: bool,
    pub use_barycenter: bool,

    // diagnostics
    pub output_normals: bool,
    pub output_lines: bool,
    pub output_weights: bool,
    pub output_residuals: bool,
    pub output_neighborhood_info: bool,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        RegistrationOptions {
            distance: DistanceMetric::PointToPlane,
            parametrization: ParametrizationKind::ContinuousTime,
            solver: SolverKind::Gn,
            loss_function: LossFunction::Standard,

            num_iters_icp: 10,
            ls_max_num_iters: 1,
            ls_num_threads: 4,

            threshold_orientation_norm: 0.0001,
            threshold_translation_norm: 0.001,

            threshold_linearity: 0.8,
            threshold_planarity: 0.3,
            outlier_distance: 0.5,
            min_number_neighbors: 20,
            max_number_neighbors: 20,
            num_closest_neighbors: 20,

            ls_sigma: 0.1,
            ls_tolerant_min_threshold: 0.05,
            min_num_residuals: 100,
            max_num_residuals: None,

            power_planarity: 2.0,
            weight_alpha: 0.9,
            weight_neighborhood: 0.1,
            weight_point_to_point: 0.1,

            point_to_plane_with_distortion: true,
            use_barycenter: false,

            output_normals: false,
            output_lines: false,
            output_weights: false,
            output_residuals: false,
            output_neighborhood_info: false,
        }
    }
}

impl RegistrationOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_number_neighbors > self.max_number_neighbors {
            return Err(ConfigError::NeighborBounds {
                min: self.min_number_neighbors,
                max: self.max_number_neighbors,
            });
        }
        if let Some(max) = self.max_num_residuals {
            if self.min_num_residuals > max {
                return Err(ConfigError::ResidualBounds {
                    min: self.min_num_residuals,
                    max,
                });
            }
        }
        // the flag only exists for continuous-time registration
        if self.parametrization == ParametrizationKind::ContinuousTime
            && self.point_to_plane_with_distortion
            && self.distance != DistanceMetric::PointToPlane
        {
            return Err(ConfigError::DistortionUnsupported(self.distance));
        }
        positive("min_number_neighbors", self.min_number_neighbors as f64)?;
        positive("num_iters_icp", self.num_iters_icp as f64)?;
        positive("ls_max_num_iters", self.ls_max_num_iters as f64)?;
        positive("ls_num_threads", self.ls_num_threads as f64)?;
        positive("outlier_distance", self.outlier_distance)?;
        positive("ls_sigma", self.ls_sigma)?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MapOptions {
    pub size_voxel_map: f64,
    pub max_num_points_in_voxel: usize,
    pub min_distance_points: f64,
    pub voxel_neighborhood: i32,
}

impl Default for MapOptions {
    fn default() -> Self {
        MapOptions {
            size_voxel_map: 1.0,
            max_num_points_in_voxel: 20,
            min_distance_points: 0.1,
            voxel_neighborhood: 1,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MotionModelOptions {
    pub beta_location_consistency: f64,
    pub beta_small_velocity: f64,
    pub beta_orientation_consistency: f64,
    pub beta_constant_velocity: f64,

    /// Largest rotation (degrees) a prediction may add to the last confirmed pose.
    pub threshold_orientation_deg: f64,
    /// Largest translation a prediction may add to the last confirmed pose.
    pub threshold_translation_diff: f64,
    pub log_if_invalid: bool,
}

impl Default for MotionModelOptions {
    fn default() -> Self {
        MotionModelOptions {
            beta_location_consistency: 0.001,
            beta_small_velocity: 0.0,
            beta_orientation_consistency: 0.0,
            beta_constant_velocity: 0.001,
            threshold_orientation_deg: 20.0,
            threshold_translation_diff: 2.0,
            log_if_invalid: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OdometryOptions {
    pub registration: RegistrationOptions,

    // frame params
    pub voxel_size: f64,
    pub max_distance: f64,
    pub distance_error_threshold: f64,
    pub orientation_error_threshold: f64,

    pub map: MapOptions,
    pub neighborhood_strategy: NeighborhoodStrategyOptions,

    // sampling
    pub sampling: Sampling,
    pub max_num_keypoints: usize,
    pub sample_voxel_size: f64,

    pub initialization: Initialization,
    pub motion_compensation: MotionCompensation,

    // first frames of the sequence
    pub init_num_frames: usize,
    pub init_voxel_size: f64,
    pub init_sample_voxel_size: f64,

    // map insertion
    pub do_no_insert: bool,
    pub always_insert: bool,

    // robust registration
    pub robust_registration: bool,
    pub robust_minimal_level: usize,
    pub robust_num_attempts: usize,
    pub robust_fail_early: bool,
    pub robust_max_voxel_neighborhood: i32,
    pub robust_full_voxel_threshold: f64,
    pub robust_threshold_relative_orientation: f64,
    pub robust_threshold_ego_orientation: f64,

    pub motion_model: MotionModelOptions,
}

impl Default for OdometryOptions {
    fn default() -> Self {
        OdometryOptions {
            registration: RegistrationOptions::default(),

            voxel_size: 0.5,
            max_distance: 100.0,
            distance_error_threshold: 5.0,
            orientation_error_threshold: 30.0,

            map: MapOptions::default(),
            neighborhood_strategy: NeighborhoodStrategyOptions::default(),

            sampling: Sampling::Grid,
            max_num_keypoints: 10_000,
            sample_voxel_size: 1.5,

            initialization: Initialization::ConstantVelocity,
            motion_compensation: MotionCompensation::Continuous,

            init_num_frames: 20,
            init_voxel_size: 0.2,
            init_sample_voxel_size: 1.0,

            do_no_insert: false,
            always_insert: false,

            robust_registration: false,
            robust_minimal_level: 0,
            robust_num_attempts: 6,
            robust_fail_early: false,
            robust_max_voxel_neighborhood: 4,
            robust_full_voxel_threshold: 0.7,
            robust_threshold_relative_orientation: 10.0,
            robust_threshold_ego_orientation: 5.0,

            motion_model: MotionModelOptions::default(),
        }
    }
}

impl OdometryOptions {
    /// Options for a rigid, single-pose registration without motion compensation.
    pub fn rigid() -> Self {
        let mut options = OdometryOptions::default();
        options.registration.parametrization = ParametrizationKind::Simple;
        options.motion_compensation = MotionCompensation::None;
        options
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registration.validate()?;
        let continuous_time =
            self.registration.parametrization == ParametrizationKind::ContinuousTime;
        let continuous_compensation = self.motion_compensation == MotionCompensation::Continuous;
        if continuous_time != continuous_compensation {
            return Err(ConfigError::IncompatibleCompensation {
                compensation: self.motion_compensation,
                parametrization: self.registration.parametrization,
            });
        }
        positive("voxel_size", self.voxel_size)?;
        positive("sample_voxel_size", self.sample_voxel_size)?;
        positive("init_voxel_size", self.init_voxel_size)?;
        positive("init_sample_voxel_size", self.init_sample_voxel_size)?;
        positive("max_distance", self.max_distance)?;
        positive("max_num_keypoints", self.max_num_keypoints as f64)?;
        positive("robust_num_attempts", self.robust_num_attempts as f64)?;
        positive("size_voxel_map", self.map.size_voxel_map)?;
        positive("max_num_points_in_voxel", self.map.max_num_points_in_voxel as f64)?;
        if let NeighborhoodStrategyOptions::DistanceBased { radius } = self.neighborhood_strategy {
            positive("radius", radius)?;
        }
        Ok(())
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

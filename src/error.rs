use thiserror::Error;

/// Errors raised once, while options are validated or components are built.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("`{field}`: `{value}` is not a recognised variant")]
    UnknownVariant { field: &'static str, value: String },

    #[error("min_number_neighbors ({min}) must not exceed max_number_neighbors ({max})")]
    NeighborBounds { min: usize, max: usize },

    #[error("min_num_residuals ({min}) must not exceed max_num_residuals ({max})")]
    ResidualBounds { min: usize, max: usize },

    #[error("point_to_plane_with_distortion requires POINT_TO_PLANE, got {0:?}")]
    DistortionUnsupported(crate::config::DistanceMetric),

    #[error("motion compensation {compensation:?} is incompatible with parametrization {parametrization:?}")]
    IncompatibleCompensation {
        compensation: crate::config::MotionCompensation,
        parametrization: crate::config::ParametrizationKind,
    },

    #[error("`{field}` must be strictly positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("failed to build the solver thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Errors of the file helpers in [`crate::io`].
#[derive(Error, Debug)]
pub enum IoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid options document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pcd file: {0}")]
    Pcd(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Reasons a single registration attempt is rejected. Consumed by the robust
/// loop, never surfaced as a hard error.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum AttemptFailure {
    #[error("{found} residuals, at least {required} required")]
    NotEnoughResiduals { found: usize, required: usize },

    #[error("relative orientation of {0:.2} deg exceeds the threshold")]
    RelativeOrientation(f64),

    #[error("ego orientation of {0:.2} deg exceeds the threshold")]
    EgoOrientation(f64),

    #[error("only {0:.2} of the keypoints have a full neighborhood")]
    SparseNeighborhood(f64),
}

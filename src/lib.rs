pub mod config;
pub mod error;
pub mod io;
pub mod lie_group;
pub mod logging;
pub mod loss;
pub mod motion_model;
pub mod neighborhood;
pub mod odometry;
pub mod parametrization;
pub mod point3d;
pub mod registration;
pub mod residual;
pub mod solver;
pub mod voxel_hash_map;
pub mod voxel_util;

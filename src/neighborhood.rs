use nalgebra as na;

use crate::{
    config::NeighborhoodStrategyOptions,
    error::ConfigError,
    voxel_hash_map::{Neighbor, VoxelHashMap},
};

/// Per-query search bounds, escalated by the robust registration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
    pub voxel_neighborhood: i32,
    pub max_number_neighbors: usize,
}

pub trait NeighborhoodStrategy: Send + Sync + std::fmt::Debug {
    fn type_name(&self) -> &'static str;

    /// Candidate neighbors of `query`, nearest first.
    fn search(&self, map: &VoxelHashMap, query: &na::Vector3<f64>, params: &SearchParams)
        -> Vec<Neighbor>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNearestNeighborStrategy;

impl NeighborhoodStrategy for DefaultNearestNeighborStrategy {
    fn type_name(&self) -> &'static str {
        "DEFAULT_NEAREST_NEIGHBOR"
    }

    fn search(
        &self,
        map: &VoxelHashMap,
        query: &na::Vector3<f64>,
        params: &SearchParams,
    ) -> Vec<Neighbor> {
        map.search_neighbors(query, params.voxel_neighborhood, params.max_number_neighbors)
    }
}

/// Nearest neighbors, dropping everything farther than `radius`.
#[derive(Debug, Clone, Copy)]
pub struct DistanceBasedStrategy {
    pub radius: f64,
}

impl NeighborhoodStrategy for DistanceBasedStrategy {
    fn type_name(&self) -> &'static str {
        "DISTANCE_BASED"
    }

    fn search(
        &self,
        map: &VoxelHashMap,
        query: &na::Vector3<f64>,
        params: &SearchParams,
    ) -> Vec<Neighbor> {
        let mut neighbors =
            map.search_neighbors(query, params.voxel_neighborhood, params.max_number_neighbors);
        // sorted, so the first neighbor outside the radius ends the list
        let inside = neighbors.partition_point(|n| n.distance <= self.radius);
        neighbors.truncate(inside);
        neighbors
    }
}

type StrategyFactory = fn(&NeighborhoodStrategyOptions) -> Box<dyn NeighborhoodStrategy>;

fn default_nearest_neighbor(_: &NeighborhoodStrategyOptions) -> Box<dyn NeighborhoodStrategy> {
    Box::new(DefaultNearestNeighborStrategy)
}

fn distance_based(options: &NeighborhoodStrategyOptions) -> Box<dyn NeighborhoodStrategy> {
    match options {
        NeighborhoodStrategyOptions::DistanceBased { radius } => {
            Box::new(DistanceBasedStrategy { radius: *radius })
        }
        NeighborhoodStrategyOptions::DefaultNearestNeighbor => Box::new(DefaultNearestNeighborStrategy),
    }
}

const REGISTRY: &[(&str, StrategyFactory)] = &[
    ("DEFAULT_NEAREST_NEIGHBOR", default_nearest_neighbor),
    ("DISTANCE_BASED", distance_based),
];

pub fn type_name(options: &NeighborhoodStrategyOptions) -> &'static str {
    match options {
        NeighborhoodStrategyOptions::DefaultNearestNeighbor => "DEFAULT_NEAREST_NEIGHBOR",
        NeighborhoodStrategyOptions::DistanceBased { .. } => "DISTANCE_BASED",
    }
}

/// Looks the strategy up by type name and builds it from `options`.
pub fn build_strategy(
    options: &NeighborhoodStrategyOptions,
) -> Result<Box<dyn NeighborhoodStrategy>, ConfigError> {
    let name = type_name(options);
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, factory)| factory(options))
        .ok_or(ConfigError::UnknownVariant {
            field: "neighborhood_strategy",
            value: name.to_owned(),
        })
}

pub fn registered_strategies() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

/// Principal-component description of a set of neighbors.
///
/// `a1d`, `a2d`, `a3d` are the linearity, planarity and scattering scores
/// computed from the square roots of the covariance eigenvalues.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborhoodDescriptor {
    pub barycenter: na::Vector3<f64>,
    pub covariance: na::Matrix3<f64>,
    pub normal: na::Vector3<f64>,
    pub line_direction: na::Vector3<f64>,
    pub eigenvalues: na::Vector3<f64>,
    pub eigenvectors: na::Matrix3<f64>,
    pub a1d: f64,
    pub a2d: f64,
    pub a3d: f64,
}

impl NeighborhoodDescriptor {
    /// `None` for fewer than two points or a collapsed neighborhood.
    pub fn compute(points: &[na::Vector3<f64>]) -> Option<NeighborhoodDescriptor> {
        if points.len() < 2 {
            return None;
        }
        let n = points.len() as f64;
        let barycenter = points.iter().sum::<na::Vector3<f64>>() / n;
        let covariance = points
            .iter()
            .map(|p| {
                let d = p - barycenter;
                d * d.transpose()
            })
            .sum::<na::Matrix3<f64>>()
            / n;

        let eigen = covariance.symmetric_eigen();
        // ascending order
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));
        let eigenvalues = na::Vector3::from_fn(|i, _| eigen.eigenvalues[order[i]].max(0.0));
        let eigenvectors =
            na::Matrix3::from_columns(&order.map(|i| eigen.eigenvectors.column(i).into_owned()));

        let sigma_1 = eigenvalues[2].sqrt();
        let sigma_2 = eigenvalues[1].sqrt();
        let sigma_3 = eigenvalues[0].sqrt();
        if sigma_1 <= f64::EPSILON {
            return None;
        }
        Some(NeighborhoodDescriptor {
            barycenter,
            covariance,
            normal: eigenvectors.column(0).normalize(),
            line_direction: eigenvectors.column(2).normalize(),
            eigenvalues,
            eigenvectors,
            a1d: (sigma_1 - sigma_2) / sigma_1,
            a2d: (sigma_2 - sigma_3) / sigma_1,
            a3d: sigma_3 / sigma_1,
        })
    }
}

use nalgebra as na;

use crate::{
    config::{DistanceMetric, RegistrationOptions},
    neighborhood::NeighborhoodDescriptor,
    parametrization::{FramePose, Jacobian, Parametrization},
    point3d::TimedPoint,
    voxel_hash_map::Neighbor,
};

/// Smallest covariance eigenvalue kept by the distribution metric, relative to the largest.
const DISTRIBUTION_EIGENVALUE_RATIO: f64 = 1e-3;
const DISTRIBUTION_MIN_EIGENVALUE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Index of the keypoint in the frame being registered.
    pub index: usize,
    pub reference: na::Vector3<f64>,
    pub projection: na::Matrix3<f64>,
    /// Confidence of the neighborhood, scales the residual.
    pub weight: f64,
    pub normal: Option<na::Vector3<f64>>,
    pub line: Option<na::Vector3<f64>>,
    /// Linearity, planarity and scattering of the neighborhood.
    pub scores: Option<[f64; 3]>,
}

/// Residuals `r = w * A * (p - q)`: `A` is `n n^T` for planes, `I - d d^T`
/// for lines, `I` for points and the inverse covariance root for distributions.
#[derive(Debug, Clone)]
pub struct ResidualModel {
    metric: DistanceMetric,
    threshold_planarity: f64,
    threshold_linearity: f64,
    power_planarity: f64,
    weight_alpha: f64,
    weight_neighborhood: f64,
    weight_point_to_point: f64,
    outlier_distance: f64,
    min_number_neighbors: usize,
    num_closest_neighbors: usize,
    use_barycenter: bool,
}

impl ResidualModel {
    pub fn new(options: &RegistrationOptions) -> ResidualModel {
        ResidualModel {
            metric: options.distance,
            threshold_planarity: options.threshold_planarity,
            threshold_linearity: options.threshold_linearity,
            power_planarity: options.power_planarity,
            weight_alpha: options.weight_alpha,
            weight_neighborhood: options.weight_neighborhood,
            weight_point_to_point: options.weight_point_to_point,
            outlier_distance: options.outlier_distance,
            min_number_neighbors: options.min_number_neighbors,
            num_closest_neighbors: options.num_closest_neighbors,
            use_barycenter: options.use_barycenter,
        }
    }

    fn neighborhood_weight(&self, score: f64, world_point: &na::Vector3<f64>, closest: &Neighbor) -> f64 {
        let scale = self.outlier_distance * self.min_number_neighbors as f64;
        self.weight_alpha * score.powf(self.power_planarity)
            + self.weight_neighborhood * (-(closest.point - world_point).norm() / scale).exp()
    }

    /// Fits the metric to `neighbors` (nearest first). `None` when the
    /// neighborhood is degenerate or fails the planarity/linearity gate.
    pub fn build(
        &self,
        index: usize,
        world_point: &na::Vector3<f64>,
        neighbors: &[Neighbor],
    ) -> Option<Correspondence> {
        let closest = neighbors.first()?;
        let positions: Vec<na::Vector3<f64>> = neighbors.iter().map(|n| n.point).collect();
        match self.metric {
            DistanceMetric::PointToPlane => {
                let descriptor = NeighborhoodDescriptor::compute(&positions)?;
                if descriptor.a2d < self.threshold_planarity {
                    return None;
                }
                let normal = descriptor.normal;
                Some(Correspondence {
                    index,
                    reference: if self.use_barycenter {
                        descriptor.barycenter
                    } else {
                        closest.point
                    },
                    projection: normal * normal.transpose(),
                    weight: self.neighborhood_weight(descriptor.a2d, world_point, closest),
                    normal: Some(normal),
                    line: None,
                    scores: Some([descriptor.a1d, descriptor.a2d, descriptor.a3d]),
                })
            }
            DistanceMetric::PointToLine => {
                let descriptor = NeighborhoodDescriptor::compute(&positions)?;
                if descriptor.a1d < self.threshold_linearity {
                    return None;
                }
                let direction = descriptor.line_direction;
                Some(Correspondence {
                    index,
                    reference: descriptor.barycenter,
                    projection: na::Matrix3::identity() - direction * direction.transpose(),
                    weight: self.neighborhood_weight(descriptor.a1d, world_point, closest),
                    normal: None,
                    line: Some(direction),
                    scores: Some([descriptor.a1d, descriptor.a2d, descriptor.a3d]),
                })
            }
            DistanceMetric::PointToPoint => Some(Correspondence {
                index,
                reference: closest.point,
                projection: na::Matrix3::identity(),
                weight: self.weight_point_to_point,
                normal: None,
                line: None,
                scores: None,
            }),
            DistanceMetric::PointToDistribution => {
                let count = self.num_closest_neighbors.min(positions.len());
                let descriptor = NeighborhoodDescriptor::compute(&positions[..count])?;
                let largest = descriptor.eigenvalues[2];
                let floor = (largest * DISTRIBUTION_EIGENVALUE_RATIO).max(DISTRIBUTION_MIN_EIGENVALUE);
                let inv_sqrt = descriptor.eigenvalues.map(|l| 1.0 / l.max(floor).sqrt());
                let whitening = na::Matrix3::from_diagonal(&inv_sqrt) * descriptor.eigenvectors.transpose();
                Some(Correspondence {
                    index,
                    reference: descriptor.barycenter,
                    projection: whitening,
                    weight: 1.0,
                    normal: None,
                    line: None,
                    scores: Some([descriptor.a1d, descriptor.a2d, descriptor.a3d]),
                })
            }
        }
    }

    /// Unweighted residual vector `A (p - q)`.
    pub fn geometric_residual(
        &self,
        correspondence: &Correspondence,
        world_point: &na::Vector3<f64>,
    ) -> na::Vector3<f64> {
        correspondence.projection * (world_point - correspondence.reference)
    }

    /// Residual reported in the diagnostics: signed distance for the plane
    /// metric, norm of the geometric residual otherwise.
    pub fn signed_residual(&self, correspondence: &Correspondence, world_point: &na::Vector3<f64>) -> f64 {
        match (self.metric, correspondence.normal) {
            (DistanceMetric::PointToPlane, Some(normal)) => {
                normal.dot(&(world_point - correspondence.reference))
            }
            _ => self.geometric_residual(correspondence, world_point).norm(),
        }
    }

    pub fn is_outlier(&self, correspondence: &Correspondence, world_point: &na::Vector3<f64>) -> bool {
        self.geometric_residual(correspondence, world_point).norm() > self.outlier_distance
    }

    /// Weighted residual and its jacobian with respect to the pose increment.
    pub fn evaluate(
        &self,
        correspondence: &Correspondence,
        keypoint: &TimedPoint,
        parametrization: &Parametrization,
        poses: &FramePose,
    ) -> (na::Vector3<f64>, Jacobian) {
        let world_point = parametrization.world_point(poses, keypoint);
        let scaled = correspondence.projection * correspondence.weight;
        let residual = scaled * (world_point - correspondence.reference);
        let jacobian = scaled * parametrization.jacobian(poses, keypoint);
        (residual, jacobian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn neighbors_of(points: &[na::Vector3<f64>], query: &na::Vector3<f64>) -> Vec<Neighbor> {
        let mut neighbors: Vec<_> = points
            .iter()
            .map(|p| Neighbor {
                point: *p,
                distance: (p - query).norm(),
            })
            .collect();
        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        neighbors
    }

    fn plane_points() -> Vec<na::Vector3<f64>> {
        (0..5)
            .flat_map(|i| (0..5).map(move |j| (i, j)))
            .map(|(i, j)| na::Vector3::new(i as f64 * 0.2, j as f64 * 0.2, 1.0))
            .collect()
    }

    fn model(distance: DistanceMetric) -> ResidualModel {
        let options = RegistrationOptions {
            distance,
            ..RegistrationOptions::default()
        };
        ResidualModel::new(&options)
    }

    #[test]
    fn point_to_plane_is_the_normal_distance() {
        let query = na::Vector3::new(0.41, 0.39, 1.3);
        let neighbors = neighbors_of(&plane_points(), &query);
        let model = model(DistanceMetric::PointToPlane);
        let correspondence = model.build(0, &query, &neighbors).unwrap();
        assert_relative_eq!(model.geometric_residual(&correspondence, &query).norm(), 0.3, epsilon = 1e-9);
        assert_relative_eq!(model.signed_residual(&correspondence, &query).abs(), 0.3, epsilon = 1e-9);
        assert!(correspondence.weight > 0.9);
        assert!(!model.is_outlier(&correspondence, &query));
        assert!(model.is_outlier(&correspondence, &na::Vector3::new(0.4, 0.4, 2.0)));
    }

    #[test]
    fn planarity_gate_rejects_lines() {
        let line: Vec<_> = (0..10).map(|i| na::Vector3::new(i as f64 * 0.1, 0.0, 0.0)).collect();
        let query = na::Vector3::new(0.45, 0.1, 0.0);
        let neighbors = neighbors_of(&line, &query);
        assert!(model(DistanceMetric::PointToPlane).build(0, &query, &neighbors).is_none());

        let line_model = model(DistanceMetric::PointToLine);
        let correspondence = line_model.build(0, &query, &neighbors).unwrap();
        assert_relative_eq!(
            line_model.geometric_residual(&correspondence, &query).norm(),
            0.1,
            epsilon = 1e-9
        );
    }

    #[test]
    fn point_to_point_uses_the_closest_neighbor() {
        let query = na::Vector3::new(0.21, 0.0, 1.0);
        let neighbors = neighbors_of(&plane_points(), &query);
        let model = model(DistanceMetric::PointToPoint);
        let correspondence = model.build(3, &query, &neighbors).unwrap();
        assert_eq!(correspondence.index, 3);
        assert_relative_eq!(correspondence.reference, na::Vector3::new(0.2, 0.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(correspondence.weight, 0.1);
    }

    #[test]
    fn distribution_residual_is_mahalanobis() {
        let points: Vec<_> = (0..4)
            .flat_map(|i| (0..4).flat_map(move |j| (0..4).map(move |k| (i, j, k))))
            .map(|(i, j, k)| na::Vector3::new(i as f64, j as f64 * 0.5, k as f64 * 0.25))
            .collect();
        let query = na::Vector3::new(1.5, 0.75, 0.375 + 0.5);
        let neighbors = neighbors_of(&points, &query);
        let options = RegistrationOptions {
            distance: DistanceMetric::PointToDistribution,
            num_closest_neighbors: 64,
            max_number_neighbors: 64,
            ..RegistrationOptions::default()
        };
        let model = ResidualModel::new(&options);
        let correspondence = model.build(0, &query, &neighbors).unwrap();
        let residual = model.geometric_residual(&correspondence, &query);
        let covariance = NeighborhoodDescriptor::compute(&points).unwrap().covariance;
        let d = query - correspondence.reference;
        let mahalanobis = (d.transpose() * covariance.try_inverse().unwrap() * d)[(0, 0)];
        assert_relative_eq!(residual.norm_squared(), mahalanobis, epsilon = 1e-6);
    }

    #[test]
    fn evaluation_scales_by_the_weight() {
        let query = na::Vector3::new(0.41, 0.39, 1.3);
        let neighbors = neighbors_of(&plane_points(), &query);
        let model = model(DistanceMetric::PointToPlane);
        let correspondence = model.build(0, &query, &neighbors).unwrap();
        let keypoint = TimedPoint::new(query, 0.0);
        let (residual, jacobian) = model.evaluate(
            &correspondence,
            &keypoint,
            &Parametrization::Rigid,
            &FramePose::default(),
        );
        assert_relative_eq!(residual.norm(), 0.3 * correspondence.weight, epsilon = 1e-9);
        // translation along the normal moves the residual one for one
        assert_relative_eq!(
            jacobian.fixed_view::<3, 3>(0, 0).into_owned(),
            correspondence.projection * correspondence.weight,
            epsilon = 1e-12
        );
    }
}

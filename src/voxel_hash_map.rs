use nalgebra as na;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::collections::HashMap;

use crate::{config::MapOptions, voxel_util::na_vec_to_voxel};

pub type Voxel = na::Vector3<i32>;
type VoxelPoints = Vec<na::Vector3<f64>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub point: na::Vector3<f64>,
    pub distance: f64,
}

/// Sparse voxel map of world points.
///
/// Each voxel keeps at most `max_points_per_voxel` points, no two of them
/// closer than `min_distance_points`.
#[derive(Debug, Clone)]
pub struct VoxelHashMap {
    voxel_size: f64,
    max_distance: f64,
    max_points_per_voxel: usize,
    min_distance_points: f64,
    map: HashMap<Voxel, VoxelPoints>,
}

fn get_adjacent_voxels(voxel: &Voxel, adjacent_voxels: i32) -> Vec<Voxel> {
    let mut voxel_neighborhood = Vec::<Voxel>::new();
    for x in voxel.x - adjacent_voxels..voxel.x + adjacent_voxels + 1 {
        for y in voxel.y - adjacent_voxels..voxel.y + adjacent_voxels + 1 {
            for z in voxel.z - adjacent_voxels..voxel.z + adjacent_voxels + 1 {
                voxel_neighborhood.push(Voxel::new(x, y, z));
            }
        }
    }
    voxel_neighborhood
}

impl VoxelHashMap {
    pub fn new(options: &MapOptions, max_distance: f64) -> VoxelHashMap {
        VoxelHashMap {
            voxel_size: options.size_voxel_map,
            max_distance,
            max_points_per_voxel: options.max_num_points_in_voxel,
            min_distance_points: options.min_distance_points,
            map: HashMap::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn map_len(&self) -> usize {
        self.map.values().map(|v| v.len()).sum()
    }

    pub fn num_voxels(&self) -> usize {
        self.map.len()
    }

    /// Inserts world points and returns how many were kept.
    pub fn add_points(&mut self, points: &[na::Vector3<f64>]) -> usize {
        let min_distance2 = self.min_distance_points * self.min_distance_points;
        let mut inserted = 0;
        for pt in points {
            let voxel = na_vec_to_voxel(pt, self.voxel_size);
            let voxel_points = self.map.entry(voxel).or_default();
            if voxel_points.len() >= self.max_points_per_voxel
                || voxel_points
                    .iter()
                    .any(|vpt| (vpt - pt).norm_squared() < min_distance2)
            {
                continue;
            }
            voxel_points.push(*pt);
            inserted += 1;
        }
        inserted
    }

    pub fn remove_points_too_far(&mut self, current_origin: &na::Vector3<f64>) {
        let max_distance2 = self.max_distance * self.max_distance;
        let keys_too_far: Vec<Voxel> = self
            .map
            .par_iter()
            .filter_map(|(k, vps)| match vps.first() {
                Some(first) if (first - current_origin).norm_squared() < max_distance2 => None,
                _ => Some(k.to_owned()),
            })
            .collect();
        keys_too_far.iter().for_each(|k| {
            self.map.remove(k);
        });
    }

    /// Up to `max_neighbors` points closest to `query`, nearest first, looked up in
    /// the cube of `voxel_neighborhood` voxels around the query's voxel.
    pub fn search_neighbors(
        &self,
        query: &na::Vector3<f64>,
        voxel_neighborhood: i32,
        max_neighbors: usize,
    ) -> Vec<Neighbor> {
        if max_neighbors == 0 {
            return Vec::new();
        }
        let voxel = na_vec_to_voxel(query, self.voxel_size);
        let mut candidates: Vec<Neighbor> = get_adjacent_voxels(&voxel, voxel_neighborhood)
            .iter()
            .filter_map(|query_voxel| self.map.get(query_voxel))
            .flatten()
            .map(|pt| Neighbor {
                point: *pt,
                distance: (pt - query).norm(),
            })
            .collect();
        if candidates.len() > max_neighbors {
            candidates
                .select_nth_unstable_by(max_neighbors - 1, |a, b| a.distance.total_cmp(&b.distance));
            candidates.truncate(max_neighbors);
        }
        candidates.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        candidates
    }

    pub fn get_closest_neighbor(&self, point: &na::Vector3<f64>) -> Option<Neighbor> {
        self.search_neighbors(point, 1, 1).into_iter().next()
    }
}

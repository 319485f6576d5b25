//! CPU light assignment, mirroring the culling compute shader.
//!
//! Used to check GPU output and to reason about the light grid in tests.
//! Offsets are handed out in flat cluster order here; on the GPU they come
//! from an atomic counter, so only the per-cluster index sets are
//! comparable, not the offsets themselves.

use crate::scene::{Aabb, GpuAabb, PointLight};
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Light grid cell: `count` indices starting at `offset`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct LightGridEntry {
    pub count: u32,
    pub offset: u32,
}

/// Light grid plus flat index list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightAssignment {
    pub grid: Vec<LightGridEntry>,
    pub indices: Vec<u32>,
}

impl LightAssignment {
    /// Light indices of a cluster. Empty clusters read nothing.
    pub fn lights_for(&self, cluster: usize) -> &[u32] {
        match self.grid.get(cluster) {
            Some(entry) if entry.count > 0 => {
                let start = entry.offset as usize;
                &self.indices[start..start + entry.count as usize]
            }
            _ => &[],
        }
    }

    /// Clusters with at least one light
    pub fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        self.grid
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.count > 0)
            .map(|(index, _)| index)
    }
}

/// Whether a light in world space touches a view-space cluster
pub fn light_touches_cluster(light: &PointLight, view: &Mat4, cluster: &GpuAabb) -> bool {
    let center = view.transform_point3(light.position());
    Aabb::from(*cluster).intersects_sphere(center, light.radius())
}

/// Assign lights to clusters, keeping at most `max_per_cluster` per cell
/// in light order.
pub fn assign_lights(
    clusters: &[GpuAabb],
    lights: &[PointLight],
    view: &Mat4,
    max_per_cluster: u32,
) -> LightAssignment {
    let mut assignment = LightAssignment {
        grid: Vec::with_capacity(clusters.len()),
        indices: Vec::new(),
    };

    for cluster in clusters {
        let offset = assignment.indices.len() as u32;
        let visible = lights
            .iter()
            .enumerate()
            .filter(|(_, light)| light_touches_cluster(light, view, cluster))
            .map(|(index, _)| index as u32)
            .take(max_per_cluster as usize);
        assignment.indices.extend(visible);
        assignment.grid.push(LightGridEntry {
            count: assignment.indices.len() as u32 - offset,
            offset,
        });
    }

    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn unit_cells() -> Vec<GpuAabb> {
        (0..4)
            .map(|i| {
                let x = i as f32;
                Aabb::new(Vec3::new(x, 0.0, -1.0), Vec3::new(x + 1.0, 1.0, 0.0)).into()
            })
            .collect()
    }

    #[test]
    fn test_ranges_are_disjoint() {
        let lights = [
            PointLight::new(Vec3::new(0.5, 0.5, -0.5), Vec3::ONE, 0.4, 1.0),
            PointLight::new(Vec3::new(2.5, 0.5, -0.5), Vec3::ONE, 1.2, 1.0),
        ];
        let assignment = assign_lights(&unit_cells(), &lights, &Mat4::IDENTITY, 8);

        assert_eq!(assignment.lights_for(0), &[0]);
        assert_eq!(assignment.lights_for(1), &[1]);
        assert_eq!(assignment.lights_for(2), &[1]);
        assert_eq!(assignment.lights_for(3), &[1]);

        let mut covered = vec![false; assignment.indices.len()];
        for entry in &assignment.grid {
            for slot in entry.offset..entry.offset + entry.count {
                assert!(!covered[slot as usize]);
                covered[slot as usize] = true;
            }
        }
        assert!(covered.into_iter().all(|c| c));
    }

    #[test]
    fn test_count_is_capped() {
        let lights: Vec<_> = (0..5)
            .map(|_| PointLight::new(Vec3::new(0.5, 0.5, -0.5), Vec3::ONE, 0.1, 1.0))
            .collect();
        let assignment = assign_lights(&unit_cells(), &lights, &Mat4::IDENTITY, 3);
        assert_eq!(assignment.lights_for(0), &[0, 1, 2]);
        assert_eq!(assignment.occupied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_empty_cluster_reads_nothing() {
        let assignment = LightAssignment {
            grid: vec![LightGridEntry {
                count: 0,
                offset: 99,
            }],
            indices: Vec::new(),
        };
        assert!(assignment.lights_for(0).is_empty());
        assert!(assignment.lights_for(5).is_empty());
    }

    #[test]
    fn test_view_transform_applies() {
        let light = PointLight::new(Vec3::new(0.5, 0.5, 9.5), Vec3::ONE, 0.1, 1.0);
        let view = Mat4::from_translation(Vec3::new(0.0, 0.0, -10.0));
        assert!(light_touches_cluster(&light, &view, &unit_cells()[0]));
        assert!(!light_touches_cluster(&light, &Mat4::IDENTITY, &unit_cells()[0]));
    }
}

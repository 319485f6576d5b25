//! Mesh data and GPU upload

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::scene::Aabb;
use glam::{Vec2, Vec3};

/// CPU-side indexed triangle mesh
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            name: name.to_string(),
        }
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Object-space bounds of all vertices
    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().map(|v| v.position))
    }

    /// Unit cube centered at the origin, four vertices per face
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");
        let faces = [Vec3::Z, -Vec3::Z, Vec3::X, -Vec3::X, Vec3::Y, -Vec3::Y];

        for normal in faces {
            let tangent = if normal.y.abs() > 0.9 {
                Vec3::X
            } else {
                Vec3::Y.cross(normal).normalize()
            };
            let bitangent = normal.cross(tangent);
            let base = mesh.vertices.len() as u32;

            let corners = [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)];
            for (u, v) in corners {
                mesh.vertices.push(Vertex::new(
                    normal * 0.5 + tangent * u + bitangent * v,
                    normal,
                    Vec2::new(u + 0.5, 0.5 - v),
                    tangent,
                ));
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }

    /// UV sphere of diameter 1
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");
        let segment_angle = std::f32::consts::TAU / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                mesh.vertices.push(Vertex::new(
                    normal * 0.5,
                    normal,
                    Vec2::new(
                        segment as f32 / segments as f32,
                        ring as f32 / rings as f32,
                    ),
                    Vec3::new(-theta.sin(), 0.0, theta.cos()),
                ));
            }
        }

        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;
                mesh.indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            }
        }

        mesh
    }

    /// Subdivided plane on XZ facing +Y
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = Mesh::new("plane");
        let subdivisions = subdivisions.max(1);
        let step = Vec2::new(width, depth) / subdivisions as f32;

        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                let uv = Vec2::new(x as f32, z as f32) / subdivisions as f32;
                mesh.vertices.push(Vertex::new(
                    Vec3::new(
                        x as f32 * step.x - width * 0.5,
                        0.0,
                        z as f32 * step.y - depth * 0.5,
                    ),
                    Vec3::Y,
                    uv,
                    Vec3::X,
                ));
            }
        }

        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * (subdivisions + 1) + x;
                let next = current + subdivisions + 1;
                mesh.indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }

        mesh
    }
}

/// Mesh uploaded to device-local vertex and index buffers
#[derive(Debug, Clone, Copy)]
pub struct GpuMesh {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub bounds: Aabb,
}

impl GpuMesh {
    pub fn upload<B: GraphicsBackend>(backend: &mut B, mesh: &Mesh) -> BackendResult<Self> {
        if mesh.vertices.is_empty() || mesh.indices.is_empty() {
            return Err(BackendError::BufferCreationFailed(format!(
                "mesh '{}' is empty",
                mesh.name
            )));
        }
        log::debug!(
            "Uploading mesh '{}' ({} vertices, {} triangles)",
            mesh.name,
            mesh.vertices.len(),
            mesh.triangle_count()
        );

        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} vertices", mesh.name)),
                size: mesh.vertex_bytes().len() as u64,
                usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            mesh.vertex_bytes(),
        )?;
        let index_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} indices", mesh.name)),
                size: mesh.index_bytes().len() as u64,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            mesh.index_bytes(),
        )?;

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
            bounds: mesh.bounds(),
        })
    }

    pub fn destroy<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.destroy_buffer(self.index_buffer);
        backend.destroy_buffer(self.vertex_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_outward_winding(mesh: &Mesh) {
        for triangle in mesh.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| mesh.vertices[triangle[i] as usize]);
            let face_normal = (b.position - a.position).cross(c.position - a.position);
            if face_normal.length_squared() < 1e-12 {
                continue;
            }
            assert!(
                face_normal.dot(a.normal) > 0.0,
                "triangle {:?} of {} winds clockwise",
                triangle,
                mesh.name
            );
        }
    }

    #[test]
    fn test_cube_layout() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.triangle_count(), 12);
        assert_eq!(cube.bounds(), Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5)));
        assert_outward_winding(&cube);
    }

    #[test]
    fn test_sphere_and_plane_wind_counter_clockwise() {
        assert_outward_winding(&Mesh::sphere(16, 8));
        assert_outward_winding(&Mesh::plane(4.0, 4.0, 3));
    }

    #[test]
    fn test_vertex_stride() {
        assert_eq!(std::mem::size_of::<Vertex>(), 44);
        assert_eq!(Vertex::layout().array_stride, 44);
    }
}

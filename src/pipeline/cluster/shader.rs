//! Light culling compute shader
//!
//! One workgroup per cluster. Each counts the lights whose sphere of
//! influence touches its bounding box, reserves that many slots in the flat
//! index list through an atomic counter and writes the indices there.

/// Body of the culling shader, appended to the shared declarations
pub const CLUSTER_CULL_SHADER: &str = r#"
struct ClusterAabb {
    min_point: vec4<f32>,
    max_point: vec4<f32>,
}

@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var<storage, read> clusters: array<ClusterAabb>;
@group(0) @binding(2) var<uniform> cluster_gen: ClusterGenData;
@group(0) @binding(3) var<storage, read> point_lights: array<PointLight>;
@group(0) @binding(4) var<storage, read_write> light_indices: array<u32>;
@group(0) @binding(5) var<storage, read_write> light_grid: array<LightGridEntry>;
@group(0) @binding(6) var<storage, read_write> global_index_count: atomic<u32>;

fn touches(light_index: u32, cluster: ClusterAabb) -> bool {
    let light = point_lights[light_index];
    let center = (globals.view * vec4<f32>(light.position_radius.xyz, 1.0)).xyz;
    let radius = light.position_radius.w;
    let closest = clamp(center, cluster.min_point.xyz, cluster.max_point.xyz);
    let delta = closest - center;
    return dot(delta, delta) <= radius * radius;
}

@compute @workgroup_size(1, 1, 1)
fn cs_main(@builtin(workgroup_id) cluster_id: vec3<u32>) {
    let dims = cluster_gen.grid_size;
    let index = cluster_id.x + cluster_id.y * dims.x + cluster_id.z * dims.x * dims.y;
    let cluster = clusters[index];
    let light_count = min(globals.point_light_count, arrayLength(&point_lights));
    let cap = dims.w;

    var visible = 0u;
    for (var i = 0u; i < light_count && visible < cap; i = i + 1u) {
        if touches(i, cluster) {
            visible = visible + 1u;
        }
    }

    let offset = atomicAdd(&global_index_count, visible);

    var written = 0u;
    for (var i = 0u; i < light_count && written < visible; i = i + 1u) {
        if touches(i, cluster) {
            light_indices[offset + written] = i;
            written = written + 1u;
        }
    }

    light_grid[index] = LightGridEntry(visible, offset);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::shader::{compile_wgsl, parse_wgsl, ShaderStage};
    use crate::pipeline::shader_source;

    #[test]
    fn test_cull_shader_compiles() {
        let source = shader_source(CLUSTER_CULL_SHADER);
        let (module, _) = parse_wgsl(&source).unwrap();
        assert_eq!(module.entry_points.len(), 1);
        assert!(compile_wgsl(&source, ShaderStage::Compute, "cs_main").is_ok());
    }

    #[test]
    fn test_bindings_are_in_set_zero() {
        let (module, _) = parse_wgsl(&shader_source(CLUSTER_CULL_SHADER)).unwrap();
        let mut bindings: Vec<u32> = module
            .global_variables
            .iter()
            .filter_map(|(_, var)| var.binding.as_ref())
            .inspect(|binding| assert_eq!(binding.group, 0))
            .map(|binding| binding.binding)
            .collect();
        bindings.sort_unstable();
        assert_eq!(bindings, (0..7).collect::<Vec<_>>());
    }
}

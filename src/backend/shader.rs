//! WGSL to SPIR-V compilation through naga

use crate::backend::traits::{BackendError, BackendResult};

/// Shader stage of an entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    fn to_naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
        }
    }
}

/// Parse and validate a WGSL module.
pub fn parse_wgsl(source: &str) -> BackendResult<(naga::Module, naga::valid::ModuleInfo)> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| BackendError::ShaderCreationFailed(format!("WGSL parse error: {e}")))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| BackendError::ShaderCreationFailed(format!("Validation error: {e}")))?;

    Ok((module, info))
}

/// Compile one entry point of a WGSL module to SPIR-V words.
pub fn compile_wgsl(
    source: &str,
    stage: ShaderStage,
    entry_point: &str,
) -> BackendResult<Vec<u32>> {
    let (module, info) = parse_wgsl(source)?;

    let naga_stage = stage.to_naga();
    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == naga_stage)
    {
        return Err(BackendError::ShaderCreationFailed(format!(
            "Entry point '{}' not found for stage {:?}",
            entry_point, stage
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };

    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options)).map_err(|e| {
        BackendError::ShaderCreationFailed(format!("SPIR-V generation error: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIVIAL: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    return vec4<f32>(f32(index), 0.0, 0.0, 1.0);
}
"#;

    #[test]
    fn test_compile_emits_spirv_magic() {
        let words = compile_wgsl(TRIVIAL, ShaderStage::Vertex, "vs_main").unwrap();
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn test_missing_entry_point() {
        let err = compile_wgsl(TRIVIAL, ShaderStage::Fragment, "vs_main").unwrap_err();
        assert!(matches!(err, BackendError::ShaderCreationFailed(_)));
    }

    #[test]
    fn test_parse_error_is_reported() {
        assert!(parse_wgsl("fn broken( {").is_err());
    }
}

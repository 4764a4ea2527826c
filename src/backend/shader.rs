// Shader module loading
//
// Shaders are compiled to SPIR-V ahead of time (see build.rs) and read from
// disk at startup. A missing binary is fatal.

use std::fs::File;
use std::path::Path;

use ash::vk;

use super::gpu::Gpu;
use crate::error::{RenderError, RenderResult};

/// Read SPIR-V words from a file.
pub fn read_spirv(path: &Path) -> RenderResult<Vec<u32>> {
    let mut file = File::open(path).map_err(|source| RenderError::ShaderNotFound {
        path: path.to_path_buf(),
        source,
    })?;

    // read_spv checks length and endianness and fixes alignment
    ash::util::read_spv(&mut file).map_err(|source| RenderError::InvalidShader {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a SPIR-V file and create a shader module from it.
pub fn load_shader_module(gpu: &dyn Gpu, path: &Path) -> RenderResult<vk::ShaderModule> {
    let code = read_spirv(path)?;
    let module = gpu.create_shader_module(&code)?;
    log::debug!("Loaded shader {} ({} words)", path.display(), code.len());
    Ok(module)
}

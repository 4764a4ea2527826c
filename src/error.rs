//! Error types for the frame core.
//!
//! Everything in here is fatal for the renderer. Out-of-date and suboptimal
//! swap chains are not errors: they come back as outcome enums and are
//! handled by the invalidation protocol.

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Failed to load the Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("No suitable GPU found ({checked} checked)")]
    NoSuitableDevice { checked: usize },

    #[error("No memory type matches filter {type_filter:#b} with {required:?}")]
    NoCompatibleMemoryType {
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// A buffer was used after `destroy_buffer`
    #[error("Buffer used after it was destroyed")]
    BufferDestroyed,

    #[error("Buffer memory is not host visible")]
    BufferNotHostVisible,

    #[error("Cannot create a zero-sized buffer")]
    EmptyBuffer,

    #[error("Write of {requested} bytes at offset {offset} overflows buffer of {capacity} bytes")]
    BufferOverflow {
        offset: vk::DeviceSize,
        requested: vk::DeviceSize,
        capacity: vk::DeviceSize,
    },

    #[error("Shader not found: {path:?}")]
    ShaderNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid SPIR-V in {path:?}: {source}")]
    InvalidShader {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Surface error: {0}")]
    Surface(String),
}

/// Result type alias for frame core operations.
pub type RenderResult<T> = std::result::Result<T, RenderError>;

//! Swap-chain-aware frame lifecycle on top of Vulkan.
//!
//! The frame core (device selection, buffers, transfers, swap chain
//! management, frame scheduling and command recording) lives in [`backend`]
//! and [`scheduler`]. [`renderer::Renderer`] wires it together; the binary
//! adds a winit window around it.

pub mod backend;
pub mod config;
pub mod error;
pub mod renderer;
pub mod scene;
pub mod scheduler;

pub use error::{RenderError, RenderResult};
pub use renderer::{Renderer, RendererSettings};
pub use scheduler::{FrameOutcome, FrameScheduler};

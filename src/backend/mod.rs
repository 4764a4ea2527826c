// Backend module - Vulkan abstraction layer
//
// Everything above `gpu` talks to the device through the `Gpu` trait:
// `device` forwards to ash, `headless` runs in-process for tests.

pub mod buffer;
pub mod commands;
pub mod device;
pub mod gpu;
pub mod headless;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod selector;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod transfer;

pub use buffer::{Buffer, ResourceAllocator};
pub use device::VulkanDevice;
pub use gpu::Gpu;
pub use headless::HeadlessGpu;
pub use swapchain::SwapChainManager;

// Swap chain manager - presentation images and everything built on them
//
// Swap chain, image views, render pass, pipeline, framebuffers and the
// per-image command buffers are one unit: when the surface changes they are
// torn down and rebuilt together by `recreate`.

use std::sync::Arc;

use ash::vk;

use super::commands::{record_commands, DrawSource, RenderTargets};
use super::gpu::{AcquireOutcome, Gpu, PresentOutcome, SurfaceSupport};
use super::pipeline::{create_framebuffers, create_graphics_pipeline, create_render_pass, PipelineTemplate};
use super::queue::QueueRole;
use crate::error::{RenderError, RenderResult};

/// User preferences for swap chain creation.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub preferred_format: vk::Format,
    pub preferred_present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
}

impl Default for SwapchainSettings {
    fn default() -> Self {
        Self {
            preferred_format: vk::Format::B8G8R8A8_SRGB,
            preferred_present_mode: vk::PresentModeKHR::MAILBOX,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// What `recreate` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recreate {
    Rebuilt,
    /// Zero-sized surface (minimized window); nothing was built.
    Deferred,
}

/// Prefer `preferred` in sRGB non-linear, else the first reported format.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::Format,
) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == preferred && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
}

/// Use `preferred` when available. FIFO is always supported.
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    present_modes
        .iter()
        .copied()
        .find(|&mode| mode == preferred)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface dictates the extent unless it reports the `u32::MAX`
/// "any size" sentinel, in which case the requested size is clamped.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped when the surface has a maximum.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

fn is_zero(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

pub struct SwapChainManager {
    gpu: Arc<dyn Gpu>,
    settings: SwapchainSettings,
    template: PipelineTemplate,

    swapchain: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    pipeline: vk::Pipeline,
    framebuffers: Vec<vk::Framebuffer>,

    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,

    present_queue: vk::Queue,
    generation: u64,
}

impl SwapChainManager {
    /// Build the swap chain and all its dependents. The manager takes
    /// ownership of `template`. A zero `requested` extent leaves the
    /// manager empty until the next successful `recreate`.
    pub fn new(
        gpu: Arc<dyn Gpu>,
        settings: SwapchainSettings,
        template: PipelineTemplate,
        requested: vk::Extent2D,
        source: &mut dyn DrawSource,
    ) -> RenderResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(gpu.queue_families().graphics());
        let command_pool = gpu.create_command_pool(&pool_info)?;
        let present_queue = gpu.queue(QueueRole::Present);

        let mut manager = Self {
            gpu,
            settings,
            template,
            swapchain: vk::SwapchainKHR::null(),
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            image_views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            pipeline: vk::Pipeline::null(),
            framebuffers: Vec::new(),
            command_pool,
            command_buffers: Vec::new(),
            present_queue,
            generation: 0,
        };
        manager.recreate(requested, source)?;
        Ok(manager)
    }

    /// Tear down and rebuild everything that depends on the surface.
    pub fn recreate(
        &mut self,
        requested: vk::Extent2D,
        source: &mut dyn DrawSource,
    ) -> RenderResult<Recreate> {
        // 1. Minimized: wait for the next window event instead
        if is_zero(requested) {
            log::debug!("Swap chain recreation deferred: window has zero size");
            return Ok(Recreate::Deferred);
        }

        // 2. Nothing may still be using the old objects
        self.gpu.device_wait_idle()?;

        // 3. Dependents first, the chain itself last
        self.destroy_targets();

        // 4. The surface may have changed under us
        let support = self.gpu.surface_support()?;
        let extent = choose_extent(&support.capabilities, requested);
        if is_zero(extent) {
            log::debug!("Swap chain recreation deferred: surface reports zero extent");
            return Ok(Recreate::Deferred);
        }
        self.create_swapchain(&support, extent)?;

        // 5. Everything that bakes in the format or extent
        self.create_image_views()?;
        self.render_pass = create_render_pass(self.gpu.as_ref(), self.surface_format.format)?;
        self.pipeline =
            create_graphics_pipeline(self.gpu.as_ref(), &self.template, self.render_pass, self.extent)?;
        self.framebuffers =
            create_framebuffers(self.gpu.as_ref(), &self.image_views, self.render_pass, self.extent)?;

        // 6. Fresh command buffers, recorded against the new targets
        self.record(source)?;

        self.generation += 1;
        log::info!(
            "Swap chain #{}: {}x{}, {} images, {:?}, {:?}",
            self.generation,
            self.extent.width,
            self.extent.height,
            self.images.len(),
            self.surface_format.format,
            self.present_mode
        );
        Ok(Recreate::Rebuilt)
    }

    fn create_swapchain(&mut self, support: &SurfaceSupport, extent: vk::Extent2D) -> RenderResult<()> {
        let surface_format = choose_surface_format(&support.formats, self.settings.preferred_format)
            .ok_or_else(|| RenderError::Surface("surface reports no formats".to_string()))?;
        let present_mode =
            choose_present_mode(&support.present_modes, self.settings.preferred_present_mode);
        let image_count = choose_image_count(&support.capabilities);

        let families = self.gpu.queue_families();
        let family_indices = [families.graphics(), families.present()];
        let (sharing_mode, shared_families): (_, &[u32]) = if family_indices[0] != family_indices[1] {
            (vk::SharingMode::CONCURRENT, &family_indices)
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        self.swapchain = self.gpu.create_swapchain(&create_info)?;
        self.images = self.gpu.swapchain_images(self.swapchain)?;
        self.surface_format = surface_format;
        self.present_mode = present_mode;
        self.extent = extent;
        Ok(())
    }

    fn create_image_views(&mut self) -> RenderResult<()> {
        for &image in &self.images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = self.gpu.create_image_view(&create_info)?;
            self.image_views.push(view);
        }
        Ok(())
    }

    /// Reset the pool, allocate one command buffer per image and record all
    /// of them with fresh inputs from `source`.
    fn record(&mut self, source: &mut dyn DrawSource) -> RenderResult<()> {
        self.gpu.reset_command_pool(self.command_pool)?;
        if self.command_buffers.len() != self.images.len() {
            if !self.command_buffers.is_empty() {
                self.gpu
                    .free_command_buffers(self.command_pool, &self.command_buffers);
                self.command_buffers.clear();
            }
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(self.images.len() as u32);
            self.command_buffers = self.gpu.allocate_command_buffers(&alloc_info)?;
        }

        let inputs = source.prepare(self.images.len())?;
        let targets = RenderTargets {
            render_pass: self.render_pass,
            pipeline: self.pipeline,
            framebuffers: &self.framebuffers,
            extent: self.extent,
        };
        record_commands(
            self.gpu.as_ref(),
            &self.command_buffers,
            &targets,
            &inputs,
            self.settings.clear_color,
        )
    }

    fn destroy_targets(&mut self) {
        let gpu = self.gpu.as_ref();
        for framebuffer in self.framebuffers.drain(..) {
            gpu.destroy_framebuffer(framebuffer);
        }
        gpu.destroy_pipeline(self.pipeline);
        self.pipeline = vk::Pipeline::null();
        gpu.destroy_render_pass(self.render_pass);
        self.render_pass = vk::RenderPass::null();
        for view in self.image_views.drain(..) {
            gpu.destroy_image_view(view);
        }
        gpu.destroy_swapchain(self.swapchain);
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
    }

    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> RenderResult<AcquireOutcome> {
        self.gpu.acquire_next_image(self.swapchain, u64::MAX, semaphore)
    }

    pub fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> RenderResult<PresentOutcome> {
        self.gpu
            .queue_present(self.present_queue, self.swapchain, image_index, wait_semaphore)
    }

    /// A swap chain exists and its command buffers are recorded.
    pub fn is_ready(&self) -> bool {
        self.swapchain != vk::SwapchainKHR::null()
            && self.command_buffers.len() == self.images.len()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    pub fn command_buffer(&self, image_index: u32) -> vk::CommandBuffer {
        self.command_buffers[image_index as usize]
    }

    /// Bumped on every successful rebuild.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.template.pipeline_layout
    }

    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.template.descriptor_set_layout
    }

    /// Release everything, template included. The device must be idle.
    pub fn destroy(&mut self) {
        if self.command_pool == vk::CommandPool::null() {
            return;
        }
        self.destroy_targets();
        if !self.command_buffers.is_empty() {
            self.gpu
                .free_command_buffers(self.command_pool, &self.command_buffers);
            self.command_buffers.clear();
        }
        self.gpu.destroy_command_pool(self.command_pool);
        self.command_pool = vk::CommandPool::null();
        self.template.destroy(self.gpu.as_ref());
    }
}

impl Drop for SwapChainManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 50,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        }
    }

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn current_extent_wins_when_defined() {
        let extent = choose_extent(
            &caps((800, 600)),
            vk::Extent2D {
                width: 1024,
                height: 768,
            },
        );
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn any_size_sentinel_clamps_each_axis_independently() {
        let caps = caps((u32::MAX, u32::MAX));

        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 4000,
                height: 10,
            },
        );
        assert_eq!((extent.width, extent.height), (1920, 50));

        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 20,
                height: 700,
            },
        );
        assert_eq!((extent.width, extent.height), (100, 700));
    }

    #[test]
    fn preferred_format_needs_srgb_nonlinear() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats, vk::Format::B8G8R8A8_SRGB).unwrap();
        assert_eq!(chosen, formats[2]);
    }

    #[test]
    fn format_falls_back_to_first() {
        let formats = [format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR)];
        assert_eq!(
            choose_surface_format(&formats, vk::Format::B8G8R8A8_SRGB),
            Some(formats[0])
        );
        assert_eq!(choose_surface_format(&[], vk::Format::B8G8R8A8_SRGB), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
    }

    #[test]
    fn image_count_is_min_plus_one_capped_by_max() {
        let mut caps = caps((800, 600));
        assert_eq!(choose_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);
    }
}

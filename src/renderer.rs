// Renderer - wires the frame core together for the demo scene
//
// Startup order: allocator -> transfer (upload the quad) -> uniform ring ->
// swap chain manager (records command buffers) -> frame scheduler.
// Teardown runs the other way round after every queue is idle.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::backend::buffer::{Buffer, ResourceAllocator};
use crate::backend::commands::{DrawInputs, DrawSource};
use crate::backend::gpu::Gpu;
use crate::backend::pipeline::{PipelineTemplate, Vertex};
use crate::backend::swapchain::{SwapChainManager, SwapchainSettings};
use crate::backend::transfer::TransferContext;
use crate::error::RenderResult;
use crate::scheduler::{FrameOutcome, FrameScheduler, FrameSchedulerState, FrameSource};

/// Unit quad, one color per corner.
pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex::new([-0.5, -0.5], [1.0, 0.0, 0.0]),
    Vertex::new([0.5, -0.5], [0.0, 1.0, 0.0]),
    Vertex::new([0.5, 0.5], [0.0, 0.0, 1.0]),
    Vertex::new([-0.5, 0.5], [1.0, 1.0, 1.0]),
];

pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Matrices read by the vertex shader, binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBlock {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBlock {
    /// Model spun `angle_degrees` around Z, seen from (2, 2, 2).
    pub fn new(angle_degrees: f32, extent: vk::Extent2D) -> Self {
        let aspect = if extent.height == 0 {
            1.0
        } else {
            extent.width as f32 / extent.height as f32
        };
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self {
            model: Mat4::from_rotation_z(angle_degrees.to_radians()),
            view: Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z),
            proj,
        }
    }
}

/// Device-local geometry.
pub struct Mesh {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub index_count: u32,
}

impl Mesh {
    pub fn upload(transfer: &TransferContext, vertices: &[Vertex], indices: &[u16]) -> RenderResult<Self> {
        // TRANSFER_SRC keeps the geometry readable for verification
        let readback = vk::BufferUsageFlags::TRANSFER_SRC;
        let vertex_buffer = transfer.upload(vertices, vk::BufferUsageFlags::VERTEX_BUFFER | readback)?;
        let index_buffer = transfer.upload(indices, vk::BufferUsageFlags::INDEX_BUFFER | readback)?;
        log::debug!(
            "Uploaded mesh: {} vertices, {} indices",
            vertices.len(),
            indices.len()
        );
        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
        })
    }

    pub fn destroy(&mut self, allocator: &ResourceAllocator) {
        allocator.destroy_buffer(&mut self.vertex_buffer);
        allocator.destroy_buffer(&mut self.index_buffer);
    }
}

/// One persistently mapped uniform buffer and descriptor set per swap chain
/// image. Resized whenever the image count changes.
pub struct UniformRing {
    allocator: ResourceAllocator,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    vertex_buffer: vk::Buffer,
    index_buffer: vk::Buffer,
    index_count: u32,

    buffers: Vec<Buffer>,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
}

impl UniformRing {
    pub fn new(allocator: ResourceAllocator, template: &PipelineTemplate, mesh: &Mesh) -> RenderResult<Self> {
        Ok(Self {
            allocator,
            set_layout: template.descriptor_set_layout,
            pipeline_layout: template.pipeline_layout,
            vertex_buffer: mesh.vertex_buffer.raw()?,
            index_buffer: mesh.index_buffer.raw()?,
            index_count: mesh.index_count,
            buffers: Vec::new(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer(&self, image_index: usize) -> &Buffer {
        &self.buffers[image_index]
    }

    fn rebuild(&mut self, count: usize) -> RenderResult<()> {
        self.destroy();
        let gpu = Arc::clone(self.allocator.gpu());
        let size = std::mem::size_of::<UniformBlock>() as vk::DeviceSize;

        for _ in 0..count {
            let mut buffer = self
                .allocator
                .create_host_buffer(size, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
            buffer.map_persistent()?;
            self.buffers.push(buffer);
        }

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: count as u32,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(count as u32);
        self.descriptor_pool = gpu.create_descriptor_pool(&pool_info)?;

        let layouts = vec![self.set_layout; count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        self.descriptor_sets = gpu.allocate_descriptor_sets(&alloc_info)?;

        for (set, buffer) in self.descriptor_sets.iter().zip(&self.buffers) {
            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: buffer.raw()?,
                offset: 0,
                range: size,
            }];
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(*set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info)
                .build();
            gpu.update_descriptor_sets(std::slice::from_ref(&write));
        }

        log::debug!("Uniform ring sized for {} images", count);
        Ok(())
    }

    pub fn destroy(&mut self) {
        let gpu = Arc::clone(self.allocator.gpu());
        // Sets go with their pool
        gpu.destroy_descriptor_pool(self.descriptor_pool);
        self.descriptor_pool = vk::DescriptorPool::null();
        self.descriptor_sets.clear();
        for mut buffer in self.buffers.drain(..) {
            self.allocator.destroy_buffer(&mut buffer);
        }
    }
}

impl DrawSource for UniformRing {
    fn prepare(&mut self, image_count: usize) -> RenderResult<DrawInputs> {
        if self.buffers.len() != image_count {
            self.rebuild(image_count)?;
        }
        Ok(DrawInputs {
            vertex_buffer: self.vertex_buffer,
            index_buffer: self.index_buffer,
            index_type: vk::IndexType::UINT16,
            index_count: self.index_count,
            descriptor_sets: self.descriptor_sets.clone(),
            pipeline_layout: self.pipeline_layout,
        })
    }
}

impl FrameSource for UniformRing {
    fn update(
        &mut self,
        image_index: u32,
        extent: vk::Extent2D,
        state: &FrameSchedulerState,
    ) -> RenderResult<()> {
        let block = UniformBlock::new(state.angle, extent);
        self.buffers[image_index as usize].write(0, std::slice::from_ref(&block))
    }
}

/// Renderer knobs that do not come from the device.
#[derive(Debug, Clone, Copy)]
pub struct RendererSettings {
    pub swapchain: SwapchainSettings,
    /// Degrees per second.
    pub rotation_speed: f32,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            swapchain: SwapchainSettings::default(),
            rotation_speed: 90.0,
        }
    }
}

pub struct Renderer {
    gpu: Arc<dyn Gpu>,
    allocator: ResourceAllocator,
    transfer: TransferContext,
    mesh: Mesh,
    uniforms: UniformRing,
    swapchain: SwapChainManager,
    scheduler: FrameScheduler,
    shut_down: bool,
}

impl Renderer {
    /// Build the whole frame core on `gpu`. Takes ownership of `template`.
    pub fn new(
        gpu: Arc<dyn Gpu>,
        template: PipelineTemplate,
        settings: RendererSettings,
        extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        let allocator = ResourceAllocator::new(Arc::clone(&gpu));
        let transfer = TransferContext::new(allocator.clone())?;
        let mesh = Mesh::upload(&transfer, &QUAD_VERTICES, &QUAD_INDICES)?;
        let mut uniforms = UniformRing::new(allocator.clone(), &template, &mesh)?;

        let swapchain = SwapChainManager::new(
            Arc::clone(&gpu),
            settings.swapchain,
            template,
            extent,
            &mut uniforms,
        )?;
        let scheduler = FrameScheduler::new(
            Arc::clone(&gpu),
            swapchain.image_count(),
            settings.rotation_speed,
        )?;

        log::info!(
            "Renderer ready: {} swap chain images, {} live buffers",
            swapchain.image_count(),
            allocator.live_buffers()
        );

        Ok(Self {
            gpu,
            allocator,
            transfer,
            mesh,
            uniforms,
            swapchain,
            scheduler,
            shut_down: false,
        })
    }

    /// Render and present one frame for a window of size `extent`.
    pub fn draw_frame(&mut self, extent: vk::Extent2D, dt: f32) -> RenderResult<FrameOutcome> {
        self.scheduler
            .draw_frame(&mut self.swapchain, &mut self.uniforms, extent, dt)
    }

    /// Window resized or display mode changed.
    pub fn request_recreate(&mut self) {
        self.scheduler.request_recreate();
    }

    pub fn frame_state(&self) -> &FrameSchedulerState {
        self.scheduler.state()
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    pub fn swapchain(&self) -> &SwapChainManager {
        &self.swapchain
    }

    pub fn uniforms(&self) -> &UniformRing {
        &self.uniforms
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn transfer(&self) -> &TransferContext {
        &self.transfer
    }

    pub fn live_buffers(&self) -> usize {
        self.allocator.live_buffers()
    }

    pub fn gpu(&self) -> &Arc<dyn Gpu> {
        &self.gpu
    }

    /// Drain every queue, then destroy everything in reverse creation order.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.scheduler.shutdown()?;
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        self.shut_down = true;
        self.scheduler.destroy();
        self.uniforms.destroy();
        self.swapchain.destroy();
        self.mesh.destroy(&self.allocator);
        self.transfer.destroy();
        log::info!("Renderer shut down");
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if self.shut_down {
            return;
        }
        if let Err(e) = self.gpu.device_wait_idle() {
            log::error!("device_wait_idle failed during drop: {}", e);
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_is_three_matrices() {
        assert_eq!(std::mem::size_of::<UniformBlock>(), 3 * 64);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let block = UniformBlock::new(
            0.0,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        );
        assert!(block.proj.y_axis.y < 0.0);
        assert_eq!(block.model, Mat4::IDENTITY);
    }

    #[test]
    fn zero_height_does_not_produce_nan() {
        let block = UniformBlock::new(
            30.0,
            vk::Extent2D {
                width: 800,
                height: 0,
            },
        );
        assert!(block.proj.to_cols_array().iter().all(|v| v.is_finite()));
    }
}

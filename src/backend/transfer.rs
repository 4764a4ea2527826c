// Transfer pipeline - one-shot host to device uploads
//
// Copies run on the transfer queue and block until the queue is idle.
// They only happen at startup, so there is no batching.

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use super::buffer::{Buffer, ResourceAllocator};
use super::gpu::{Gpu, Submission};
use super::queue::QueueRole;
use crate::error::{RenderError, RenderResult};

pub struct TransferContext {
    gpu: Arc<dyn Gpu>,
    allocator: ResourceAllocator,
    pool: vk::CommandPool,
    queue: vk::Queue,
}

impl TransferContext {
    /// Create a transient command pool on the transfer family.
    pub fn new(allocator: ResourceAllocator) -> RenderResult<Self> {
        let gpu = Arc::clone(allocator.gpu());
        let family = gpu.queue_families().transfer();

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = gpu.create_command_pool(&pool_info)?;
        let queue = gpu.queue(QueueRole::Transfer);

        log::debug!("Transfer context on queue family {}", family);

        Ok(Self {
            gpu,
            allocator,
            pool,
            queue,
        })
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    /// Copy `size` bytes from `src` to `dst` and wait for completion.
    pub fn copy_buffer(&self, dst: &Buffer, src: &Buffer, size: vk::DeviceSize) -> RenderResult<()> {
        let (dst_raw, src_raw) = (dst.raw()?, src.raw()?);
        let capacity = src.size().min(dst.size());
        if size > capacity {
            return Err(RenderError::BufferOverflow {
                offset: 0,
                requested: size,
                capacity,
            });
        }

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmds = self.gpu.allocate_command_buffers(&alloc_info)?;

        let result = self.submit_copy(cmds[0], src_raw, dst_raw, size);
        self.gpu.free_command_buffers(self.pool, &cmds);
        result
    }

    fn submit_copy(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RenderResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.gpu.begin_command_buffer(cmd, &begin_info)?;

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        self.gpu.cmd_copy_buffer(cmd, src, dst, &[region]);
        self.gpu.end_command_buffer(cmd)?;

        self.gpu
            .queue_submit(self.queue, &Submission::commands(&[cmd]), vk::Fence::null())?;
        self.gpu.queue_wait_idle(self.queue)
    }

    /// Upload `data` into a new device-local buffer with the given usage.
    pub fn upload<T: Pod>(&self, data: &[T], usage: vk::BufferUsageFlags) -> RenderResult<Buffer> {
        let mut staging = self
            .allocator
            .create_buffer_with_data(vk::BufferUsageFlags::TRANSFER_SRC, data)?;

        let result = self
            .allocator
            .create_buffer(
                staging.size(),
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .and_then(|target| {
                self.copy_buffer(&target, &staging, staging.size())?;
                Ok(target)
            });

        self.allocator.destroy_buffer(&mut staging);
        result
    }

    /// Read a buffer back through a staging copy. The buffer needs
    /// TRANSFER_SRC usage.
    pub fn download(&self, buffer: &Buffer) -> RenderResult<Vec<u8>> {
        let mut staging = self.allocator.create_host_buffer(
            buffer.size(),
            vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        let result = self
            .copy_buffer(&staging, buffer, buffer.size())
            .and_then(|_| staging.read_bytes());
        self.allocator.destroy_buffer(&mut staging);
        result
    }

    pub fn destroy(&mut self) {
        if self.pool != vk::CommandPool::null() {
            self.gpu.destroy_command_pool(self.pool);
            self.pool = vk::CommandPool::null();
        }
    }
}

impl Drop for TransferContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessGpu;
    use crate::backend::queue::QueueFamilyCaps;

    fn as_f32(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn staged_round_trip_is_bit_identical() {
        let gpu = Arc::new(HeadlessGpu::new());
        let transfer = TransferContext::new(ResourceAllocator::new(gpu.clone())).unwrap();

        let data: Vec<u32> = (0..64).map(|i| i * 0x0101_0101).collect();
        let mut buffer = transfer
            .upload(&data, vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC)
            .unwrap();
        assert!(!buffer.is_host_visible());

        let bytes = transfer.download(&buffer).unwrap();
        assert_eq!(bytes, bytemuck::cast_slice::<u32, u8>(&data));

        transfer.allocator().destroy_buffer(&mut buffer);
        drop(transfer);
        assert_eq!(gpu.live_objects(), 0);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn upload_leaves_only_the_target_buffer() {
        let gpu = Arc::new(HeadlessGpu::new());
        let transfer = TransferContext::new(ResourceAllocator::new(gpu.clone())).unwrap();

        let mut buffer = transfer
            .upload(&[0u16, 1, 2, 2, 3, 0], vk::BufferUsageFlags::INDEX_BUFFER)
            .unwrap();
        assert_eq!(buffer.size(), 12);
        assert_eq!(transfer.allocator().live_buffers(), 1);
        assert_eq!(gpu.pending_submissions(), 0);

        transfer.allocator().destroy_buffer(&mut buffer);
    }

    #[test]
    fn copy_larger_than_either_buffer_is_rejected() {
        let gpu = Arc::new(HeadlessGpu::new());
        let transfer = TransferContext::new(ResourceAllocator::new(gpu.clone())).unwrap();
        let allocator = transfer.allocator().clone();

        let mut src = allocator
            .create_host_buffer(16, vk::BufferUsageFlags::TRANSFER_SRC)
            .unwrap();
        let mut dst = allocator
            .create_host_buffer(8, vk::BufferUsageFlags::TRANSFER_DST)
            .unwrap();
        assert!(matches!(
            transfer.copy_buffer(&dst, &src, 16),
            Err(RenderError::BufferOverflow { capacity: 8, .. })
        ));

        allocator.destroy_buffer(&mut src);
        allocator.destroy_buffer(&mut dst);
    }

    #[test]
    fn copies_run_on_a_dedicated_transfer_family() {
        let families = [
            QueueFamilyCaps {
                flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                queue_count: 1,
                present: true,
            },
            QueueFamilyCaps {
                flags: vk::QueueFlags::TRANSFER,
                queue_count: 1,
                present: false,
            },
        ];
        let gpu = Arc::new(HeadlessGpu::with_queue_families(&families));
        assert_eq!(gpu.queue_families().transfer(), 1);

        let transfer = TransferContext::new(ResourceAllocator::new(gpu.clone())).unwrap();
        let mut buffer = transfer
            .upload(&[1.0f32, 2.0, 3.0], vk::BufferUsageFlags::TRANSFER_SRC)
            .unwrap();
        let floats = as_f32(&transfer.download(&buffer).unwrap());
        assert_eq!(floats, vec![1.0, 2.0, 3.0]);

        transfer.allocator().destroy_buffer(&mut buffer);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }
}

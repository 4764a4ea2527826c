// Resource allocator for vertex, index, uniform and staging buffers
//
// Every buffer owns exactly one VkBuffer and one VkDeviceMemory allocation.
// Destruction is explicit through `ResourceAllocator::destroy_buffer`; a
// buffer dropped without it is still released, with a warning.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;

use super::gpu::Gpu;
use super::memory::find_memory_type;
use crate::error::{RenderError, RenderResult};

/// Memory-backed GPU buffer.
pub struct Buffer {
    gpu: Arc<dyn Gpu>,
    raw: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
    mapped: Option<*mut u8>,
    live: Arc<AtomicUsize>,
}

impl Buffer {
    /// Raw handle, or `BufferDestroyed` once the buffer was destroyed.
    pub fn raw(&self) -> RenderResult<vk::Buffer> {
        if self.is_destroyed() {
            return Err(RenderError::BufferDestroyed);
        }
        Ok(self.raw)
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Property flags of the memory type the buffer landed in.
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    pub fn is_destroyed(&self) -> bool {
        self.raw == vk::Buffer::null()
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Map the whole buffer and keep it mapped until destruction.
    /// Writes through a host-coherent mapping need no flush.
    pub fn map_persistent(&mut self) -> RenderResult<()> {
        self.check_host_access()?;
        if self.mapped.is_none() {
            let ptr = self.gpu.map_memory(self.memory, 0, self.size)?;
            self.mapped = Some(ptr);
        }
        Ok(())
    }

    /// Copy `data` into the buffer at byte `offset`.
    pub fn write<T: Pod>(&mut self, offset: vk::DeviceSize, data: &[T]) -> RenderResult<()> {
        self.check_host_access()?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let len = bytes.len() as vk::DeviceSize;
        self.check_range(offset, len)?;
        if len == 0 {
            return Ok(());
        }

        match self.mapped {
            Some(base) => unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(offset as usize), bytes.len());
            },
            None => {
                let ptr = self.gpu.map_memory(self.memory, offset, len)?;
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
                }
                self.gpu.unmap_memory(self.memory);
            }
        }
        Ok(())
    }

    /// Read the whole buffer back. Only valid for host-visible memory.
    pub fn read_bytes(&self) -> RenderResult<Vec<u8>> {
        self.check_host_access()?;
        let mut out = vec![0u8; self.size as usize];

        match self.mapped {
            Some(base) => unsafe {
                std::ptr::copy_nonoverlapping(base as *const u8, out.as_mut_ptr(), out.len());
            },
            None => {
                let ptr = self.gpu.map_memory(self.memory, 0, self.size)?;
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), out.len());
                }
                self.gpu.unmap_memory(self.memory);
            }
        }
        Ok(out)
    }

    fn check_host_access(&self) -> RenderResult<()> {
        if self.is_destroyed() {
            return Err(RenderError::BufferDestroyed);
        }
        if !self.is_host_visible() {
            return Err(RenderError::BufferNotHostVisible);
        }
        Ok(())
    }

    fn check_range(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> RenderResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(RenderError::BufferOverflow {
                offset,
                requested: len,
                capacity: self.size,
            }),
        }
    }

    fn release(&mut self) {
        if self.is_destroyed() {
            return;
        }
        if self.mapped.take().is_some() {
            self.gpu.unmap_memory(self.memory);
        }
        self.gpu.destroy_buffer(self.raw);
        self.gpu.free_memory(self.memory);
        self.raw = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            log::warn!(
                "Buffer of {} bytes ({:?}) dropped without destroy_buffer",
                self.size,
                self.usage
            );
            self.release();
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("raw", &self.raw)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("memory_flags", &self.memory_flags)
            .field("mapped", &self.mapped.is_some())
            .finish()
    }
}

/// Creates and destroys buffers, picking memory types for them.
#[derive(Clone)]
pub struct ResourceAllocator {
    gpu: Arc<dyn Gpu>,
    live: Arc<AtomicUsize>,
}

impl ResourceAllocator {
    pub fn new(gpu: Arc<dyn Gpu>) -> Self {
        Self {
            gpu,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn gpu(&self) -> &Arc<dyn Gpu> {
        &self.gpu
    }

    /// Buffers created by this allocator and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Create a buffer, allocate memory for it and bind the two.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<Buffer> {
        if size == 0 {
            return Err(RenderError::EmptyBuffer);
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = self.gpu.create_buffer(&buffer_info)?;

        let requirements = self.gpu.buffer_memory_requirements(raw);
        let memory_properties = self.gpu.memory_properties();
        let type_index = match find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            properties,
        ) {
            Ok(index) => index,
            Err(e) => {
                self.gpu.destroy_buffer(raw);
                return Err(e);
            }
        };
        let memory_flags = memory_properties.memory_types[type_index as usize].property_flags;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);
        let memory = match self.gpu.allocate_memory(&alloc_info) {
            Ok(memory) => memory,
            Err(e) => {
                self.gpu.destroy_buffer(raw);
                return Err(e);
            }
        };

        if let Err(e) = self.gpu.bind_buffer_memory(raw, memory) {
            self.gpu.destroy_buffer(raw);
            self.gpu.free_memory(memory);
            return Err(e);
        }

        self.live.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "Created buffer {:?}: {} bytes, {:?}, memory type {}",
            raw,
            size,
            usage,
            type_index
        );

        Ok(Buffer {
            gpu: Arc::clone(&self.gpu),
            raw,
            memory,
            size,
            usage,
            memory_flags,
            mapped: None,
            live: Arc::clone(&self.live),
        })
    }

    /// Release a buffer's handle and memory. Later use of the buffer fails
    /// with `BufferDestroyed`; destroying twice does nothing.
    pub fn destroy_buffer(&self, buffer: &mut Buffer) {
        buffer.release();
    }

    /// Host-visible, host-coherent transfer source sized like `target`.
    pub fn create_staging_buffer(&self, target: &Buffer) -> RenderResult<Buffer> {
        target.raw()?;
        self.create_host_buffer(target.size(), vk::BufferUsageFlags::TRANSFER_SRC)
    }

    /// Host-visible, host-coherent buffer for direct CPU writes.
    pub fn create_host_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<Buffer> {
        self.create_buffer(
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Host buffer filled with `data`.
    pub fn create_buffer_with_data<T: Pod>(
        &self,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> RenderResult<Buffer> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let mut buffer = self.create_host_buffer(size, usage)?;
        buffer.write(0, data)?;
        Ok(buffer)
    }
}

// Headless GPU - in-process stand-in for a Vulkan device
//
// Responsibilities:
// - Hand out unique handles and track every live object
// - Keep byte-accurate memory for buffers and execute copy commands
// - Record draw calls and presents so tests can inspect what reached the GPU
// - Model semaphore, fence and queue state closely enough to catch misuse
//
// Submitted work stays "in flight" until the host waits for it (fence wait,
// queue idle or device idle). Anything a validation layer would complain
// about is recorded as a violation instead of failing the call, except where
// a real driver would also return an error.

use std::collections::{HashMap, HashSet};

use ash::vk::{self, Handle};
use parking_lot::{Mutex, MutexGuard};

use super::gpu::{AcquireOutcome, Gpu, PresentOutcome, Submission, SurfaceSupport};
use super::memory::memory_properties_from;
use super::queue::{assign_queue_families, QueueFamilyCaps, QueueFamilyIndices, QueuePlan, QueueRole};
use crate::error::{RenderError, RenderResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Smallest word sequence the headless device accepts as a shader.
pub const MINIMAL_SPIRV: [u32; 5] = [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
const QUEUE_HANDLE_BASE: u64 = 0x51_0000;

/// Kind of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Memory,
    CommandPool,
    CommandBuffer,
    Semaphore,
    Fence,
    Swapchain,
    Image,
    ImageView,
    RenderPass,
    Framebuffer,
    ShaderModule,
    DescriptorSetLayout,
    PipelineLayout,
    Pipeline,
    DescriptorPool,
    DescriptorSet,
}

/// A draw call as executed by a queue submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawCall {
    pub command_buffer: vk::CommandBuffer,
    pub framebuffer: vk::Framebuffer,
    pub pipeline: vk::Pipeline,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_type: vk::IndexType,
    pub descriptor_set: vk::DescriptorSet,
    pub render_area: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

/// Parameters a swap chain was created with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapchainRecord {
    pub handle: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    pub sharing_mode: vk::SharingMode,
    pub image_count: u32,
}

#[derive(Debug)]
struct Object {
    kind: ObjectKind,
    deps: Vec<u64>,
}

#[derive(Debug, Clone)]
enum Command {
    Copy {
        src: u64,
        dst: u64,
        regions: Vec<vk::BufferCopy>,
    },
    BeginRenderPass {
        render_pass: u64,
        framebuffer: u64,
        area: vk::Extent2D,
        clear_color: [f32; 4],
    },
    BindPipeline(u64),
    BindVertexBuffer(u64),
    BindIndexBuffer(u64, vk::IndexType),
    BindDescriptorSet { layout: u64, set: u64 },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    EndRenderPass,
}

impl Command {
    fn references(&self) -> Vec<u64> {
        match *self {
            Command::Copy { src, dst, .. } => vec![src, dst],
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                ..
            } => vec![render_pass, framebuffer],
            Command::BindPipeline(p) => vec![p],
            Command::BindVertexBuffer(b) => vec![b],
            Command::BindIndexBuffer(b, _) => vec![b],
            Command::BindDescriptorSet { layout, set } => vec![layout, set],
            Command::DrawIndexed { .. } | Command::EndRenderPass => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug)]
struct CommandBufferState {
    pool: u64,
    state: RecordingState,
    commands: Vec<Command>,
}

#[derive(Debug)]
struct Allocation {
    bytes: Vec<u8>,
    type_index: u32,
    mapped: bool,
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
    pending: Option<u64>,
}

#[derive(Debug)]
struct SwapchainState {
    images: Vec<u64>,
    next_image: usize,
    acquired: HashSet<u32>,
    out_of_date: bool,
}

#[derive(Debug)]
struct PendingSubmit {
    id: u64,
    queue: u64,
    fence: Option<u64>,
    command_buffers: Vec<u64>,
}

#[derive(Debug)]
struct State {
    next_handle: u64,
    next_submit: u64,
    calls: u64,
    objects: HashMap<u64, Object>,
    allocations: HashMap<u64, Allocation>,
    buffer_memory: HashMap<u64, u64>,
    buffer_sizes: HashMap<u64, vk::DeviceSize>,
    command_buffers: HashMap<u64, CommandBufferState>,
    semaphores: HashMap<u64, bool>,
    fences: HashMap<u64, FenceState>,
    framebuffer_extents: HashMap<u64, vk::Extent2D>,
    descriptor_pools: HashMap<u64, u32>,
    descriptor_bindings: HashMap<u64, u64>,
    swapchains: HashMap<u64, SwapchainState>,
    swapchain_history: Vec<SwapchainRecord>,
    pending: Vec<PendingSubmit>,
    surface: SurfaceSupport,
    suboptimal_presents: u32,
    suboptimal_acquires: u32,
    invalidate_after_acquire: bool,
    draws: Vec<DrawCall>,
    presents: Vec<(vk::SwapchainKHR, u32)>,
    device_idle_waits: u32,
    violations: Vec<String>,
}

impl State {
    fn handle(&mut self, kind: ObjectKind, deps: Vec<u64>) -> u64 {
        let raw = self.next_handle;
        self.next_handle += 1;
        self.objects.insert(raw, Object { kind, deps });
        raw
    }

    fn violation(&mut self, message: String) {
        log::warn!("[headless] {}", message);
        self.violations.push(message);
    }

    fn is_live(&self, raw: u64, kind: ObjectKind) -> bool {
        self.objects.get(&raw).map(|o| o.kind) == Some(kind)
    }

    fn expect_live(&mut self, raw: u64, kind: ObjectKind, during: &str) -> bool {
        if self.is_live(raw, kind) {
            true
        } else {
            self.violation(format!("{}: {:?} {:#x} is not a live object", during, kind, raw));
            false
        }
    }

    fn in_flight(&self, raw: u64) -> bool {
        self.pending.iter().any(|submit| {
            submit.fence == Some(raw)
                || submit.command_buffers.iter().any(|cmd| {
                    *cmd == raw
                        || self
                            .command_buffers
                            .get(cmd)
                            .map(|state| state.commands.iter().any(|c| c.references().contains(&raw)))
                            .unwrap_or(false)
                        || self.descriptor_sets_in(cmd).any(|set| {
                            set == raw || self.descriptor_bindings.get(&set) == Some(&raw)
                        })
                })
        })
    }

    fn descriptor_sets_in(&self, cmd: &u64) -> impl Iterator<Item = u64> + '_ {
        self.command_buffers
            .get(cmd)
            .into_iter()
            .flat_map(|state| state.commands.iter())
            .filter_map(|c| match c {
                Command::BindDescriptorSet { set, .. } => Some(*set),
                _ => None,
            })
    }

    /// Remove an object, recording misuse. Null handles are ignored.
    fn destroy(&mut self, raw: u64, kind: ObjectKind) -> bool {
        if raw == 0 {
            return false;
        }
        if !self.expect_live(raw, kind, "destroy") {
            return false;
        }
        if self.in_flight(raw) {
            self.violation(format!(
                "{:?} {:#x} destroyed while in use by submitted work",
                kind, raw
            ));
        }
        let dependents: Vec<ObjectKind> = self
            .objects
            .values()
            .filter(|o| o.deps.contains(&raw))
            .map(|o| o.kind)
            .collect();
        if !dependents.is_empty() {
            self.violation(format!(
                "{:?} {:#x} destroyed while still referenced by {:?}",
                kind, raw, dependents
            ));
        }
        self.objects.remove(&raw);
        true
    }

    fn complete(&mut self, id: u64) {
        if let Some(pos) = self.pending.iter().position(|s| s.id == id) {
            let submit = self.pending.remove(pos);
            if let Some(fence) = submit.fence {
                if let Some(state) = self.fences.get_mut(&fence) {
                    state.signaled = true;
                    state.pending = None;
                }
            }
        }
    }

    fn complete_where(&mut self, pred: impl Fn(&PendingSubmit) -> bool) {
        let ids: Vec<u64> = self.pending.iter().filter(|s| pred(s)).map(|s| s.id).collect();
        for id in ids {
            self.complete(id);
        }
    }

    fn consume_semaphore(&mut self, raw: u64, during: &str) {
        match self.semaphores.get_mut(&raw) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => self.violation(format!(
                "{}: wait on semaphore {:#x} that has no pending signal",
                during, raw
            )),
            None => self.violation(format!("{}: unknown semaphore {:#x}", during, raw)),
        }
    }

    fn signal_semaphore(&mut self, raw: u64, during: &str) {
        match self.semaphores.get_mut(&raw) {
            Some(signaled) if *signaled => self.violation(format!(
                "{}: semaphore {:#x} signaled twice without a wait",
                during, raw
            )),
            Some(signaled) => *signaled = true,
            None => self.violation(format!("{}: unknown semaphore {:#x}", during, raw)),
        }
    }

    fn record(&mut self, cmd: vk::CommandBuffer, command: Command) {
        let raw = cmd.as_raw();
        let ok = matches!(
            self.command_buffers.get(&raw).map(|c| c.state),
            Some(RecordingState::Recording)
        );
        if !ok {
            self.violation(format!(
                "command recorded into {:#x} outside begin/end",
                raw
            ));
            return;
        }
        if let Some(state) = self.command_buffers.get_mut(&raw) {
            state.commands.push(command);
        }
    }

    fn execute(&mut self, cmd: u64) {
        let commands = match self.command_buffers.get(&cmd) {
            Some(state) => state.commands.clone(),
            None => return,
        };

        let mut framebuffer = 0;
        let mut area = vk::Extent2D::default();
        let mut clear = [0.0; 4];
        let mut in_pass = false;
        let mut pipeline = 0;
        let mut vertex = 0;
        let mut index = (0, vk::IndexType::UINT16);
        let mut set = 0;

        for command in commands {
            for raw in command.references() {
                if !self.objects.contains_key(&raw) {
                    self.violation(format!(
                        "submitted command buffer {:#x} references destroyed object {:#x}",
                        cmd, raw
                    ));
                }
            }
            match command {
                Command::Copy { src, dst, regions } => self.copy(src, dst, &regions),
                Command::BeginRenderPass {
                    framebuffer: fb,
                    area: a,
                    clear_color,
                    ..
                } => {
                    framebuffer = fb;
                    area = a;
                    clear = clear_color;
                    in_pass = true;
                }
                Command::BindPipeline(p) => pipeline = p,
                Command::BindVertexBuffer(b) => vertex = b,
                Command::BindIndexBuffer(b, t) => index = (b, t),
                Command::BindDescriptorSet { set: s, .. } => {
                    set = s;
                    if !self.descriptor_bindings.contains_key(&s) {
                        self.violation(format!("descriptor set {:#x} bound before it was written", s));
                    }
                }
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => {
                    if !in_pass || pipeline == 0 || vertex == 0 || index.0 == 0 {
                        self.violation(format!(
                            "indexed draw in {:#x} without render pass, pipeline or buffers",
                            cmd
                        ));
                    }
                    self.draws.push(DrawCall {
                        command_buffer: vk::CommandBuffer::from_raw(cmd),
                        framebuffer: vk::Framebuffer::from_raw(framebuffer),
                        pipeline: vk::Pipeline::from_raw(pipeline),
                        vertex_buffer: vk::Buffer::from_raw(vertex),
                        index_buffer: vk::Buffer::from_raw(index.0),
                        index_type: index.1,
                        descriptor_set: vk::DescriptorSet::from_raw(set),
                        render_area: area,
                        clear_color: clear,
                        index_count,
                        instance_count,
                        first_index,
                        vertex_offset,
                        first_instance,
                    });
                }
                Command::EndRenderPass => in_pass = false,
            }
        }
    }

    fn copy(&mut self, src: u64, dst: u64, regions: &[vk::BufferCopy]) {
        let (Some(&src_mem), Some(&dst_mem)) =
            (self.buffer_memory.get(&src), self.buffer_memory.get(&dst))
        else {
            self.violation(format!("copy between unbound buffers {:#x} -> {:#x}", src, dst));
            return;
        };
        let src_size = self.buffer_sizes.get(&src).copied().unwrap_or(0);
        let dst_size = self.buffer_sizes.get(&dst).copied().unwrap_or(0);

        for region in regions {
            if region.src_offset + region.size > src_size || region.dst_offset + region.size > dst_size {
                self.violation(format!("copy region {:?} out of bounds", region));
                continue;
            }
            let range = region.src_offset as usize..(region.src_offset + region.size) as usize;
            let bytes = match self.allocations.get(&src_mem) {
                Some(alloc) => alloc.bytes[range].to_vec(),
                None => continue,
            };
            if let Some(alloc) = self.allocations.get_mut(&dst_mem) {
                let start = region.dst_offset as usize;
                alloc.bytes[start..start + bytes.len()].copy_from_slice(&bytes);
            }
        }
    }
}

/// In-process GPU used to exercise the frame core without hardware.
pub struct HeadlessGpu {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    plan: QueuePlan,
    state: Mutex<State>,
}

impl HeadlessGpu {
    /// One universal queue family and the usual three memory types:
    /// device local, host visible + coherent, and both.
    pub fn new() -> Self {
        Self::build(&default_memory_types(), &[universal_family()])
    }

    pub fn with_memory_types(types: &[vk::MemoryPropertyFlags]) -> Self {
        Self::build(types, &[universal_family()])
    }

    /// Custom queue families. Panics when they cannot cover every role,
    /// since a real selector would have rejected such a device.
    pub fn with_queue_families(families: &[QueueFamilyCaps]) -> Self {
        Self::build(&default_memory_types(), families)
    }

    fn build(types: &[vk::MemoryPropertyFlags], families: &[QueueFamilyCaps]) -> Self {
        let indices = assign_queue_families(families);
        let plan = QueuePlan::resolve(indices, families)
            .unwrap_or_else(|| panic!("headless queue families {:?} are incomplete", families));

        Self {
            memory_properties: memory_properties_from(types),
            plan,
            state: Mutex::new(State {
                next_handle: 1,
                next_submit: 1,
                calls: 0,
                objects: HashMap::new(),
                allocations: HashMap::new(),
                buffer_memory: HashMap::new(),
                buffer_sizes: HashMap::new(),
                command_buffers: HashMap::new(),
                semaphores: HashMap::new(),
                fences: HashMap::new(),
                framebuffer_extents: HashMap::new(),
                descriptor_pools: HashMap::new(),
                descriptor_bindings: HashMap::new(),
                swapchains: HashMap::new(),
                swapchain_history: Vec::new(),
                pending: Vec::new(),
                surface: default_surface(vk::Extent2D {
                    width: 800,
                    height: 600,
                }),
                suboptimal_presents: 0,
                suboptimal_acquires: 0,
                invalidate_after_acquire: false,
                draws: Vec::new(),
                presents: Vec::new(),
                device_idle_waits: 0,
                violations: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock();
        state.calls += 1;
        state
    }

    // ---- Test controls ----

    /// Resize the surface. Existing swap chains become out of date.
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        let mut state = self.state.lock();
        let extent = vk::Extent2D { width, height };
        state.surface.capabilities.current_extent = extent;
        if width == 0 || height == 0 {
            state.surface.capabilities.min_image_extent = extent;
            state.surface.capabilities.max_image_extent = extent;
        } else {
            state.surface.capabilities.min_image_extent = vk::Extent2D { width: 1, height: 1 };
            state.surface.capabilities.max_image_extent = vk::Extent2D {
                width: 4096,
                height: 4096,
            };
        }
        Self::invalidate(&mut state);
    }

    /// Replace the whole surface description.
    pub fn set_surface_support(&self, support: SurfaceSupport) {
        let mut state = self.state.lock();
        state.surface = support;
        Self::invalidate(&mut state);
    }

    /// Mark current swap chains out of date without changing the surface,
    /// as a fullscreen mode switch does.
    pub fn invalidate_surface(&self) {
        Self::invalidate(&mut self.state.lock());
    }

    /// The next `count` presents report suboptimal.
    pub fn report_suboptimal(&self, count: u32) {
        self.state.lock().suboptimal_presents = count;
    }

    /// The next `count` successful acquires report suboptimal.
    pub fn report_suboptimal_acquire(&self, count: u32) {
        self.state.lock().suboptimal_acquires = count;
    }

    /// The next acquire succeeds, then the surface changes before the
    /// image is presented.
    pub fn invalidate_after_next_acquire(&self) {
        self.state.lock().invalidate_after_acquire = true;
    }

    fn invalidate(state: &mut State) {
        for swapchain in state.swapchains.values_mut() {
            swapchain.out_of_date = true;
        }
    }

    // ---- Inspection ----

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| o.kind == kind)
            .count()
    }

    /// Number of device calls made so far.
    pub fn call_count(&self) -> u64 {
        self.state.lock().calls
    }

    pub fn draws(&self) -> Vec<DrawCall> {
        self.state.lock().draws.clone()
    }

    pub fn take_draws(&self) -> Vec<DrawCall> {
        std::mem::take(&mut self.state.lock().draws)
    }

    pub fn presents(&self) -> Vec<(vk::SwapchainKHR, u32)> {
        self.state.lock().presents.clone()
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn device_idle_waits(&self) -> u32 {
        self.state.lock().device_idle_waits
    }

    /// Every swap chain created so far, oldest first.
    pub fn swapchain_history(&self) -> Vec<SwapchainRecord> {
        self.state.lock().swapchain_history.clone()
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .map(|f| f.signaled)
            .unwrap_or(false)
    }
}

impl Default for HeadlessGpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Surface with two formats and FIFO + MAILBOX, allowing 2..=3 images.
pub fn default_surface(extent: vk::Extent2D) -> SurfaceSupport {
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: extent,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        },
        formats: vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ],
        present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
    }
}

fn default_memory_types() -> [vk::MemoryPropertyFlags; 3] {
    [
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT,
    ]
}

fn universal_family() -> QueueFamilyCaps {
    QueueFamilyCaps {
        flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        queue_count: 1,
        present: true,
    }
}

fn vk_err(result: vk::Result) -> RenderError {
    RenderError::Vulkan(result)
}

impl Gpu for HeadlessGpu {
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn queue_families(&self) -> QueueFamilyIndices {
        self.plan.indices
    }

    fn queue(&self, role: QueueRole) -> vk::Queue {
        let (family, index) = self.plan.queue_for(role);
        vk::Queue::from_raw(QUEUE_HANDLE_BASE + (family as u64) * 16 + index as u64)
    }

    fn surface_support(&self) -> RenderResult<SurfaceSupport> {
        Ok(self.lock().surface.clone())
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
        fence: vk::Fence,
    ) -> RenderResult<()> {
        let mut state = self.lock();
        let queue_raw = queue.as_raw();

        if submission.wait_semaphores.len() != submission.wait_stages.len() {
            state.violation("submit: wait semaphore and stage counts differ".to_string());
        }
        for semaphore in submission.wait_semaphores {
            state.consume_semaphore(semaphore.as_raw(), "submit");
        }

        let fence_raw = fence.as_raw();
        if fence_raw != 0 {
            match state.fences.get(&fence_raw) {
                Some(f) if f.signaled => state.violation(format!(
                    "submit: fence {:#x} is still signaled, reset it first",
                    fence_raw
                )),
                Some(f) if f.pending.is_some() => state.violation(format!(
                    "submit: fence {:#x} already belongs to pending work",
                    fence_raw
                )),
                Some(_) => {}
                None => state.violation(format!("submit: unknown fence {:#x}", fence_raw)),
            }
        }

        let mut command_buffers = Vec::with_capacity(submission.command_buffers.len());
        for cmd in submission.command_buffers {
            let raw = cmd.as_raw();
            match state.command_buffers.get(&raw).map(|c| c.state) {
                Some(RecordingState::Executable) => {}
                Some(other) => state.violation(format!(
                    "submit: command buffer {:#x} is {:?}, not executable",
                    raw, other
                )),
                None => {
                    state.violation(format!("submit: unknown command buffer {:#x}", raw));
                    continue;
                }
            }
            if state.pending.iter().any(|s| s.command_buffers.contains(&raw)) {
                state.violation(format!(
                    "submit: command buffer {:#x} resubmitted while still pending",
                    raw
                ));
            }
            state.execute(raw);
            command_buffers.push(raw);
        }

        for semaphore in submission.signal_semaphores {
            state.signal_semaphore(semaphore.as_raw(), "submit");
        }

        let id = state.next_submit;
        state.next_submit += 1;
        if let Some(f) = state.fences.get_mut(&fence_raw) {
            f.pending = Some(id);
        }
        state.pending.push(PendingSubmit {
            id,
            queue: queue_raw,
            fence: (fence_raw != 0).then_some(fence_raw),
            command_buffers,
        });
        Ok(())
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> RenderResult<()> {
        let mut state = self.lock();
        let raw = queue.as_raw();
        state.complete_where(|s| s.queue == raw);
        Ok(())
    }

    fn device_wait_idle(&self) -> RenderResult<()> {
        let mut state = self.lock();
        state.device_idle_waits += 1;
        state.complete_where(|_| true);
        Ok(())
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo) -> RenderResult<vk::Buffer> {
        let mut state = self.lock();
        if info.size == 0 {
            state.violation("create_buffer: size must be greater than 0".to_string());
        }
        let raw = state.handle(ObjectKind::Buffer, Vec::new());
        state.buffer_sizes.insert(raw, info.size);
        Ok(vk::Buffer::from_raw(raw))
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.lock();
        let size = state.buffer_sizes.get(&buffer.as_raw()).copied().unwrap_or(0);
        let count = self.memory_properties.memory_type_count;
        vk::MemoryRequirements {
            size: (size + 15) & !15,
            alignment: 16,
            memory_type_bits: if count >= 32 { u32::MAX } else { (1 << count) - 1 },
        }
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo) -> RenderResult<vk::DeviceMemory> {
        let mut state = self.lock();
        if info.memory_type_index >= self.memory_properties.memory_type_count {
            state.violation(format!(
                "allocate_memory: memory type {} does not exist",
                info.memory_type_index
            ));
            return Err(vk_err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let raw = state.handle(ObjectKind::Memory, Vec::new());
        state.allocations.insert(
            raw,
            Allocation {
                bytes: vec![0; info.allocation_size as usize],
                type_index: info.memory_type_index,
                mapped: false,
            },
        );
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn bind_buffer_memory(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) -> RenderResult<()> {
        let mut state = self.lock();
        let (b, m) = (buffer.as_raw(), memory.as_raw());
        if !state.expect_live(b, ObjectKind::Buffer, "bind_buffer_memory")
            || !state.expect_live(m, ObjectKind::Memory, "bind_buffer_memory")
        {
            return Err(vk_err(vk::Result::ERROR_UNKNOWN));
        }
        if state.buffer_memory.insert(b, m).is_some() {
            state.violation(format!("bind_buffer_memory: buffer {:#x} bound twice", b));
        }
        if let Some(object) = state.objects.get_mut(&b) {
            object.deps.push(m);
        }
        Ok(())
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> RenderResult<*mut u8> {
        let mut state = self.lock();
        let raw = memory.as_raw();
        let host_visible = match state.allocations.get(&raw) {
            Some(alloc) => self.memory_properties.memory_types[alloc.type_index as usize]
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            None => {
                state.violation(format!("map_memory: unknown memory {:#x}", raw));
                return Err(vk_err(vk::Result::ERROR_MEMORY_MAP_FAILED));
            }
        };
        if !host_visible {
            state.violation(format!("map_memory: memory {:#x} is not host visible", raw));
            return Err(vk_err(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }

        let mut overflow = false;
        let mut double_map = false;
        let ptr = match state.allocations.get_mut(&raw) {
            Some(alloc) => {
                double_map = alloc.mapped;
                overflow = offset + size > alloc.bytes.len() as vk::DeviceSize;
                if !overflow {
                    alloc.mapped = true;
                }
                // Offset is validated below before anyone writes through it
                unsafe { alloc.bytes.as_mut_ptr().add((offset as usize).min(alloc.bytes.len())) }
            }
            None => std::ptr::null_mut(),
        };
        if double_map {
            state.violation(format!("map_memory: memory {:#x} is already mapped", raw));
        }
        if overflow {
            state.violation(format!("map_memory: range past the end of {:#x}", raw));
            return Err(vk_err(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        Ok(ptr)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.lock();
        let raw = memory.as_raw();
        match state.allocations.get_mut(&raw) {
            Some(alloc) if alloc.mapped => alloc.mapped = false,
            _ => state.violation(format!("unmap_memory: memory {:#x} is not mapped", raw)),
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.lock();
        let raw = buffer.as_raw();
        if state.destroy(raw, ObjectKind::Buffer) {
            state.buffer_memory.remove(&raw);
            state.buffer_sizes.remove(&raw);
        }
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.lock();
        let raw = memory.as_raw();
        if state.destroy(raw, ObjectKind::Memory) {
            state.allocations.remove(&raw);
        }
    }

    fn create_command_pool(&self, info: &vk::CommandPoolCreateInfo) -> RenderResult<vk::CommandPool> {
        let mut state = self.lock();
        let unique = self.plan.indices.unique_families();
        if !unique.contains(&info.queue_family_index) {
            state.violation(format!(
                "create_command_pool: family {} was not requested at device creation",
                info.queue_family_index
            ));
        }
        Ok(vk::CommandPool::from_raw(
            state.handle(ObjectKind::CommandPool, Vec::new()),
        ))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> RenderResult<()> {
        let mut state = self.lock();
        let raw = pool.as_raw();
        if !state.expect_live(raw, ObjectKind::CommandPool, "reset_command_pool") {
            return Err(vk_err(vk::Result::ERROR_UNKNOWN));
        }
        let members: Vec<u64> = state
            .command_buffers
            .iter()
            .filter(|(_, c)| c.pool == raw)
            .map(|(h, _)| *h)
            .collect();
        for cmd in members {
            if state.pending.iter().any(|s| s.command_buffers.contains(&cmd)) {
                state.violation(format!(
                    "reset_command_pool: command buffer {:#x} is still pending",
                    cmd
                ));
            }
            if let Some(c) = state.command_buffers.get_mut(&cmd) {
                c.state = RecordingState::Initial;
                c.commands.clear();
            }
        }
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.lock();
        let raw = pool.as_raw();
        let members: Vec<u64> = state
            .command_buffers
            .iter()
            .filter(|(_, c)| c.pool == raw)
            .map(|(h, _)| *h)
            .collect();
        for cmd in &members {
            if state.in_flight(*cmd) {
                state.violation(format!(
                    "destroy_command_pool: command buffer {:#x} is still pending",
                    cmd
                ));
            }
        }
        // Freeing the pool frees its command buffers
        for cmd in members {
            state.command_buffers.remove(&cmd);
            state.objects.remove(&cmd);
        }
        state.destroy(raw, ObjectKind::CommandPool);
    }

    fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo,
    ) -> RenderResult<Vec<vk::CommandBuffer>> {
        let mut state = self.lock();
        let pool = info.command_pool.as_raw();
        if !state.expect_live(pool, ObjectKind::CommandPool, "allocate_command_buffers") {
            return Err(vk_err(vk::Result::ERROR_UNKNOWN));
        }
        let mut out = Vec::with_capacity(info.command_buffer_count as usize);
        for _ in 0..info.command_buffer_count {
            let raw = state.handle(ObjectKind::CommandBuffer, Vec::new());
            state.command_buffers.insert(
                raw,
                CommandBufferState {
                    pool,
                    state: RecordingState::Initial,
                    commands: Vec::new(),
                },
            );
            out.push(vk::CommandBuffer::from_raw(raw));
        }
        Ok(out)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.lock();
        for cmd in buffers {
            let raw = cmd.as_raw();
            if state.command_buffers.get(&raw).map(|c| c.pool) != Some(pool.as_raw()) {
                state.violation(format!(
                    "free_command_buffers: {:#x} does not belong to pool {:#x}",
                    raw,
                    pool.as_raw()
                ));
                continue;
            }
            if state.destroy(raw, ObjectKind::CommandBuffer) {
                state.command_buffers.remove(&raw);
            }
        }
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _info: &vk::CommandBufferBeginInfo,
    ) -> RenderResult<()> {
        let mut state = self.lock();
        let raw = cmd.as_raw();
        if state.pending.iter().any(|s| s.command_buffers.contains(&raw)) {
            state.violation(format!(
                "begin_command_buffer: {:#x} re-recorded while pending",
                raw
            ));
        }
        match state.command_buffers.get_mut(&raw) {
            Some(c) => {
                c.state = RecordingState::Recording;
                c.commands.clear();
                Ok(())
            }
            None => {
                state.violation(format!("begin_command_buffer: unknown {:#x}", raw));
                Err(vk_err(vk::Result::ERROR_UNKNOWN))
            }
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> RenderResult<()> {
        let mut state = self.lock();
        let raw = cmd.as_raw();
        let in_pass = state
            .command_buffers
            .get(&raw)
            .map(|c| {
                c.commands.iter().fold(false, |open, command| match command {
                    Command::BeginRenderPass { .. } => true,
                    Command::EndRenderPass => false,
                    _ => open,
                })
            })
            .unwrap_or(false);
        if in_pass {
            state.violation(format!("end_command_buffer: {:#x} inside a render pass", raw));
        }
        match state.command_buffers.get_mut(&raw) {
            Some(c) if c.state == RecordingState::Recording => {
                c.state = RecordingState::Executable;
                Ok(())
            }
            _ => {
                state.violation(format!("end_command_buffer: {:#x} is not recording", raw));
                Err(vk_err(vk::Result::ERROR_UNKNOWN))
            }
        }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.lock().record(
            cmd,
            Command::Copy {
                src: src.as_raw(),
                dst: dst.as_raw(),
                regions: regions.to_vec(),
            },
        );
    }

    fn cmd_begin_render_pass(&self, cmd: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        let mut state = self.lock();
        let clear_color = if info.clear_value_count > 0 && !info.p_clear_values.is_null() {
            unsafe { (*info.p_clear_values).color.float32 }
        } else {
            [0.0; 4]
        };
        let framebuffer = info.framebuffer.as_raw();
        if let Some(extent) = state.framebuffer_extents.get(&framebuffer).copied() {
            let area = info.render_area.extent;
            if area.width > extent.width || area.height > extent.height {
                state.violation(format!(
                    "render area {:?} exceeds framebuffer {:?}",
                    area, extent
                ));
            }
        }
        state.record(
            cmd,
            Command::BeginRenderPass {
                render_pass: info.render_pass.as_raw(),
                framebuffer,
                area: info.render_area.extent,
                clear_color,
            },
        );
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.lock().record(cmd, Command::BindPipeline(pipeline.as_raw()));
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer, _offset: vk::DeviceSize) {
        self.lock().record(cmd, Command::BindVertexBuffer(buffer.as_raw()));
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.lock()
            .record(cmd, Command::BindIndexBuffer(buffer.as_raw(), index_type));
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    ) {
        self.lock().record(
            cmd,
            Command::BindDescriptorSet {
                layout: layout.as_raw(),
                set: set.as_raw(),
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.lock().record(
            cmd,
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            },
        );
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.lock().record(cmd, Command::EndRenderPass);
    }

    fn create_semaphore(&self) -> RenderResult<vk::Semaphore> {
        let mut state = self.lock();
        let raw = state.handle(ObjectKind::Semaphore, Vec::new());
        state.semaphores.insert(raw, false);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.lock();
        let raw = semaphore.as_raw();
        if state.destroy(raw, ObjectKind::Semaphore) {
            state.semaphores.remove(&raw);
        }
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence> {
        let mut state = self.lock();
        let raw = state.handle(ObjectKind::Fence, Vec::new());
        state.fences.insert(
            raw,
            FenceState {
                signaled,
                pending: None,
            },
        );
        Ok(vk::Fence::from_raw(raw))
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> RenderResult<()> {
        let mut state = self.lock();
        let raw = fence.as_raw();
        let (signaled, pending) = match state.fences.get(&raw) {
            Some(f) => (f.signaled, f.pending),
            None => {
                state.violation(format!("wait_for_fence: unknown fence {:#x}", raw));
                return Err(vk_err(vk::Result::ERROR_UNKNOWN));
            }
        };
        if signaled {
            return Ok(());
        }
        match pending {
            Some(id) => {
                state.complete(id);
                Ok(())
            }
            None => {
                state.violation(format!(
                    "wait_for_fence: fence {:#x} is unsignaled with no pending work",
                    raw
                ));
                Err(vk_err(vk::Result::TIMEOUT))
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()> {
        let mut state = self.lock();
        let raw = fence.as_raw();
        let pending = state.fences.get(&raw).map(|f| f.pending.is_some());
        match pending {
            Some(true) => state.violation(format!(
                "reset_fence: fence {:#x} belongs to pending work",
                raw
            )),
            Some(false) => {}
            None => {
                state.violation(format!("reset_fence: unknown fence {:#x}", raw));
                return Err(vk_err(vk::Result::ERROR_UNKNOWN));
            }
        }
        if let Some(f) = state.fences.get_mut(&raw) {
            f.signaled = false;
        }
        Ok(())
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.lock();
        let raw = fence.as_raw();
        if state.destroy(raw, ObjectKind::Fence) {
            state.fences.remove(&raw);
        }
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> RenderResult<vk::SwapchainKHR> {
        let mut state = self.lock();
        let extent = info.image_extent;
        let caps = state.surface.capabilities;

        if extent.width == 0 || extent.height == 0 {
            state.violation(format!("create_swapchain: zero extent {:?}", extent));
            return Err(vk_err(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        if extent.width < caps.min_image_extent.width
            || extent.height < caps.min_image_extent.height
            || extent.width > caps.max_image_extent.width
            || extent.height > caps.max_image_extent.height
        {
            state.violation(format!(
                "create_swapchain: extent {:?} outside surface limits",
                extent
            ));
        }
        if info.min_image_count < caps.min_image_count
            || (caps.max_image_count > 0 && info.min_image_count > caps.max_image_count)
        {
            state.violation(format!(
                "create_swapchain: image count {} outside surface limits",
                info.min_image_count
            ));
        }

        let old = info.old_swapchain.as_raw();
        let others = state.swapchains.keys().any(|&h| h != old);
        if others {
            state.violation("create_swapchain: surface already has a live swap chain".to_string());
        }
        if let Some(old_state) = state.swapchains.get_mut(&old) {
            old_state.out_of_date = true;
        }

        let raw = state.handle(ObjectKind::Swapchain, Vec::new());
        let images = (0..info.min_image_count)
            .map(|_| state.handle(ObjectKind::Image, vec![]))
            .collect::<Vec<_>>();
        let record = SwapchainRecord {
            handle: vk::SwapchainKHR::from_raw(raw),
            extent,
            format: info.image_format,
            color_space: info.image_color_space,
            present_mode: info.present_mode,
            sharing_mode: info.image_sharing_mode,
            image_count: info.min_image_count,
        };
        state.swapchain_history.push(record);
        state.swapchains.insert(
            raw,
            SwapchainState {
                images,
                next_image: 0,
                acquired: HashSet::new(),
                out_of_date: false,
            },
        );
        Ok(record.handle)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RenderResult<Vec<vk::Image>> {
        let mut state = self.lock();
        let raw = swapchain.as_raw();
        match state.swapchains.get(&raw) {
            Some(s) => Ok(s.images.iter().map(|&i| vk::Image::from_raw(i)).collect()),
            None => {
                state.violation(format!("swapchain_images: unknown swap chain {:#x}", raw));
                Err(vk_err(vk::Result::ERROR_UNKNOWN))
            }
        }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.lock();
        let raw = swapchain.as_raw();
        let images = match state.swapchains.get(&raw) {
            Some(s) => s.images.clone(),
            None => Vec::new(),
        };
        // Presentation images go away with their swap chain, but views of
        // them must already be gone
        for image in &images {
            state.destroy(*image, ObjectKind::Image);
        }
        if state.destroy(raw, ObjectKind::Swapchain) {
            state.swapchains.remove(&raw);
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        let mut state = self.lock();
        let raw = swapchain.as_raw();
        let (out_of_date, index) = match state.swapchains.get_mut(&raw) {
            Some(s) => {
                if s.out_of_date {
                    (true, 0)
                } else {
                    let index = s.next_image as u32;
                    s.next_image = (s.next_image + 1) % s.images.len().max(1);
                    (false, index)
                }
            }
            None => {
                state.violation(format!("acquire_next_image: unknown swap chain {:#x}", raw));
                return Err(vk_err(vk::Result::ERROR_SURFACE_LOST_KHR));
            }
        };
        if out_of_date {
            return Ok(AcquireOutcome::OutOfDate);
        }

        let double = state
            .swapchains
            .get_mut(&raw)
            .map(|s| !s.acquired.insert(index))
            .unwrap_or(false);
        if double {
            state.violation(format!(
                "acquire_next_image: image {} acquired again before it was presented",
                index
            ));
        }
        state.signal_semaphore(semaphore.as_raw(), "acquire_next_image");

        if std::mem::take(&mut state.invalidate_after_acquire) {
            Self::invalidate(&mut state);
        }
        let suboptimal = state.suboptimal_acquires > 0;
        if suboptimal {
            state.suboptimal_acquires -= 1;
        }
        Ok(AcquireOutcome::Image { index, suboptimal })
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> RenderResult<PresentOutcome> {
        let mut state = self.lock();
        let raw = swapchain.as_raw();
        state.consume_semaphore(wait_semaphore.as_raw(), "queue_present");

        let (acquired, out_of_date) = match state.swapchains.get_mut(&raw) {
            Some(s) => (s.acquired.remove(&image_index), s.out_of_date),
            None => {
                state.violation(format!("queue_present: unknown swap chain {:#x}", raw));
                return Err(vk_err(vk::Result::ERROR_SURFACE_LOST_KHR));
            }
        };
        if !acquired {
            state.violation(format!(
                "queue_present: image {} was not acquired",
                image_index
            ));
        }
        if out_of_date {
            return Ok(PresentOutcome::OutOfDate);
        }

        state.presents.push((swapchain, image_index));
        if state.suboptimal_presents > 0 {
            state.suboptimal_presents -= 1;
            return Ok(PresentOutcome::Suboptimal);
        }
        Ok(PresentOutcome::Presented)
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> RenderResult<vk::ImageView> {
        let mut state = self.lock();
        let image = info.image.as_raw();
        if !state.expect_live(image, ObjectKind::Image, "create_image_view") {
            return Err(vk_err(vk::Result::ERROR_UNKNOWN));
        }
        Ok(vk::ImageView::from_raw(
            state.handle(ObjectKind::ImageView, vec![image]),
        ))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.lock().destroy(view.as_raw(), ObjectKind::ImageView);
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> RenderResult<vk::RenderPass> {
        let mut state = self.lock();
        if info.attachment_count == 0 {
            state.violation("create_render_pass: no attachments".to_string());
        }
        Ok(vk::RenderPass::from_raw(
            state.handle(ObjectKind::RenderPass, Vec::new()),
        ))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.lock().destroy(render_pass.as_raw(), ObjectKind::RenderPass);
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> RenderResult<vk::Framebuffer> {
        let mut state = self.lock();
        let render_pass = info.render_pass.as_raw();
        let mut deps = vec![render_pass];
        state.expect_live(render_pass, ObjectKind::RenderPass, "create_framebuffer");

        let attachments = if info.attachment_count > 0 && !info.p_attachments.is_null() {
            unsafe { std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize) }
        } else {
            &[]
        };
        for view in attachments {
            state.expect_live(view.as_raw(), ObjectKind::ImageView, "create_framebuffer");
            deps.push(view.as_raw());
        }

        let raw = state.handle(ObjectKind::Framebuffer, deps);
        state.framebuffer_extents.insert(
            raw,
            vk::Extent2D {
                width: info.width,
                height: info.height,
            },
        );
        Ok(vk::Framebuffer::from_raw(raw))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.lock();
        let raw = framebuffer.as_raw();
        if state.destroy(raw, ObjectKind::Framebuffer) {
            state.framebuffer_extents.remove(&raw);
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> RenderResult<vk::ShaderModule> {
        let mut state = self.lock();
        if code.first() != Some(&SPIRV_MAGIC) {
            state.violation("create_shader_module: code is not SPIR-V".to_string());
            return Err(vk_err(vk::Result::ERROR_INVALID_SHADER_NV));
        }
        Ok(vk::ShaderModule::from_raw(
            state.handle(ObjectKind::ShaderModule, Vec::new()),
        ))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.lock().destroy(module.as_raw(), ObjectKind::ShaderModule);
    }

    fn create_descriptor_set_layout(
        &self,
        _info: &vk::DescriptorSetLayoutCreateInfo,
    ) -> RenderResult<vk::DescriptorSetLayout> {
        let mut state = self.lock();
        Ok(vk::DescriptorSetLayout::from_raw(
            state.handle(ObjectKind::DescriptorSetLayout, Vec::new()),
        ))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.lock()
            .destroy(layout.as_raw(), ObjectKind::DescriptorSetLayout);
    }

    fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo,
    ) -> RenderResult<vk::PipelineLayout> {
        let mut state = self.lock();
        let layouts = if info.set_layout_count > 0 && !info.p_set_layouts.is_null() {
            unsafe { std::slice::from_raw_parts(info.p_set_layouts, info.set_layout_count as usize) }
        } else {
            &[]
        };
        for layout in layouts {
            state.expect_live(
                layout.as_raw(),
                ObjectKind::DescriptorSetLayout,
                "create_pipeline_layout",
            );
        }
        Ok(vk::PipelineLayout::from_raw(
            state.handle(ObjectKind::PipelineLayout, Vec::new()),
        ))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.lock().destroy(layout.as_raw(), ObjectKind::PipelineLayout);
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo,
    ) -> RenderResult<vk::Pipeline> {
        let mut state = self.lock();
        let render_pass = info.render_pass.as_raw();
        let layout = info.layout.as_raw();
        state.expect_live(render_pass, ObjectKind::RenderPass, "create_graphics_pipeline");
        state.expect_live(layout, ObjectKind::PipelineLayout, "create_graphics_pipeline");

        let stages = if info.stage_count > 0 && !info.p_stages.is_null() {
            unsafe { std::slice::from_raw_parts(info.p_stages, info.stage_count as usize) }
        } else {
            &[]
        };
        for stage in stages {
            state.expect_live(
                stage.module.as_raw(),
                ObjectKind::ShaderModule,
                "create_graphics_pipeline",
            );
        }

        Ok(vk::Pipeline::from_raw(
            state.handle(ObjectKind::Pipeline, vec![render_pass, layout]),
        ))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.lock().destroy(pipeline.as_raw(), ObjectKind::Pipeline);
    }

    fn create_descriptor_pool(
        &self,
        info: &vk::DescriptorPoolCreateInfo,
    ) -> RenderResult<vk::DescriptorPool> {
        let mut state = self.lock();
        let raw = state.handle(ObjectKind::DescriptorPool, Vec::new());
        state.descriptor_pools.insert(raw, info.max_sets);
        Ok(vk::DescriptorPool::from_raw(raw))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.lock();
        let raw = pool.as_raw();
        let sets: Vec<u64> = state
            .objects
            .iter()
            .filter(|(_, o)| o.kind == ObjectKind::DescriptorSet && o.deps.contains(&raw))
            .map(|(h, _)| *h)
            .collect();
        for set in sets {
            if state.in_flight(set) {
                state.violation(format!(
                    "destroy_descriptor_pool: set {:#x} is used by pending work",
                    set
                ));
            }
            state.objects.remove(&set);
            state.descriptor_bindings.remove(&set);
        }
        if state.destroy(raw, ObjectKind::DescriptorPool) {
            state.descriptor_pools.remove(&raw);
        }
    }

    fn allocate_descriptor_sets(
        &self,
        info: &vk::DescriptorSetAllocateInfo,
    ) -> RenderResult<Vec<vk::DescriptorSet>> {
        let mut state = self.lock();
        let pool = info.descriptor_pool.as_raw();
        let Some(&max_sets) = state.descriptor_pools.get(&pool) else {
            state.violation(format!("allocate_descriptor_sets: unknown pool {:#x}", pool));
            return Err(vk_err(vk::Result::ERROR_UNKNOWN));
        };
        let used = state
            .objects
            .values()
            .filter(|o| o.kind == ObjectKind::DescriptorSet && o.deps.contains(&pool))
            .count() as u32;
        if used + info.descriptor_set_count > max_sets {
            return Err(vk_err(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        Ok((0..info.descriptor_set_count)
            .map(|_| vk::DescriptorSet::from_raw(state.handle(ObjectKind::DescriptorSet, vec![pool])))
            .collect())
    }

    fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet]) {
        let mut state = self.lock();
        for write in writes {
            let set = write.dst_set.as_raw();
            if !state.expect_live(set, ObjectKind::DescriptorSet, "update_descriptor_sets") {
                continue;
            }
            if write.descriptor_count == 0 || write.p_buffer_info.is_null() {
                continue;
            }
            let infos =
                unsafe { std::slice::from_raw_parts(write.p_buffer_info, write.descriptor_count as usize) };
            for info in infos {
                let buffer = info.buffer.as_raw();
                if state.expect_live(buffer, ObjectKind::Buffer, "update_descriptor_sets") {
                    state.descriptor_bindings.insert(set, buffer);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_signal_only_when_waited_on() {
        let gpu = HeadlessGpu::new();
        let fence = gpu.create_fence(false).unwrap();
        let queue = gpu.queue(QueueRole::Graphics);

        gpu.queue_submit(queue, &Submission::commands(&[]), fence).unwrap();
        assert_eq!(gpu.pending_submissions(), 1);
        assert!(!gpu.is_fence_signaled(fence));

        gpu.wait_for_fence(fence, u64::MAX).unwrap();
        assert!(gpu.is_fence_signaled(fence));
        assert_eq!(gpu.pending_submissions(), 0);

        gpu.destroy_fence(fence);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn submitting_with_a_signaled_fence_is_a_violation() {
        let gpu = HeadlessGpu::new();
        let fence = gpu.create_fence(true).unwrap();
        gpu.queue_submit(gpu.queue(QueueRole::Graphics), &Submission::commands(&[]), fence)
            .unwrap();
        assert_eq!(gpu.violations().len(), 1);
    }

    #[test]
    fn waiting_on_an_unsignaled_semaphore_is_a_violation() {
        let gpu = HeadlessGpu::new();
        let semaphore = gpu.create_semaphore().unwrap();
        let submission = Submission {
            wait_semaphores: &[semaphore],
            wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            command_buffers: &[],
            signal_semaphores: &[],
        };
        gpu.queue_submit(gpu.queue(QueueRole::Graphics), &submission, vk::Fence::null())
            .unwrap();
        assert!(gpu.violations()[0].contains("no pending signal"));
    }

    #[test]
    fn destroying_a_render_pass_with_live_framebuffers_is_a_violation() {
        let gpu = HeadlessGpu::new();
        let attachment = vk::AttachmentDescription::default();
        let render_pass = gpu
            .create_render_pass(
                &vk::RenderPassCreateInfo::builder().attachments(std::slice::from_ref(&attachment)),
            )
            .unwrap();
        let framebuffer = gpu
            .create_framebuffer(
                &vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .width(4)
                    .height(4)
                    .layers(1),
            )
            .unwrap();

        gpu.destroy_render_pass(render_pass);
        assert!(gpu.violations()[0].contains("still referenced"));
        gpu.destroy_framebuffer(framebuffer);
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn destroying_unknown_handles_is_a_violation() {
        let gpu = HeadlessGpu::new();
        gpu.destroy_buffer(vk::Buffer::from_raw(999));
        assert_eq!(gpu.violations().len(), 1);

        // Null handles are ignored like in Vulkan
        gpu.destroy_buffer(vk::Buffer::null());
        assert_eq!(gpu.violations().len(), 1);
    }

    #[test]
    fn acquire_cycles_images_and_reports_out_of_date_after_resize() {
        let gpu = HeadlessGpu::new();
        let info = vk::SwapchainCreateInfoKHR::builder()
            .min_image_count(2)
            .image_extent(vk::Extent2D {
                width: 800,
                height: 600,
            });
        let swapchain = gpu.create_swapchain(&info).unwrap();
        let semaphores = [gpu.create_semaphore().unwrap(), gpu.create_semaphore().unwrap()];

        for (expected, semaphore) in [0u32, 1].into_iter().zip(semaphores) {
            let outcome = gpu.acquire_next_image(swapchain, u64::MAX, semaphore).unwrap();
            assert_eq!(
                outcome,
                AcquireOutcome::Image {
                    index: expected,
                    suboptimal: false
                }
            );
        }

        gpu.set_surface_extent(1024, 768);
        assert_eq!(
            gpu.acquire_next_image(swapchain, u64::MAX, semaphores[0]).unwrap(),
            AcquireOutcome::OutOfDate
        );
    }

    #[test]
    fn acquire_controls_report_suboptimal_and_late_invalidation() {
        let gpu = HeadlessGpu::new();
        let info = vk::SwapchainCreateInfoKHR::builder()
            .min_image_count(2)
            .image_extent(vk::Extent2D {
                width: 800,
                height: 600,
            });
        let swapchain = gpu.create_swapchain(&info).unwrap();
        let semaphore = gpu.create_semaphore().unwrap();

        gpu.report_suboptimal_acquire(1);
        gpu.invalidate_after_next_acquire();
        assert_eq!(
            gpu.acquire_next_image(swapchain, u64::MAX, semaphore).unwrap(),
            AcquireOutcome::Image {
                index: 0,
                suboptimal: true
            }
        );

        // The acquired image can still be handed back, but not shown
        assert_eq!(
            gpu.queue_present(gpu.queue(QueueRole::Present), swapchain, 0, semaphore)
                .unwrap(),
            PresentOutcome::OutOfDate
        );
        assert!(gpu.presents().is_empty());
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn failed_map_leaves_memory_unmapped() {
        let gpu = HeadlessGpu::new();
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let type_index = (0..gpu.memory_properties().memory_type_count)
            .find(|&i| {
                gpu.memory_properties().memory_types[i as usize]
                    .property_flags
                    .contains(host)
            })
            .unwrap();
        let memory = gpu
            .allocate_memory(
                &vk::MemoryAllocateInfo::builder()
                    .allocation_size(16)
                    .memory_type_index(type_index),
            )
            .unwrap();

        assert!(gpu.map_memory(memory, 8, 16).is_err());
        assert_eq!(gpu.violations().len(), 1);

        // No "already mapped" complaint after the failed attempt
        assert!(gpu.map_memory(memory, 0, 16).is_ok());
        gpu.unmap_memory(memory);
        assert_eq!(gpu.violations().len(), 1);

        gpu.free_memory(memory);
        assert_eq!(gpu.live_objects(), 0);
    }
}

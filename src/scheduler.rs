// Frame scheduler - drives the per-frame acquire/submit/present cycle
//
// One sync slot per swap chain image. A slot goes
// Idle -> Acquiring -> WaitingFence -> RecordingUniforms -> Submitted ->
// Presenting -> Idle, and the slot index advances after every present.

use std::sync::Arc;

use ash::vk;

use crate::backend::commands::DrawSource;
use crate::backend::gpu::{AcquireOutcome, Gpu, Submission};
use crate::backend::queue::QueueRole;
use crate::backend::swapchain::{Recreate, SwapChainManager};
use crate::backend::sync::{FrameSyncSet, SlotPhase};
use crate::error::RenderResult;

/// Loop state that survives between frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSchedulerState {
    pub current_slot: usize,
    pub slot_count: usize,
    pub frames_presented: u64,
    /// Model rotation in degrees.
    pub angle: f32,
    /// Degrees per second.
    pub rotation_speed: f32,
}

impl FrameSchedulerState {
    pub fn new(slot_count: usize, rotation_speed: f32) -> Self {
        Self {
            current_slot: 0,
            slot_count,
            frames_presented: 0,
            angle: 0.0,
            rotation_speed,
        }
    }

    /// Move to the next slot after a present.
    pub fn advance(&mut self) {
        self.frames_presented += 1;
        if self.slot_count > 0 {
            self.current_slot = (self.current_slot + 1) % self.slot_count;
        }
    }

    pub fn tick(&mut self, dt: f32) {
        self.angle = (self.angle + self.rotation_speed * dt) % 360.0;
    }

    /// Adopt a new slot count. The slot index restarts when it changes.
    pub fn resize(&mut self, slot_count: usize) {
        if slot_count != self.slot_count {
            self.slot_count = slot_count;
            self.current_slot = 0;
        }
    }
}

/// Per-frame hook: a draw source that also refreshes per-image data right
/// before that image's command buffer is submitted.
pub trait FrameSource: DrawSource {
    fn update(
        &mut self,
        image_index: u32,
        extent: vk::Extent2D,
        state: &FrameSchedulerState,
    ) -> RenderResult<()>;
}

/// What one call to `draw_frame` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Submitted and handed to present, then the swap chain was rebuilt.
    /// The present itself may have been dropped as out of date.
    PresentedAndRecreated,
    /// Nothing was submitted; the swap chain was rebuilt instead.
    Recreated,
    /// The surface has zero size. Nothing was submitted.
    Deferred,
}

pub struct FrameScheduler {
    gpu: Arc<dyn Gpu>,
    sync: FrameSyncSet,
    /// Fence of the submission that last rendered to each swap chain image.
    images_in_flight: Vec<vk::Fence>,
    state: FrameSchedulerState,
    graphics_queue: vk::Queue,
    recreate_requested: bool,
}

impl FrameScheduler {
    pub fn new(gpu: Arc<dyn Gpu>, image_count: usize, rotation_speed: f32) -> RenderResult<Self> {
        let sync = FrameSyncSet::new(gpu.as_ref(), image_count)?;
        let graphics_queue = gpu.queue(QueueRole::Graphics);
        Ok(Self {
            gpu,
            sync,
            images_in_flight: vec![vk::Fence::null(); image_count],
            state: FrameSchedulerState::new(image_count, rotation_speed),
            graphics_queue,
            recreate_requested: false,
        })
    }

    pub fn state(&self) -> &FrameSchedulerState {
        &self.state
    }

    pub fn slot_phase(&self, slot: usize) -> SlotPhase {
        self.sync.phase(slot)
    }

    /// Rebuild the swap chain at the start of the next frame.
    pub fn request_recreate(&mut self) {
        self.recreate_requested = true;
    }

    pub fn recreate_pending(&self) -> bool {
        self.recreate_requested
    }

    /// Run one frame. `extent` is the current window size and `dt` the
    /// time since the previous frame in seconds.
    pub fn draw_frame<S: FrameSource>(
        &mut self,
        swapchain: &mut SwapChainManager,
        source: &mut S,
        extent: vk::Extent2D,
        dt: f32,
    ) -> RenderResult<FrameOutcome> {
        if self.recreate_requested || !swapchain.is_ready() {
            return self.recreate(swapchain, source, extent);
        }

        let slot = self.state.current_slot;
        let sync = *self.sync.get(slot);

        // 1. Acquire
        self.sync.set_phase(slot, SlotPhase::Acquiring);
        let image_index = match swapchain.acquire_next_image(sync.image_available)? {
            AcquireOutcome::Image { index, suboptimal } => {
                if suboptimal {
                    self.recreate_requested = true;
                }
                index
            }
            AcquireOutcome::OutOfDate => {
                self.sync.set_phase(slot, SlotPhase::Idle);
                return self.recreate(swapchain, source, extent);
            }
        };
        let image = image_index as usize;

        // 2. Wait until the slot, and whoever last drew this image, is done
        self.sync.set_phase(slot, SlotPhase::WaitingFence);
        self.gpu.wait_for_fence(sync.in_flight_fence, u64::MAX)?;
        let previous = self.images_in_flight[image];
        if previous != vk::Fence::null() && previous != sync.in_flight_fence {
            self.gpu.wait_for_fence(previous, u64::MAX)?;
        }
        self.images_in_flight[image] = sync.in_flight_fence;

        // 3. Per-image uniforms
        self.sync.set_phase(slot, SlotPhase::RecordingUniforms);
        self.state.tick(dt);
        source.update(image_index, swapchain.extent(), &self.state)?;

        // 4. Submit the prerecorded command buffer for this image
        self.gpu.reset_fence(sync.in_flight_fence)?;
        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [swapchain.command_buffer(image_index)];
        let signal_semaphores = [sync.render_finished];
        let submission = Submission {
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            command_buffers: &command_buffers,
            signal_semaphores: &signal_semaphores,
        };
        self.gpu
            .queue_submit(self.graphics_queue, &submission, sync.in_flight_fence)?;
        self.sync.set_phase(slot, SlotPhase::Submitted);

        // 5. Present
        self.sync.set_phase(slot, SlotPhase::Presenting);
        let presented = swapchain.present(image_index, sync.render_finished)?;
        self.sync.set_phase(slot, SlotPhase::Idle);
        self.state.advance();

        if presented.needs_recreate() {
            log::debug!("Present reported {:?}, recreating swap chain", presented);
            return match self.recreate(swapchain, source, extent)? {
                FrameOutcome::Recreated => Ok(FrameOutcome::PresentedAndRecreated),
                other => Ok(other),
            };
        }
        Ok(FrameOutcome::Presented)
    }

    fn recreate<S: FrameSource>(
        &mut self,
        swapchain: &mut SwapChainManager,
        source: &mut S,
        extent: vk::Extent2D,
    ) -> RenderResult<FrameOutcome> {
        match swapchain.recreate(extent, source)? {
            Recreate::Deferred => {
                self.recreate_requested = true;
                Ok(FrameOutcome::Deferred)
            }
            Recreate::Rebuilt => {
                self.recreate_requested = false;
                self.adopt_image_count(swapchain.image_count())?;
                Ok(FrameOutcome::Recreated)
            }
        }
    }

    /// Called right after a rebuild, while the device is idle.
    fn adopt_image_count(&mut self, image_count: usize) -> RenderResult<()> {
        if image_count != self.sync.len() {
            log::debug!(
                "Image count changed {} -> {}, rebuilding frame sync",
                self.sync.len(),
                image_count
            );
            self.sync.destroy(self.gpu.as_ref());
            self.sync = FrameSyncSet::new(self.gpu.as_ref(), image_count)?;
            self.state.resize(image_count);
        }
        self.images_in_flight = vec![vk::Fence::null(); image_count];
        Ok(())
    }

    /// Wait for every distinct queue to drain.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        let mut queues: Vec<vk::Queue> = Vec::with_capacity(QueueRole::ALL.len());
        for role in QueueRole::ALL {
            let queue = self.gpu.queue(role);
            if !queues.contains(&queue) {
                queues.push(queue);
            }
        }
        for queue in queues {
            self.gpu.queue_wait_idle(queue)?;
        }
        log::info!(
            "Frame scheduler stopped after {} frames",
            self.state.frames_presented
        );
        Ok(())
    }

    /// Release the sync objects. Queues must be idle.
    pub fn destroy(&mut self) {
        self.sync.destroy(self.gpu.as_ref());
        self.images_in_flight.clear();
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_wraps_after_slot_count_advances() {
        let mut state = FrameSchedulerState::new(3, 90.0);
        for _ in 0..3 {
            state.advance();
        }
        assert_eq!(state.current_slot, 0);
        assert_eq!(state.frames_presented, 3);
    }

    #[test]
    fn angle_advances_with_time_and_wraps() {
        let mut state = FrameSchedulerState::new(2, 90.0);
        state.tick(0.5);
        assert!((state.angle - 45.0).abs() < 1e-4);
        state.tick(4.0);
        assert!((state.angle - 45.0).abs() < 1e-3);
    }

    #[test]
    fn resize_restarts_slot_only_on_change() {
        let mut state = FrameSchedulerState::new(3, 0.0);
        state.advance();
        state.resize(3);
        assert_eq!(state.current_slot, 1);
        state.resize(2);
        assert_eq!((state.current_slot, state.slot_count), (0, 2));
    }
}

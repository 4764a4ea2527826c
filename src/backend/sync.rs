// Synchronization primitives
//
// One FrameSync per in-flight slot. Semaphores order GPU work (acquire ->
// render -> present), the fence lets the CPU know a slot's last submission
// has finished.

use ash::vk;

use super::gpu::Gpu;
use crate::error::RenderResult;

/// Where a slot is in its per-frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPhase {
    #[default]
    Idle,
    Acquiring,
    WaitingFence,
    RecordingUniforms,
    Submitted,
    Presenting,
}

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(gpu: &dyn Gpu) -> RenderResult<Self> {
        let image_available = gpu.create_semaphore()?;
        let render_finished = match gpu.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                gpu.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        // Start signaled so the first wait on each slot returns immediately
        let in_flight_fence = match gpu.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                gpu.destroy_semaphore(image_available);
                gpu.destroy_semaphore(render_finished);
                return Err(e);
            }
        };

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    pub fn destroy(&self, gpu: &dyn Gpu) {
        gpu.destroy_semaphore(self.image_available);
        gpu.destroy_semaphore(self.render_finished);
        gpu.destroy_fence(self.in_flight_fence);
    }
}

/// The slot array, sized to the swap chain image count.
#[derive(Debug, Default)]
pub struct FrameSyncSet {
    slots: Vec<FrameSync>,
    phases: Vec<SlotPhase>,
}

impl FrameSyncSet {
    pub fn new(gpu: &dyn Gpu, count: usize) -> RenderResult<Self> {
        let mut set = Self::default();
        for _ in 0..count {
            match FrameSync::new(gpu) {
                Ok(sync) => {
                    set.slots.push(sync);
                    set.phases.push(SlotPhase::Idle);
                }
                Err(e) => {
                    set.destroy(gpu);
                    return Err(e);
                }
            }
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> &FrameSync {
        &self.slots[slot]
    }

    pub fn phase(&self, slot: usize) -> SlotPhase {
        self.phases[slot]
    }

    pub fn set_phase(&mut self, slot: usize, phase: SlotPhase) {
        log::trace!("slot {}: {:?} -> {:?}", slot, self.phases[slot], phase);
        self.phases[slot] = phase;
    }

    pub fn fences(&self) -> impl Iterator<Item = vk::Fence> + '_ {
        self.slots.iter().map(|s| s.in_flight_fence)
    }

    pub fn destroy(&mut self, gpu: &dyn Gpu) {
        for sync in self.slots.drain(..) {
            sync.destroy(gpu);
        }
        self.phases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessGpu, ObjectKind};

    #[test]
    fn slots_start_idle_with_signaled_fences() {
        let gpu = HeadlessGpu::new();
        let mut set = FrameSyncSet::new(&gpu, 3).unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(gpu.live_count(ObjectKind::Semaphore), 6);
        assert!(set.fences().all(|f| gpu.is_fence_signaled(f)));
        assert!((0..3).all(|i| set.phase(i) == SlotPhase::Idle));

        set.destroy(&gpu);
        assert!(set.is_empty());
        assert_eq!(gpu.live_objects(), 0);
    }
}

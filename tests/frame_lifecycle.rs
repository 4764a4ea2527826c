// Frame lifecycle against the headless device: startup, the per-frame loop,
// every invalidation path and shutdown.

use std::sync::Arc;

use ash::vk;
use frame_renderer::backend::gpu::Gpu;
use frame_renderer::backend::headless::{default_surface, HeadlessGpu, ObjectKind, MINIMAL_SPIRV};
use frame_renderer::backend::pipeline::PipelineTemplate;
use frame_renderer::backend::queue::QueueFamilyCaps;
use frame_renderer::backend::sync::SlotPhase;
use frame_renderer::renderer::{UniformBlock, QUAD_VERTICES};
use frame_renderer::{FrameOutcome, Renderer, RendererSettings};
use glam::Mat4;

fn extent(width: u32, height: u32) -> vk::Extent2D {
    vk::Extent2D { width, height }
}

fn template(gpu: &dyn Gpu) -> PipelineTemplate {
    let vert = gpu.create_shader_module(&MINIMAL_SPIRV).unwrap();
    let frag = gpu.create_shader_module(&MINIMAL_SPIRV).unwrap();
    PipelineTemplate::from_modules(gpu, vert, frag).unwrap()
}

fn renderer_on(gpu: &Arc<HeadlessGpu>, size: vk::Extent2D) -> Renderer {
    let dyn_gpu: Arc<dyn Gpu> = gpu.clone();
    Renderer::new(dyn_gpu, template(gpu.as_ref()), RendererSettings::default(), size).unwrap()
}

fn setup() -> (Arc<HeadlessGpu>, Renderer) {
    let gpu = Arc::new(HeadlessGpu::new());
    let renderer = renderer_on(&gpu, extent(800, 600));
    (gpu, renderer)
}

fn assert_clean(gpu: &HeadlessGpu) {
    let violations = gpu.violations();
    assert!(violations.is_empty(), "violations: {:#?}", violations);
}

#[test]
fn quad_is_drawn_once_with_six_indices() {
    let (gpu, mut renderer) = setup();

    let outcome = renderer.draw_frame(extent(800, 600), 0.016).unwrap();
    assert_eq!(outcome, FrameOutcome::Presented);

    let draws = gpu.take_draws();
    assert_eq!(draws.len(), 1);
    let draw = draws[0];
    assert_eq!(draw.index_count, 6);
    assert_eq!(draw.instance_count, 1);
    assert_eq!(draw.index_type, vk::IndexType::UINT16);
    assert_eq!(draw.render_area, extent(800, 600));
    assert_eq!(draw.clear_color, [0.0, 0.0, 0.0, 1.0]);
    assert_eq!(gpu.presents().len(), 1);

    assert_clean(&gpu);
}

#[test]
fn uploaded_geometry_reads_back_bit_identical() {
    let (gpu, renderer) = setup();

    let bytes = renderer
        .transfer()
        .download(&renderer.mesh().vertex_buffer)
        .unwrap();
    assert_eq!(bytes, bytemuck::cast_slice::<_, u8>(&QUAD_VERTICES[..]));

    let indices = renderer
        .transfer()
        .download(&renderer.mesh().index_buffer)
        .unwrap();
    assert_eq!(indices, bytemuck::cast_slice::<u16, u8>(&[0, 1, 2, 2, 3, 0]));

    assert_clean(&gpu);
}

#[test]
fn slot_returns_to_start_after_image_count_frames() {
    let (gpu, mut renderer) = setup();
    let images = renderer.swapchain().image_count();
    assert_eq!(images, 3);

    let start = renderer.frame_state().current_slot;
    for _ in 0..images {
        assert_eq!(
            renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
            FrameOutcome::Presented
        );
    }
    assert_eq!(renderer.frame_state().current_slot, start);
    assert_eq!(renderer.frame_state().frames_presented, images as u64);

    // Each image binds its own descriptor set
    let draws = gpu.take_draws();
    let mut sets: Vec<_> = draws.iter().map(|d| d.descriptor_set).collect();
    sets.dedup();
    assert_eq!(sets.len(), images);

    assert_clean(&gpu);
}

#[test]
fn uniforms_follow_rotation() {
    let (gpu, mut renderer) = setup();

    // 90 degrees per second for half a second
    renderer.draw_frame(extent(800, 600), 0.5).unwrap();
    assert!((renderer.frame_state().angle - 45.0).abs() < 1e-4);

    let (_, image) = gpu.presents()[0];
    let bytes = renderer.uniforms().buffer(image as usize).read_bytes().unwrap();
    let block: UniformBlock = bytemuck::pod_read_unaligned(&bytes);
    let expected = Mat4::from_rotation_z(45f32.to_radians());
    assert!(block.model.abs_diff_eq(expected, 1e-5));
    assert!(block.proj.y_axis.y < 0.0);
}

#[test]
fn resize_recreates_at_new_extent() {
    let (gpu, mut renderer) = setup();
    renderer.draw_frame(extent(800, 600), 0.016).unwrap();
    assert!(gpu.pending_submissions() > 0);

    gpu.set_surface_extent(1024, 768);
    let outcome = renderer.draw_frame(extent(1024, 768), 0.016).unwrap();
    assert_eq!(outcome, FrameOutcome::Recreated);

    let swapchain = renderer.swapchain();
    assert_eq!(swapchain.extent(), extent(1024, 768));
    assert_eq!(swapchain.framebuffers().len(), swapchain.image_count());
    assert_eq!(gpu.swapchain_history().len(), 2);
    assert_eq!(gpu.live_count(ObjectKind::Swapchain), 1);

    gpu.take_draws();
    assert_eq!(
        renderer.draw_frame(extent(1024, 768), 0.016).unwrap(),
        FrameOutcome::Presented
    );
    assert_eq!(gpu.take_draws()[0].render_area, extent(1024, 768));

    // Old objects were destroyed only after the device went idle
    assert_clean(&gpu);
}

#[test]
fn recreating_twice_in_a_row_leaves_one_valid_chain() {
    let (gpu, mut renderer) = setup();

    for _ in 0..2 {
        renderer.request_recreate();
        assert_eq!(
            renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
            FrameOutcome::Recreated
        );
    }

    let images = renderer.swapchain().image_count();
    assert_eq!(renderer.swapchain().framebuffers().len(), images);
    assert_eq!(renderer.swapchain().generation(), 3);
    assert_eq!(gpu.live_count(ObjectKind::Swapchain), 1);
    assert_eq!(gpu.live_count(ObjectKind::Framebuffer), images);
    assert_eq!(gpu.live_count(ObjectKind::ImageView), images);
    assert_eq!(gpu.live_count(ObjectKind::Pipeline), 1);
    assert_eq!(gpu.live_count(ObjectKind::RenderPass), 1);
    assert_eq!(gpu.live_count(ObjectKind::CommandBuffer), images);

    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Presented
    );
    assert_clean(&gpu);
}

#[test]
fn minimized_window_defers_without_touching_the_chain() {
    let (gpu, mut renderer) = setup();
    renderer.draw_frame(extent(800, 600), 0.016).unwrap();
    let waits = gpu.device_idle_waits();

    renderer.request_recreate();
    assert_eq!(
        renderer.draw_frame(extent(0, 0), 0.016).unwrap(),
        FrameOutcome::Deferred
    );
    assert_eq!(gpu.device_idle_waits(), waits);
    assert_eq!(gpu.swapchain_history().len(), 1);
    assert_eq!(gpu.live_count(ObjectKind::Swapchain), 1);
    assert!(renderer.scheduler().recreate_pending());

    // Restored: the pending recreation runs first
    assert_eq!(
        renderer.draw_frame(extent(640, 480), 0.016).unwrap(),
        FrameOutcome::Recreated
    );
    assert!(!renderer.scheduler().recreate_pending());
    assert_eq!(
        renderer.draw_frame(extent(640, 480), 0.016).unwrap(),
        FrameOutcome::Presented
    );
    assert_clean(&gpu);
}

#[test]
fn zero_sized_surface_tears_down_until_restored() {
    let (gpu, mut renderer) = setup();
    renderer.draw_frame(extent(800, 600), 0.016).unwrap();

    gpu.set_surface_extent(0, 0);
    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Deferred
    );
    assert!(!renderer.swapchain().is_ready());
    assert_eq!(gpu.live_count(ObjectKind::Swapchain), 0);
    assert!(renderer.scheduler().recreate_pending());

    // Still nothing to draw to
    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Deferred
    );

    gpu.set_surface_extent(800, 600);
    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Recreated
    );
    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Presented
    );
    assert_clean(&gpu);
}

#[test]
fn starting_minimized_builds_on_first_real_frame() {
    let gpu = Arc::new(HeadlessGpu::new());
    let mut renderer = renderer_on(&gpu, extent(0, 0));
    assert!(!renderer.swapchain().is_ready());
    assert_eq!(gpu.live_count(ObjectKind::Swapchain), 0);

    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Recreated
    );
    assert_eq!(renderer.frame_state().slot_count, 3);
    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Presented
    );
    assert_clean(&gpu);
}

#[test]
fn suboptimal_present_recreates_after_presenting() {
    let (gpu, mut renderer) = setup();
    gpu.report_suboptimal(1);

    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::PresentedAndRecreated
    );
    assert_eq!(gpu.presents().len(), 1);
    assert_eq!(gpu.swapchain_history().len(), 2);
    assert_eq!(renderer.frame_state().frames_presented, 1);

    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Presented
    );
    assert_clean(&gpu);
}

#[test]
fn mode_change_invalidation_recreates_at_same_size() {
    let (gpu, mut renderer) = setup();
    renderer.draw_frame(extent(800, 600), 0.016).unwrap();

    gpu.invalidate_surface();
    let slot = renderer.frame_state().current_slot;
    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Recreated
    );
    // Acquire failed, so neither the slot nor the frame counter moved
    assert_eq!(renderer.frame_state().current_slot, slot);
    assert_eq!(renderer.frame_state().frames_presented, 1);
    assert_eq!(renderer.scheduler().slot_phase(slot), SlotPhase::Idle);
    assert_eq!(renderer.swapchain().extent(), extent(800, 600));
    assert_clean(&gpu);
}

#[test]
fn every_slot_is_idle_between_frames() {
    let (gpu, mut renderer) = setup();
    let slots = renderer.frame_state().slot_count;

    for _ in 0..slots + 1 {
        renderer.draw_frame(extent(800, 600), 0.016).unwrap();
        for slot in 0..slots {
            assert_eq!(renderer.scheduler().slot_phase(slot), SlotPhase::Idle);
        }
    }
    assert_clean(&gpu);
}

#[test]
fn suboptimal_acquire_draws_now_and_recreates_next_frame() {
    let (gpu, mut renderer) = setup();
    gpu.report_suboptimal_acquire(1);

    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Presented
    );
    assert_eq!(gpu.presents().len(), 1);
    assert_eq!(renderer.frame_state().current_slot, 1);
    assert_eq!(renderer.frame_state().frames_presented, 1);
    assert!(renderer.scheduler().recreate_pending());
    assert_eq!(gpu.swapchain_history().len(), 1);

    // Rebuilt before acquiring again
    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Recreated
    );
    assert!(!renderer.scheduler().recreate_pending());
    assert_eq!(gpu.swapchain_history().len(), 2);
    assert_eq!(renderer.frame_state().current_slot, 1);

    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Presented
    );
    assert_eq!(renderer.frame_state().current_slot, 2);
    assert_clean(&gpu);
}

#[test]
fn out_of_date_present_advances_slot_and_recreates() {
    let (gpu, mut renderer) = setup();
    renderer.draw_frame(extent(800, 600), 0.016).unwrap();

    // Surface changes between acquire and present
    gpu.invalidate_after_next_acquire();
    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::PresentedAndRecreated
    );
    assert_eq!(gpu.presents().len(), 1);
    assert_eq!(renderer.frame_state().current_slot, 2);
    assert_eq!(renderer.frame_state().frames_presented, 2);
    assert_eq!(renderer.scheduler().slot_phase(1), SlotPhase::Idle);
    assert!(!renderer.scheduler().recreate_pending());
    assert_eq!(gpu.swapchain_history().len(), 2);
    assert_eq!(gpu.live_count(ObjectKind::Swapchain), 1);

    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Presented
    );
    assert_eq!(gpu.presents().len(), 2);
    assert_clean(&gpu);
}

#[test]
fn image_count_change_resizes_frame_sync() {
    let (gpu, mut renderer) = setup();
    renderer.draw_frame(extent(800, 600), 0.016).unwrap();

    let mut surface = default_surface(extent(800, 600));
    surface.capabilities.min_image_count = 3;
    surface.capabilities.max_image_count = 4;
    gpu.set_surface_support(surface);

    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Recreated
    );
    assert_eq!(renderer.swapchain().image_count(), 4);
    assert_eq!(renderer.frame_state().slot_count, 4);
    assert_eq!(renderer.uniforms().len(), 4);
    assert_eq!(gpu.live_count(ObjectKind::Fence), 4);
    assert_eq!(gpu.live_count(ObjectKind::Semaphore), 8);
    assert_eq!(gpu.live_count(ObjectKind::DescriptorSet), 4);

    let start = renderer.frame_state().current_slot;
    for _ in 0..4 {
        assert_eq!(
            renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
            FrameOutcome::Presented
        );
    }
    assert_eq!(renderer.frame_state().current_slot, start);
    assert_clean(&gpu);
}

#[test]
fn separate_graphics_and_present_families_share_images_concurrently() {
    let gpu = Arc::new(HeadlessGpu::with_queue_families(&[
        QueueFamilyCaps {
            flags: vk::QueueFlags::GRAPHICS,
            queue_count: 1,
            present: false,
        },
        QueueFamilyCaps {
            flags: vk::QueueFlags::TRANSFER,
            queue_count: 1,
            present: false,
        },
        QueueFamilyCaps {
            flags: vk::QueueFlags::COMPUTE,
            queue_count: 1,
            present: true,
        },
    ]));
    let mut renderer = renderer_on(&gpu, extent(800, 600));

    let record = gpu.swapchain_history()[0];
    assert_eq!(record.sharing_mode, vk::SharingMode::CONCURRENT);

    assert_eq!(
        renderer.draw_frame(extent(800, 600), 0.016).unwrap(),
        FrameOutcome::Presented
    );
    renderer.shutdown().unwrap();
    assert_eq!(gpu.live_objects(), 0);
    assert_clean(&gpu);
}

#[test]
fn shutdown_leaves_nothing_alive() {
    let (gpu, mut renderer) = setup();
    for _ in 0..5 {
        renderer.draw_frame(extent(800, 600), 0.016).unwrap();
    }
    gpu.set_surface_extent(1280, 720);
    renderer.draw_frame(extent(1280, 720), 0.016).unwrap();
    renderer.draw_frame(extent(1280, 720), 0.016).unwrap();

    renderer.shutdown().unwrap();
    assert_eq!(gpu.pending_submissions(), 0);
    assert_eq!(renderer.live_buffers(), 0);
    assert_eq!(gpu.live_objects(), 0);

    // Dropping after shutdown does nothing more
    drop(renderer);
    assert_eq!(gpu.live_objects(), 0);
    assert_clean(&gpu);
}

#[test]
fn dropping_without_shutdown_still_cleans_up() {
    let (gpu, mut renderer) = setup();
    renderer.draw_frame(extent(800, 600), 0.016).unwrap();
    drop(renderer);

    assert_eq!(gpu.live_objects(), 0);
    assert_clean(&gpu);
}

// Command recorder
//
// Bakes one command buffer per swap chain image. Buffers are always
// re-recorded in full; there is no incremental update.

use ash::vk;

use super::gpu::Gpu;
use crate::error::RenderResult;

/// Per-image render targets owned by the swap chain manager.
#[derive(Debug, Clone, Copy)]
pub struct RenderTargets<'a> {
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    pub framebuffers: &'a [vk::Framebuffer],
    pub extent: vk::Extent2D,
}

/// What to draw: geometry plus one descriptor set per image.
#[derive(Debug, Clone)]
pub struct DrawInputs {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_type: vk::IndexType,
    pub index_count: u32,
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    pub pipeline_layout: vk::PipelineLayout,
}

/// Record every command buffer against its framebuffer and descriptor set.
pub fn record_commands(
    gpu: &dyn Gpu,
    command_buffers: &[vk::CommandBuffer],
    targets: &RenderTargets<'_>,
    draw: &DrawInputs,
    clear_color: [f32; 4],
) -> RenderResult<()> {
    debug_assert_eq!(command_buffers.len(), targets.framebuffers.len());
    debug_assert!(draw.descriptor_sets.len() >= command_buffers.len());

    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: clear_color,
        },
    }];

    for (i, &cmd) in command_buffers.iter().enumerate() {
        let begin_info = vk::CommandBufferBeginInfo::builder();
        gpu.begin_command_buffer(cmd, &begin_info)?;

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(targets.render_pass)
            .framebuffer(targets.framebuffers[i])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: targets.extent,
            })
            .clear_values(&clear_values);

        gpu.cmd_begin_render_pass(cmd, &render_pass_info);
        gpu.cmd_bind_pipeline(cmd, targets.pipeline);
        gpu.cmd_bind_vertex_buffer(cmd, draw.vertex_buffer, 0);
        gpu.cmd_bind_index_buffer(cmd, draw.index_buffer, 0, draw.index_type);
        gpu.cmd_bind_descriptor_set(cmd, draw.pipeline_layout, draw.descriptor_sets[i]);
        gpu.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
        gpu.cmd_end_render_pass(cmd);

        gpu.end_command_buffer(cmd)?;
    }

    log::debug!("Recorded {} command buffers", command_buffers.len());
    Ok(())
}

/// Supplies draw inputs whenever command buffers are re-recorded. Called
/// with the device idle, after the swap chain was rebuilt, so the source
/// may resize its per-image resources.
pub trait DrawSource {
    fn prepare(&mut self, image_count: usize) -> RenderResult<DrawInputs>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessGpu;
    use crate::backend::queue::QueueRole;
    use ash::vk::Handle;

    #[test]
    fn each_buffer_binds_its_own_descriptor_set() {
        let gpu = HeadlessGpu::new();
        let pool = gpu
            .create_command_pool(
                &vk::CommandPoolCreateInfo::builder().queue_family_index(gpu.queue_families().graphics()),
            )
            .unwrap();
        let cmds = gpu
            .allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(2),
            )
            .unwrap();

        let framebuffers = [
            vk::Framebuffer::from_raw(0xF0),
            vk::Framebuffer::from_raw(0xF1),
        ];
        let targets = RenderTargets {
            render_pass: vk::RenderPass::from_raw(0xA0),
            pipeline: vk::Pipeline::from_raw(0xB0),
            framebuffers: &framebuffers,
            extent: vk::Extent2D {
                width: 320,
                height: 200,
            },
        };
        let draw = DrawInputs {
            vertex_buffer: vk::Buffer::from_raw(0xC0),
            index_buffer: vk::Buffer::from_raw(0xC1),
            index_type: vk::IndexType::UINT16,
            index_count: 6,
            descriptor_sets: vec![
                vk::DescriptorSet::from_raw(0xD0),
                vk::DescriptorSet::from_raw(0xD1),
            ],
            pipeline_layout: vk::PipelineLayout::from_raw(0xE0),
        };

        record_commands(&gpu, &cmds, &targets, &draw, [0.1, 0.2, 0.3, 1.0]).unwrap();
        gpu.queue_submit(
            gpu.queue(QueueRole::Graphics),
            &crate::backend::gpu::Submission::commands(&cmds),
            vk::Fence::null(),
        )
        .unwrap();

        let draws = gpu.draws();
        assert_eq!(draws.len(), 2);
        for (i, call) in draws.iter().enumerate() {
            assert_eq!(call.framebuffer, framebuffers[i]);
            assert_eq!(call.descriptor_set, draw.descriptor_sets[i]);
            assert_eq!((call.index_count, call.instance_count), (6, 1));
            assert_eq!((call.first_index, call.vertex_offset, call.first_instance), (0, 0, 0));
            assert_eq!(call.clear_color, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(call.render_area, targets.extent);
        }
    }
}

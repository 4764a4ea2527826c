// Render pass, framebuffers and graphics pipeline
//
// The pipeline template (shader modules, descriptor set layout, pipeline
// layout) does not depend on the swap chain and lives for the whole run.
// Render pass, pipeline and framebuffers are rebuilt with the swap chain.

use std::ffi::CStr;
use std::path::Path;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::gpu::Gpu;
use super::shader::load_shader_module;
use crate::error::RenderResult;

const SHADER_ENTRY: &CStr = c"main";

/// Vertex layout shared by the quad and the pipeline.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(pos: [f32; 2], color: [f32; 3]) -> Self {
        Self { pos, color }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            // Position (location 0)
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 0,
            },
            // Color (location 1), after 2 floats
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 8,
            },
        ]
    }
}

/// Swap-chain-independent pipeline state.
#[derive(Debug, Clone, Copy)]
pub struct PipelineTemplate {
    pub vert_shader: vk::ShaderModule,
    pub frag_shader: vk::ShaderModule,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
}

impl PipelineTemplate {
    /// Load both shaders from disk and build the layouts.
    pub fn load(gpu: &dyn Gpu, vert_path: &Path, frag_path: &Path) -> RenderResult<Self> {
        let vert_shader = load_shader_module(gpu, vert_path)?;
        let frag_shader = match load_shader_module(gpu, frag_path) {
            Ok(module) => module,
            Err(e) => {
                gpu.destroy_shader_module(vert_shader);
                return Err(e);
            }
        };
        Self::from_modules(gpu, vert_shader, frag_shader)
    }

    /// Build the layouts around already created shader modules. The
    /// template takes ownership of the modules.
    pub fn from_modules(
        gpu: &dyn Gpu,
        vert_shader: vk::ShaderModule,
        frag_shader: vk::ShaderModule,
    ) -> RenderResult<Self> {
        let mut template = Self {
            vert_shader,
            frag_shader,
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
        };

        // Binding 0: the per-image uniform block, read by the vertex stage
        let ubo_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .build();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(std::slice::from_ref(&ubo_binding));

        template.descriptor_set_layout = match gpu.create_descriptor_set_layout(&layout_info) {
            Ok(layout) => layout,
            Err(e) => {
                template.destroy(gpu);
                return Err(e);
            }
        };

        let set_layouts = [template.descriptor_set_layout];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        template.pipeline_layout = match gpu.create_pipeline_layout(&pipeline_layout_info) {
            Ok(layout) => layout,
            Err(e) => {
                template.destroy(gpu);
                return Err(e);
            }
        };

        Ok(template)
    }

    pub fn destroy(&mut self, gpu: &dyn Gpu) {
        gpu.destroy_pipeline_layout(self.pipeline_layout);
        gpu.destroy_descriptor_set_layout(self.descriptor_set_layout);
        gpu.destroy_shader_module(self.vert_shader);
        gpu.destroy_shader_module(self.frag_shader);
        *self = Self {
            vert_shader: vk::ShaderModule::null(),
            frag_shader: vk::ShaderModule::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
        };
    }
}

/// Single color attachment render pass that ends in present layout.
pub fn create_render_pass(gpu: &dyn Gpu, format: vk::Format) -> RenderResult<vk::RenderPass> {
    // Color attachment (the swap chain image)
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .build();

    // Don't touch the image before the acquire semaphore let go of it
    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
        .build();

    let attachments = &[color_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    gpu.create_render_pass(&render_pass_info)
}

/// One framebuffer per swap chain image view.
pub fn create_framebuffers(
    gpu: &dyn Gpu,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> RenderResult<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(image_views.len());
    for &image_view in image_views {
        let attachments = [image_view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match gpu.create_framebuffer(&framebuffer_info) {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                for framebuffer in framebuffers {
                    gpu.destroy_framebuffer(framebuffer);
                }
                return Err(e);
            }
        }
    }
    Ok(framebuffers)
}

/// Graphics pipeline with a fixed viewport covering `extent`.
pub fn create_graphics_pipeline(
    gpu: &dyn Gpu,
    template: &PipelineTemplate,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> RenderResult<vk::Pipeline> {
    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(template.vert_shader)
        .name(SHADER_ENTRY)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(template.frag_shader)
        .name(SHADER_ENTRY)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    let bindings = [Vertex::binding_description()];
    let attributes = Vertex::attribute_descriptions();
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Baked in: a new extent means a new pipeline
    let viewport = vk::Viewport::builder()
        .x(0.0)
        .y(0.0)
        .width(extent.width as f32)
        .height(extent.height as f32)
        .min_depth(0.0)
        .max_depth(1.0)
        .build();

    let scissor = vk::Rect2D::builder()
        .offset(vk::Offset2D { x: 0, y: 0 })
        .extent(extent)
        .build();

    let viewports = &[viewport];
    let scissors = &[scissor];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(viewports)
        .scissors(scissors);

    // The projection flips Y, which turns counter-clockwise into front facing
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = &[color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .layout(template.pipeline_layout)
        .render_pass(render_pass)
        .subpass(0);

    gpu.create_graphics_pipeline(&pipeline_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessGpu, ObjectKind, MINIMAL_SPIRV};

    fn stub_template(gpu: &dyn Gpu) -> PipelineTemplate {
        let vert = gpu.create_shader_module(&MINIMAL_SPIRV).unwrap();
        let frag = gpu.create_shader_module(&MINIMAL_SPIRV).unwrap();
        PipelineTemplate::from_modules(gpu, vert, frag).unwrap()
    }

    #[test]
    fn vertex_layout_matches_attribute_offsets() {
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 20);

        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attributes[1].location, 1);
        assert_eq!(attributes[1].offset, 8);
    }

    #[test]
    fn pipeline_objects_are_created_and_released() {
        let gpu = HeadlessGpu::new();
        let mut template = stub_template(&gpu);
        let render_pass = create_render_pass(&gpu, vk::Format::B8G8R8A8_SRGB).unwrap();
        let extent = vk::Extent2D {
            width: 640,
            height: 480,
        };
        let pipeline = create_graphics_pipeline(&gpu, &template, render_pass, extent).unwrap();
        let framebuffers = create_framebuffers(&gpu, &[], render_pass, extent).unwrap();
        assert!(framebuffers.is_empty());
        assert_eq!(gpu.live_count(ObjectKind::Pipeline), 1);

        gpu.destroy_pipeline(pipeline);
        gpu.destroy_render_pass(render_pass);
        template.destroy(&gpu);

        assert_eq!(gpu.live_objects(), 0);
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }

    #[test]
    fn template_destroy_is_idempotent() {
        let gpu = HeadlessGpu::new();
        let mut template = stub_template(&gpu);
        template.destroy(&gpu);
        template.destroy(&gpu);
        assert!(gpu.violations().is_empty());
    }
}

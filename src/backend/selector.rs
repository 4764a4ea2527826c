// Physical device selection
//
// Each device is snapshotted into a PhysicalDeviceCandidate, then checked
// against DeviceRequirements. The first candidate that passes every check
// wins; there is no scoring.

use ash::vk;
use serde::Deserialize;
use thiserror::Error;

use super::gpu::SurfaceSupport;
use super::queue::{assign_queue_families, QueueFamilyCaps, QueuePlan};
use crate::error::{RenderError, RenderResult};

/// Device features the renderer knows how to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFeature {
    FillModeNonSolid,
    WideLines,
    SamplerAnisotropy,
    GeometryShader,
    TessellationShader,
    ShaderInt64,
    MultiDrawIndirect,
    DepthClamp,
}

impl DeviceFeature {
    /// Required unless the configuration says otherwise.
    pub const BASELINE: [DeviceFeature; 4] = [
        DeviceFeature::GeometryShader,
        DeviceFeature::TessellationShader,
        DeviceFeature::FillModeNonSolid,
        DeviceFeature::DepthClamp,
    ];

    fn flag(self, features: &mut vk::PhysicalDeviceFeatures) -> &mut vk::Bool32 {
        match self {
            DeviceFeature::FillModeNonSolid => &mut features.fill_mode_non_solid,
            DeviceFeature::WideLines => &mut features.wide_lines,
            DeviceFeature::SamplerAnisotropy => &mut features.sampler_anisotropy,
            DeviceFeature::GeometryShader => &mut features.geometry_shader,
            DeviceFeature::TessellationShader => &mut features.tessellation_shader,
            DeviceFeature::ShaderInt64 => &mut features.shader_int64,
            DeviceFeature::MultiDrawIndirect => &mut features.multi_draw_indirect,
            DeviceFeature::DepthClamp => &mut features.depth_clamp,
        }
    }

    pub fn is_supported(self, features: &vk::PhysicalDeviceFeatures) -> bool {
        let mut copy = *features;
        *self.flag(&mut copy) == vk::TRUE
    }

    pub fn enable(self, features: &mut vk::PhysicalDeviceFeatures) {
        *self.flag(features) = vk::TRUE;
    }
}

/// What a device must offer to be picked.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    pub extensions: Vec<String>,
    pub features: Vec<DeviceFeature>,
    pub device_types: Vec<vk::PhysicalDeviceType>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            extensions: vec!["VK_KHR_swapchain".to_string()],
            features: DeviceFeature::BASELINE.to_vec(),
            device_types: vec![
                vk::PhysicalDeviceType::DISCRETE_GPU,
                vk::PhysicalDeviceType::INTEGRATED_GPU,
            ],
        }
    }
}

impl DeviceRequirements {
    /// Also accept CPU implementations such as lavapipe.
    pub fn allow_software(mut self) -> Self {
        if !self.device_types.contains(&vk::PhysicalDeviceType::CPU) {
            self.device_types.push(vk::PhysicalDeviceType::CPU);
        }
        self
    }

    /// Feature struct to pass at device creation.
    pub fn enabled_features(&self) -> vk::PhysicalDeviceFeatures {
        let mut features = vk::PhysicalDeviceFeatures::default();
        for feature in &self.features {
            feature.enable(&mut features);
        }
        features
    }
}

/// Capability snapshot of one physical device.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub features: vk::PhysicalDeviceFeatures,
    pub extensions: Vec<String>,
    pub queue_families: Vec<QueueFamilyCaps>,
    pub surface: SurfaceSupport,
}

/// Why a candidate was passed over.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing extension {0}")]
    MissingExtension(String),
    #[error("surface has no formats or no present modes")]
    InadequateSurface,
    #[error("missing feature {0:?}")]
    MissingFeature(DeviceFeature),
    #[error("device type {0:?} not accepted")]
    DeviceType(vk::PhysicalDeviceType),
    #[error("queue families cannot cover every role")]
    IncompleteQueues,
}

/// Check one candidate. On success, returns its queue plan.
pub fn evaluate(
    candidate: &PhysicalDeviceCandidate,
    requirements: &DeviceRequirements,
) -> Result<QueuePlan, Rejection> {
    if let Some(missing) = requirements
        .extensions
        .iter()
        .find(|ext| !candidate.extensions.contains(ext))
    {
        return Err(Rejection::MissingExtension(missing.clone()));
    }

    if !candidate.surface.is_adequate() {
        return Err(Rejection::InadequateSurface);
    }

    if let Some(&missing) = requirements
        .features
        .iter()
        .find(|f| !f.is_supported(&candidate.features))
    {
        return Err(Rejection::MissingFeature(missing));
    }

    if !requirements.device_types.contains(&candidate.device_type) {
        return Err(Rejection::DeviceType(candidate.device_type));
    }

    let indices = assign_queue_families(&candidate.queue_families);
    QueuePlan::resolve(indices, &candidate.queue_families).ok_or(Rejection::IncompleteQueues)
}

/// Pick the first candidate that meets `requirements`.
pub fn select_device(
    candidates: &[PhysicalDeviceCandidate],
    requirements: &DeviceRequirements,
) -> RenderResult<(usize, QueuePlan)> {
    for (i, candidate) in candidates.iter().enumerate() {
        match evaluate(candidate, requirements) {
            Ok(plan) => {
                log::info!("Selected GPU: {} ({:?})", candidate.name, candidate.device_type);
                log::debug!("Queue plan: {}", plan.describe());
                return Ok((i, plan));
            }
            Err(reason) => log::debug!("Rejected GPU {}: {}", candidate.name, reason),
        }
    }
    Err(RenderError::NoSuitableDevice {
        checked: candidates.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::default_surface;
    use crate::backend::queue::QueueRole;

    fn family(flags: vk::QueueFlags, present: bool) -> QueueFamilyCaps {
        QueueFamilyCaps {
            flags,
            queue_count: 1,
            present,
        }
    }

    fn candidate(name: &str) -> PhysicalDeviceCandidate {
        let mut features = vk::PhysicalDeviceFeatures::default();
        for feature in DeviceFeature::BASELINE {
            feature.enable(&mut features);
        }
        PhysicalDeviceCandidate {
            handle: vk::PhysicalDevice::null(),
            name: name.to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            features,
            extensions: vec!["VK_KHR_swapchain".to_string()],
            queue_families: vec![family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true)],
            surface: default_surface(vk::Extent2D {
                width: 640,
                height: 480,
            }),
        }
    }

    #[test]
    fn first_qualifying_device_wins() {
        let mut no_swapchain = candidate("a");
        no_swapchain.extensions.clear();
        let candidates = [no_swapchain, candidate("b"), candidate("c")];

        let (index, plan) = select_device(&candidates, &DeviceRequirements::default()).unwrap();
        assert_eq!(index, 1);
        assert!(plan.indices.is_complete());
    }

    #[test]
    fn every_check_can_reject() {
        let req = DeviceRequirements {
            features: vec![DeviceFeature::FillModeNonSolid],
            ..Default::default()
        };

        let mut c = candidate("x");
        c.features.fill_mode_non_solid = vk::FALSE;
        assert_eq!(
            evaluate(&c, &req).unwrap_err(),
            Rejection::MissingFeature(DeviceFeature::FillModeNonSolid)
        );

        c.features.fill_mode_non_solid = vk::TRUE;
        c.surface.present_modes.clear();
        assert_eq!(evaluate(&c, &req).unwrap_err(), Rejection::InadequateSurface);

        c.surface = default_surface(vk::Extent2D {
            width: 1,
            height: 1,
        });
        c.device_type = vk::PhysicalDeviceType::CPU;
        assert_eq!(
            evaluate(&c, &req).unwrap_err(),
            Rejection::DeviceType(vk::PhysicalDeviceType::CPU)
        );
        assert!(evaluate(&c, &req.clone().allow_software()).is_ok());

        c.queue_families = vec![family(vk::QueueFlags::COMPUTE, true)];
        assert_eq!(
            evaluate(&c, &req.allow_software()).unwrap_err(),
            Rejection::IncompleteQueues
        );
    }

    #[test]
    fn default_gate_needs_depth_clamp_and_a_real_gpu() {
        let req = DeviceRequirements::default();

        let mut no_clamp = candidate("no-clamp");
        no_clamp.features.depth_clamp = vk::FALSE;
        assert_eq!(
            evaluate(&no_clamp, &req).unwrap_err(),
            Rejection::MissingFeature(DeviceFeature::DepthClamp)
        );

        let mut virtual_gpu = candidate("virtual");
        virtual_gpu.device_type = vk::PhysicalDeviceType::VIRTUAL_GPU;
        assert_eq!(
            evaluate(&virtual_gpu, &req).unwrap_err(),
            Rejection::DeviceType(vk::PhysicalDeviceType::VIRTUAL_GPU)
        );

        let mut integrated = candidate("integrated");
        integrated.device_type = vk::PhysicalDeviceType::INTEGRATED_GPU;
        assert!(evaluate(&integrated, &req).is_ok());

        let enabled = req.enabled_features();
        assert_eq!(enabled.geometry_shader, vk::TRUE);
        assert_eq!(enabled.tessellation_shader, vk::TRUE);
        assert_eq!(enabled.fill_mode_non_solid, vk::TRUE);
        assert_eq!(enabled.depth_clamp, vk::TRUE);
    }

    #[test]
    fn no_device_is_fatal() {
        let mut c = candidate("only");
        c.queue_families[0].present = false;
        let err = select_device(&[c], &DeviceRequirements::default()).unwrap_err();
        assert!(matches!(err, RenderError::NoSuitableDevice { checked: 1 }));
    }

    #[test]
    fn selected_plan_covers_every_role() {
        let mut c = candidate("split");
        c.queue_families = vec![
            family(vk::QueueFlags::GRAPHICS, false),
            family(vk::QueueFlags::TRANSFER, false),
            family(vk::QueueFlags::COMPUTE, true),
        ];
        let (_, plan) = select_device(&[c], &DeviceRequirements::default()).unwrap();
        for role in QueueRole::ALL {
            assert!(plan.indices.get(role).is_some(), "{:?} unassigned", role);
        }
        assert_eq!(plan.indices.graphics(), 0);
        assert_eq!(plan.indices.transfer(), 1);
        assert_eq!(plan.indices.present(), 2);
    }

    #[test]
    fn feature_names_parse_from_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            features: Vec<DeviceFeature>,
        }
        let parsed: Wrapper = toml::from_str(r#"features = ["fill_mode_non_solid", "shader_int64"]"#).unwrap();
        assert_eq!(
            parsed.features,
            vec![DeviceFeature::FillModeNonSolid, DeviceFeature::ShaderInt64]
        );
        let enabled = DeviceRequirements {
            features: parsed.features,
            ..Default::default()
        }
        .enabled_features();
        assert_eq!(enabled.fill_mode_non_solid, vk::TRUE);
        assert_eq!(enabled.shader_int64, vk::TRUE);
        assert_eq!(enabled.wide_lines, vk::FALSE);
    }
}

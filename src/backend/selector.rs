// Physical device selection
//
// Facts about every GPU are gathered once into `DeviceCandidate`s, then a pure
// function decides. Keeping the decision away from the driver lets the policy
// be exercised with hand-built candidates.
//
// Policy:
// - `Any`: first qualifying device in enumeration order
// - preferred class: first qualifying device of that class, otherwise the
//   LAST qualifying device scanned

use ash::extensions::khr;
use ash::vk;
use std::ffi::{CStr, CString};
use std::mem::size_of;

use crate::error::{EngineError, Result, VkResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredDeviceType {
    Any,
    /// Discrete GPU
    HighPerformance,
    /// Integrated GPU
    LowEnergy,
}

impl PreferredDeviceType {
    fn device_type(self) -> Option<vk::PhysicalDeviceType> {
        match self {
            PreferredDeviceType::Any => None,
            PreferredDeviceType::HighPerformance => Some(vk::PhysicalDeviceType::DISCRETE_GPU),
            PreferredDeviceType::LowEnergy => Some(vk::PhysicalDeviceType::INTEGRATED_GPU),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub index: u32,
    pub graphics: bool,
    pub present: bool,
}

/// Everything selection needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: Vec<QueueFamilySupport>,
    pub extensions: Vec<CString>,
    pub features: vk::PhysicalDeviceFeatures,
    pub draw_parameters: bool,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Debug, Clone)]
pub struct SelectionRequirements {
    pub extensions: Vec<&'static CStr>,
    pub features: vk::PhysicalDeviceFeatures,
    /// `shaderDrawParameters` (gl_BaseInstance in the object shaders)
    pub draw_parameters: bool,
    /// When false the surface format / present mode checks are skipped
    pub require_swapchain: bool,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub preferred: PreferredDeviceType,
}

impl SelectionRequirements {
    /// Swapchain extension plus shader draw parameters; extend as needed.
    pub fn for_presentation(surface_format: vk::SurfaceFormatKHR, present_mode: vk::PresentModeKHR) -> Self {
        let mut extensions = vec![khr::Swapchain::name()];
        if cfg!(target_os = "macos") {
            extensions.push(c"VK_KHR_portability_subset");
        }
        Self {
            extensions,
            features: vk::PhysicalDeviceFeatures::default(),
            draw_parameters: true,
            require_swapchain: true,
            surface_format,
            present_mode,
            preferred: PreferredDeviceType::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// One entry per distinct family.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// One family doing both if there is one, else the first of each.
pub fn find_queue_families(families: &[QueueFamilySupport]) -> Option<QueueFamilies> {
    if let Some(both) = families.iter().find(|f| f.graphics && f.present) {
        return Some(QueueFamilies {
            graphics: both.index,
            present: both.index,
        });
    }
    let graphics = families.iter().find(|f| f.graphics)?;
    let present = families.iter().find(|f| f.present)?;
    Some(QueueFamilies {
        graphics: graphics.index,
        present: present.index,
    })
}

fn feature_bits(features: &vk::PhysicalDeviceFeatures) -> &[vk::Bool32] {
    let len = size_of::<vk::PhysicalDeviceFeatures>() / size_of::<vk::Bool32>();
    // PhysicalDeviceFeatures is a repr(C) struct made only of Bool32 fields.
    unsafe { std::slice::from_raw_parts((features as *const vk::PhysicalDeviceFeatures).cast(), len) }
}

/// True when every bit set in `required` is also set in `supported`.
pub fn features_supported(required: &vk::PhysicalDeviceFeatures, supported: &vk::PhysicalDeviceFeatures) -> bool {
    feature_bits(required)
        .iter()
        .zip(feature_bits(supported))
        .all(|(&want, &have)| want == vk::FALSE || have == vk::TRUE)
}

/// Decide whether `candidate` qualifies. `Err` carries the first reason it does not.
pub fn evaluate(candidate: &DeviceCandidate, requirements: &SelectionRequirements) -> Result<QueueFamilies, String> {
    let families = find_queue_families(&candidate.queue_families)
        .ok_or_else(|| "no graphics and present queue families".to_owned())?;

    if let Some(missing) = requirements
        .extensions
        .iter()
        .copied()
        .find(|name| !candidate.extensions.iter().any(|have| have.as_c_str() == *name))
    {
        return Err(format!("missing extension {}", missing.to_string_lossy()));
    }

    if !features_supported(&requirements.features, &candidate.features) {
        return Err("missing required features".to_owned());
    }
    if requirements.draw_parameters && !candidate.draw_parameters {
        return Err("shaderDrawParameters not supported".to_owned());
    }

    if requirements.require_swapchain {
        if candidate.formats.is_empty() || candidate.present_modes.is_empty() {
            return Err("surface exposes no formats or present modes".to_owned());
        }
        if !candidate.formats.contains(&requirements.surface_format) {
            return Err(format!("surface format {:?} unsupported", requirements.surface_format.format));
        }
        if !candidate.present_modes.contains(&requirements.present_mode) {
            return Err(format!("present mode {:?} unsupported", requirements.present_mode));
        }
    }

    Ok(families)
}

/// Pick a device. Returns the candidate index and its queue families.
pub fn select(candidates: &[DeviceCandidate], requirements: &SelectionRequirements) -> Result<(usize, QueueFamilies)> {
    let mut rejections = Vec::new();
    let mut last_qualifying = None;

    for (index, candidate) in candidates.iter().enumerate() {
        let families = match evaluate(candidate, requirements) {
            Ok(families) => families,
            Err(reason) => {
                log::debug!("Rejected GPU {}: {}", candidate.name, reason);
                rejections.push(format!("{}: {}", candidate.name, reason));
                continue;
            }
        };

        match requirements.preferred.device_type() {
            None => return Ok((index, families)),
            Some(wanted) if candidate.device_type == wanted => return Ok((index, families)),
            Some(_) => last_qualifying = Some((index, families)),
        }
    }

    if let Some((index, families)) = last_qualifying {
        log::warn!(
            "No {:?} GPU qualifies; falling back to the last qualifying device scanned ({})",
            requirements.preferred,
            candidates[index].name
        );
        return Ok((index, families));
    }

    if candidates.is_empty() {
        return Err(EngineError::DeviceSelection("no Vulkan-capable GPU found".to_owned()));
    }
    Err(EngineError::DeviceSelection(rejections.join("; ")))
}

/// Selected GPU and the facts cached about it. Immutable after selection.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub queue_families: QueueFamilies,
    pub extensions: Vec<CString>,
}

impl PhysicalDeviceInfo {
    pub fn min_uniform_buffer_offset_alignment(&self) -> vk::DeviceSize {
        self.properties.limits.min_uniform_buffer_offset_alignment
    }

    pub fn max_sampler_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy
    }
}

/// Gather candidate facts for every physical device, presenting to `surface`.
pub fn query_candidates(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
) -> Result<Vec<DeviceCandidate>> {
    let devices = unsafe { instance.enumerate_physical_devices() }.calling("vkEnumeratePhysicalDevices")?;

    devices
        .into_iter()
        .map(|physical_device| unsafe { query_candidate(instance, surface_loader, surface, physical_device) })
        .collect()
}

unsafe fn query_candidate(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<DeviceCandidate> {
    let properties = instance.get_physical_device_properties(physical_device);
    let name = CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy().into_owned();

    let queue_families = instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .enumerate()
        .map(|(index, family)| {
            let index = index as u32;
            let present = surface_loader
                .get_physical_device_surface_support(physical_device, index, surface)
                .calling("vkGetPhysicalDeviceSurfaceSupportKHR")?;
            Ok(QueueFamilySupport {
                index,
                graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                present,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let extensions = instance
        .enumerate_device_extension_properties(physical_device)
        .calling("vkEnumerateDeviceExtensionProperties")?
        .iter()
        .map(|ext| CStr::from_ptr(ext.extension_name.as_ptr()).to_owned())
        .collect();

    let mut draw_parameters = vk::PhysicalDeviceShaderDrawParametersFeatures::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut draw_parameters);
    instance.get_physical_device_features2(physical_device, &mut features2);
    let features = features2.features;

    let formats = surface_loader
        .get_physical_device_surface_formats(physical_device, surface)
        .calling("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
    let present_modes = surface_loader
        .get_physical_device_surface_present_modes(physical_device, surface)
        .calling("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

    Ok(DeviceCandidate {
        physical_device,
        name,
        device_type: properties.device_type,
        queue_families,
        extensions,
        features,
        draw_parameters: draw_parameters.shader_draw_parameters == vk::TRUE,
        formats,
        present_modes,
    })
}

/// Query every device, run the selection policy and cache the winner's facts.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
    requirements: &SelectionRequirements,
) -> Result<PhysicalDeviceInfo> {
    let candidates = query_candidates(instance, surface_loader, surface)?;
    let (index, queue_families) = select(&candidates, requirements)?;
    let chosen = &candidates[index];

    let properties = unsafe { instance.get_physical_device_properties(chosen.physical_device) };
    log::info!("Selected GPU: {} ({:?})", chosen.name, chosen.device_type);
    log::info!(
        "API Version: {}.{}.{}",
        vk::api_version_major(properties.api_version),
        vk::api_version_minor(properties.api_version),
        vk::api_version_patch(properties.api_version)
    );
    log::debug!(
        "Queue families: graphics {}, present {}",
        queue_families.graphics,
        queue_families.present
    );

    Ok(PhysicalDeviceInfo {
        physical_device: chosen.physical_device,
        name: chosen.name.clone(),
        properties,
        features: chosen.features,
        queue_families,
        extensions: chosen.extensions.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    fn candidate(raw: u64, name: &str, device_type: vk::PhysicalDeviceType) -> DeviceCandidate {
        DeviceCandidate {
            physical_device: vk::PhysicalDevice::from_raw(raw),
            name: name.to_owned(),
            device_type,
            queue_families: vec![QueueFamilySupport { index: 0, graphics: true, present: true }],
            extensions: vec![khr::Swapchain::name().to_owned()],
            features: vk::PhysicalDeviceFeatures {
                sampler_anisotropy: vk::TRUE,
                ..Default::default()
            },
            draw_parameters: true,
            formats: vec![FORMAT],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    fn requirements(preferred: PreferredDeviceType) -> SelectionRequirements {
        SelectionRequirements {
            extensions: vec![khr::Swapchain::name()],
            features: vk::PhysicalDeviceFeatures {
                sampler_anisotropy: vk::TRUE,
                ..Default::default()
            },
            draw_parameters: true,
            require_swapchain: true,
            surface_format: FORMAT,
            present_mode: vk::PresentModeKHR::FIFO,
            preferred,
        }
    }

    fn broken(mut c: DeviceCandidate) -> DeviceCandidate {
        c.extensions.clear();
        c
    }

    #[test]
    fn lone_qualifier_wins_regardless_of_hint() {
        let candidates = vec![
            broken(candidate(1, "a", vk::PhysicalDeviceType::DISCRETE_GPU)),
            candidate(2, "b", vk::PhysicalDeviceType::CPU),
            broken(candidate(3, "c", vk::PhysicalDeviceType::INTEGRATED_GPU)),
        ];
        for hint in [
            PreferredDeviceType::Any,
            PreferredDeviceType::HighPerformance,
            PreferredDeviceType::LowEnergy,
        ] {
            let (index, _) = select(&candidates, &requirements(hint)).unwrap();
            assert_eq!(index, 1);
        }
    }

    #[test]
    fn no_qualifier_is_a_selection_failure() {
        let candidates = vec![
            broken(candidate(1, "a", vk::PhysicalDeviceType::DISCRETE_GPU)),
            broken(candidate(2, "b", vk::PhysicalDeviceType::INTEGRATED_GPU)),
        ];
        let err = select(&candidates, &requirements(PreferredDeviceType::Any)).unwrap_err();
        match err {
            EngineError::DeviceSelection(reason) => {
                assert!(reason.contains("a: missing extension"));
                assert!(reason.contains("b: missing extension"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            select(&[], &requirements(PreferredDeviceType::Any)),
            Err(EngineError::DeviceSelection(_))
        ));
    }

    #[test]
    fn preferred_class_beats_scan_order() {
        let candidates = vec![
            candidate(1, "igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
            candidate(2, "dgpu", vk::PhysicalDeviceType::DISCRETE_GPU),
            candidate(3, "dgpu2", vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        let (index, _) = select(&candidates, &requirements(PreferredDeviceType::HighPerformance)).unwrap();
        assert_eq!(index, 1);
        let (index, _) = select(&candidates, &requirements(PreferredDeviceType::Any)).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn missing_preferred_class_falls_back_to_last_qualifier() {
        let candidates = vec![
            candidate(1, "cpu", vk::PhysicalDeviceType::CPU),
            candidate(2, "igpu", vk::PhysicalDeviceType::INTEGRATED_GPU),
            broken(candidate(3, "virtual", vk::PhysicalDeviceType::VIRTUAL_GPU)),
        ];
        let (index, _) = select(&candidates, &requirements(PreferredDeviceType::HighPerformance)).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn feature_bits_must_all_be_present() {
        let mut c = candidate(1, "a", vk::PhysicalDeviceType::DISCRETE_GPU);
        c.features.sampler_anisotropy = vk::FALSE;
        c.features.wide_lines = vk::TRUE;
        let reason = evaluate(&c, &requirements(PreferredDeviceType::Any)).unwrap_err();
        assert!(reason.contains("features"));

        let none = vk::PhysicalDeviceFeatures::default();
        assert!(features_supported(&none, &c.features));
    }

    #[test]
    fn swapchain_support_is_checked_only_when_required() {
        let mut c = candidate(1, "a", vk::PhysicalDeviceType::DISCRETE_GPU);
        c.present_modes = vec![vk::PresentModeKHR::MAILBOX];
        let mut req = requirements(PreferredDeviceType::Any);
        assert!(evaluate(&c, &req).unwrap_err().contains("present mode"));
        req.require_swapchain = false;
        assert!(evaluate(&c, &req).is_ok());
    }

    #[test]
    fn split_families_pick_first_of_each() {
        let families = [
            QueueFamilySupport { index: 0, graphics: false, present: true },
            QueueFamilySupport { index: 1, graphics: true, present: false },
            QueueFamilySupport { index: 2, graphics: true, present: false },
        ];
        let picked = find_queue_families(&families).unwrap();
        assert_eq!(picked, QueueFamilies { graphics: 1, present: 0 });
        assert_eq!(picked.unique(), vec![1, 0]);

        let shared = [
            QueueFamilySupport { index: 0, graphics: true, present: false },
            QueueFamilySupport { index: 1, graphics: true, present: true },
        ];
        let picked = find_queue_families(&shared).unwrap();
        assert!(picked.is_shared());
        assert_eq!(picked.graphics, 1);

        let no_present = [QueueFamilySupport { index: 0, graphics: true, present: false }];
        assert!(find_queue_families(&no_present).is_none());
    }
}

// Vulkan instance - loader, extensions, layers, validation messenger
//
// InstanceBuilder collects what the presentation provider and the debug
// settings need and checks the validation layer is really installed.
// Validation messages are routed into `log`.
//
// Drop order: surface ─> debug messenger ─> instance

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::{CStr, CString};

use crate::error::{EngineError, Result, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct InstanceBuilder {
    app_name: String,
    app_version: u32,
    engine_name: String,
    engine_version: u32,
    api_version: u32,
    extensions: Vec<&'static CStr>,
    layers: Vec<&'static CStr>,
    validation: bool,
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
}

impl InstanceBuilder {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_owned(),
            app_version: vk::make_api_version(0, 0, 1, 0),
            engine_name: "vk-frames".to_owned(),
            engine_version: vk::make_api_version(0, 0, 1, 0),
            api_version: vk::API_VERSION_1_1,
            extensions: Vec::new(),
            layers: Vec::new(),
            validation: false,
            severity: vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            message_types: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        }
    }

    pub fn app_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.app_version = vk::make_api_version(0, major, minor, patch);
        self
    }

    pub fn engine_name(mut self, name: &str) -> Self {
        self.engine_name = name.to_owned();
        self
    }

    pub fn api_version(mut self, major: u32, minor: u32) -> Self {
        self.api_version = vk::make_api_version(0, major, minor, 0);
        self
    }

    pub fn extensions(mut self, names: impl IntoIterator<Item = &'static CStr>) -> Self {
        for name in names {
            if !self.extensions.contains(&name) {
                self.extensions.push(name);
            }
        }
        self
    }

    pub fn layer(mut self, name: &'static CStr) -> Self {
        if !self.layers.contains(&name) {
            self.layers.push(name);
        }
        self
    }

    /// Enable the Khronos validation layer and a debug messenger.
    pub fn validation(mut self, enabled: bool) -> Self {
        self.validation = enabled;
        self
    }

    pub fn debug_severity(mut self, severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        self.severity = severity;
        self
    }

    /// Forward the messenger's chatty severities only when the log would show them.
    pub fn severity_for(level: log::LevelFilter) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        let mut severity =
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR;
        if level >= log::LevelFilter::Debug {
            severity |= vk::DebugUtilsMessageSeverityFlagsEXT::INFO;
        }
        if level >= log::LevelFilter::Trace {
            severity |= vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE;
        }
        severity
    }

    pub fn build(mut self) -> Result<VulkanInstance> {
        let entry = unsafe { Entry::load() }?;

        if self.validation {
            let available = entry
                .enumerate_instance_layer_properties()
                .calling("vkEnumerateInstanceLayerProperties")?;
            let installed = available
                .iter()
                .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
            if !installed {
                return Err(EngineError::Unsupported(format!(
                    "validation requested but {} is not installed",
                    VALIDATION_LAYER.to_string_lossy()
                )));
            }
            self = self.layer(VALIDATION_LAYER).extensions([DebugUtils::name()]);
        }

        let mut flags = vk::InstanceCreateFlags::empty();
        if cfg!(target_os = "macos") {
            self = self.extensions([vk::KhrPortabilityEnumerationFn::name()]);
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let app_name = CString::new(self.app_name.as_str())
            .map_err(|_| EngineError::InvalidInput("application name contains a NUL byte".into()))?;
        let engine_name = CString::new(self.engine_name.as_str())
            .map_err(|_| EngineError::InvalidInput("engine name contains a NUL byte".into()))?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(self.app_version)
            .engine_name(&engine_name)
            .engine_version(self.engine_version)
            .api_version(self.api_version);

        let extension_ptrs: Vec<_> = self.extensions.iter().map(|name| name.as_ptr()).collect();
        let layer_ptrs: Vec<_> = self.layers.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }.creating("Vulkan instance")?;
        log::info!(
            "Created Vulkan instance {}.{} ({} extensions, {} layers)",
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            self.extensions.len(),
            self.layers.len()
        );

        let debug_utils = if self.validation {
            match setup_debug_messenger(&entry, &instance, self.severity, self.message_types) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(VulkanInstance {
            entry,
            instance,
            debug_utils,
            surface: None,
            api_version: self.api_version,
        })
    }
}

/// Instance plus the objects that must die with it: the presentation
/// surface and the debug messenger.
pub struct VulkanInstance {
    pub entry: Entry,
    pub instance: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface: Option<(khr::Surface, vk::SurfaceKHR)>,
    pub api_version: u32,
}

impl VulkanInstance {
    pub fn validation_enabled(&self) -> bool {
        self.debug_utils.is_some()
    }

    /// Create the window surface. Only one surface is supported per instance.
    ///
    /// # Safety
    /// The window behind the handles must outlive this instance.
    pub unsafe fn attach_surface(&mut self, display: RawDisplayHandle, window: RawWindowHandle) -> Result<vk::SurfaceKHR> {
        if self.surface.is_some() {
            return Err(EngineError::InvalidInput("instance already has a surface".into()));
        }
        let surface = super::surface::create_surface(&self.entry, &self.instance, display, window)?;
        let loader = khr::Surface::new(&self.entry, &self.instance);
        self.surface = Some((loader, surface));
        log::debug!("Created window surface");
        Ok(surface)
    }

    /// Surface loader and handle, once attached.
    pub fn surface(&self) -> Option<(&khr::Surface, vk::SurfaceKHR)> {
        self.surface.as_ref().map(|(loader, surface)| (loader, *surface))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, surface)) = self.surface.take() {
                loader.destroy_surface(surface, None);
            }
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        log::debug!("Destroyed Vulkan instance");
    }
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(severity)
        .message_type(message_types)
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .creating("debug messenger")?;

    Ok((debug_utils, messenger))
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan {:?}] {}", message_type, message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan {:?}] {}", message_type, message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan {:?}] {}", message_type, message.to_string_lossy());
        }
    }

    vk::FALSE
}

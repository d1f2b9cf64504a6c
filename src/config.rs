// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Everything here is fixed at init: window extent, swapchain preferences,
// frame-overlap count and descriptor/object limits. Nothing is hot-reloaded.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::selector::PreferredDeviceType;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub limits: LimitsConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Engine".to_string(),
            width: 1440,
            height: 900,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub surface_format: String,
    pub frames_in_flight: usize,
    pub clear_color: [f32; 4],
    pub preferred_gpu: String,
    pub fence_timeout_ms: u64,
    pub anisotropy: bool,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            surface_format: "b8g8r8a8_srgb".to_string(),
            frames_in_flight: 2,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            preferred_gpu: "discrete".to_string(),
            fence_timeout_ms: 1000,
            anisotropy: false,
        }
    }
}

/// Capacity limits for per-frame buffers and the descriptor pool
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_objects: usize,
    pub max_descriptor_sets: u32,
    pub descriptors_per_type: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_objects: 10_000,
            max_descriptor_sets: 16,
            descriptors_per_type: 16,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

/// Where compiled SPIR-V blobs live
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub directory: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("shaders"),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.graphics.frames_in_flight == 0 {
            anyhow::bail!("graphics.frames_in_flight must be at least 1");
        }
        if config.limits.max_objects == 0 {
            anyhow::bail!("limits.max_objects must be at least 1");
        }
        Ok(config)
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.window.width,
            height: self.window.height,
        }
    }

    pub fn fence_timeout_ns(&self) -> u64 {
        self.graphics.fence_timeout_ms.saturating_mul(1_000_000)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Get the desired swapchain surface format (always sRGB non-linear color space)
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        let format = match self.graphics.surface_format.to_lowercase().as_str() {
            "b8g8r8a8_srgb" => vk::Format::B8G8R8A8_SRGB,
            "b8g8r8a8_unorm" => vk::Format::B8G8R8A8_UNORM,
            "r8g8b8a8_srgb" => vk::Format::R8G8B8A8_SRGB,
            "r8g8b8a8_unorm" => vk::Format::R8G8B8A8_UNORM,
            _ => {
                log::warn!(
                    "Unknown surface format '{}', defaulting to B8G8R8A8_SRGB",
                    self.graphics.surface_format
                );
                vk::Format::B8G8R8A8_SRGB
            }
        };
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    pub fn preferred_device_type(&self) -> PreferredDeviceType {
        match self.graphics.preferred_gpu.to_lowercase().as_str() {
            "any" => PreferredDeviceType::Any,
            "discrete" | "high_performance" => PreferredDeviceType::HighPerformance,
            "integrated" | "low_energy" => PreferredDeviceType::LowEnergy,
            _ => {
                log::warn!(
                    "Unknown GPU preference '{}', accepting any GPU",
                    self.graphics.preferred_gpu
                );
                PreferredDeviceType::Any
            }
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}

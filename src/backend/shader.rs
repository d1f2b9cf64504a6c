// Shader module loading
//
// SPIR-V blobs are looked up by logical name (`mesh.vert` -> `mesh.vert.spv`)
// in the configured shader directory. A missing or malformed blob is fatal.

use ash::vk;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use super::VulkanDevice;
use crate::error::{EngineError, Result, VkResultExt};

const SPIRV_MAGIC: u32 = 0x0723_0203;

pub struct ShaderLibrary {
    directory: PathBuf,
}

impl ShaderLibrary {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.spv", name))
    }

    /// Read and validate the words of shader `name`.
    pub fn load(&self, name: &str) -> Result<Vec<u32>> {
        let path = self.path_of(name);
        let bytes = std::fs::read(&path).map_err(|e| EngineError::Shader {
            name: name.to_owned(),
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        parse_spirv(name, &bytes)
    }

    pub fn create_module(&self, device: &VulkanDevice, name: &str) -> Result<vk::ShaderModule> {
        let code = self.load(name)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .creating(format!("shader module {}", name))?;
        log::debug!("Loaded shader {} ({} words)", name, code.len());
        Ok(module)
    }
}

/// Decode SPIR-V bytes into aligned words, rejecting empty or foreign blobs.
pub fn parse_spirv(name: &str, bytes: &[u8]) -> Result<Vec<u32>> {
    let invalid = |reason: String| EngineError::Shader {
        name: name.to_owned(),
        reason,
    };
    if bytes.is_empty() {
        return Err(invalid("file is empty".into()));
    }
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| invalid(e.to_string()))?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(other) => Err(invalid(format!("bad magic number {:#010x}", other))),
        None => Err(invalid("no SPIR-V words".into())),
    }
}

// Error taxonomy for the renderer core
//
// Every startup failure is fatal for the process; the only condition callers
// are expected to tell apart at runtime is a synchronization timeout.

use ash::vk;
use thiserror::Error;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("no GPU satisfies the requested capabilities: {0}")]
    DeviceSelection(String),

    #[error("failed to create {what}: {source}")]
    ResourceCreation {
        what: String,
        #[source]
        source: vk::Result,
    },

    #[error("failed to allocate memory for {what}: {source}")]
    Allocation {
        what: String,
        #[source]
        source: gpu_allocator::AllocationError,
    },

    #[error("timed out after {timeout_ns} ns waiting for {what}")]
    SynchronizationTimeout { what: &'static str, timeout_ns: u64 },

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        #[source]
        result: vk::Result,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("shader '{name}': {reason}")]
    Shader { name: String, reason: String },

    #[error("unknown {kind} handle {index}")]
    UnknownResource { kind: &'static str, index: usize },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::SynchronizationTimeout { .. })
    }
}

/// Context helpers for raw `ash` results, in the spirit of `anyhow::Context`.
pub trait VkResultExt<T> {
    /// Tag a failed object creation with the object being created.
    fn creating(self, what: impl Into<String>) -> Result<T>;

    /// Tag a failed non-creation call with the API entry point.
    fn calling(self, call: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn creating(self, what: impl Into<String>) -> Result<T> {
        self.map_err(|source| EngineError::ResourceCreation {
            what: what.into(),
            source,
        })
    }

    fn calling(self, call: &'static str) -> Result<T> {
        self.map_err(|result| EngineError::Vulkan { call, result })
    }
}

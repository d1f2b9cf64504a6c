//! Vulkan renderer core: capability negotiation, N frames in flight,
//! immediate-submit uploads, batched draws and LIFO teardown.
//!
//! The engine core in [`engine`] reaches the GPU only through the traits in
//! [`backend::gpu`], so its scheduling and teardown rules are testable
//! without a device.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;

pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, Result};

// Backend module - Vulkan abstraction layer
//
// Thin wrapper around ash. The engine core talks to it only through the
// traits in `gpu`; everything else here builds the objects those traits use.

pub mod buffer;
pub mod commands;
pub mod descriptors;
pub mod device;
pub mod gpu;
pub mod instance;
pub mod pipeline;
pub mod selector;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub mod testing;

pub use device::{DeviceBuilder, VulkanDevice};
pub use instance::{InstanceBuilder, VulkanInstance};
pub use swapchain::Swapchain;

// Deletion queue - LIFO teardown registry
//
// Every GPU object created after init is registered here right after it is
// created. Dependents are always registered after what they depend on, so
// draining the stack top-to-bottom destroys views before images, pipelines
// before their layouts, image views before the swapchain.

use ash::vk::{self, Handle};

use crate::backend::gpu::{Destroyer, Submission};

/// What a teardown record destroys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    Framebuffer,
    RenderPass,
    Pipeline,
    PipelineLayout,
    DescriptorSetLayout,
    DescriptorPool,
    CommandPool,
    Fence,
    Semaphore,
    ShaderModule,
    Swapchain,
}

/// A raw handle tagged with its kind; the destroyer dispatches on `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub kind: ResourceKind,
    pub handle: u64,
}

impl Teardown {
    pub fn of<H: TrackedHandle>(handle: H) -> Self {
        Self {
            kind: H::KIND,
            handle: handle.as_raw(),
        }
    }

    /// Recover the typed handle. `None` when `H` does not match the record's kind.
    pub fn handle<H: TrackedHandle>(&self) -> Option<H> {
        (self.kind == H::KIND).then(|| H::from_raw(self.handle))
    }
}

/// Vulkan handle types the deletion queue knows how to destroy.
pub trait TrackedHandle: Handle + Copy {
    const KIND: ResourceKind;
}

macro_rules! tracked {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(impl TrackedHandle for $ty {
            const KIND: ResourceKind = ResourceKind::$kind;
        })*
    };
}

tracked! {
    vk::Buffer => Buffer,
    vk::Image => Image,
    vk::ImageView => ImageView,
    vk::Sampler => Sampler,
    vk::Framebuffer => Framebuffer,
    vk::RenderPass => RenderPass,
    vk::Pipeline => Pipeline,
    vk::PipelineLayout => PipelineLayout,
    vk::DescriptorSetLayout => DescriptorSetLayout,
    vk::DescriptorPool => DescriptorPool,
    vk::CommandPool => CommandPool,
    vk::Fence => Fence,
    vk::Semaphore => Semaphore,
    vk::ShaderModule => ShaderModule,
    vk::SwapchainKHR => Swapchain,
}

/// Stack of pending teardowns. Not safe for concurrent push/flush; the engine
/// owns it on the render thread.
#[derive(Debug, Default)]
pub struct DeletionQueue {
    pending: Vec<Teardown>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, teardown: Teardown) {
        self.pending.push(teardown);
    }

    /// Register a typed handle.
    pub fn track<H: TrackedHandle>(&mut self, handle: H) -> H {
        self.push(Teardown::of(handle));
        handle
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Destroy everything, most recently registered first. Leaves the queue
    /// empty; flushing an empty queue does nothing.
    pub fn flush<D: Destroyer + ?Sized>(&mut self, destroyer: &D) {
        if self.pending.is_empty() {
            return;
        }
        log::debug!("Flushing deletion queue ({} resources)", self.pending.len());
        while let Some(teardown) = self.pending.pop() {
            destroyer.destroy(teardown);
        }
    }
}

/// Shutdown protocol: wait for the device to drain every in-flight frame and
/// upload, then flush the queue. With nothing queued it does not touch the GPU,
/// so calling it again after a shutdown is a no-op.
pub fn release_all<G: Submission + Destroyer + ?Sized>(gpu: &G, queue: &mut DeletionQueue) {
    if queue.is_empty() {
        return;
    }
    if let Err(e) = gpu.wait_idle() {
        log::error!("Device did not go idle before teardown: {}", e);
    }
    queue.flush(gpu);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Log(RefCell<Vec<Teardown>>);

    impl Destroyer for Log {
        fn destroy(&self, teardown: Teardown) {
            self.0.borrow_mut().push(teardown);
        }
    }

    #[test]
    fn flush_runs_in_reverse_push_order_exactly_once() {
        let mut queue = DeletionQueue::new();
        let image = queue.track(vk::Image::from_raw(1));
        let view = queue.track(vk::ImageView::from_raw(2));
        let fence = queue.track(vk::Fence::from_raw(3));

        let log = Log::default();
        queue.flush(&log);

        assert_eq!(
            *log.0.borrow(),
            vec![Teardown::of(fence), Teardown::of(view), Teardown::of(image)]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_on_empty_and_flush_after_flush_do_nothing() {
        let mut queue = DeletionQueue::new();
        let log = Log::default();
        queue.flush(&log);
        assert!(log.0.borrow().is_empty());

        queue.track(vk::Buffer::from_raw(7));
        queue.flush(&log);
        queue.flush(&log);
        assert_eq!(log.0.borrow().len(), 1);
    }

    #[test]
    fn many_pushes_come_back_reversed() {
        let mut queue = DeletionQueue::new();
        for raw in 1..=64u64 {
            queue.track(vk::Semaphore::from_raw(raw));
        }
        assert_eq!(queue.len(), 64);

        let log = Log::default();
        queue.flush(&log);
        let handles: Vec<u64> = log.0.borrow().iter().map(|t| t.handle).collect();
        assert_eq!(handles, (1..=64u64).rev().collect::<Vec<_>>());
    }

    #[test]
    fn typed_handle_round_trips_only_for_its_kind() {
        let record = Teardown::of(vk::Pipeline::from_raw(42));
        assert_eq!(record.kind, ResourceKind::Pipeline);
        assert_eq!(record.handle::<vk::Pipeline>(), Some(vk::Pipeline::from_raw(42)));
        assert_eq!(record.handle::<vk::PipelineLayout>(), None);
    }

    #[test]
    fn release_waits_for_idle_before_any_teardown() {
        use crate::backend::testing::{Event, RecordingGpu};

        let gpu = RecordingGpu::new(2);
        let mut queue = DeletionQueue::new();
        let swapchain = queue.track(gpu.handle::<vk::SwapchainKHR>());
        let view = queue.track(gpu.handle::<vk::ImageView>());
        let fence = queue.track(gpu.signaled_fence());

        release_all(&gpu, &mut queue);
        assert_eq!(
            gpu.events(),
            vec![
                Event::WaitIdle,
                Event::Destroy(Teardown::of(fence)),
                Event::Destroy(Teardown::of(view)),
                Event::Destroy(Teardown::of(swapchain)),
            ]
        );
        assert!(queue.is_empty());

        release_all(&gpu, &mut queue);
        assert_eq!(gpu.events().len(), 4);
    }
}

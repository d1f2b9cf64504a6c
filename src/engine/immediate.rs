// Immediate submit - synchronous one-off GPU work
//
// One dedicated pool / command buffer / fence, reused serially for every
// upload. `immediate_submit` takes `&mut self`, so two submissions can never
// interleave on the shared command buffer.

use ash::vk;

use crate::backend::gpu::{CommandEncoder, SubmitDesc, Submission};
use crate::error::Result;

#[derive(Debug)]
pub struct UploadContext {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    /// Created unsignaled; signaled by each submit and reset after the wait
    pub fence: vk::Fence,
    timeout_ns: u64,
}

impl UploadContext {
    pub fn new(
        command_pool: vk::CommandPool,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
        timeout_ns: u64,
    ) -> Self {
        Self {
            command_pool,
            command_buffer,
            fence,
            timeout_ns,
        }
    }

    /// Record `work`, submit it to the graphics queue and block until the GPU
    /// has finished executing it.
    pub fn immediate_submit<G, F>(&mut self, gpu: &G, work: F) -> Result<()>
    where
        G: CommandEncoder + Submission + ?Sized,
        F: FnOnce(&G, vk::CommandBuffer) -> Result<()>,
    {
        let cmd = self.command_buffer;
        gpu.begin_one_time(cmd)?;
        work(gpu, cmd)?;
        gpu.end(cmd)?;

        gpu.submit(&SubmitDesc::new(cmd, self.fence))?;
        gpu.wait_for_fence(self.fence, "upload fence", self.timeout_ns)?;

        gpu.reset_fence(self.fence)?;
        gpu.reset_command_pool(self.command_pool)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{Event, RecordingGpu};

    fn context(gpu: &RecordingGpu) -> UploadContext {
        UploadContext::new(gpu.handle(), gpu.handle(), gpu.unsignaled_fence(), 1_000_000_000)
    }

    #[test]
    fn records_submits_waits_then_resets() {
        let gpu = RecordingGpu::new(2);
        let mut upload = context(&gpu);
        let (src, dst) = (gpu.handle(), gpu.handle());

        upload
            .immediate_submit(&gpu, |g, cmd| {
                g.copy_buffer(cmd, src, dst, 16);
                Ok(())
            })
            .unwrap();

        assert_eq!(
            gpu.events(),
            vec![
                Event::Begin(upload.command_buffer),
                Event::CopyBuffer { src, dst, size: 16 },
                Event::End(upload.command_buffer),
                Event::Submit { cmd: upload.command_buffer, fence: upload.fence },
                Event::WaitFence(upload.fence),
                Event::ResetFence(upload.fence),
                Event::ResetPool(upload.command_pool),
            ]
        );
    }

    #[test]
    fn sequential_submits_never_overlap() {
        let gpu = RecordingGpu::new(2);
        let mut upload = context(&gpu);

        upload.immediate_submit(&gpu, |_, _| Ok(())).unwrap();
        upload.immediate_submit(&gpu, |_, _| Ok(())).unwrap();

        let events = gpu.events();
        let submits: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Event::Submit { .. }))
            .map(|(i, _)| i)
            .collect();
        let waits: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, Event::WaitFence(_)))
            .map(|(i, _)| i)
            .collect();

        assert_eq!(submits.len(), 2);
        assert_eq!(waits.len(), 2);
        // first signal observed before the second submission is even recorded
        assert!(submits[0] < waits[0]);
        assert!(waits[0] < submits[1]);
        assert!(submits[1] < waits[1]);
    }

    #[test]
    fn timeout_is_reported_and_fence_left_alone() {
        let gpu = RecordingGpu::new(2);
        let mut upload = context(&gpu);
        gpu.stall(upload.fence);

        let err = upload.immediate_submit(&gpu, |_, _| Ok(())).unwrap_err();
        assert!(err.is_timeout());
        assert!(!gpu.events().contains(&Event::ResetFence(upload.fence)));
    }

    #[test]
    fn recording_errors_skip_submission() {
        let gpu = RecordingGpu::new(2);
        let mut upload = context(&gpu);

        let err = upload
            .immediate_submit(&gpu, |_, _| {
                Err(crate::error::EngineError::InvalidInput("nothing to copy".into()))
            })
            .unwrap_err();
        assert!(err.to_string().contains("nothing to copy"));
        assert!(!gpu.events().iter().any(|e| matches!(e, Event::Submit { .. })));
    }
}

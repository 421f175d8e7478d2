//! Synchronization primitives.

use std::time::Duration;

use ash::vk;
use tracing::error;

use crate::device::{timeout_ns, DeviceRef};
use crate::error::{reject, GpuError, Rejected, Result, SetResult};

/// How long [`Fence::wait`] blocks before giving up.
pub const DEFAULT_FENCE_TIMEOUT: Duration = Duration::from_secs(3);

/// A CPU-observable completion signal.
pub struct Fence {
    device: DeviceRef,
    fence: vk::Fence,
    signaled: bool,
}

impl Fence {
    /// Create an uninitialized, initially unsignaled fence.
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            fence: vk::Fence::null(),
            signaled: false,
        }
    }

    /// Create and initialize a fence in one step.
    pub fn create(device: DeviceRef, signaled: bool) -> Result<Self> {
        let mut fence = Self::new(device);
        fence.signaled = signaled;
        fence.init()?;
        Ok(fence)
    }

    /// Whether the fence starts out signaled.
    pub fn set_signaled(&mut self, signaled: bool) -> SetResult {
        if self.is_initialized() {
            return reject(Rejected::AlreadyInitialized("fence initial state"));
        }
        self.signaled = signaled;
        Ok(())
    }

    pub fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            self.finalize();
        }
        self.fence = self.device.create_fence(self.signaled).map_err(|e| {
            error!("Failed to create fence: {e}");
            GpuError::from(e)
        })?;
        Ok(())
    }

    /// Block until the fence signals, up to [`DEFAULT_FENCE_TIMEOUT`].
    pub fn wait(&self) -> Result<()> {
        self.wait_timeout(DEFAULT_FENCE_TIMEOUT)
    }

    /// Block until the fence signals or `timeout` expires.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.ensure_initialized("wait on")?;
        match self.device.wait_for_fence(self.fence, timeout_ns(timeout)) {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::Timeout {
                what: "fence",
                timeout,
            }),
            Err(e) => {
                error!("Fence wait failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Return the fence to the unsignaled state.
    pub fn reset(&self) -> Result<()> {
        self.ensure_initialized("reset")?;
        self.device.reset_fence(self.fence)?;
        Ok(())
    }

    /// Poll the fence without blocking.
    pub fn is_signaled(&self) -> Result<bool> {
        self.ensure_initialized("query")?;
        Ok(self.device.fence_signaled(self.fence)?)
    }

    pub fn is_initialized(&self) -> bool {
        self.fence != vk::Fence::null()
    }

    pub const fn handle(&self) -> vk::Fence {
        self.fence
    }

    pub fn finalize(&mut self) {
        if self.is_initialized() {
            self.device.destroy_fence(self.fence);
            self.fence = vk::Fence::null();
        }
    }

    fn ensure_initialized(&self, action: &str) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "cannot {action} an uninitialized fence"
            )))
        }
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// A GPU-side ordering token between queue operations.
pub struct Semaphore {
    device: DeviceRef,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            semaphore: vk::Semaphore::null(),
        }
    }

    /// Create and initialize a semaphore in one step.
    pub fn create(device: DeviceRef) -> Result<Self> {
        let mut semaphore = Self::new(device);
        semaphore.init()?;
        Ok(semaphore)
    }

    pub fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            self.finalize();
        }
        self.semaphore = self.device.create_semaphore().map_err(|e| {
            error!("Failed to create semaphore: {e}");
            GpuError::from(e)
        })?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.semaphore != vk::Semaphore::null()
    }

    pub const fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Wait on this semaphore at `stage` of a submission.
    pub const fn at(&self, stage: vk::PipelineStageFlags) -> WaitSemaphore {
        WaitSemaphore {
            semaphore: self.semaphore,
            stage,
        }
    }

    pub fn finalize(&mut self) {
        if self.is_initialized() {
            self.device.destroy_semaphore(self.semaphore);
            self.semaphore = vk::Semaphore::null();
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// A semaphore a submission waits on, and the first stage that needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSemaphore {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, Submission};
    use crate::fake::FakeDevice;

    fn submit_with(fake: &FakeDevice, fence: &Fence) {
        fake.queue_submit(vk::Queue::null(), &Submission::default(), fence.handle())
            .unwrap();
    }

    #[test]
    fn signaled_fence_does_not_block() {
        let fake = FakeDevice::new();
        let fence = Fence::create(fake.clone(), true).unwrap();
        fence.wait().unwrap();
        assert!(fence.is_signaled().unwrap());
        assert_eq!(fake.now(), Duration::ZERO);
    }

    #[test]
    fn wait_blocks_until_submission_completes() {
        let fake = FakeDevice::new();
        fake.complete_submissions_after(Duration::from_millis(16));
        let fence = Fence::create(fake.clone(), false).unwrap();
        submit_with(&fake, &fence);

        assert!(!fence.is_signaled().unwrap());
        fence.wait().unwrap();
        assert_eq!(fake.now(), Duration::from_millis(16));
        assert!(fence.is_signaled().unwrap());

        fence.reset().unwrap();
        assert!(!fence.is_signaled().unwrap());
    }

    #[test]
    fn never_signaled_fence_times_out() {
        let fake = FakeDevice::new();
        fake.never_complete_submissions();
        let fence = Fence::create(fake.clone(), false).unwrap();
        submit_with(&fake, &fence);

        let err = fence.wait().unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert_eq!(fake.now(), DEFAULT_FENCE_TIMEOUT);

        let err = fence.wait_timeout(Duration::from_millis(1)).unwrap_err();
        assert!(matches!(
            err,
            GpuError::Timeout {
                what: "fence",
                timeout
            } if timeout == Duration::from_millis(1)
        ));
    }

    #[test]
    fn uninitialized_fence_is_an_error() {
        let fake = FakeDevice::new();
        let fence = Fence::new(fake.clone());
        assert!(matches!(fence.wait(), Err(GpuError::InvalidState(_))));
        assert!(fake.fence_waits().is_empty());
    }

    #[test]
    fn initial_state_frozen_after_init() {
        let fake = FakeDevice::new();
        let mut fence = Fence::new(fake.clone());
        fence.set_signaled(true).unwrap();
        fence.init().unwrap();
        assert_eq!(
            fence.set_signaled(false),
            Err(Rejected::AlreadyInitialized("fence initial state"))
        );
        assert!(fence.is_signaled().unwrap());
    }

    #[test]
    fn finalize_twice_destroys_once() {
        let fake = FakeDevice::new();
        let mut fence = Fence::create(fake.clone(), false).unwrap();
        let mut semaphore = Semaphore::create(fake.clone()).unwrap();

        fence.finalize();
        fence.finalize();
        semaphore.finalize();
        semaphore.finalize();
        drop(fence);
        drop(semaphore);

        assert_eq!(fake.destroy_count("fence"), 1);
        assert_eq!(fake.destroy_count("semaphore"), 1);
        assert_eq!(fake.invalid_destroys(), 0);
    }

    #[test]
    fn wait_semaphore_carries_stage() {
        let fake = FakeDevice::new();
        let semaphore = Semaphore::create(fake).unwrap();
        let wait = semaphore.at(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(wait.semaphore, semaphore.handle());
        assert_eq!(wait.stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    }
}

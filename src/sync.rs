// Synchronization primitives
//
// Per frame slot: a command buffer, an image-acquired semaphore, a
// render-finished semaphore and a CPU-waitable fence. Plus the table that
// remembers which fence last rendered into each swapchain image.

use ash::vk;
use std::sync::Arc;

use crate::backend::GpuDevice;
use crate::error::{RenderError, RenderResult, VkResultExt};
use crate::frame::{FrameIndex, ImageIndex};
use crate::FRAMES_IN_FLIGHT;

/// Sync objects and recording target for one frame in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_acquired: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    /// Created signaled so the first wait on each slot returns at once.
    pub fence: vk::Fence,
}

impl FrameSlot {
    fn new<D: GpuDevice>(device: &D, command_buffer: vk::CommandBuffer) -> RenderResult<Self> {
        let image_acquired = device.create_semaphore().during("vkCreateSemaphore")?;
        let render_finished = match device.create_semaphore().during("vkCreateSemaphore") {
            Ok(semaphore) => semaphore,
            Err(err) => {
                device.destroy_semaphore(image_acquired);
                return Err(err);
            }
        };
        let fence = match device.create_fence(true).during("vkCreateFence") {
            Ok(fence) => fence,
            Err(err) => {
                device.destroy_semaphore(image_acquired);
                device.destroy_semaphore(render_finished);
                return Err(err);
            }
        };

        Ok(Self {
            command_buffer,
            image_acquired,
            render_finished,
            fence,
        })
    }

    fn destroy<D: GpuDevice>(&self, device: &D) {
        device.destroy_semaphore(self.image_acquired);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.fence);
    }
}

/// Swapchain image index -> fence of the frame that last rendered into it.
#[derive(Debug, Clone, Default)]
pub struct ImageInFlightTable {
    fences: Vec<Option<vk::Fence>>,
}

impl ImageInFlightTable {
    pub fn new(image_count: usize) -> Self {
        Self {
            fences: vec![None; image_count],
        }
    }

    pub fn get(&self, image: ImageIndex) -> Option<vk::Fence> {
        self.fences.get(image.as_usize()).copied().flatten()
    }

    /// Record `fence` as the owner of `image`, returning the previous owner.
    /// Images past the end of the table are not recorded.
    pub fn set(&mut self, image: ImageIndex, fence: vk::Fence) -> Option<vk::Fence> {
        self.fences.get_mut(image.as_usize())?.replace(fence)
    }

    #[inline]
    pub fn contains(&self, image: ImageIndex) -> bool {
        image.as_usize() < self.fences.len()
    }

    /// Forget every entry and resize for a new swapchain.
    pub fn reset(&mut self, image_count: usize) {
        self.fences.clear();
        self.fences.resize(image_count, None);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}

/// All synchronization state for `FRAMES_IN_FLIGHT` frame slots.
///
/// No control flow of its own: the frame scheduler decides when to wait,
/// reset and record ownership.
pub struct SynchronizationSet<D: GpuDevice> {
    slots: [FrameSlot; FRAMES_IN_FLIGHT],
    images_in_flight: ImageInFlightTable,
    device: Arc<D>,
}

impl<D: GpuDevice> SynchronizationSet<D> {
    pub fn new(device: Arc<D>, image_count: usize) -> RenderResult<Self> {
        let command_buffers = device
            .allocate_command_buffers(FRAMES_IN_FLIGHT as u32)
            .during("vkAllocateCommandBuffers")?;

        let mut slots = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for &command_buffer in &command_buffers {
            match FrameSlot::new(&*device, command_buffer) {
                Ok(slot) => slots.push(slot),
                Err(err) => {
                    for slot in &slots {
                        slot.destroy(&*device);
                    }
                    device.free_command_buffers(&command_buffers);
                    return Err(err);
                }
            }
        }

        let slots: [FrameSlot; FRAMES_IN_FLIGHT] = slots
            .try_into()
            .unwrap_or_else(|_| unreachable!("one command buffer per frame slot"));

        log::info!(
            "Created synchronization for {} frames in flight ({} swapchain images)",
            FRAMES_IN_FLIGHT,
            image_count
        );

        Ok(Self {
            slots,
            images_in_flight: ImageInFlightTable::new(image_count),
            device,
        })
    }

    #[inline]
    pub fn slot(&self, frame: FrameIndex) -> &FrameSlot {
        &self.slots[frame.get()]
    }

    #[inline]
    pub fn slots(&self) -> &[FrameSlot; FRAMES_IN_FLIGHT] {
        &self.slots
    }

    #[inline]
    pub fn images_in_flight(&self) -> &ImageInFlightTable {
        &self.images_in_flight
    }

    /// Block until the GPU is done with the last submission from `frame`.
    pub fn wait(&self, frame: FrameIndex) -> RenderResult<()> {
        self.device
            .wait_for_fence(self.slot(frame).fence, u64::MAX)
            .during("vkWaitForFences")
    }

    /// Wait, then unsignal the fence so the next submit can signal it.
    pub fn wait_and_reset(&self, frame: FrameIndex) -> RenderResult<()> {
        self.wait(frame)?;
        self.device
            .reset_fence(self.slot(frame).fence)
            .during("vkResetFences")
    }

    /// Claim `image` for `frame`.
    ///
    /// If another slot's fence still owns the image, wait for it first:
    /// acquire order and slot rotation don't have to line up, and without
    /// this two slots can render into the same image concurrently.
    pub fn claim_image(&mut self, image: ImageIndex, frame: FrameIndex) -> RenderResult<()> {
        let fence = self.slots[frame.get()].fence;

        if !self.images_in_flight.contains(image) {
            return Err(RenderError::ImageIndexOutOfRange {
                index: image.get(),
                image_count: self.images_in_flight.len(),
            });
        }

        if let Some(owner) = self.images_in_flight.get(image) {
            if owner != fence {
                log::trace!("Image {} still owned by another frame, waiting", image);
                self.device
                    .wait_for_fence(owner, u64::MAX)
                    .during("vkWaitForFences")?;
            }
        }

        self.images_in_flight.set(image, fence);
        Ok(())
    }

    /// Rebind to a swapchain with `image_count` images.
    ///
    /// The caller has waited for device idle, so no entry is still pending.
    /// Recording targets are reallocated when the image count changes; the
    /// slots themselves stay.
    pub fn rebind(&mut self, image_count: usize) -> RenderResult<()> {
        let count_changed = image_count != self.images_in_flight.len();
        self.images_in_flight.reset(image_count);

        if !count_changed {
            return Ok(());
        }

        // Slots keep their old buffers until the new ones exist, so a failed
        // allocation leaves nothing dangling for Drop.
        let command_buffers = self
            .device
            .allocate_command_buffers(FRAMES_IN_FLIGHT as u32)
            .during("vkAllocateCommandBuffers")?;

        let old: Vec<vk::CommandBuffer> = self
            .slots
            .iter_mut()
            .zip(command_buffers)
            .map(|(slot, command_buffer)| std::mem::replace(&mut slot.command_buffer, command_buffer))
            .collect();
        self.device.free_command_buffers(&old);

        log::debug!(
            "Swapchain image count is now {}, reallocated {} command buffers",
            image_count,
            FRAMES_IN_FLIGHT
        );
        Ok(())
    }
}

impl<D: GpuDevice> Drop for SynchronizationSet<D> {
    fn drop(&mut self) {
        let command_buffers: Vec<vk::CommandBuffer> =
            self.slots.iter().map(|s| s.command_buffer).collect();
        self.device.free_command_buffers(&command_buffers);

        for slot in &self.slots {
            slot.destroy(&*self.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Call, MockDevice};

    fn device() -> Arc<MockDevice> {
        Arc::new(MockDevice::new(vk::Extent2D {
            width: 800,
            height: 600,
        }))
    }

    #[test]
    fn slots_start_signaled() {
        let device = device();
        let sync = SynchronizationSet::new(device.clone(), 3).unwrap();

        for frame in FrameIndex::all() {
            assert!(device.is_fence_signaled(sync.slot(frame).fence));
            sync.wait(frame).unwrap();
        }
    }

    #[test]
    fn slots_are_distinct() {
        let sync = SynchronizationSet::new(device(), 3).unwrap();
        let [a, b] = [sync.slot(FrameIndex::FIRST), sync.slot(FrameIndex::FIRST.next())];
        assert_ne!(a.fence, b.fence);
        assert_ne!(a.image_acquired, b.image_acquired);
        assert_ne!(a.command_buffer, b.command_buffer);
    }

    #[test]
    fn wait_and_reset_unsignals() {
        let device = device();
        let sync = SynchronizationSet::new(device.clone(), 3).unwrap();
        let fence = sync.slot(FrameIndex::FIRST).fence;

        sync.wait_and_reset(FrameIndex::FIRST).unwrap();
        assert!(!device.is_fence_signaled(fence));
    }

    #[test]
    fn claim_waits_on_other_slots_fence() {
        let device = device();
        let mut sync = SynchronizationSet::new(device.clone(), 3).unwrap();
        let image = ImageIndex::new(1);
        let first = FrameIndex::FIRST;
        let second = first.next();

        sync.claim_image(image, first).unwrap();
        assert_eq!(sync.images_in_flight().get(image), Some(sync.slot(first).fence));

        device.clear_calls();
        sync.claim_image(image, second).unwrap();
        assert_eq!(device.calls(), vec![Call::WaitFence(sync.slot(first).fence)]);
        assert_eq!(sync.images_in_flight().get(image), Some(sync.slot(second).fence));
    }

    #[test]
    fn claim_by_same_slot_does_not_wait() {
        let device = device();
        let mut sync = SynchronizationSet::new(device.clone(), 3).unwrap();
        let image = ImageIndex::new(0);

        sync.claim_image(image, FrameIndex::FIRST).unwrap();
        device.clear_calls();
        sync.claim_image(image, FrameIndex::FIRST).unwrap();
        assert!(device.calls().is_empty());
    }

    #[test]
    fn rebind_reallocates_only_on_count_change() {
        let device = device();
        let mut sync = SynchronizationSet::new(device.clone(), 3).unwrap();
        sync.claim_image(ImageIndex::new(2), FrameIndex::FIRST).unwrap();
        let before = *sync.slot(FrameIndex::FIRST);

        sync.rebind(3).unwrap();
        assert_eq!(sync.slot(FrameIndex::FIRST).command_buffer, before.command_buffer);
        assert_eq!(sync.images_in_flight().get(ImageIndex::new(2)), None);

        sync.rebind(2).unwrap();
        assert_eq!(sync.images_in_flight().len(), 2);
        assert_ne!(sync.slot(FrameIndex::FIRST).command_buffer, before.command_buffer);
        assert_eq!(sync.slot(FrameIndex::FIRST).fence, before.fence);
    }

    #[test]
    fn failed_reallocation_keeps_old_command_buffers() {
        let device = device();
        let mut sync = SynchronizationSet::new(device.clone(), 3).unwrap();
        let before = *sync.slot(FrameIndex::FIRST);

        device.push_allocate(Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        let err = sync.rebind(4).unwrap_err();
        assert_eq!(err.code(), Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert_eq!(sync.slot(FrameIndex::FIRST).command_buffer, before.command_buffer);
        assert_eq!(device.count_calls(|c| matches!(c, Call::FreeCommandBuffers(_))), 0);

        drop(sync);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn drop_releases_everything() {
        let device = device();
        let sync = SynchronizationSet::new(device.clone(), 3).unwrap();
        drop(sync);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn table_set_returns_previous_owner() {
        let mut table = ImageInFlightTable::new(2);
        let fence = vk::Fence::null();
        assert_eq!(table.set(ImageIndex::new(0), fence), None);
        assert_eq!(table.set(ImageIndex::new(0), fence), Some(fence));
        assert_eq!(table.get(ImageIndex::new(5)), None);
        assert_eq!(table.set(ImageIndex::new(5), fence), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn claim_rejects_image_outside_table() {
        let mut sync = SynchronizationSet::new(device(), 3).unwrap();
        let err = sync.claim_image(ImageIndex::new(3), FrameIndex::FIRST).unwrap_err();
        assert!(matches!(
            err,
            RenderError::ImageIndexOutOfRange {
                index: 3,
                image_count: 3
            }
        ));
        assert_eq!(sync.images_in_flight().len(), 3);
    }
}

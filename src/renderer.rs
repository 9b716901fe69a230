// Frame scheduler - acquire, record, submit, present
//
// FRAME TIMELINE (one frame slot):
// ┌──────────────────────────────────────────────────────────────────────────┐
// │ wait slot fence ─> acquire ─> wait image owner ─> record ─> submit ─>    │
// │ present ─> (rebuild if stale) ─> next slot                               │
// └──────────────────────────────────────────────────────────────────────────┘
//
// Everything here runs on one thread. The swapchain is only replaced inside
// rebuild_swapchain, which never runs while a frame is open.

use ash::vk;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{FrameSubmit, GpuDevice, RenderPassBegin, SurfaceProvider};
use crate::config::Config;
use crate::error::{FrameStateError, RenderError, RenderResult, VkResultExt};
use crate::frame::{FrameContext, FrameIndex, FrameState, ImageIndex};
use crate::swapchain::{AcquireOutcome, PresentOutcome, Swapchain, SwapchainSettings};
use crate::sync::SynchronizationSet;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub swapchain: SwapchainSettings,
    pub clear_color: [f32; 4],
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            swapchain: SwapchainSettings::default(),
            clear_color: [0.01, 0.01, 0.01, 1.0],
        }
    }
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            swapchain: SwapchainSettings {
                preferred_present_mode: config.present_mode(),
                acquire_timeout: u64::try_from(config.acquire_timeout().as_nanos())
                    .unwrap_or(u64::MAX),
            },
            clear_color: config.graphics.clear_color,
        }
    }
}

/// Drives the frame state machine over a swapchain and `FRAMES_IN_FLIGHT`
/// frame slots.
///
/// ```no_run
/// # use present_core::backend::{GpuDevice, SurfaceProvider};
/// # use present_core::renderer::FrameScheduler;
/// # fn run<D: GpuDevice, S: SurfaceProvider>(
/// #     renderer: &mut FrameScheduler<D, S>,
/// # ) -> Result<(), present_core::RenderError> {
/// if let Some(frame) = renderer.begin_frame()? {
///     renderer.begin_swapchain_render_pass(&frame)?;
///     // record draws into frame.command_buffer
///     renderer.end_swapchain_render_pass(&frame)?;
///     renderer.end_frame()?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct FrameScheduler<D: GpuDevice, S: SurfaceProvider> {
    // Field order matters for Drop: sync objects and the swapchain go before
    // the device, and the device before the window behind the surface.
    sync: SynchronizationSet<D>,
    swapchain: Swapchain<D>,
    state: FrameState,
    settings: SchedulerSettings,
    rebuild_pending: bool,
    rebuild_count: u64,
    last_frame: Instant,
    shut_down: bool,
    device: Arc<D>,
    surface: S,
}

impl<D: GpuDevice, S: SurfaceProvider> FrameScheduler<D, S> {
    pub fn new(device: Arc<D>, mut surface: S, settings: SchedulerSettings) -> RenderResult<Self> {
        let extent = wait_for_drawable_extent(&mut surface);
        let swapchain = Swapchain::build(device.clone(), extent, None, &settings.swapchain)?;
        let sync = SynchronizationSet::new(device.clone(), swapchain.image_count())?;

        Ok(Self {
            sync,
            swapchain,
            state: FrameState::new(),
            settings,
            rebuild_pending: false,
            rebuild_count: 0,
            last_frame: Instant::now(),
            shut_down: false,
            device,
            surface,
        })
    }

    /// Open a frame.
    ///
    /// Returns `Ok(None)` when the swapchain was stale and has been rebuilt;
    /// skip rendering this tick and try again on the next one.
    pub fn begin_frame(&mut self) -> RenderResult<Option<FrameContext>> {
        self.state.ensure_idle().map_err(precondition)?;

        let frame = self.state.frame_index();

        // Don't get more than FRAMES_IN_FLIGHT frames ahead of the GPU
        self.sync.wait(frame)?;

        let slot = *self.sync.slot(frame);
        let image_index = match self.swapchain.acquire_next_image(slot.image_acquired)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    log::debug!("Acquired suboptimal image {}, rebuilding after this frame", image_index);
                    self.rebuild_pending = true;
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                self.rebuild_swapchain()?;
                return Ok(None);
            }
            AcquireOutcome::SurfaceLost => {
                log::error!("Surface lost while acquiring an image");
                return Err(RenderError::SurfaceLost {
                    op: "vkAcquireNextImageKHR",
                });
            }
        };

        self.sync.claim_image(image_index, frame)?;

        self.device
            .begin_command_buffer(slot.command_buffer)
            .during("vkBeginCommandBuffer")?;

        self.state.open(image_index).map_err(precondition)?;

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame);
        self.last_frame = now;

        log::trace!("Frame open: slot {}, image {}", frame, image_index);

        Ok(Some(FrameContext {
            command_buffer: slot.command_buffer,
            frame_index: frame,
            image_index,
            extent: self.swapchain.extent(),
            frame_time,
        }))
    }

    /// Close, submit and present the open frame.
    pub fn end_frame(&mut self) -> RenderResult<()> {
        let image_index = self.state.ensure_open().map_err(precondition)?;
        let frame = self.state.frame_index();
        let slot = *self.sync.slot(frame);

        self.device
            .end_command_buffer(slot.command_buffer)
            .during("vkEndCommandBuffer")?;

        // Unsignal right before the submit that will signal it again
        self.sync.wait_and_reset(frame)?;

        self.device
            .queue_submit(&FrameSubmit {
                command_buffer: slot.command_buffer,
                wait_semaphore: slot.image_acquired,
                wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                signal_semaphore: slot.render_finished,
                fence: slot.fence,
            })
            .during("vkQueueSubmit")
            .map_err(|err| {
                log::error!("Frame {} submission failed: {}", frame, err);
                err
            })?;

        let outcome = self.swapchain.present(slot.render_finished, image_index)?;
        let resized = self.surface.consume_resize_flag();

        self.state.close().map_err(precondition)?;

        match outcome {
            PresentOutcome::Success => {}
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                log::debug!("Present returned {:?}, rebuilding swapchain", outcome);
                self.rebuild_pending = true;
            }
            PresentOutcome::SurfaceLost => {
                log::error!("Surface lost while presenting image {}", image_index);
                return Err(RenderError::SurfaceLost {
                    op: "vkQueuePresentKHR",
                });
            }
        }

        if resized {
            log::debug!("Surface resized, rebuilding swapchain");
            self.rebuild_pending = true;
        }

        if self.rebuild_pending {
            self.rebuild_swapchain()?;
        }

        Ok(())
    }

    /// Replace the swapchain with one matching the surface's current size.
    ///
    /// Stalls the whole device first. While the surface has zero area this
    /// blocks on the surface's event wait until it has a size again.
    pub fn rebuild_swapchain(&mut self) -> RenderResult<()> {
        self.state.ensure_idle().map_err(precondition)?;

        let extent = wait_for_drawable_extent(&mut self.surface);

        self.device.wait_idle().during("vkDeviceWaitIdle")?;

        let swapchain = Swapchain::build(
            self.device.clone(),
            extent,
            Some(&self.swapchain),
            &self.settings.swapchain,
        )?;
        let previous = std::mem::replace(&mut self.swapchain, swapchain);

        if !previous.formats_compatible(&self.swapchain) {
            log::error!(
                "Swapchain formats changed on rebuild: {:?}/{:?} -> {:?}/{:?}",
                previous.image_format(),
                previous.depth_format(),
                self.swapchain.image_format(),
                self.swapchain.depth_format()
            );
            return Err(RenderError::FormatChanged {
                old_color: previous.image_format(),
                new_color: self.swapchain.image_format(),
                old_depth: previous.depth_format(),
                new_depth: self.swapchain.depth_format(),
            });
        }

        let previous_count = previous.image_count();
        drop(previous);

        self.sync.rebind(self.swapchain.image_count())?;
        if previous_count != self.swapchain.image_count() {
            log::info!(
                "Swapchain image count changed: {} -> {}",
                previous_count,
                self.swapchain.image_count()
            );
        }

        self.rebuild_pending = false;
        self.rebuild_count += 1;
        Ok(())
    }

    /// Open a render pass over the acquired image's framebuffer, cleared to
    /// the configured color, with a full-extent viewport and scissor.
    pub fn begin_swapchain_render_pass(&self, frame: &FrameContext) -> RenderResult<()> {
        let image_index = self.check_target(frame)?;
        let framebuffer = self.swapchain.framebuffer(image_index).ok_or(
            RenderError::ImageIndexOutOfRange {
                index: image_index.get(),
                image_count: self.swapchain.image_count(),
            },
        )?;
        let extent = self.swapchain.extent();

        self.device.cmd_begin_render_pass(
            frame.command_buffer,
            &RenderPassBegin {
                render_pass: self.swapchain.render_pass(),
                framebuffer,
                extent,
                clear_color: self.settings.clear_color,
                clear_depth: 1.0,
            },
        );
        self.device
            .cmd_set_viewport_and_scissor(frame.command_buffer, extent);
        Ok(())
    }

    pub fn end_swapchain_render_pass(&self, frame: &FrameContext) -> RenderResult<()> {
        self.check_target(frame)?;
        self.device.cmd_end_render_pass(frame.command_buffer);
        Ok(())
    }

    fn check_target(&self, frame: &FrameContext) -> RenderResult<ImageIndex> {
        let image_index = self.state.ensure_open().map_err(precondition)?;
        let current = self.state.frame_index();
        let expected_buffer = self.sync.slot(current).command_buffer;

        if frame.frame_index != current
            || frame.command_buffer != expected_buffer
            || frame.image_index != image_index
        {
            return Err(precondition(FrameStateError::TargetMismatch {
                expected: current,
                found: frame.frame_index,
            }));
        }
        Ok(image_index)
    }

    /// Wait for the device to go idle. Safe to call more than once; also run
    /// on drop.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        log::info!("Shutting down frame scheduler after {} rebuilds", self.rebuild_count);
        self.device.wait_idle().during("vkDeviceWaitIdle")
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.settings.clear_color = color;
    }

    #[inline]
    pub fn frame_index(&self) -> FrameIndex {
        self.state.frame_index()
    }

    /// Image acquired by the open frame.
    #[inline]
    pub fn image_index(&self) -> Option<ImageIndex> {
        self.state.image_index()
    }

    #[inline]
    pub fn is_frame_open(&self) -> bool {
        self.state.is_open()
    }

    #[inline]
    pub fn swapchain(&self) -> &Swapchain<D> {
        &self.swapchain
    }

    #[inline]
    pub fn render_pass(&self) -> vk::RenderPass {
        self.swapchain.render_pass()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.aspect_ratio()
    }

    #[inline]
    pub fn sync(&self) -> &SynchronizationSet<D> {
        &self.sync
    }

    /// Completed swapchain rebuilds since construction.
    #[inline]
    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }

    #[inline]
    pub fn surface(&self) -> &S {
        &self.surface
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<D: GpuDevice, S: SurfaceProvider> Drop for FrameScheduler<D, S> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("Device wait before teardown failed: {}", err);
        }
    }
}

fn precondition(err: FrameStateError) -> RenderError {
    log::error!("Frame scheduling bug: {}", err);
    RenderError::Precondition(err)
}

/// Busy-wait (on the surface's event wait) until the surface has a size.
fn wait_for_drawable_extent<S: SurfaceProvider>(surface: &mut S) -> vk::Extent2D {
    let mut extent = surface.current_extent();
    if extent.width == 0 || extent.height == 0 {
        log::info!("Surface is minimized, waiting for a drawable size");
        while extent.width == 0 || extent.height == 0 {
            surface.wait_for_events();
            extent = surface.current_extent();
        }
        log::info!("Surface restored to {}x{}", extent.width, extent.height);
    }
    extent
}

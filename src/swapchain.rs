// Swapchain - Window presentation
//
// Owns the chain of presentable images plus everything bound to them:
// color views, one depth image per swapchain image, the render pass and the
// framebuffers. A Swapchain is built in one batch and destroyed in one batch.

use ash::vk;
use std::sync::Arc;

use crate::backend::{BackendStatus, GpuDevice, SurfaceSupport, SwapchainDesc};
use crate::error::{RenderError, RenderResult, VkResultExt};
use crate::frame::ImageIndex;

pub const PREFERRED_SURFACE_FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;
pub const PREFERRED_COLOR_SPACE: vk::ColorSpaceKHR = vk::ColorSpaceKHR::SRGB_NONLINEAR;

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Build-time knobs, usually derived from [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub preferred_present_mode: vk::PresentModeKHR,
    /// Acquire timeout in nanoseconds.
    pub acquire_timeout: u64,
}

impl Default for SwapchainSettings {
    fn default() -> Self {
        Self {
            preferred_present_mode: vk::PresentModeKHR::MAILBOX,
            acquire_timeout: 1_000_000_000,
        }
    }
}

/// Result of asking for the next image. Only `Acquired` starts a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired {
        image_index: ImageIndex,
        suboptimal: bool,
    },
    OutOfDate,
    SurfaceLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Success,
    /// Displayed, but the swapchain should be rebuilt soon.
    Suboptimal,
    /// Must be rebuilt before the next acquire.
    OutOfDate,
    SurfaceLost,
}

/// Depth attachment for one swapchain image.
#[derive(Debug, Clone, Copy)]
pub struct DepthResource {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

pub struct Swapchain<D: GpuDevice> {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth_resources: Vec<DepthResource>,
    framebuffers: Vec<vk::Framebuffer>,
    render_pass: vk::RenderPass,
    surface_format: vk::SurfaceFormatKHR,
    depth_format: vk::Format,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    acquire_timeout: u64,
    device: Arc<D>,
}

impl<D: GpuDevice> Swapchain<D> {
    /// Build a swapchain for the device's surface.
    ///
    /// `previous` is handed to the driver as `oldSwapchain` so it can recycle
    /// images during the hand-off. The caller keeps ownership of it and drops
    /// it once this call has returned a live swapchain.
    pub fn build(
        device: Arc<D>,
        requested_extent: vk::Extent2D,
        previous: Option<&Swapchain<D>>,
        settings: &SwapchainSettings,
    ) -> RenderResult<Self> {
        let support = device
            .surface_support()
            .during("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;

        if support.formats.is_empty() || support.present_modes.is_empty() {
            log::error!(
                "Surface reports {} formats and {} present modes",
                support.formats.len(),
                support.present_modes.len()
            );
            return Err(RenderError::SurfaceIncompatible);
        }

        let surface_format =
            choose_surface_format(&support.formats).ok_or(RenderError::SurfaceIncompatible)?;
        let present_mode =
            choose_present_mode(&support.present_modes, settings.preferred_present_mode);
        let extent = choose_extent(&support.capabilities, requested_extent);
        let min_image_count = choose_image_count(&support);
        let depth_format = choose_depth_format(|format| device.supports_depth_format(format))
            .ok_or(RenderError::NoDepthFormat)?;

        let desc = SwapchainDesc {
            surface_format,
            present_mode,
            extent,
            min_image_count,
            pre_transform: support.capabilities.current_transform,
            old_swapchain: previous.map_or(vk::SwapchainKHR::null(), |old| old.handle),
        };

        let handle = device.create_swapchain(&desc).during("vkCreateSwapchainKHR")?;

        // From here on Drop cleans up whatever has been created so far
        let mut swapchain = Self {
            handle,
            images: Vec::new(),
            image_views: Vec::new(),
            depth_resources: Vec::new(),
            framebuffers: Vec::new(),
            render_pass: vk::RenderPass::null(),
            surface_format,
            depth_format,
            present_mode,
            extent,
            acquire_timeout: settings.acquire_timeout,
            device,
        };

        swapchain.images = swapchain
            .device
            .swapchain_images(handle)
            .during("vkGetSwapchainImagesKHR")?;
        swapchain.create_image_views()?;
        swapchain.render_pass = swapchain
            .device
            .create_render_pass(surface_format.format, depth_format)
            .during("vkCreateRenderPass")?;
        swapchain.create_depth_resources()?;
        swapchain.create_framebuffers()?;

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}/{:?}, depth {:?}",
            extent.width,
            extent.height,
            swapchain.images.len(),
            present_mode,
            surface_format.format,
            surface_format.color_space,
            depth_format
        );

        Ok(swapchain)
    }

    fn create_image_views(&mut self) -> RenderResult<()> {
        for &image in &self.images {
            let view = self
                .device
                .create_image_view(image, self.surface_format.format, vk::ImageAspectFlags::COLOR)
                .during("vkCreateImageView")?;
            self.image_views.push(view);
        }
        Ok(())
    }

    fn create_depth_resources(&mut self) -> RenderResult<()> {
        for _ in 0..self.images.len() {
            let image = self
                .device
                .create_depth_image(self.extent, self.depth_format)
                .during("vkCreateImage")?;

            let view = match self.device.create_image_view(
                image,
                self.depth_format,
                vk::ImageAspectFlags::DEPTH,
            ) {
                Ok(view) => view,
                Err(code) => {
                    self.device.destroy_depth_image(image);
                    return Err(RenderError::Backend {
                        op: "vkCreateImageView",
                        code,
                    });
                }
            };

            self.depth_resources.push(DepthResource { image, view });
        }
        Ok(())
    }

    fn create_framebuffers(&mut self) -> RenderResult<()> {
        for (color, depth) in self.image_views.iter().zip(&self.depth_resources) {
            let framebuffer = self
                .device
                .create_framebuffer(self.render_pass, &[*color, depth.view], self.extent)
                .during("vkCreateFramebuffer")?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// Hand the next image to the caller, signaling `signal` once it is
    /// safe to render into.
    ///
    /// Blocks at most for the configured acquire timeout; a timeout reports
    /// `OutOfDate`.
    pub fn acquire_next_image(&self, signal: vk::Semaphore) -> RenderResult<AcquireOutcome> {
        let result = self
            .device
            .acquire_next_image(self.handle, self.acquire_timeout, signal);

        match result {
            Ok((index, _)) if index as usize >= self.images.len() => {
                log::error!("Acquire returned image {} of {}", index, self.images.len());
                Err(RenderError::ImageIndexOutOfRange {
                    index,
                    image_count: self.images.len(),
                })
            }
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index: ImageIndex::new(index),
                suboptimal,
            }),
            Err(code) => match BackendStatus::classify(code) {
                BackendStatus::OutOfDate => {
                    log::debug!("Swapchain out of date during acquire ({})", code);
                    Ok(AcquireOutcome::OutOfDate)
                }
                BackendStatus::Lost => Ok(AcquireOutcome::SurfaceLost),
                _ => Err(RenderError::Backend {
                    op: "vkAcquireNextImageKHR",
                    code,
                }),
            },
        }
    }

    /// Queue `image_index` for display once `wait` is signaled.
    pub fn present(
        &self,
        wait: vk::Semaphore,
        image_index: ImageIndex,
    ) -> RenderResult<PresentOutcome> {
        let result = self
            .device
            .queue_present(self.handle, image_index.get(), wait);

        match result {
            Ok(false) => Ok(PresentOutcome::Success),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(code) => match BackendStatus::classify(code) {
                BackendStatus::Suboptimal => Ok(PresentOutcome::Suboptimal),
                BackendStatus::OutOfDate => {
                    log::debug!("Swapchain out of date during present ({})", code);
                    Ok(PresentOutcome::OutOfDate)
                }
                BackendStatus::Lost => Ok(PresentOutcome::SurfaceLost),
                _ => Err(RenderError::Backend {
                    op: "vkQueuePresentKHR",
                    code,
                }),
            },
        }
    }

    /// Same color and depth formats, i.e. render passes built against one
    /// are still valid for the other.
    pub fn formats_compatible(&self, other: &Swapchain<D>) -> bool {
        self.surface_format.format == other.surface_format.format
            && self.depth_format == other.depth_format
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    #[inline]
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    #[inline]
    pub fn depth_resources(&self) -> &[DepthResource] {
        &self.depth_resources
    }

    #[inline]
    pub fn framebuffers(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    pub fn framebuffer(&self, image_index: ImageIndex) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index.as_usize()).copied()
    }

    #[inline]
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    #[inline]
    pub fn image_format(&self) -> vk::Format {
        self.surface_format.format
    }

    #[inline]
    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.surface_format.color_space
    }

    #[inline]
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }
}

impl<D: GpuDevice> Drop for Swapchain<D> {
    fn drop(&mut self) {
        for &framebuffer in &self.framebuffers {
            self.device.destroy_framebuffer(framebuffer);
        }
        for depth in &self.depth_resources {
            self.device.destroy_image_view(depth.view);
            self.device.destroy_depth_image(depth.image);
        }
        for &view in &self.image_views {
            self.device.destroy_image_view(view);
        }
        if self.render_pass != vk::RenderPass::null() {
            self.device.destroy_render_pass(self.render_pass);
        }
        self.device.destroy_swapchain(self.handle);
    }
}

/// Prefer 8-bit sRGB, else whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == PREFERRED_SURFACE_FORMAT && f.color_space == PREFERRED_COLOR_SPACE)
        .or_else(|| formats.first())
        .copied()
}

// FIFO is the one mode every driver must support
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    [
        preferred,
        vk::PresentModeKHR::MAILBOX,
        vk::PresentModeKHR::FIFO_RELAXED,
    ]
    .into_iter()
    .find(|mode| available.contains(mode))
    .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: requested.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: requested.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, so the driver never stalls us on the last image.
pub fn choose_image_count(support: &SurfaceSupport) -> u32 {
    let caps = &support.capabilities;
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub fn choose_depth_format(supported: impl Fn(vk::Format) -> bool) -> Option<vk::Format> {
    DEPTH_FORMAT_CANDIDATES
        .into_iter()
        .find(|&format| supported(format))
}

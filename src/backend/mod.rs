// Backend module - the GPU API boundary
//
// GpuDevice is a thin mirror of the Vulkan calls the presentation core
// makes. VulkanDevice implements it over ash; tests implement it with a
// scripted mock. Handles stay ash handle types on both sides.

pub mod device;
pub mod memory;
pub mod render_pass;
pub mod surface;

#[cfg(test)]
pub mod mock;

pub use device::VulkanDevice;

use ash::prelude::VkResult;
use ash::vk;

/// What vkAcquireNextImageKHR / vkQueuePresentKHR can tell us, reduced to
/// the cases the frame loop branches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Success,
    Suboptimal,
    /// Includes acquire timeouts: the caller rebuilds and skips the frame.
    OutOfDate,
    Lost,
    Fatal(vk::Result),
}

impl BackendStatus {
    pub fn classify(result: vk::Result) -> Self {
        match result {
            vk::Result::SUCCESS => BackendStatus::Success,
            vk::Result::SUBOPTIMAL_KHR => BackendStatus::Suboptimal,
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::TIMEOUT | vk::Result::NOT_READY => {
                BackendStatus::OutOfDate
            }
            vk::Result::ERROR_SURFACE_LOST_KHR => BackendStatus::Lost,
            other => BackendStatus::Fatal(other),
        }
    }
}

/// Surface properties queried right before a swapchain build.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Everything vkCreateSwapchainKHR needs besides the surface, which the
/// device owns.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Previous swapchain, or null on first build.
    pub old_swapchain: vk::SwapchainKHR,
}

/// One frame's queue submission.
#[derive(Debug, Clone, Copy)]
pub struct FrameSubmit {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderPassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

/// Logical device, its graphics+present queue, command pool and the surface
/// it presents to. The presentation core never creates or destroys one.
pub trait GpuDevice {
    fn wait_idle(&self) -> VkResult<()>;

    // Synchronization primitives
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    // Command buffers from the device's pool
    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);
    /// Reset and begin a one-time-submit recording.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn queue_submit(&self, submit: &FrameSubmit) -> VkResult<()>;

    // Surface and swapchain
    fn surface_support(&self) -> VkResult<SurfaceSupport>;
    fn supports_depth_format(&self, format: vk::Format) -> bool;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// `Ok((index, suboptimal))`, or the raw error code.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    /// `Ok(suboptimal)`, or the raw error code.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool>;

    // Images and attachments
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn create_depth_image(&self, extent: vk::Extent2D, format: vk::Format) -> VkResult<vk::Image>;
    fn destroy_depth_image(&self, image: vk::Image);
    fn create_render_pass(
        &self,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Recording
    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin);
    fn cmd_set_viewport_and_scissor(&self, command_buffer: vk::CommandBuffer, extent: vk::Extent2D);
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
}

/// Window-side collaborator: drawable size and resize notifications.
pub trait SurfaceProvider {
    fn current_extent(&self) -> vk::Extent2D;

    /// True once per resize, then false until the next one.
    fn consume_resize_flag(&mut self) -> bool;

    /// Block until the window system has something new to say. Only used
    /// while the surface has zero area.
    fn wait_for_events(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_recoverable_codes() {
        assert_eq!(BackendStatus::classify(vk::Result::SUCCESS), BackendStatus::Success);
        assert_eq!(
            BackendStatus::classify(vk::Result::SUBOPTIMAL_KHR),
            BackendStatus::Suboptimal
        );
        assert_eq!(
            BackendStatus::classify(vk::Result::ERROR_OUT_OF_DATE_KHR),
            BackendStatus::OutOfDate
        );
        assert_eq!(BackendStatus::classify(vk::Result::TIMEOUT), BackendStatus::OutOfDate);
    }

    #[test]
    fn classify_fatal_codes() {
        assert_eq!(
            BackendStatus::classify(vk::Result::ERROR_SURFACE_LOST_KHR),
            BackendStatus::Lost
        );
        let lost_device = BackendStatus::classify(vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(lost_device, BackendStatus::Fatal(vk::Result::ERROR_DEVICE_LOST));
    }
}

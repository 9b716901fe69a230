// Scripted in-memory backend for tests
//
// Hands out fake handles, records the calls the frame loop makes, and lets a
// test script acquire/present results and surface sizes. The "GPU" finishes
// every submission instantly, so the only way a fence wait can hang is a
// fence that was reset and never submitted; the mock panics on that instead
// of hanging.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::{FrameSubmit, GpuDevice, RenderPassBegin, SurfaceProvider, SurfaceSupport, SwapchainDesc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    WaitIdle,
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    AllocateCommandBuffers(u32),
    FreeCommandBuffers(usize),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    Submit {
        command_buffer: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    },
    CreateSwapchain {
        handle: vk::SwapchainKHR,
        old: vk::SwapchainKHR,
        extent: vk::Extent2D,
    },
    DestroySwapchain(vk::SwapchainKHR),
    Acquire {
        signal: vk::Semaphore,
    },
    Present {
        image_index: u32,
        wait: vk::Semaphore,
    },
    BeginRenderPass {
        command_buffer: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    },
    SetViewportAndScissor(vk::Extent2D),
    EndRenderPass(vk::CommandBuffer),
}

struct SurfaceState {
    extent: vk::Extent2D,
    /// Extents revealed one by one by `wait_for_events`.
    pending: VecDeque<vk::Extent2D>,
    resized: bool,
    waits: usize,
}

struct MockState {
    next_handle: u64,
    calls: Vec<Call>,
    live: HashSet<u64>,
    fences: HashMap<vk::Fence, bool>,
    swapchains: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    framebuffers: HashMap<vk::Framebuffer, vk::Extent2D>,
    surface: SurfaceState,
    min_image_count: u32,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    depth_formats: Vec<vk::Format>,
    acquire_script: VecDeque<VkResult<(u32, bool)>>,
    next_image: u32,
    present_script: VecDeque<VkResult<bool>>,
    submit_script: VecDeque<VkResult<()>>,
    allocate_script: VecDeque<VkResult<()>>,
}

impl MockState {
    fn fresh(&mut self) -> u64 {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        self.next_handle
    }

    fn release(&mut self, raw: u64) {
        assert!(self.live.remove(&raw), "double destroy of handle {raw:#x}");
    }
}

/// Fake device. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn new(extent: vk::Extent2D) -> Self {
        let state = MockState {
            next_handle: 0x1000,
            calls: Vec::new(),
            live: HashSet::new(),
            fences: HashMap::new(),
            swapchains: HashMap::new(),
            framebuffers: HashMap::new(),
            surface: SurfaceState {
                extent,
                pending: VecDeque::new(),
                resized: false,
                waits: 0,
            },
            min_image_count: 2,
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            depth_formats: vec![vk::Format::D32_SFLOAT],
            acquire_script: VecDeque::new(),
            next_image: 0,
            present_script: VecDeque::new(),
            submit_script: VecDeque::new(),
            allocate_script: VecDeque::new(),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A surface provider sharing this device's surface.
    pub fn surface(&self) -> MockSurface {
        MockSurface {
            state: self.state.clone(),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count_calls(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Objects created and not yet destroyed, swapchains included.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn framebuffer_extent(&self, framebuffer: vk::Framebuffer) -> Option<vk::Extent2D> {
        self.state.lock().framebuffers.get(&framebuffer).copied()
    }

    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.lock().formats = formats;
    }

    pub fn set_depth_formats(&self, formats: Vec<vk::Format>) {
        self.state.lock().depth_formats = formats;
    }

    pub fn set_min_image_count(&self, count: u32) {
        self.state.lock().min_image_count = count;
    }

    /// Change the drawable size and raise the resize flag.
    pub fn resize(&self, extent: vk::Extent2D) {
        let mut state = self.state.lock();
        state.surface.extent = extent;
        state.surface.resized = true;
    }

    /// Sizes the surface will report after each successive `wait_for_events`.
    pub fn queue_surface_extents(&self, extents: impl IntoIterator<Item = vk::Extent2D>) {
        self.state.lock().surface.pending.extend(extents);
    }

    pub fn surface_waits(&self) -> usize {
        self.state.lock().surface.waits
    }

    pub fn push_acquire(&self, result: VkResult<(u32, bool)>) {
        self.state.lock().acquire_script.push_back(result);
    }

    pub fn push_present(&self, result: VkResult<bool>) {
        self.state.lock().present_script.push_back(result);
    }

    pub fn push_submit(&self, result: VkResult<()>) {
        self.state.lock().submit_script.push_back(result);
    }

    pub fn push_allocate(&self, result: VkResult<()>) {
        self.state.lock().allocate_script.push_back(result);
    }
}

impl GpuDevice for MockDevice {
    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::WaitIdle);
        // Instant GPU: every submitted fence is already signaled
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        Ok(vk::Semaphore::from_raw(self.state.lock().fresh()))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().release(semaphore.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(state.fresh());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.release(fence.as_raw());
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::WaitFence(fence));
        match state.fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => panic!("deadlock: waiting on fence {fence:?} that nothing will signal"),
            None => panic!("waiting on unknown fence {fence:?}"),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::ResetFence(fence));
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => panic!("resetting unknown fence {fence:?}"),
        }
    }

    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        state.calls.push(Call::AllocateCommandBuffers(count));
        if let Some(result) = state.allocate_script.pop_front() {
            result?;
        }
        Ok((0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.fresh()))
            .collect())
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        state.calls.push(Call::FreeCommandBuffers(command_buffers.len()));
        for command_buffer in command_buffers {
            state.release(command_buffer.as_raw());
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.state
            .lock()
            .calls
            .push(Call::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.state
            .lock()
            .calls
            .push(Call::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn queue_submit(&self, submit: &FrameSubmit) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Submit {
            command_buffer: submit.command_buffer,
            wait: submit.wait_semaphore,
            signal: submit.signal_semaphore,
            fence: submit.fence,
        });

        if let Some(result) = state.submit_script.pop_front() {
            result?;
        }

        match state.fences.get_mut(&submit.fence) {
            Some(signaled) => {
                assert!(!*signaled, "submitted with a fence that is still signaled");
                *signaled = true;
            }
            None => panic!("submit with unknown fence {:?}", submit.fence),
        }
        Ok(())
    }

    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        let state = self.state.lock();
        Ok(SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: state.min_image_count,
                max_image_count: 0,
                current_extent: state.surface.extent,
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 16384,
                    height: 16384,
                },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: state.formats.clone(),
            present_modes: state.present_modes.clone(),
        })
    }

    fn supports_depth_format(&self, format: vk::Format) -> bool {
        self.state.lock().depth_formats.contains(&format)
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        let handle = vk::SwapchainKHR::from_raw(state.fresh());
        let images = (0..desc.min_image_count)
            .map(|_| {
                state.next_handle += 1;
                vk::Image::from_raw(state.next_handle)
            })
            .collect();
        state.swapchains.insert(handle, images);
        state.calls.push(Call::CreateSwapchain {
            handle,
            old: desc.old_swapchain,
            extent: desc.extent,
        });
        Ok(handle)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain)
            .cloned()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.calls.push(Call::DestroySwapchain(swapchain));
        state.swapchains.remove(&swapchain);
        state.release(swapchain.as_raw());
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        state.calls.push(Call::Acquire { signal });

        if let Some(result) = state.acquire_script.pop_front() {
            return result;
        }

        let count = state.swapchains.get(&swapchain).map_or(1, |images| images.len() as u32);
        let index = state.next_image % count;
        state.next_image += 1;
        Ok((index, false))
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.calls.push(Call::Present { image_index, wait });
        state.present_script.pop_front().unwrap_or(Ok(false))
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView> {
        Ok(vk::ImageView::from_raw(self.state.lock().fresh()))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().release(view.as_raw());
    }

    fn create_depth_image(&self, _extent: vk::Extent2D, _format: vk::Format) -> VkResult<vk::Image> {
        Ok(vk::Image::from_raw(self.state.lock().fresh()))
    }

    fn destroy_depth_image(&self, image: vk::Image) {
        self.state.lock().release(image.as_raw());
    }

    fn create_render_pass(
        &self,
        _color_format: vk::Format,
        _depth_format: vk::Format,
    ) -> VkResult<vk::RenderPass> {
        Ok(vk::RenderPass::from_raw(self.state.lock().fresh()))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.lock().release(render_pass.as_raw());
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        assert_eq!(attachments.len(), 2, "framebuffer needs color + depth");
        let mut state = self.state.lock();
        let framebuffer = vk::Framebuffer::from_raw(state.fresh());
        state.framebuffers.insert(framebuffer, extent);
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.lock();
        state.framebuffers.remove(&framebuffer);
        state.release(framebuffer.as_raw());
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin) {
        self.state.lock().calls.push(Call::BeginRenderPass {
            command_buffer,
            framebuffer: begin.framebuffer,
            extent: begin.extent,
        });
    }

    fn cmd_set_viewport_and_scissor(&self, _command_buffer: vk::CommandBuffer, extent: vk::Extent2D) {
        self.state
            .lock()
            .calls
            .push(Call::SetViewportAndScissor(extent));
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.state
            .lock()
            .calls
            .push(Call::EndRenderPass(command_buffer));
    }
}

/// Surface half of the mock; shares state with the device it came from.
pub struct MockSurface {
    state: Arc<Mutex<MockState>>,
}

impl SurfaceProvider for MockSurface {
    fn current_extent(&self) -> vk::Extent2D {
        self.state.lock().surface.extent
    }

    fn consume_resize_flag(&mut self) -> bool {
        std::mem::take(&mut self.state.lock().surface.resized)
    }

    fn wait_for_events(&mut self) {
        let mut state = self.state.lock();
        state.surface.waits += 1;
        match state.surface.pending.pop_front() {
            Some(extent) => state.surface.extent = extent,
            None => panic!("wait_for_events would block forever: no surface change scripted"),
        }
    }
}

// =============================================================================
// PRESENT CORE - Swapchain ownership and frame pacing for Vulkan
// =============================================================================
//
// The piece of a renderer that sits between the window and the draw code:
// it owns the swapchain, keeps FRAMES_IN_FLIGHT frames queued on the GPU,
// and rebuilds everything that depends on the window size when the surface
// changes.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  FrameScheduler (begin_frame / end_frame state machine)         │
// │    ├── Swapchain (images, views, depth, render pass, fbs)       │
// │    ├── SynchronizationSet (per-slot semaphores + fences)        │
// │    └── SurfaceProvider (window size, resize flag)               │
// │          └── GpuDevice (VulkanDevice, or a mock in tests)       │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod renderer;
pub mod swapchain;
pub mod sync;
pub mod window;

/// Frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

pub use backend::{GpuDevice, SurfaceProvider, VulkanDevice};
pub use config::Config;
pub use error::{FrameStateError, RenderError, RenderResult};
pub use frame::{FrameContext, FrameIndex, ImageIndex};
pub use renderer::{FrameScheduler, SchedulerSettings};
pub use swapchain::Swapchain;
pub use window::{has_drawable_area, WinitSurface};

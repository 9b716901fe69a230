// Window - winit side of the presentation loop
//
// The event loop owns event dispatch, so the scheduler can't pump events
// while it waits out a minimized window. wait_for_events sleeps for the
// configured poll interval and lets the next size query hit the window
// system again.
//
// That re-query is live on Win32, X11 and macOS. On Wayland winit caches
// the size and only updates it while dispatching events, so the spin would
// never end there. Callers on the event loop thread must not let the
// scheduler see a zero-sized window: create it only once the window has a
// drawable size (see `has_drawable_area`) and stop drawing after a
// zero-sized Resized until the next non-zero one.

use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use winit::dpi::PhysicalSize;
use winit::window::Window;

use crate::backend::SurfaceProvider;

pub struct WinitSurface {
    window: Arc<Window>,
    resized: AtomicBool,
    poll_interval: Duration,
}

impl WinitSurface {
    pub fn new(window: Arc<Window>, poll_interval: Duration) -> Self {
        Self {
            window,
            resized: AtomicBool::new(false),
            poll_interval,
        }
    }

    /// Call from `WindowEvent::Resized` and after anything that changes the
    /// window size behind the scheduler's back (fullscreen toggles).
    pub fn notify_resized(&self) {
        self.resized.store(true, Ordering::Release);
    }

    #[inline]
    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }
}

impl SurfaceProvider for WinitSurface {
    fn current_extent(&self) -> vk::Extent2D {
        extent_from_size(self.window.inner_size())
    }

    fn consume_resize_flag(&mut self) -> bool {
        self.resized.swap(false, Ordering::AcqRel)
    }

    fn wait_for_events(&mut self) {
        log::trace!("Window has no drawable area, sleeping {:?}", self.poll_interval);
        std::thread::sleep(self.poll_interval);
    }
}

#[inline]
pub fn has_drawable_area(size: PhysicalSize<u32>) -> bool {
    size.width > 0 && size.height > 0
}

pub fn extent_from_size(size: PhysicalSize<u32>) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_size_maps_to_extent() {
        assert_eq!(
            extent_from_size(PhysicalSize::new(1920, 1080)),
            vk::Extent2D {
                width: 1920,
                height: 1080
            }
        );
        let minimized = extent_from_size(PhysicalSize::new(0, 0));
        assert_eq!((minimized.width, minimized.height), (0, 0));
    }

    #[test]
    fn zero_width_or_height_is_not_drawable() {
        assert!(has_drawable_area(PhysicalSize::new(1, 1)));
        assert!(!has_drawable_area(PhysicalSize::new(0, 720)));
        assert!(!has_drawable_area(PhysicalSize::new(1280, 0)));
    }
}

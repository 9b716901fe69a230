// =============================================================================
// PRESENT DEMO - Drives the frame scheduler from a winit window
// =============================================================================
//
// Clears the screen to an animated color every frame. Everything
// interesting (acquire, fences, rebuilds on resize) happens inside
// FrameScheduler; this file only routes window events to it.
//
// FRAME FLOW:
// 1. RedrawRequested
// 2. begin_frame (None = swapchain was rebuilt, skip this tick)
// 3. begin/end swapchain render pass
// 4. end_frame (submit + present, rebuild if needed)
//
// Keys: F11 toggles fullscreen, Esc quits.
//
// =============================================================================

use anyhow::{Context, Result};
use present_core::config::Config;
use present_core::{
    has_drawable_area, FrameScheduler, RenderResult, SchedulerSettings, SurfaceProvider,
    VulkanDevice, WinitSurface,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

type Renderer = FrameScheduler<VulkanDevice, WinitSurface>;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting present demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// RUST_LOG wins over the config file's log level
fn init_logging(config: &Config) {
    let env = env_logger::Env::default().default_filter_or(config.debug.log_level.as_str());
    env_logger::Builder::from_env(env).init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The renderer (and the device it
/// holds) must go before the window its surface was created from.
struct App {
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,

    config: Config,
    is_fullscreen: bool,
    /// Resized to 0x0: skip redraws instead of blocking the event loop
    is_minimized: bool,
    /// First fatal error; main returns it after the loop exits
    fatal: Option<anyhow::Error>,

    // FPS tracking
    start_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            renderer: None,
            window: None,
            config,
            is_fullscreen,
            is_minimized: false,
            fatal: None,
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
        }
    }

    /// Creates the renderer once the window can be drawn into. Until then
    /// the scheduler would block the event loop waiting for a size.
    fn try_init_renderer(&mut self, event_loop: &ActiveEventLoop) {
        if self.renderer.is_some() || self.fatal.is_some() {
            return;
        }
        let Some(window) = self.window.clone() else {
            return;
        };
        if !has_drawable_area(window.inner_size()) {
            log::info!("Window has no drawable area yet, deferring Vulkan setup");
            return;
        }

        if let Err(e) = self.init_renderer(window) {
            self.fail(event_loop, e.context("Failed to initialize Vulkan"));
        }
    }

    fn init_renderer(&mut self, window: Arc<Window>) -> Result<()> {
        log::info!("Initializing Vulkan...");

        // Enable validation layers based on config (and debug build)
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;

        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let device =
            VulkanDevice::new(&self.config.window.title, enable_validation, display, handle)?;
        let surface = WinitSurface::new(window, self.config.minimized_poll_interval());
        let renderer = FrameScheduler::new(device, surface, SchedulerSettings::from(&self.config))?;

        log::info!(
            "Vulkan initialized: {} swapchain images, {:?}",
            renderer.swapchain().image_count(),
            renderer.swapchain().present_mode()
        );

        self.renderer = Some(renderer);
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Returns false when the frame was skipped for a swapchain rebuild.
    fn render_frame(&mut self) -> RenderResult<bool> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(false);
        };

        let t = self.start_time.elapsed().as_secs_f32();
        renderer.set_clear_color(animated_clear_color(self.config.graphics.clear_color, t));

        let Some(frame) = renderer.begin_frame()? else {
            return Ok(false);
        };

        renderer.begin_swapchain_render_pass(&frame)?;
        // Draw calls go here
        renderer.end_swapchain_render_pass(&frame)?;
        renderer.end_frame()?;

        Ok(true)
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.as_mut() {
            if let Err(err) = renderer.shutdown() {
                log::error!("Failed to wait for the GPU on shutdown: {}", err);
            }
        }
        event_loop.exit();
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        log::error!("Fatal: {:#}", err);
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
        self.shutdown(event_loop);
        // No more frames after a fatal error, even if redraws are still queued
        self.renderer = None;
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        let Some(window) = self.window.as_ref() else {
            return;
        };

        self.is_fullscreen = !self.is_fullscreen;
        if self.is_fullscreen {
            window.set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }

        if let Some(renderer) = self.renderer.as_ref() {
            renderer.surface().notify_resized();
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();

        // Update title every second
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(renderer)) = (self.window.as_ref(), self.renderer.as_ref()) {
                let extent = renderer.surface().current_extent();
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({}x{}, {} rebuilds) [{}]",
                    self.config.window.title,
                    fps,
                    extent.width,
                    extent.height,
                    renderer.rebuild_count(),
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

fn animated_clear_color(base: [f32; 4], t: f32) -> [f32; 4] {
    let wave = |phase: f32| 0.5 + 0.5 * (t * 0.7 + phase).sin();
    [
        base[0] * 0.5 + wave(0.0) * 0.25,
        base[1] * 0.5 + wave(2.1) * 0.25,
        base[2] * 0.5 + wave(4.2) * 0.25,
        base[3],
    ]
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        self.window = Some(window);
        self.try_init_renderer(event_loop);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                self.is_minimized = !has_drawable_area(size);
                if let Some(renderer) = self.renderer.as_ref() {
                    renderer.surface().notify_resized();
                } else if !self.is_minimized {
                    self.try_init_renderer(event_loop);
                }
            }

            WindowEvent::RedrawRequested => {
                if self.is_minimized {
                    return;
                }
                match self.render_frame() {
                    Ok(true) => self.update_fps(),
                    Ok(false) => {}
                    Err(e) => self.fail(event_loop, e.into()),
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown(event_loop);
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Swapchain, sync objects and the device go with the renderer
        self.renderer = None;
        log::info!("Cleanup complete");
    }
}

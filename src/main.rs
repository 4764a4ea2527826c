// =============================================================================
// FRAME RENDERER - winit shell around the frame core
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit ApplicationHandler)                                 │
// │    └── Renderer                                                 │
// │          ├── VulkanDevice (Gpu)                                 │
// │          ├── Mesh + UniformRing                                 │
// │          ├── SwapChainManager (recreated as one unit)           │
// │          └── FrameScheduler (sync slots, frame loop)            │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Acquire swapchain image
// 2. Wait for the slot's previous frame
// 3. Write this image's uniforms
// 4. Submit the pre-recorded command buffer
// 5. Present, recreate the swap chain if it went stale
//
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use ash::vk;
use frame_renderer::backend::pipeline::PipelineTemplate;
use frame_renderer::backend::{Gpu, VulkanDevice};
use frame_renderer::config::Config;
use frame_renderer::{scene, FrameOutcome, Renderer};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting frame renderer");
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

    // A fatal error inside the event loop ends up here
    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Level from config.toml, RUST_LOG wins when set
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_default_env()
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Main application struct.
///
/// IMPORTANT: Field order matters for Drop! The renderer (and with it the
/// device and surface) must go before the window.
struct App {
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    config: Config,

    is_fullscreen: bool,
    /// Window has zero size - skip rendering and wait for events
    is_minimized: bool,
    /// First fatal error, returned from main
    error: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
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
            error: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    /// Device, shaders, scene hook, then the renderer itself.
    fn init_renderer(&self, window: &Window) -> Result<Renderer> {
        log::info!("Initializing Vulkan...");

        // STEP 1: Device + surface
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(
            &self.config.window.title,
            enable_validation,
            window.raw_display_handle(),
            window.raw_window_handle(),
            &self.config.device_requirements(),
        )
        .context("Failed to create Vulkan device")?;
        let gpu: Arc<dyn Gpu> = Arc::new(device);

        // STEP 2: Shaders (missing binaries are fatal)
        let assets = &self.config.assets;
        let template = PipelineTemplate::load(gpu.as_ref(), &assets.vertex_shader, &assets.fragment_shader)
            .context("Failed to load shaders")?;

        // STEP 3: Scene import hook
        scene::import_scene(&assets.scene);

        // STEP 4: Everything else
        let renderer = Renderer::new(
            gpu,
            template,
            self.config.renderer_settings(),
            window_extent(window),
        )
        .context("Failed to create renderer")?;

        log::info!("Vulkan initialized successfully!");
        Ok(renderer)
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.shutdown();
        if self.error.is_none() {
            self.error = Some(error);
        }
        event_loop.exit();
    }

    fn shutdown(&mut self) {
        if let Some(mut renderer) = self.renderer.take() {
            if let Err(e) = renderer.shutdown() {
                log::error!("Shutdown failed: {}", e);
            }
        }
    }

    // =========================================================================
    // RENDER FRAME
    // =========================================================================

    fn render_frame(&mut self) -> Result<()> {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return Ok(());
        };

        let now = Instant::now();
        let dt = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;

        match renderer.draw_frame(window_extent(window), dt)? {
            FrameOutcome::Presented | FrameOutcome::PresentedAndRecreated => self.update_fps(dt),
            FrameOutcome::Recreated => {}
            FrameOutcome::Deferred => self.is_minimized = true,
        }
        Ok(())
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            // Mode change invalidates the swap chain even at the same size
            if let Some(renderer) = self.renderer.as_mut() {
                renderer.request_recreate();
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self, frame_time: f32) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

fn window_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        // Create window with settings from config
        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match self.init_renderer(&window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        }

        self.window = Some(window);
    }

    /// Handle window events.
    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                self.is_minimized = size.width == 0 || size.height == 0;
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.request_recreate();
                }
            }

            WindowEvent::RedrawRequested => {
                if self.is_minimized {
                    return;
                }
                if let Err(e) = self.render_frame() {
                    self.fail(event_loop, e.context("Render error"));
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            // ESC - Quit application
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown();
                                event_loop.exit();
                            }
                            // F11 - Toggle fullscreen
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Render continuously, but sleep until the next event while minimized.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

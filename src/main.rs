// =============================================================================
// vk2d demo - clears the window every frame and presents
// =============================================================================
//
// Controls: F11 toggles fullscreen, Escape quits.
// With `debug.hot_reload = true` edits to config.toml change the clear color
// and vsync mode while running.

use anyhow::Result;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use vk2d::backend::state::Color;
use vk2d::config::{Config, ConfigWatcher, DEFAULT_CONFIG_PATH};
use vk2d::{create_instance, GraphicsBackend};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting vk2d demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Vsync: {:?}", config.vsync());

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== vk2d log ===");
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the backend owns the surface, so it goes
/// before the window.
struct App {
    config: Config,
    backend: Option<Box<dyn GraphicsBackend>>,
    watcher: Option<ConfigWatcher>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    is_minimized: bool,

    frame_count: u32,
    last_frame_time: Instant,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            backend: None,
            watcher: None,
            window: None,
            is_fullscreen,
            is_minimized: false,
            frame_count: 0,
            last_frame_time: Instant::now(),
            last_fps_update: Instant::now(),
        }
    }

    fn init_graphics(&mut self, window: &Window) -> Result<()> {
        let mut backend = create_instance(self.config.renderer(), self.config.backend_settings())
            .ok_or_else(|| anyhow::anyhow!("No usable renderer"))?;

        let pixels = window.inner_size();
        let logical = pixels.to_logical::<u32>(window.scale_factor());
        backend.set_mode(
            window,
            logical.width,
            logical.height,
            pixels.width,
            pixels.height,
            false,
            0,
        )?;

        if let Some(info) = backend.renderer_info() {
            log::info!("Renderer: {} {} on {} ({})", info.name, info.version, info.device, info.vendor);
        }

        if self.config.debug.hot_reload {
            match ConfigWatcher::new(DEFAULT_CONFIG_PATH) {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(e) => log::warn!("Hot reload disabled: {:#}", e),
            }
        }

        self.backend = Some(backend);
        Ok(())
    }

    fn apply_config_changes(&mut self) {
        let Some(config) = self.watcher.as_ref().and_then(|w| w.poll()) else {
            return;
        };
        log::info!("Config reloaded");

        if let Some(backend) = self.backend.as_mut() {
            backend.set_vsync(config.vsync());
        }
        self.config.graphics.clear_color = config.graphics.clear_color;
        self.config.graphics.vsync = config.graphics.vsync;
    }

    /// Returns false when nothing was drawn
    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }
        self.apply_config_changes();

        let Some(backend) = self.backend.as_mut() else {
            return Ok(false);
        };

        let clear = Color::from_array(self.config.graphics.clear_color);
        backend.clear(Some(clear), None, None)?;
        backend.present()?;
        Ok(true)
    }

    fn resize(&mut self, width: u32, height: u32) {
        let Some(window) = self.window.as_ref() else {
            return;
        };
        let logical = winit::dpi::PhysicalSize::new(width, height).to_logical::<u32>(window.scale_factor());
        if let Some(backend) = self.backend.as_mut() {
            backend.set_viewport_size(logical.width, logical.height, width, height);
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
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
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_graphics(&window) {
            log::error!("Failed to initialize graphics: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
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

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.unset_mode();
        }
        log::info!("Cleanup complete");
    }
}

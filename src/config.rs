// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Missing file -> defaults. Unparsable file -> warning, then defaults.
// With `debug.hot_reload` the demo watches the file and re-applies vsync and
// clear color when it changes.

use anyhow::{Context, Result};
use notify::{event::ModifyKind, recommended_watcher, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

use crate::backend::{BackendSettings, Vsync, FRAMES_IN_FLIGHT};
use crate::renderer::RendererKind;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vk2d".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphicsConfig {
    pub renderer: String,
    /// "on", "adaptive", "fast" or "immediate"
    pub vsync: String,
    pub clear_color: [f32; 4],
    pub gamma_correct: bool,
    /// Accepted for older files; the backend always runs two frames in flight
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            renderer: "vulkan".to_string(),
            vsync: "on".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            gamma_correct: false,
            max_frames_in_flight: FRAMES_IN_FLIGHT,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    pub hot_reload: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_to_file: false,
            log_file: "vk2d.log".to_string(),
            show_fps: true,
            hot_reload: false,
        }
    }
}

impl Config {
    /// Load configuration from `config.toml`, falling back to defaults
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_PATH).unwrap_or_else(|e| {
            log::warn!("Failed to load {}: {:#}. Using defaults.", DEFAULT_CONFIG_PATH, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.graphics.max_frames_in_flight != FRAMES_IN_FLIGHT {
            log::warn!(
                "max_frames_in_flight = {} ignored; using {}",
                config.graphics.max_frames_in_flight,
                FRAMES_IN_FLIGHT
            );
        }
        Ok(config)
    }

    pub fn vsync(&self) -> Vsync {
        Vsync::from_name(&self.graphics.vsync).unwrap_or_else(|| {
            log::warn!("Unknown vsync mode '{}', defaulting to on", self.graphics.vsync);
            Vsync::On
        })
    }

    pub fn renderer(&self) -> RendererKind {
        RendererKind::from_name(&self.graphics.renderer).unwrap_or_else(|| {
            log::warn!("Unknown renderer '{}', using Vulkan", self.graphics.renderer);
            RendererKind::Vulkan
        })
    }

    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            app_name: self.window.title.clone(),
            validation: self.debug.validation_layers,
            vsync: self.vsync(),
            gamma_correct: self.graphics.gamma_correct,
        }
    }
}

/// Watches a config file and reports content changes
pub struct ConfigWatcher {
    path: PathBuf,
    changes: Receiver<()>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (sender, changes) = channel();

        let mut watcher = recommended_watcher(move |event: notify::Result<notify::Event>| match event {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_))
                ) {
                    // No change to file contents
                    return;
                }
                // Receiver gone means the demo is shutting down
                let _ = sender.send(());
            }
            Err(err) => log::error!("Config watcher error: {err}"),
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .context("Failed to watch config file")?;
        log::info!("Watching {:?} for changes", path);

        Ok(Self {
            path,
            changes,
            _watcher: watcher,
        })
    }

    /// Reloaded config if the file changed since the last poll
    pub fn poll(&self) -> Option<Config> {
        let mut changed = false;
        while self.changes.try_recv().is_ok() {
            changed = true;
        }
        if !changed {
            return None;
        }

        match Config::load_from_path(&self.path) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Ignoring config change: {:#}", e);
                None
            }
        }
    }
}

// Windowing collaborator
//
// The backend never talks to winit directly. It asks the host window for
// raw handles, its drawable size and the instance extensions its platform
// needs for presentation.

use anyhow::{Context, Result};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

use crate::backend::surface;

pub trait WindowHost {
    fn native_window_handle(&self) -> Result<RawWindowHandle>;

    fn native_display_handle(&self) -> Result<RawDisplayHandle>;

    /// Size of the drawable area in pixels
    fn drawable_size(&self) -> (u32, u32);

    /// Instance extensions required to present to this window
    fn required_instance_extensions(&self) -> Result<Vec<&'static CStr>> {
        surface::required_surface_extensions(self.native_display_handle()?)
    }
}

impl WindowHost for winit::window::Window {
    fn native_window_handle(&self) -> Result<RawWindowHandle> {
        let handle = self
            .window_handle()
            .context("Failed to get window handle")?;
        Ok(handle.as_raw())
    }

    fn native_display_handle(&self) -> Result<RawDisplayHandle> {
        let handle = self
            .display_handle()
            .context("Failed to get display handle")?;
        Ok(handle.as_raw())
    }

    fn drawable_size(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }
}

// Window surface creation
//
// Maps raw window/display handles onto the matching WSI extension.

use anyhow::{bail, Context, Result};
use ash::extensions::khr;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

/// Instance extensions needed to create a surface on `display`
pub fn required_surface_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        RawDisplayHandle::Android(_) => khr::AndroidSurface::name(),
        other => bail!("Unsupported display platform: {:?}", other),
    };
    Ok(vec![khr::Surface::name(), platform])
}

/// Create a surface for `window`
///
/// # Safety
/// Both handles must stay valid for the lifetime of the returned surface.
pub unsafe fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
            let hinstance = window.hinstance.map_or(0, |h| h.get());
            let info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance as vk::HINSTANCE)
                .hwnd(window.hwnd.get() as vk::HWND);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&info, None)
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let dpy = display
                .display
                .context("Xlib display handle has no connection")?;
            let info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr() as *mut _)
                .window(window.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&info, None)
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection = display
                .connection
                .context("XCB display handle has no connection")?;
            let info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr())
                .window(window.window.get());
            khr::XcbSurface::new(entry, instance).create_xcb_surface(&info, None)
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&info, None)
        }
        (RawDisplayHandle::Android(_), RawWindowHandle::AndroidNdk(window)) => {
            let info = vk::AndroidSurfaceCreateInfoKHR::builder()
                .window(window.a_native_window.as_ptr());
            khr::AndroidSurface::new(entry, instance).create_android_surface(&info, None)
        }
        (display, window) => bail!(
            "Unsupported window/display combination: {:?} / {:?}",
            window,
            display
        ),
    };

    surface.context("failed to create window surface!")
}

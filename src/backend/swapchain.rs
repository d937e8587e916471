// Swapchain - Window presentation
//
// Owns the presentable images and their views. Recreated wholesale on
// resize or when presentation reports the chain as stale; never patched.

use anyhow::{Context, Result};
use ash::vk;
use glam::Mat4;

use super::gpu::{Gpu, SurfaceSupport, SwapchainDesc};

/// Presentation pacing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Vsync {
    /// Late frames tear instead of waiting a full interval
    Adaptive,
    /// No tearing, newest frame wins
    Fast,
    /// No synchronization at all
    Immediate,
    #[default]
    On,
}

impl Vsync {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "adaptive" | "fifo_relaxed" => Some(Vsync::Adaptive),
            "fast" | "mailbox" => Some(Vsync::Fast),
            "immediate" | "off" => Some(Vsync::Immediate),
            "on" | "fifo" => Some(Vsync::On),
            _ => None,
        }
    }

    /// Mode requested by this policy before support is considered
    pub fn requested_mode(self) -> vk::PresentModeKHR {
        match self {
            Vsync::Adaptive => vk::PresentModeKHR::FIFO_RELAXED,
            Vsync::Fast => vk::PresentModeKHR::MAILBOX,
            Vsync::Immediate => vk::PresentModeKHR::IMMEDIATE,
            Vsync::On => vk::PresentModeKHR::FIFO,
        }
    }
}

/// Prefer 8-bit BGRA UNORM with sRGB non-linear encoding, else the first
/// format offered.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The requested mode when supported, else FIFO (always available)
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: Vsync) -> vk::PresentModeKHR {
    let requested = vsync.requested_mode();
    if modes.contains(&requested) {
        requested
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, drawable: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: drawable
            .0
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: drawable
            .1
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

pub fn is_rotated_quarter(transform: vk::SurfaceTransformFlagsKHR) -> bool {
    transform.intersects(
        vk::SurfaceTransformFlagsKHR::ROTATE_90 | vk::SurfaceTransformFlagsKHR::ROTATE_270,
    )
}

/// Rotation that keeps content upright on a pre-rotated surface
pub fn display_rotation(transform: vk::SurfaceTransformFlagsKHR) -> Mat4 {
    use std::f32::consts::PI;

    let angle = if transform.contains(vk::SurfaceTransformFlagsKHR::IDENTITY) {
        0.0
    } else if transform.contains(vk::SurfaceTransformFlagsKHR::ROTATE_90) {
        -PI / 2.0
    } else if transform.contains(vk::SurfaceTransformFlagsKHR::ROTATE_180) {
        -PI
    } else if transform.contains(vk::SurfaceTransformFlagsKHR::ROTATE_270) {
        -3.0 * PI / 2.0
    } else {
        0.0
    };

    let (sin, cos) = angle.sin_cos();
    Mat4::from_cols_array(&[
        cos, -sin, 0.0, 0.0, //
        sin, cos, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ])
}

/// Everything needed to create a chain, derived from surface support
pub fn describe(support: &SurfaceSupport, drawable: (u32, u32), vsync: Vsync) -> Result<SwapchainDesc> {
    let caps = &support.capabilities;

    let format = choose_surface_format(&support.formats).context("No suitable surface format")?;
    let present_mode = choose_present_mode(&support.present_modes, vsync);

    let mut extent = choose_extent(caps, drawable);
    if is_rotated_quarter(caps.current_transform) {
        std::mem::swap(&mut extent.width, &mut extent.height);
    }

    Ok(SwapchainDesc {
        image_count: choose_image_count(caps),
        format,
        extent,
        pre_transform: caps.current_transform,
        present_mode,
    })
}

pub struct Swapchain<G: Gpu> {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub display_rotation: Mat4,
    gpu: G,
}

impl<G: Gpu> Swapchain<G> {
    pub fn new(gpu: G, drawable: (u32, u32), vsync: Vsync) -> Result<Self> {
        let mut swapchain = Self {
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            display_rotation: Mat4::IDENTITY,
            gpu,
        };
        swapchain.build(drawable, vsync)?;
        Ok(swapchain)
    }

    fn build(&mut self, drawable: (u32, u32), vsync: Vsync) -> Result<()> {
        let support = self
            .gpu
            .surface_support()
            .context("Failed to query surface support")?;
        let desc = describe(&support, drawable, vsync)?;

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {} images requested",
            desc.extent.width,
            desc.extent.height,
            desc.present_mode,
            desc.image_count
        );

        let handle = self
            .gpu
            .create_swapchain(&desc)
            .context("Failed to create swap chain")?;
        self.handle = handle;

        self.images = self
            .gpu
            .swapchain_images(handle)
            .context("Failed to get swap chain images")?;

        self.image_views.clear();
        for &image in &self.images {
            let view = self
                .gpu
                .create_image_view(image, desc.format.format)
                .context("Failed to create image views")?;
            self.image_views.push(view);
        }

        self.format = desc.format.format;
        self.extent = desc.extent;
        self.present_mode = desc.present_mode;
        self.display_rotation = display_rotation(desc.pre_transform);

        log::info!("Created swapchain with {} images", self.images.len());
        Ok(())
    }

    /// Destroy and rebuild. The caller has already drained GPU work and
    /// released framebuffers that reference the old views.
    pub fn recreate(&mut self, drawable: (u32, u32), vsync: Vsync) -> Result<()> {
        self.destroy_in_place();
        self.build(drawable, vsync)
    }

    pub fn owns_view(&self, view: vk::ImageView) -> bool {
        self.image_views.contains(&view)
    }

    fn destroy_in_place(&mut self) {
        for view in self.image_views.drain(..) {
            self.gpu.destroy_image_view(view);
        }
        if self.handle != vk::SwapchainKHR::null() {
            self.gpu.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
        self.images.clear();
    }
}

impl<G: Gpu> Drop for Swapchain<G> {
    fn drop(&mut self) {
        self.destroy_in_place();
    }
}

// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation, validation layers and the debug messenger
// - Window surface
// - Physical device selection (prefer discrete GPU)
// - Logical device, graphics/present queues and the command pool
// - Memory allocator setup

use anyhow::{bail, Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{c_char, CStr, CString};

use super::gpu::{BackendSettings, DeviceLimits, QueueFamilies};
use super::surface;
use crate::window::WindowHost;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Device extensions every adapter must offer. Shaders bind their
/// descriptors with push descriptors, so that extension is required too.
fn required_device_extensions() -> [&'static CStr; 2] {
    [khr::Swapchain::name(), khr::PushDescriptor::name()]
}

/// What adapter selection needs to know about one physical device
#[derive(Debug, Clone, Copy)]
pub struct AdapterProfile {
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: Option<QueueFamilies>,
    pub extensions_supported: bool,
    pub has_surface_formats: bool,
    pub has_present_modes: bool,
    pub sampler_anisotropy: bool,
    /// Needed for wireframe (line polygon mode) pipelines
    pub fill_mode_non_solid: bool,
}

/// Score an adapter; 0 means unusable
pub fn rate_adapter(profile: &AdapterProfile) -> u32 {
    let suitable = profile.queue_families.is_some()
        && profile.extensions_supported
        && profile.has_surface_formats
        && profile.has_present_modes
        && profile.sampler_anisotropy
        && profile.fill_mode_non_solid;
    if !suitable {
        return 0;
    }

    1 + match profile.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        _ => 0,
    }
}

/// Highest non-zero score; ties keep the earliest candidate
pub fn pick_best<T: Copy>(candidates: &[(T, u32)]) -> Option<T> {
    let mut best: Option<(T, u32)> = None;
    for &(candidate, score) in candidates {
        if score == 0 {
            continue;
        }
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((candidate, score));
        }
    }
    best.map(|(c, _)| c)
}

/// Prefer one family that can both draw and present, otherwise the first
/// of each.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    present_support: impl Fn(u32) -> bool,
) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut present = None;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        let can_draw = family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = present_support(index);

        if can_draw && can_present {
            return Some(QueueFamilies { graphics: index, present: index });
        }
        if can_draw && graphics.is_none() {
            graphics = Some(index);
        }
        if can_present && present.is_none() {
            present = Some(index);
        }
    }

    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped explicitly, before the device
    pub allocator: Mutex<Option<Allocator>>,
    pub command_pool: vk::CommandPool,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    pub entry: Entry,

    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilies,

    pub limits: DeviceLimits,
}

impl VulkanDevice {
    /// Load the Vulkan library without creating anything
    pub fn load_entry() -> Result<Entry> {
        unsafe { Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")
    }

    pub fn new(window: &dyn WindowHost, settings: &BackendSettings) -> Result<Self> {
        log::info!("Creating Vulkan device: {}", settings.app_name);

        let entry = Self::load_entry()?;

        if settings.validation && !Self::validation_layer_available(&entry)? {
            bail!("validation layers requested, but not available!");
        }

        let display_handle = window.native_display_handle()?;
        let window_handle = window.native_window_handle()?;
        let surface_extensions = window.required_instance_extensions()?;

        let instance = Self::create_instance(&entry, &surface_extensions, settings)?;

        let debug_utils = if settings.validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface = unsafe { surface::create_surface(&entry, &instance, display_handle, window_handle)? };
        let surface_loader = khr::Surface::new(&entry, &instance);

        let (physical_device, queue_families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let (device, graphics_queue, present_queue) =
            Self::create_logical_device(&instance, physical_device, queue_families)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let limits = Self::read_limits(&properties);

        log::info!("Selected GPU: {}", limits.device_name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_families.graphics);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("failed to create command pool!")?;

        Ok(Self {
            allocator: Mutex::new(Some(allocator)),
            command_pool,
            device,
            physical_device,
            surface,
            surface_loader,
            debug_utils,
            instance,
            entry,
            graphics_queue,
            present_queue,
            queue_families,
            limits,
        })
    }

    fn validation_layer_available(entry: &Entry) -> Result<bool> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;
        Ok(layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER))
    }

    fn create_instance(
        entry: &Entry,
        surface_extensions: &[&CStr],
        settings: &BackendSettings,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(settings.app_name.as_str())?;
        let engine_name = CString::new("vk2d")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions: Vec<*const c_char> = surface_extensions
            .iter()
            .map(|name| name.as_ptr())
            .collect();
        if settings.validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if settings.validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.context("failed to create instance!")
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("failed to set up debug messenger!")?;

        Ok((debug_utils, messenger))
    }

    fn profile_adapter(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        device: vk::PhysicalDevice,
    ) -> Result<AdapterProfile> {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let queue_families = select_queue_families(&families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        });

        let available = unsafe { instance.enumerate_device_extension_properties(device) }?;
        let extensions_supported = required_device_extensions().iter().all(|required| {
            available
                .iter()
                .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *required)
        });

        // Surface queries are only meaningful with the swapchain extension
        let (has_surface_formats, has_present_modes) = if extensions_supported {
            let formats =
                unsafe { surface_loader.get_physical_device_surface_formats(device, surface) }?;
            let modes =
                unsafe { surface_loader.get_physical_device_surface_present_modes(device, surface) }?;
            (!formats.is_empty(), !modes.is_empty())
        } else {
            (false, false)
        };

        Ok(AdapterProfile {
            device_type: props.device_type,
            queue_families,
            extensions_supported,
            has_surface_formats,
            has_present_modes,
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            fill_mode_non_solid: features.fill_mode_non_solid == vk::TRUE,
        })
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            bail!("failed to find GPUs with Vulkan support!");
        }

        let mut candidates = Vec::with_capacity(devices.len());
        for device in devices {
            let profile = Self::profile_adapter(instance, surface_loader, surface, device)?;
            let score = rate_adapter(&profile);
            log::debug!("Adapter {:?}: {:?}, score {}", device, profile.device_type, score);
            if let Some(families) = profile.queue_families {
                candidates.push(((device, families), score));
            }
        }

        pick_best(&candidates).context("failed to find a suitable GPU!")
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: QueueFamilies,
    ) -> Result<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        // Both were checked by rate_adapter
        let enabled_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(true)
            .fill_mode_non_solid(true)
            .build();

        let extensions: Vec<*const c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&enabled_features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("failed to create logical device!")?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")
    }

    fn read_limits(properties: &vk::PhysicalDeviceProperties) -> DeviceLimits {
        let limits = &properties.limits;
        DeviceLimits {
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            point_size_max: limits.point_size_range[1],
            max_image_dimension_2d: limits.max_image_dimension2_d,
            max_image_dimension_3d: limits.max_image_dimension3_d,
            max_image_dimension_cube: limits.max_image_dimension_cube,
            max_image_array_layers: limits.max_image_array_layers,
            max_texel_buffer_elements: limits.max_texel_buffer_elements,
            max_storage_buffer_range: limits.max_storage_buffer_range,
            max_sampler_anisotropy: limits.max_sampler_anisotropy,
            device_name: unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned(),
            vendor_id: properties.vendor_id,
            api_version: properties.api_version,
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Allocator frees its memory blocks through the device
        drop(self.allocator.lock().take());

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

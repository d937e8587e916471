// Capabilities and renderer information
//
// Feature flags are reported optimistically; limits come from the device.

use super::gpu::DeviceLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    MultiRenderTargetFormats,
    ClampZero,
    ClampOne,
    BlendMinMax,
    Lighten,
    FullNpot,
    PixelShaderHighp,
    ShaderDerivatives,
    Glsl3,
    Glsl4,
    Instancing,
    TexelBuffer,
    IndexBuffer32Bit,
    CopyBuffer,
    CopyBufferToTexture,
    CopyTextureToBuffer,
    CopyRenderTargetToBuffer,
}

impl Feature {
    pub const ALL: [Feature; 17] = [
        Feature::MultiRenderTargetFormats,
        Feature::ClampZero,
        Feature::ClampOne,
        Feature::BlendMinMax,
        Feature::Lighten,
        Feature::FullNpot,
        Feature::PixelShaderHighp,
        Feature::ShaderDerivatives,
        Feature::Glsl3,
        Feature::Glsl4,
        Feature::Instancing,
        Feature::TexelBuffer,
        Feature::IndexBuffer32Bit,
        Feature::CopyBuffer,
        Feature::CopyBufferToTexture,
        Feature::CopyTextureToBuffer,
        Feature::CopyRenderTargetToBuffer,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    PointSize,
    TextureSize,
    TextureLayers,
    VolumeTextureSize,
    CubeTextureSize,
    TexelBufferSize,
    ShaderStorageBufferSize,
    ThreadgroupsX,
    ThreadgroupsY,
    ThreadgroupsZ,
    RenderTargets,
    TextureMsaa,
    Anisotropy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureType {
    Tex2D,
    Tex2DArray,
    Volume,
    Cube,
}

#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    features: Vec<(Feature, bool)>,
    limits: Vec<(Limit, f64)>,
    texture_types: Vec<(TextureType, bool)>,
}

impl Capabilities {
    pub fn from_limits(limits: &DeviceLimits) -> Self {
        let features = Feature::ALL
            .iter()
            .map(|&f| {
                let supported = matches!(
                    f,
                    Feature::PixelShaderHighp
                        | Feature::Glsl3
                        | Feature::Glsl4
                        | Feature::IndexBuffer32Bit
                );
                (f, supported)
            })
            .collect();

        let limits = vec![
            (Limit::PointSize, limits.point_size_max as f64),
            (Limit::TextureSize, limits.max_image_dimension_2d as f64),
            (Limit::TextureLayers, limits.max_image_array_layers as f64),
            (Limit::VolumeTextureSize, limits.max_image_dimension_3d as f64),
            (Limit::CubeTextureSize, limits.max_image_dimension_cube as f64),
            (Limit::TexelBufferSize, limits.max_texel_buffer_elements as f64),
            (Limit::ShaderStorageBufferSize, limits.max_storage_buffer_range as f64),
            (Limit::ThreadgroupsX, 0.0),
            (Limit::ThreadgroupsY, 0.0),
            (Limit::ThreadgroupsZ, 0.0),
            (Limit::RenderTargets, 1.0),
            (Limit::TextureMsaa, 1.0),
            (Limit::Anisotropy, 1.0),
        ];

        let texture_types = vec![
            (TextureType::Tex2D, true),
            (TextureType::Tex2DArray, true),
            (TextureType::Volume, false),
            (TextureType::Cube, true),
        ];

        Self {
            features,
            limits,
            texture_types,
        }
    }

    pub fn feature(&self, feature: Feature) -> bool {
        self.features
            .iter()
            .find(|(f, _)| *f == feature)
            .is_some_and(|(_, on)| *on)
    }

    pub fn limit(&self, limit: Limit) -> f64 {
        self.limits
            .iter()
            .find(|(l, _)| *l == limit)
            .map_or(0.0, |(_, v)| *v)
    }

    pub fn texture_type(&self, ty: TextureType) -> bool {
        self.texture_types
            .iter()
            .find(|(t, _)| *t == ty)
            .is_some_and(|(_, on)| *on)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererInfo {
    pub name: String,
    pub version: String,
    pub vendor: String,
    pub device: String,
}

impl RendererInfo {
    pub fn from_limits(limits: &DeviceLimits) -> Self {
        Self {
            name: "Vulkan".to_string(),
            version: api_version_string(limits.api_version),
            vendor: vendor_name(limits.vendor_id).to_string(),
            device: limits.device_name.clone(),
        }
    }
}

/// PCI vendor id to a human-readable name
pub fn vendor_name(vendor_id: u32) -> &'static str {
    match vendor_id {
        0x1002 => "AMD",
        0x1010 => "ImgTec",
        0x106B => "Apple",
        0x10DE => "NVIDIA",
        0x13B5 => "ARM",
        0x5143 => "Qualcomm",
        0x8086 => "Intel",
        _ => "unknown",
    }
}

pub fn api_version_string(version: u32) -> String {
    format!(
        "{}.{}.{}",
        ash::vk::api_version_major(version),
        ash::vk::api_version_minor(version),
        ash::vk::api_version_patch(version)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Resolves to the platform's default 8-bit format
    Normal,
    /// Resolves to a 16-bit float format
    Hdr,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    R8Unorm,
}

impl PixelFormat {
    pub fn to_vk(self) -> ash::vk::Format {
        use ash::vk::Format;
        match self {
            PixelFormat::Normal | PixelFormat::Rgba8Unorm => Format::R8G8B8A8_UNORM,
            PixelFormat::Rgba8UnormSrgb => Format::R8G8B8A8_SRGB,
            PixelFormat::Bgra8Unorm => Format::B8G8R8A8_UNORM,
            PixelFormat::Bgra8UnormSrgb => Format::B8G8R8A8_SRGB,
            PixelFormat::Hdr | PixelFormat::Rgba16Float => Format::R16G16B16A16_SFLOAT,
            PixelFormat::Rgba32Float => Format::R32G32B32A32_SFLOAT,
            PixelFormat::R8Unorm => Format::R8_UNORM,
        }
    }
}

/// Resolve the abstract `Normal`/`Hdr` formats to concrete ones
pub fn sized_format(format: PixelFormat, gamma_correct: bool) -> PixelFormat {
    match format {
        PixelFormat::Normal if gamma_correct => PixelFormat::Rgba8UnormSrgb,
        PixelFormat::Normal => PixelFormat::Rgba8Unorm,
        PixelFormat::Hdr => PixelFormat::Rgba16Float,
        other => other,
    }
}

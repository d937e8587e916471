// Resource caches
//
// Render passes, framebuffers, graphics pipelines and samplers are memoized
// by value-type keys. Entries live until session teardown; lookups with
// structurally equal keys always yield the same handle.

use anyhow::Result;
use ash::vk;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use super::state::{BlendState, ColorChannelMask, CullMode, PrimitiveType, ScissorRect, Winding};
use super::vertex::VertexAttributes;

/// Memoizing map from a structural key to a GPU handle
pub struct HandleCache<K, V> {
    entries: HashMap<K, V>,
    created: usize,
}

impl<K: Eq + Hash + Clone, V: Copy> Default for HandleCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: Copy> HandleCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            created: 0,
        }
    }

    /// Return the cached handle for `key`, creating it on first use.
    /// A failed creation leaves the cache untouched.
    pub fn get_or_create<F>(&mut self, key: &K, create: F) -> Result<V>
    where
        F: FnOnce(&K) -> Result<V>,
    {
        if let Some(&handle) = self.entries.get(key) {
            return Ok(handle);
        }

        let handle = create(key)?;
        self.entries.insert(key.clone(), handle);
        self.created += 1;
        Ok(handle)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of creations performed over the cache's lifetime
    pub fn created(&self) -> usize {
        self.created
    }

    /// Remove and return every entry whose key matches `pred`
    pub fn remove_where<P>(&mut self, mut pred: P) -> Vec<V>
    where
        P: FnMut(&K) -> bool,
    {
        let keys: Vec<K> = self.entries.keys().filter(|k| pred(k)).cloned().collect();
        keys.iter()
            .filter_map(|k| self.entries.remove(k))
            .collect()
    }

    /// Remove and return every entry
    pub fn drain(&mut self) -> Vec<V> {
        self.entries.drain().map(|(_, v)| v).collect()
    }
}

// ============================================================================
// Keys
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub color_format: vk::Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferKey {
    pub render_pass: vk::RenderPass,
    pub image_view: vk::ImageView,
    pub width: u32,
    pub height: u32,
}

/// Identity of a shader program, assigned by the shader collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub render_pass: vk::RenderPass,
    pub vertex_attributes: VertexAttributes,
    pub shader: ShaderId,
    pub primitive: PrimitiveType,
    pub wireframe: bool,
    pub blend: BlendState,
    pub color_mask: ColorChannelMask,
    pub winding: Winding,
    pub cull_mode: CullMode,
    /// Viewport in pixels; baked into the pipeline
    pub viewport: (u32, u32),
    pub scissor: Option<ScissorRect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    #[default]
    Linear,
    Nearest,
}

impl FilterMode {
    pub fn to_vk(self) -> vk::Filter {
        match self {
            FilterMode::Linear => vk::Filter::LINEAR,
            FilterMode::Nearest => vk::Filter::NEAREST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MipmapFilterMode {
    #[default]
    None,
    Linear,
    Nearest,
}

impl MipmapFilterMode {
    pub fn to_vk(self) -> vk::SamplerMipmapMode {
        match self {
            MipmapFilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
            MipmapFilterMode::None | MipmapFilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    Clamp,
    ClampZero,
    ClampOne,
    Repeat,
    MirroredRepeat,
}

impl WrapMode {
    pub fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            WrapMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            WrapMode::ClampZero | WrapMode::ClampOne => vk::SamplerAddressMode::CLAMP_TO_BORDER,
            WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
            WrapMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareMode {
    Less,
    LessEqual,
    Equal,
    GreaterEqual,
    Greater,
    NotEqual,
    Always,
    Never,
}

impl CompareMode {
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            CompareMode::Less => vk::CompareOp::LESS,
            CompareMode::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareMode::Equal => vk::CompareOp::EQUAL,
            CompareMode::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareMode::Greater => vk::CompareOp::GREATER,
            CompareMode::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareMode::Always => vk::CompareOp::ALWAYS,
            CompareMode::Never => vk::CompareOp::NEVER,
        }
    }
}

/// Sampler configuration. Equality and hashing cover every field, with
/// `lod_bias` compared bitwise.
#[derive(Debug, Clone, Copy)]
pub struct SamplerKey {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub mipmap_filter: MipmapFilterMode,
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
    pub wrap_w: WrapMode,
    pub max_anisotropy: u8,
    pub depth_compare: Option<CompareMode>,
    pub lod_bias: f32,
    pub min_lod: u32,
    pub max_lod: u32,
}

impl Default for SamplerKey {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            mipmap_filter: MipmapFilterMode::None,
            wrap_u: WrapMode::Clamp,
            wrap_v: WrapMode::Clamp,
            wrap_w: WrapMode::Clamp,
            max_anisotropy: 1,
            depth_compare: None,
            lod_bias: 0.0,
            min_lod: 0,
            max_lod: 1000,
        }
    }
}

impl PartialEq for SamplerKey {
    fn eq(&self, other: &Self) -> bool {
        self.min_filter == other.min_filter
            && self.mag_filter == other.mag_filter
            && self.mipmap_filter == other.mipmap_filter
            && self.wrap_u == other.wrap_u
            && self.wrap_v == other.wrap_v
            && self.wrap_w == other.wrap_w
            && self.max_anisotropy == other.max_anisotropy
            && self.depth_compare == other.depth_compare
            && self.lod_bias.to_bits() == other.lod_bias.to_bits()
            && self.min_lod == other.min_lod
            && self.max_lod == other.max_lod
    }
}

impl Eq for SamplerKey {}

impl Hash for SamplerKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.min_filter.hash(state);
        self.mag_filter.hash(state);
        self.mipmap_filter.hash(state);
        self.wrap_u.hash(state);
        self.wrap_v.hash(state);
        self.wrap_w.hash(state);
        self.max_anisotropy.hash(state);
        self.depth_compare.hash(state);
        self.lod_bias.to_bits().hash(state);
        self.min_lod.hash(state);
        self.max_lod.hash(state);
    }
}

//! Sampler cache.
//!
//! Samplers are small immutable objects that many textures share. The
//! [`SamplerCache`] creates each distinct [`SamplerDesc`] once and hands out
//! the same handle afterwards. Samplers live until the cache is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;

/// Sampler filtering and addressing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerDesc {
    /// Magnification and minification filter.
    pub filter: vk::Filter,
    /// Addressing mode for U, V and W.
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

impl SamplerDesc {
    /// Nearest filtering with clamped edges, for pixel-exact lookups.
    pub fn nearest_clamp() -> Self {
        Self {
            filter: vk::Filter::NEAREST,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
        }
    }

    fn to_vk(self) -> vk::SamplerCreateInfo<'static> {
        vk::SamplerCreateInfo::default()
            .mag_filter(self.filter)
            .min_filter(self.filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .max_lod(vk::LOD_CLAMP_NONE)
    }
}

/// Thread-safe cache of samplers keyed by [`SamplerDesc`].
pub struct SamplerCache {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Created samplers.
    samplers: Mutex<HashMap<SamplerDesc, vk::Sampler>>,
}

impl SamplerCache {
    /// Creates an empty cache.
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            samplers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the sampler for `desc`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if sampler creation fails.
    pub fn get(&self, desc: SamplerDesc) -> RhiResult<vk::Sampler> {
        let mut samplers = self
            .samplers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(&sampler) = samplers.get(&desc) {
            return Ok(sampler);
        }

        let sampler = unsafe { self.device.handle().create_sampler(&desc.to_vk(), None)? };
        debug!("Created sampler {:?}", desc);
        samplers.insert(desc, sampler);
        Ok(sampler)
    }

    /// Number of distinct samplers created so far.
    pub fn len(&self) -> usize {
        self.samplers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no sampler has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SamplerCache {
    fn drop(&mut self) {
        let samplers = self
            .samplers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, sampler) in samplers.drain() {
            unsafe { self.device.handle().destroy_sampler(sampler, None) };
        }
        debug!("Sampler cache destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_desc_default() {
        let desc = SamplerDesc::default();
        assert_eq!(desc.filter, vk::Filter::LINEAR);
        assert_eq!(desc.address_mode, vk::SamplerAddressMode::REPEAT);
    }

    #[test]
    fn test_sampler_desc_to_vk() {
        let info = SamplerDesc::nearest_clamp().to_vk();
        assert_eq!(info.mag_filter, vk::Filter::NEAREST);
        assert_eq!(info.min_filter, vk::Filter::NEAREST);
        assert_eq!(info.address_mode_w, vk::SamplerAddressMode::CLAMP_TO_EDGE);
    }

    #[test]
    fn test_sampler_desc_is_hashable_key() {
        let mut map = HashMap::new();
        map.insert(SamplerDesc::default(), 1);
        map.insert(SamplerDesc::nearest_clamp(), 2);
        map.insert(SamplerDesc::default(), 3);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_sampler_cache_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SamplerCache>();
    }
}

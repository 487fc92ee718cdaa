//! Renderer configuration.
//!
//! [`RendererConfig`] collects the tunables of the frame pipeline: pool
//! sizes, clear color and timing thresholds. Defaults are suitable for most
//! applications; individual fields can be overridden with builder methods or
//! through `VKFRAME_*` environment variables via [`RendererConfig::from_env`].

use std::str::FromStr;

use crate::error::{Error, Result};

/// Tunables for the frame pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct RendererConfig {
    /// Number of uniform value slots per binding-data buffer group.
    pub buffer_slots: u32,
    /// Capacity (in sets) of the first descriptor pool created per layout.
    pub descriptor_pool_initial_sets: u32,
    /// Upper bound for the capacity of a single descriptor pool.
    pub descriptor_pool_max_sets: u32,
    /// Color the render pass clears to.
    pub clear_color: [f32; 4],
    /// Timeout for per-slot fence waits, in nanoseconds.
    pub fence_timeout_ns: u64,
    /// Frames slower than this are logged.
    pub slow_frame_threshold_ms: u64,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            buffer_slots: 64,
            descriptor_pool_initial_sets: 16,
            descriptor_pool_max_sets: 1024,
            clear_color: [0.1, 0.1, 0.15, 1.0],
            fence_timeout_ns: u64::MAX,
            slow_frame_threshold_ms: 50,
        }
    }
}

impl RendererConfig {
    /// Builds the default configuration with `VKFRAME_*` environment
    /// overrides applied, then validates it.
    ///
    /// Recognized variables: `VKFRAME_BUFFER_SLOTS`,
    /// `VKFRAME_DESCRIPTOR_POOL_INITIAL_SETS`, `VKFRAME_DESCRIPTOR_POOL_MAX_SETS`,
    /// `VKFRAME_FENCE_TIMEOUT_NS`, `VKFRAME_SLOW_FRAME_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        override_field(&lookup, "VKFRAME_BUFFER_SLOTS", &mut config.buffer_slots)?;
        override_field(
            &lookup,
            "VKFRAME_DESCRIPTOR_POOL_INITIAL_SETS",
            &mut config.descriptor_pool_initial_sets,
        )?;
        override_field(
            &lookup,
            "VKFRAME_DESCRIPTOR_POOL_MAX_SETS",
            &mut config.descriptor_pool_max_sets,
        )?;
        override_field(&lookup, "VKFRAME_FENCE_TIMEOUT_NS", &mut config.fence_timeout_ns)?;
        override_field(
            &lookup,
            "VKFRAME_SLOW_FRAME_MS",
            &mut config.slow_frame_threshold_ms,
        )?;

        config.validate()?;
        Ok(config)
    }

    /// Sets the number of value slots per buffer group.
    pub fn with_buffer_slots(mut self, slots: u32) -> Self {
        self.buffer_slots = slots;
        self
    }

    /// Sets the initial and maximum descriptor pool capacities.
    pub fn with_descriptor_pool_sets(mut self, initial: u32, max: u32) -> Self {
        self.descriptor_pool_initial_sets = initial;
        self.descriptor_pool_max_sets = max;
        self
    }

    /// Sets the render pass clear color.
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Checks the configuration for values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_slots == 0 {
            return Err(Error::Config("buffer_slots must be greater than 0".into()));
        }
        if self.descriptor_pool_initial_sets == 0 {
            return Err(Error::Config(
                "descriptor_pool_initial_sets must be greater than 0".into(),
            ));
        }
        if self.descriptor_pool_max_sets < self.descriptor_pool_initial_sets {
            return Err(Error::Config(format!(
                "descriptor_pool_max_sets ({}) is smaller than descriptor_pool_initial_sets ({})",
                self.descriptor_pool_max_sets, self.descriptor_pool_initial_sets
            )));
        }
        Ok(())
    }
}

fn override_field<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    field: &mut T,
) -> Result<()> {
    if let Some(value) = lookup(key) {
        *field = value
            .trim()
            .parse()
            .map_err(|_| Error::InvalidOverride { key, value })?;
    }
    Ok(())
}

//! Core utilities for the frame pipeline.
//!
//! This crate provides foundational types shared by the other crates:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Renderer configuration

mod config;
mod error;
mod logging;
mod timer;

pub use config::RendererConfig;
pub use error::{Error, Result};
pub use logging::{DEFAULT_FILTER, init_logging};
pub use timer::FrameTimer;

//! Runtime factory for creating platform-appropriate container runtimes

use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::runtime::{ContainerRuntime, PodmanRuntime};
use std::path::PathBuf;
use std::sync::Arc;

/// Detected platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Linux - uses native rootless Podman
    Linux,
    /// macOS - `--rootfs` sandboxes need a local Linux kernel
    MacOS,
    /// Unsupported platform
    Unsupported,
}

impl Platform {
    /// Detect the current platform
    pub fn detect() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::MacOS,
            "linux" => Platform::Linux,
            _ => Platform::Unsupported,
        }
    }

    /// Get a human-readable platform name
    pub fn name(&self) -> &'static str {
        match self {
            Platform::MacOS => "macOS",
            Platform::Linux => "Linux",
            Platform::Unsupported => "Unsupported",
        }
    }
}

/// Create a container runtime appropriate for the current platform
///
/// `scratch` holds per-sandbox secret files and image exports.
pub fn create_runtime(config: &Config, scratch: PathBuf) -> KilnResult<Arc<dyn ContainerRuntime>> {
    match Platform::detect() {
        Platform::Linux => Ok(Arc::new(PodmanRuntime::new(config.runtime.clone(), scratch))),
        Platform::MacOS | Platform::Unsupported => Err(KilnError::UnsupportedPlatform(
            std::env::consts::OS.to_string(),
        )),
    }
}

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Top-level configuration, loaded from vexel.toml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VexelConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub reclamation: ReclamationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Application name reported to the Vulkan instance
    #[serde(default = "default_app_name")]
    pub application_name: String,
    /// Frames the CPU may run ahead of the GPU before end_frame blocks
    #[serde(default = "default_frames_in_flight")]
    pub max_frames_in_flight: u32,
    /// Enable VK_LAYER_KHRONOS_validation
    #[serde(default)]
    pub enable_validation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Command buffers allocated up-front when a pool is created
    #[serde(default)]
    pub prewarm_buffers: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReclamationConfig {
    /// Sweep the reclamation bin every N frames
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_frames: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            application_name: default_app_name(),
            max_frames_in_flight: default_frames_in_flight(),
            enable_validation: false,
        }
    }
}

impl Default for ReclamationConfig {
    fn default() -> Self {
        Self {
            sweep_interval_frames: default_sweep_interval(),
        }
    }
}

impl VexelConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ExecError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ExecError> {
        let config: VexelConfig =
            toml::from_str(content).map_err(|e| ExecError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ExecError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!("ignoring {}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ExecError> {
        if self.device.max_frames_in_flight == 0 {
            return Err(ExecError::Config(
                "device.max_frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.reclamation.sweep_interval_frames == 0 {
            return Err(ExecError::Config(
                "reclamation.sweep_interval_frames must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. System-wide config: `%PROGRAMDATA%\Vexel\vexel.toml` (Windows) or `/etc/vexel/vexel.toml`
/// 2. Local fallback: `./vexel.toml`
pub fn default_config_path() -> String {
    #[cfg(windows)]
    {
        let programdata =
            std::env::var("PROGRAMDATA").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\Vexel\vexel.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/vexel/vexel.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "vexel.toml".to_string()
}

fn default_app_name() -> String {
    "vexel".to_string()
}

fn default_frames_in_flight() -> u32 {
    2
}

fn default_sweep_interval() -> u32 {
    1
}

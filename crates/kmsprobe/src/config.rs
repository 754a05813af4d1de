use kmsprobe_common::{config_search_path, parse_color};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use drm_fourcc::DrmFourcc;

use crate::error::{KmsError, KmsResult};
use crate::flip::PendingFlipPolicy;
use crate::pattern::Pattern;
use crate::pipeline::{FlipOptions, PipelineOptions};

fn default_device_path() -> String {
    "auto".to_string()
}

fn default_bpp() -> u32 {
    32
}
fn default_format() -> String {
    "XR24".to_string()
}

fn default_cycles() -> usize {
    10
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_timeout_ms() -> u64 {
    1000
}

fn default_primary() -> Pattern {
    Pattern::Tiles
}
fn default_secondary() -> Pattern {
    Pattern::Plain
}
fn default_plain_color() -> String {
    "#777777".to_string()
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub buffer: BufferConfig,
    pub flip: FlipConfig,
    pub pattern: PatternConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// `auto` or a device node such as `/dev/dri/card1`.
    #[serde(default = "default_device_path")]
    pub path: String,

    /// Kernel driver name to look for, e.g. `vkms`.
    pub driver: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: default_device_path(),
            driver: None,
        }
    }
}

impl DeviceConfig {
    pub fn device_path(&self) -> Option<PathBuf> {
        match self.path.as_str() {
            "auto" | "" => None,
            path => Some(PathBuf::from(path)),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    #[serde(default = "default_bpp")]
    pub bpp: u32,

    /// Four character pixel format code.
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            bpp: default_bpp(),
            format: default_format(),
        }
    }
}

impl BufferConfig {
    pub fn fourcc(&self) -> KmsResult<DrmFourcc> {
        let code = self.format.as_bytes();
        if code.len() != 4 {
            return Err(KmsError::Config(format!(
                "pixel format {:?} is not a four character code",
                self.format
            )));
        }
        let value = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
        DrmFourcc::try_from(value)
            .map_err(|_| KmsError::Config(format!("unknown pixel format {:?}", self.format)))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FlipConfig {
    #[serde(default = "default_cycles")]
    pub cycles: usize,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    pub pending: PendingFlipPolicy,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for FlipConfig {
    fn default() -> Self {
        Self {
            cycles: default_cycles(),
            interval_ms: default_interval_ms(),
            pending: PendingFlipPolicy::default(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PatternConfig {
    #[serde(default = "default_primary")]
    pub primary: Pattern,

    #[serde(default = "default_secondary")]
    pub secondary: Pattern,

    #[serde(default = "default_plain_color")]
    pub plain_color: String,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            secondary: default_secondary(),
            plain_color: default_plain_color(),
        }
    }
}

impl Config {
    /// Loads `explicit` if given; otherwise the user config, then the system
    /// config, then built-in defaults. Only an explicit path is required to
    /// load.
    pub fn load(explicit: Option<&Path>) -> KmsResult<Self> {
        if let Some(path) = explicit {
            let config = Self::load_from_path(path)
                .map_err(|e| KmsError::Config(format!("{}: {}", path.display(), e)))?;
            log::info!("Loaded config from {}", path.display());
            return Ok(config);
        }

        for path in config_search_path() {
            if !path.exists() {
                continue;
            }
            match Self::load_from_path(&path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load {}: {}", path.display(), e);
                }
            }
        }

        log::info!("Using default configuration");
        Ok(Self::default())
    }

    fn load_from_path(path: &Path) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read file: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse TOML: {}", e))
    }

    pub fn plain_color(&self) -> u32 {
        parse_color(&self.pattern.plain_color).unwrap_or_else(|| {
            log::warn!(
                "Invalid plain_color {:?}, using #777777",
                self.pattern.plain_color
            );
            0xFF777777
        })
    }

    pub fn pipeline_options(&self) -> KmsResult<PipelineOptions> {
        Ok(PipelineOptions {
            bpp: self.buffer.bpp,
            format: self.buffer.fourcc()?,
            primary: self.pattern.primary,
            secondary: self.pattern.secondary,
            plain_color: self.plain_color(),
            flip: FlipOptions {
                cycles: self.flip.cycles,
                interval: Duration::from_millis(self.flip.interval_ms),
                pending: self.flip.pending,
                timeout: Duration::from_millis(self.flip.timeout_ms),
            },
        })
    }
}

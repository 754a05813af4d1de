use std::io;
use std::path::PathBuf;

use crate::device::{ModeObject, ObjectClass};

pub type KmsResult<T> = Result<T, KmsError>;

/// Why no (connector, encoder, crtc, plane) chain could be chosen.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("no connector exposes a display mode")]
    NoConnector,

    #[error("connector {connector} lists no encoders")]
    NoEncoder { connector: u32 },

    #[error("connector {connector} references encoder {encoder} missing from the snapshot")]
    UnknownEncoder { connector: u32, encoder: u32 },

    #[error("encoder {encoder} is compatible with no crtc (possible_crtcs={possible_crtcs:#x})")]
    NoCrtc { encoder: u32, possible_crtcs: u32 },

    #[error("no plane can be attached to crtc {crtc} (index {index})")]
    NoPlane { crtc: u32, index: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum KmsError {
    // ── Environment and configuration (exit code 2) ─────────────────

    #[error("Failed to open DRM device {path}: {source}")]
    DeviceOpen { path: PathBuf, source: io::Error },

    #[error("No DRM device found{}", describe_driver(.driver))]
    NoDevice { driver: Option<String> },

    #[error("Driver does not support {capability}")]
    DeviceCapability {
        capability: &'static str,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    // ── Pipeline failures (exit code 1) ─────────────────────────────

    #[error("Resource discovery failed while {context}: {source}")]
    ResourceDiscovery {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Inconsistent resource snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("No compatible display path: {0}")]
    NoCompatiblePath(#[from] PathError),

    #[error("Property {name:?} not found on {class} {object_id}")]
    PropertyNotFound {
        class: ObjectClass,
        object_id: u32,
        name: String,
    },

    #[error("Failed to allocate {width}x{height}@{bpp}bpp buffer: {reason}")]
    BufferAllocation {
        width: u32,
        height: u32,
        bpp: u32,
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Driver rejected framebuffer {format} with pitch {pitch}: {source}")]
    InvalidFormat {
        format: String,
        pitch: u32,
        #[source]
        source: io::Error,
    },

    #[error("Commit rejected{}: {source}", describe_rejection(.object, .property))]
    CommitRejected {
        object: Option<ModeObject>,
        property: Option<u32>,
        #[source]
        source: io::Error,
    },

    #[error("A flip is already pending on crtc {crtc}")]
    FlipPending { crtc: u32 },

    #[error("Flip on crtc {crtc} did not complete within {millis}ms")]
    FlipTimeout { crtc: u32, millis: u128 },

    #[error("Failed to wait for flip events: {0}")]
    Events(#[source] io::Error),
}

fn describe_driver(driver: &Option<String>) -> String {
    match driver {
        Some(driver) => format!(" for driver {}", driver),
        None => String::new(),
    }
}

fn describe_rejection(object: &Option<ModeObject>, property: &Option<u32>) -> String {
    match (object, property) {
        (Some(object), Some(property)) => format!(" at {} property {}", object, property),
        (Some(object), None) => format!(" at {}", object),
        _ => String::new(),
    }
}

impl KmsError {
    pub fn discovery(context: impl Into<String>, source: io::Error) -> Self {
        Self::ResourceDiscovery {
            context: context.into(),
            source,
        }
    }

    /// Process exit status: 2 when the environment is unusable, 1 when the
    /// pipeline itself failed.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::DeviceOpen { .. }
            | Self::NoDevice { .. }
            | Self::DeviceCapability { .. }
            | Self::Config(_) => 2,

            Self::ResourceDiscovery { .. }
            | Self::InvalidSnapshot(_)
            | Self::NoCompatiblePath(_)
            | Self::PropertyNotFound { .. }
            | Self::BufferAllocation { .. }
            | Self::InvalidFormat { .. }
            | Self::CommitRejected { .. }
            | Self::FlipPending { .. }
            | Self::FlipTimeout { .. }
            | Self::Events(_) => 1,
        }
    }
}

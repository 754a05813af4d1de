//! Discovers the display pipeline of a DRM/KMS card, picks a
//! connector → encoder → CRTC → plane chain, puts dumb framebuffers on it
//! with atomic or legacy mode-setting, and page-flips between them.

pub mod card;
pub mod commit;
pub mod config;
pub mod device;
pub mod error;
pub mod flip;
pub mod framebuffer;
pub mod graph;
pub mod mode;
pub mod pattern;
pub mod pipeline;
pub mod props;
pub mod select;
pub mod virt;

pub use card::Card;
pub use config::Config;
pub use device::KmsDevice;
pub use error::{KmsError, KmsResult, PathError};
pub use pipeline::{PipelineOptions, Session};
pub use virt::VirtualCard;

//! The driver boundary. Everything the pipeline needs from a KMS device goes
//! through [`KmsDevice`]; [`crate::card::Card`] talks to a real DRM node and
//! [`crate::virt::VirtualCard`] keeps the whole device in memory.

use std::fmt;
use std::io;
use std::ops::DerefMut;
use std::time::Duration;

use bitflags::bitflags;
use drm_fourcc::DrmFourcc;
use serde::Serialize;

use crate::mode::DisplayMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectClass {
    Crtc,
    Encoder,
    Connector,
    Plane,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 4] = [
        ObjectClass::Crtc,
        ObjectClass::Encoder,
        ObjectClass::Connector,
        ObjectClass::Plane,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Crtc => "crtc",
            ObjectClass::Encoder => "encoder",
            ObjectClass::Connector => "connector",
            ObjectClass::Plane => "plane",
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mode object is keyed by class and id together; ids repeat across classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModeObject {
    pub class: ObjectClass,
    pub id: u32,
}

impl ModeObject {
    pub fn new(class: ObjectClass, id: u32) -> Self {
        Self { class, id }
    }
}

impl fmt::Display for ModeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.class, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCapability {
    DumbBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCapability {
    UniversalPlanes,
    Atomic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PropertyKind {
    Range { min: u64, max: u64 },
    SignedRange { min: i64, max: i64 },
    Enum { values: Vec<(String, u64)> },
    Bitmask,
    Blob,
    Boolean,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub id: u32,
    pub object_class: ObjectClass,
    pub kind: PropertyKind,
    pub immutable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawConnector {
    pub id: u32,
    pub name: String,
    pub state: ConnectionState,
    pub modes: Vec<DisplayMode>,
    pub encoder_ids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEncoder {
    pub id: u32,
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPlane {
    pub id: u32,
    pub possible_crtcs: u32,
}

/// Unvalidated reply to the resource and plane-resource enumeration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResources {
    pub connectors: Vec<RawConnector>,
    pub encoders: Vec<RawEncoder>,
    pub crtcs: Vec<u32>,
    pub planes: Vec<RawPlane>,
}

/// Reply to a dumb buffer creation; pitch and size are chosen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbAllocation {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

/// One `(handle, pitch, offset)` entry of a framebuffer's plane layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub handle: u32,
    pub pitch: u32,
    pub offset: u32,
}

impl PlaneLayout {
    pub fn single(handle: u32, pitch: u32, offset: u32) -> [PlaneLayout; 4] {
        let mut layout = [PlaneLayout::default(); 4];
        layout[0] = PlaneLayout {
            handle,
            pitch,
            offset,
        };
        layout
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommitFlags: u32 {
        const PAGE_FLIP_EVENT = 0x01;
        const TEST_ONLY = 0x100;
        const NONBLOCK = 0x200;
        const ALLOW_MODESET = 0x400;
    }
}

impl Default for CommitFlags {
    fn default() -> Self {
        CommitFlags::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyWrite {
    pub object: ModeObject,
    pub property: u32,
    pub value: u64,
}

/// A rejected atomic commit. Drivers that can tell which write they
/// refused report it; the others leave `object` and `property` empty.
#[derive(Debug)]
pub struct CommitFailure {
    pub object: Option<ModeObject>,
    pub property: Option<u32>,
    pub source: io::Error,
}

impl From<io::Error> for CommitFailure {
    fn from(source: io::Error) -> Self {
        Self {
            object: None,
            property: None,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipEvent {
    pub crtc: u32,
    pub frame: u32,
}

/// Synchronous request/response access to a mode-setting device.
///
/// Every call blocks until the driver answers. Ids are the driver's raw
/// object ids; none of them is ever zero.
pub trait KmsDevice {
    /// CPU view of a mapped dumb buffer. Dropping it unmaps the memory.
    type Mapping: DerefMut<Target = [u8]>;

    fn driver_capability(&self, capability: DriverCapability) -> io::Result<bool>;

    fn set_client_capability(&self, capability: ClientCapability, enable: bool) -> io::Result<()>;

    fn resources(&self) -> io::Result<RawResources>;

    fn object_properties(&self, object: ModeObject) -> io::Result<Vec<PropertyDescriptor>>;

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation>;

    /// Returns the fake offset to pass to [`KmsDevice::map_memory`].
    fn map_dumb_buffer(&self, handle: u32) -> io::Result<u64>;

    fn map_memory(&self, offset: u64, len: usize) -> io::Result<Self::Mapping>;

    fn destroy_dumb_buffer(&self, handle: u32) -> io::Result<()>;

    fn add_framebuffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        layout: &[PlaneLayout; 4],
    ) -> io::Result<u32>;

    fn remove_framebuffer(&self, framebuffer: u32) -> io::Result<()>;

    fn set_crtc(
        &self,
        crtc: u32,
        framebuffer: u32,
        position: (u32, u32),
        connectors: &[u32],
        mode: &DisplayMode,
    ) -> io::Result<()>;

    fn page_flip(&self, crtc: u32, framebuffer: u32, request_event: bool) -> io::Result<()>;

    fn create_property_blob(&self, data: &[u8]) -> io::Result<u32>;

    fn destroy_property_blob(&self, blob: u32) -> io::Result<()>;

    fn atomic_commit(&self, writes: &[PropertyWrite], flags: CommitFlags) -> Result<(), CommitFailure>;

    /// Waits up to `timeout` for completion events and returns whatever
    /// arrived, possibly nothing.
    fn read_flip_events(&self, timeout: Duration) -> io::Result<Vec<FlipEvent>>;
}

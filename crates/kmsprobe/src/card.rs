//! [`KmsDevice`] on a real `/dev/dri/cardN` node.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::num::{NonZeroU32, NonZeroUsize};
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::time::Duration;

use drm::control::{
    atomic, connector, crtc, encoder, framebuffer, plane, property, AtomicCommitFlags,
    Device as ControlDevice, Event, FbCmd2Flags, Mode, PageFlipFlags, ResourceHandles,
};
use drm::Device as _;
use drm_fourcc::{DrmFourcc, DrmModifier};
use nix::sys::mman::{self, MapFlags, ProtFlags};

use crate::device::{
    ClientCapability, CommitFailure, CommitFlags, ConnectionState, DriverCapability,
    DumbAllocation, FlipEvent, KmsDevice, ModeObject, ObjectClass, PlaneLayout,
    PropertyDescriptor, PropertyKind, PropertyWrite, RawConnector, RawEncoder, RawPlane,
    RawResources,
};
use crate::error::{KmsError, KmsResult};
use crate::mode::DisplayMode;

const MAX_CARDS: u32 = 16;

struct DrmCard(File);

impl AsFd for DrmCard {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for DrmCard {}
impl ControlDevice for DrmCard {}

/// An open DRM primary node.
pub struct Card {
    drm: DrmCard,
    path: PathBuf,
    /// Modes as the driver reported them, to hand back to `set_crtc`.
    modes: RefCell<Vec<Mode>>,
}

impl Card {
    pub fn open(path: impl AsRef<Path>) -> KmsResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| KmsError::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;
        log::info!("Opened DRM device {}", path.display());
        Ok(Self {
            drm: DrmCard(file),
            path: path.to_path_buf(),
            modes: RefCell::new(Vec::new()),
        })
    }

    /// First card whose kernel driver is called `name`.
    pub fn open_driver(name: &str) -> KmsResult<Self> {
        for path in card_paths() {
            let Ok(card) = Self::open(&path) else {
                continue;
            };
            match card.driver_name() {
                Ok(driver) if driver == name => return Ok(card),
                Ok(driver) => log::debug!("{} is driven by {}, skipping", path.display(), driver),
                Err(e) => log::debug!("Cannot query driver of {}: {}", path.display(), e),
            }
        }
        Err(KmsError::NoDevice {
            driver: Some(name.to_string()),
        })
    }

    /// First card node that can be opened.
    pub fn open_auto() -> KmsResult<Self> {
        card_paths()
            .find_map(|path| Self::open(path).ok())
            .ok_or(KmsError::NoDevice { driver: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn driver_name(&self) -> io::Result<String> {
        let driver = self.drm.get_driver()?;
        Ok(driver.name().to_string_lossy().into_owned())
    }

    fn fd(&self) -> BorrowedFd<'_> {
        self.drm.as_fd()
    }
}

fn card_paths() -> impl Iterator<Item = PathBuf> {
    (0..MAX_CARDS).map(|n| PathBuf::from(format!("/dev/dri/card{}", n)))
}

fn handle<H: From<NonZeroU32>>(id: u32) -> io::Result<H> {
    NonZeroU32::new(id)
        .map(H::from)
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Rebuilds a `possible_crtcs` bitmask against the order of `res.crtcs()`.
fn crtc_mask(res: &ResourceHandles, filter: drm::control::CrtcListFilter) -> u32 {
    let compatible = res.filter_crtcs(filter);
    res.crtcs()
        .iter()
        .enumerate()
        .filter(|&(_, crtc)| compatible.contains(crtc))
        .fold(0, |mask, (i, _)| mask | 1u32.checked_shl(i as u32).unwrap_or(0))
}

fn display_mode(mode: &Mode) -> DisplayMode {
    let (hdisplay, vdisplay) = mode.size();
    let (hsync_start, hsync_end, htotal) = mode.hsync();
    let (vsync_start, vsync_end, vtotal) = mode.vsync();
    DisplayMode {
        name: mode.name().to_string_lossy().into_owned(),
        clock: mode.clock(),
        hdisplay,
        hsync_start,
        hsync_end,
        htotal,
        hskew: mode.hskew(),
        vdisplay,
        vsync_start,
        vsync_end,
        vtotal,
        vscan: mode.vscan(),
        vrefresh: mode.vrefresh(),
        flags: mode.flags().bits(),
        mode_type: mode.mode_type().bits(),
    }
}

fn property_kind(value_type: property::ValueType) -> PropertyKind {
    use property::ValueType;
    match value_type {
        ValueType::UnsignedRange(min, max) => PropertyKind::Range { min, max },
        ValueType::SignedRange(min, max) => PropertyKind::SignedRange { min, max },
        ValueType::Enum(values) => PropertyKind::Enum {
            values: values
                .values()
                .1
                .iter()
                .map(|v| (v.name().to_string_lossy().into_owned(), v.value()))
                .collect(),
        },
        ValueType::Bitmask => PropertyKind::Bitmask,
        ValueType::Blob => PropertyKind::Blob,
        ValueType::Boolean => PropertyKind::Boolean,
        _ => PropertyKind::Other,
    }
}

struct SinglePlaneBuffer {
    size: (u32, u32),
    format: DrmFourcc,
    layout: [PlaneLayout; 4],
}

impl drm::buffer::PlanarBuffer for SinglePlaneBuffer {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        self.layout.map(|p| p.pitch)
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        self.layout
            .map(|p| NonZeroU32::new(p.handle).map(drm::buffer::Handle::from))
    }

    fn offsets(&self) -> [u32; 4] {
        self.layout.map(|p| p.offset)
    }
}

/// A shared mapping of a dumb buffer; unmapped on drop.
pub struct DumbMapping {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

impl Deref for DumbMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }
}

impl DerefMut for DumbMapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }
}

impl Drop for DumbMapping {
    fn drop(&mut self) {
        if let Err(e) = unsafe { mman::munmap(self.ptr, self.len) } {
            log::warn!("munmap of {} bytes failed: {}", self.len, e);
        }
    }
}

impl KmsDevice for Card {
    type Mapping = DumbMapping;

    fn driver_capability(&self, capability: DriverCapability) -> io::Result<bool> {
        let cap = match capability {
            DriverCapability::DumbBuffer => drm::DriverCapability::DumbBuffer,
        };
        Ok(self.drm.get_driver_capability(cap)? != 0)
    }

    fn set_client_capability(&self, capability: ClientCapability, enable: bool) -> io::Result<()> {
        let cap = match capability {
            ClientCapability::UniversalPlanes => drm::ClientCapability::UniversalPlanes,
            ClientCapability::Atomic => drm::ClientCapability::Atomic,
        };
        self.drm.set_client_capability(cap, enable)
    }

    fn resources(&self) -> io::Result<RawResources> {
        let res = self.drm.resource_handles()?;
        let mut modes = Vec::new();

        let mut connectors = Vec::with_capacity(res.connectors().len());
        for &handle in res.connectors() {
            let info = self.drm.get_connector(handle, true)?;
            modes.extend_from_slice(info.modes());
            connectors.push(RawConnector {
                id: handle.into(),
                name: format!("{}-{}", info.interface().as_str(), info.interface_id()),
                state: match info.state() {
                    connector::State::Connected => ConnectionState::Connected,
                    connector::State::Disconnected => ConnectionState::Disconnected,
                    _ => ConnectionState::Unknown,
                },
                modes: info.modes().iter().map(display_mode).collect(),
                encoder_ids: info.encoders().iter().map(|&e| e.into()).collect(),
            });
        }

        let mut encoders = Vec::with_capacity(res.encoders().len());
        for &handle in res.encoders() {
            let info = self.drm.get_encoder(handle)?;
            encoders.push(RawEncoder {
                id: handle.into(),
                possible_crtcs: crtc_mask(&res, info.possible_crtcs()),
            });
        }

        let mut planes = Vec::new();
        for handle in self.drm.plane_handles()? {
            let info = self.drm.get_plane(handle)?;
            planes.push(RawPlane {
                id: handle.into(),
                possible_crtcs: crtc_mask(&res, info.possible_crtcs()),
            });
        }

        *self.modes.borrow_mut() = modes;
        Ok(RawResources {
            connectors,
            encoders,
            crtcs: res.crtcs().iter().map(|&c| c.into()).collect(),
            planes,
        })
    }

    fn object_properties(&self, object: ModeObject) -> io::Result<Vec<PropertyDescriptor>> {
        let values = match object.class {
            ObjectClass::Crtc => self.drm.get_properties(handle::<crtc::Handle>(object.id)?)?,
            ObjectClass::Encoder => self.drm.get_properties(handle::<encoder::Handle>(object.id)?)?,
            ObjectClass::Connector => {
                self.drm.get_properties(handle::<connector::Handle>(object.id)?)?
            }
            ObjectClass::Plane => self.drm.get_properties(handle::<plane::Handle>(object.id)?)?,
        };

        let (props, _) = values.as_props_and_values();
        let mut descriptors = Vec::with_capacity(props.len());
        for &prop in props {
            let info = self.drm.get_property(prop)?;
            descriptors.push(PropertyDescriptor {
                name: info.name().to_string_lossy().into_owned(),
                id: prop.into(),
                object_class: object.class,
                kind: property_kind(info.value_type()),
                immutable: !info.mutable(),
            });
        }
        Ok(descriptors)
    }

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        let reply = drm_ffi::mode::dumbbuffer::create(self.fd(), width, height, bpp, 0)?;
        Ok(DumbAllocation {
            handle: reply.handle,
            pitch: reply.pitch,
            size: reply.size,
        })
    }

    fn map_dumb_buffer(&self, handle: u32) -> io::Result<u64> {
        Ok(drm_ffi::mode::dumbbuffer::map(self.fd(), handle, 0, 0)?.offset)
    }

    fn map_memory(&self, offset: u64, len: usize) -> io::Result<DumbMapping> {
        let length = NonZeroUsize::new(len).ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
        let ptr = unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.fd(),
                offset,
            )
        }
        .map_err(io::Error::from)?;
        Ok(DumbMapping { ptr, len })
    }

    fn destroy_dumb_buffer(&self, handle: u32) -> io::Result<()> {
        drm_ffi::mode::dumbbuffer::destroy(self.fd(), handle)?;
        Ok(())
    }

    fn add_framebuffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        layout: &[PlaneLayout; 4],
    ) -> io::Result<u32> {
        let buffer = SinglePlaneBuffer {
            size: (width, height),
            format,
            layout: *layout,
        };
        let fb = self
            .drm
            .add_planar_framebuffer(&buffer, FbCmd2Flags::empty())?;
        Ok(fb.into())
    }

    fn remove_framebuffer(&self, framebuffer: u32) -> io::Result<()> {
        self.drm
            .destroy_framebuffer(handle::<framebuffer::Handle>(framebuffer)?)
    }

    fn set_crtc(
        &self,
        crtc: u32,
        framebuffer: u32,
        position: (u32, u32),
        connectors: &[u32],
        mode: &DisplayMode,
    ) -> io::Result<()> {
        let drm_mode = self
            .modes
            .borrow()
            .iter()
            .find(|m| display_mode(m) == *mode)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let connectors = connectors
            .iter()
            .map(|&c| handle::<connector::Handle>(c))
            .collect::<io::Result<Vec<_>>>()?;

        self.drm.set_crtc(
            handle(crtc)?,
            Some(handle(framebuffer)?),
            position,
            &connectors,
            Some(drm_mode),
        )
    }

    fn page_flip(&self, crtc: u32, framebuffer: u32, request_event: bool) -> io::Result<()> {
        let flags = if request_event {
            PageFlipFlags::EVENT
        } else {
            PageFlipFlags::empty()
        };
        self.drm
            .page_flip(handle(crtc)?, handle(framebuffer)?, flags, None)
    }

    fn create_property_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut data = data.to_vec();
        Ok(drm_ffi::mode::create_property_blob(self.fd(), &mut data)?.blob_id)
    }

    fn destroy_property_blob(&self, blob: u32) -> io::Result<()> {
        self.drm.destroy_property_blob(blob as u64)
    }

    fn atomic_commit(&self, writes: &[PropertyWrite], flags: CommitFlags) -> Result<(), CommitFailure> {
        let mut req = atomic::AtomicModeReq::new();
        for write in writes {
            let prop = handle::<property::Handle>(write.property)?;
            let value = property::Value::UnsignedRange(write.value);
            let id = write.object.id;
            match write.object.class {
                ObjectClass::Crtc => req.add_property(handle::<crtc::Handle>(id)?, prop, value),
                ObjectClass::Encoder => req.add_property(handle::<encoder::Handle>(id)?, prop, value),
                ObjectClass::Connector => {
                    req.add_property(handle::<connector::Handle>(id)?, prop, value)
                }
                ObjectClass::Plane => req.add_property(handle::<plane::Handle>(id)?, prop, value),
            }
        }

        // The kernel does not say which write it refused.
        self.drm
            .atomic_commit(AtomicCommitFlags::from_bits_truncate(flags.bits()), req)
            .map_err(CommitFailure::from)
    }

    fn read_flip_events(&self, timeout: Duration) -> io::Result<Vec<FlipEvent>> {
        let mut fds = [libc::pollfd {
            fd: self.drm.as_fd().as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        if ret == 0 || fds[0].revents & libc::POLLIN == 0 {
            return Ok(Vec::new());
        }

        let events = self
            .drm
            .receive_events()?
            .filter_map(|event| match event {
                Event::PageFlip(flip) => Some(FlipEvent {
                    crtc: flip.crtc.into(),
                    frame: flip.frame,
                }),
                _ => None,
            })
            .collect();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_refuse_zero() {
        assert!(handle::<crtc::Handle>(0).is_err());
        let crtc: crtc::Handle = handle(41).unwrap();
        assert_eq!(u32::from(crtc), 41);
    }

    #[test]
    fn card_paths_cover_all_minors() {
        let paths: Vec<_> = card_paths().collect();
        assert_eq!(paths.len(), MAX_CARDS as usize);
        assert_eq!(paths[0], PathBuf::from("/dev/dri/card0"));
    }

    #[test]
    fn missing_node_is_device_open_error() {
        let err = Card::open("/nonexistent/dri/card0").err().unwrap();
        assert!(matches!(err, KmsError::DeviceOpen { .. }));
        assert_eq!(err.exit_code(), 2);
    }
}

//! An in-memory KMS device.
//!
//! [`VirtualCard`] validates requests roughly the way a kernel driver does:
//! unknown objects and properties are refused, atomic commits are staged and
//! applied all at once, and page flips stay pending until their completion
//! event is read. The builder injects faults for testing the error paths.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use drm_fourcc::DrmFourcc;

use crate::device::{
    ClientCapability, CommitFailure, CommitFlags, ConnectionState, DriverCapability,
    DumbAllocation, FlipEvent, KmsDevice, ModeObject, ObjectClass, PlaneLayout,
    PropertyDescriptor, PropertyKind, PropertyWrite, RawConnector, RawEncoder, RawPlane,
    RawResources,
};
use crate::mode::{DisplayMode, MODE_INFO_SIZE};

const PITCH_ALIGN: u32 = 64;
const FIRST_DYNAMIC_ID: u32 = 1000;

/// Properties a commit may only touch with [`CommitFlags::ALLOW_MODESET`].
const MODESET_PROPERTIES: [(ObjectClass, &str); 3] = [
    (ObjectClass::Crtc, "ACTIVE"),
    (ObjectClass::Crtc, "MODE_ID"),
    (ObjectClass::Connector, "CRTC_ID"),
];

/// Request counts, for asserting what reached the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub driver_capability: usize,
    pub create_dumb: usize,
    pub add_framebuffer: usize,
    pub set_crtc: usize,
    pub page_flip: usize,
    pub atomic_commit: usize,
    pub create_blob: usize,
}

/// A framebuffer going on screen through `set_crtc` or `page_flip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanoutChange {
    pub crtc: u32,
    pub framebuffer: u32,
    pub at: Instant,
}

/// CPU view of a virtual dumb buffer.
#[derive(Debug)]
pub struct VirtualMapping(Vec<u8>);

impl Deref for VirtualMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for VirtualMapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct DumbBuffer {
    pitch: u32,
    size: u64,
}

#[derive(Debug, Default)]
struct State {
    atomic: bool,
    next_id: u32,
    dumb: HashMap<u32, DumbBuffer>,
    framebuffers: HashSet<u32>,
    blobs: HashMap<u32, Vec<u8>>,
    committed: BTreeMap<ModeObject, BTreeMap<u32, u64>>,
    scanout: HashMap<u32, u32>,
    history: Vec<ScanoutChange>,
    pending_flips: Vec<u32>,
    injected: Vec<FlipEvent>,
    frame: u32,
    calls: Calls,
}

impl State {
    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn show(&mut self, crtc: u32, framebuffer: u32) {
        self.scanout.insert(crtc, framebuffer);
        self.history.push(ScanoutChange {
            crtc,
            framebuffer,
            at: Instant::now(),
        });
    }
}

pub struct VirtualCardBuilder {
    resources: RawResources,
    dumb_buffers: bool,
    atomic: bool,
    pitch_shortfall: u32,
    formats: Vec<DrmFourcc>,
    omitted: Vec<(ModeObject, String)>,
    rejected: Vec<(ModeObject, String)>,
    withhold_flip_events: bool,
}

impl Default for VirtualCardBuilder {
    fn default() -> Self {
        Self {
            resources: VirtualCard::default_resources(),
            dumb_buffers: true,
            atomic: true,
            pitch_shortfall: 0,
            formats: vec![DrmFourcc::Xrgb8888, DrmFourcc::Argb8888, DrmFourcc::Rgb565],
            omitted: Vec::new(),
            rejected: Vec::new(),
            withhold_flip_events: false,
        }
    }
}

impl VirtualCardBuilder {
    pub fn resources(mut self, resources: RawResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn dumb_buffers(mut self, supported: bool) -> Self {
        self.dumb_buffers = supported;
        self
    }

    pub fn atomic(mut self, supported: bool) -> Self {
        self.atomic = supported;
        self
    }

    /// Makes created dumb buffers report a pitch this many bytes too small.
    pub fn pitch_shortfall(mut self, bytes: u32) -> Self {
        self.pitch_shortfall = bytes;
        self
    }

    pub fn formats(mut self, formats: Vec<DrmFourcc>) -> Self {
        self.formats = formats;
        self
    }

    /// Leaves a property out of the object's property list.
    pub fn omit_property(mut self, object: ModeObject, name: &str) -> Self {
        self.omitted.push((object, name.to_string()));
        self
    }

    /// Fails any commit that writes this property, naming it as the offender.
    pub fn reject_property(mut self, object: ModeObject, name: &str) -> Self {
        self.rejected.push((object, name.to_string()));
        self
    }

    /// Accepts page flips but never delivers their completion events.
    pub fn withhold_flip_events(mut self, withhold: bool) -> Self {
        self.withhold_flip_events = withhold;
        self
    }

    pub fn build(self) -> VirtualCard {
        let properties = standard_properties(&self.resources, &self.omitted);
        let rejected = self
            .rejected
            .iter()
            .filter_map(|(object, name)| {
                let id = properties
                    .get(object)?
                    .iter()
                    .find(|p| &p.name == name)?
                    .id;
                Some((*object, id))
            })
            .collect();

        VirtualCard {
            state: RefCell::new(State {
                next_id: FIRST_DYNAMIC_ID,
                ..State::default()
            }),
            resources: self.resources,
            properties,
            rejected,
            dumb_buffers: self.dumb_buffers,
            atomic: self.atomic,
            pitch_shortfall: self.pitch_shortfall,
            formats: self.formats,
            withhold_flip_events: self.withhold_flip_events,
        }
    }
}

pub struct VirtualCard {
    resources: RawResources,
    properties: BTreeMap<ModeObject, Vec<PropertyDescriptor>>,
    rejected: HashSet<(ModeObject, u32)>,
    dumb_buffers: bool,
    atomic: bool,
    pitch_shortfall: u32,
    formats: Vec<DrmFourcc>,
    withhold_flip_events: bool,
    state: RefCell<State>,
}

impl Default for VirtualCard {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualCard {
    /// One connected 1080p output with a primary and a cursor plane.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> VirtualCardBuilder {
        VirtualCardBuilder::default()
    }

    pub fn default_resources() -> RawResources {
        RawResources {
            connectors: vec![RawConnector {
                id: 40,
                name: "Virtual-1".to_string(),
                state: ConnectionState::Connected,
                modes: vec![
                    DisplayMode::with_size(1920, 1080),
                    DisplayMode::with_size(1280, 720),
                ],
                encoder_ids: vec![39],
            }],
            encoders: vec![RawEncoder {
                id: 39,
                possible_crtcs: 0b1,
            }],
            crtcs: vec![38],
            planes: vec![
                RawPlane {
                    id: 31,
                    possible_crtcs: 0b1,
                },
                RawPlane {
                    id: 34,
                    possible_crtcs: 0b1,
                },
            ],
        }
    }

    pub fn calls(&self) -> Calls {
        self.state.borrow().calls
    }

    pub fn live_dumb_buffers(&self) -> usize {
        self.state.borrow().dumb.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.borrow().framebuffers.len()
    }

    pub fn live_blobs(&self) -> usize {
        self.state.borrow().blobs.len()
    }

    /// Last committed value of a property, by name.
    pub fn property_value(&self, object: ModeObject, name: &str) -> Option<u64> {
        let id = self.property_id(object, name)?;
        self.state.borrow().committed.get(&object)?.get(&id).copied()
    }

    /// Framebuffer shown on a CRTC through the legacy calls.
    pub fn scanout(&self, crtc: u32) -> Option<u32> {
        self.state.borrow().scanout.get(&crtc).copied()
    }

    /// Every legacy scanout change so far, oldest first.
    pub fn scanout_history(&self) -> Vec<ScanoutChange> {
        self.state.borrow().history.clone()
    }

    pub fn pending_flips(&self) -> Vec<u32> {
        self.state.borrow().pending_flips.clone()
    }

    /// Queues an event that no flip asked for.
    pub fn inject_flip_event(&self, event: FlipEvent) {
        self.state.borrow_mut().injected.push(event);
    }

    pub fn property_id(&self, object: ModeObject, name: &str) -> Option<u32> {
        self.properties
            .get(&object)?
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.id)
    }

    fn descriptor(&self, object: ModeObject, property: u32) -> Option<&PropertyDescriptor> {
        self.properties.get(&object)?.iter().find(|p| p.id == property)
    }

    fn has_crtc(&self, id: u32) -> bool {
        self.resources.crtcs.contains(&id)
    }

    /// Checks one write against the staged state. Errors carry the errno the
    /// kernel would answer with.
    fn check_write(&self, state: &State, write: &PropertyWrite, flags: CommitFlags) -> io::Result<()> {
        let einval = || Err(io::Error::from_raw_os_error(libc::EINVAL));

        let Some(descriptor) = self.descriptor(write.object, write.property) else {
            return einval();
        };
        if descriptor.immutable || self.rejected.contains(&(write.object, write.property)) {
            return einval();
        }

        let value = write.value;
        let object_id = u32::try_from(value).ok();
        let ok = match descriptor.name.as_str() {
            "FB_ID" => value == 0 || object_id.is_some_and(|id| state.framebuffers.contains(&id)),
            "CRTC_ID" => value == 0 || object_id.is_some_and(|id| self.has_crtc(id)),
            "MODE_ID" => {
                value == 0
                    || object_id
                        .and_then(|id| state.blobs.get(&id))
                        .is_some_and(|blob| blob.len() == MODE_INFO_SIZE)
            }
            "ACTIVE" => value <= 1,
            _ => match &descriptor.kind {
                PropertyKind::Range { min, max } => (*min..=*max).contains(&value),
                _ => true,
            },
        };
        if !ok {
            return einval();
        }

        let needs_modeset = MODESET_PROPERTIES
            .iter()
            .any(|&(class, name)| class == write.object.class && name == descriptor.name);
        if needs_modeset && !flags.contains(CommitFlags::ALLOW_MODESET) {
            let current = state
                .committed
                .get(&write.object)
                .and_then(|props| props.get(&write.property))
                .copied()
                .unwrap_or(0);
            if current != value {
                return einval();
            }
        }

        Ok(())
    }
}

impl KmsDevice for VirtualCard {
    type Mapping = VirtualMapping;

    fn driver_capability(&self, capability: DriverCapability) -> io::Result<bool> {
        self.state.borrow_mut().calls.driver_capability += 1;
        match capability {
            DriverCapability::DumbBuffer => Ok(self.dumb_buffers),
        }
    }

    fn set_client_capability(&self, capability: ClientCapability, enable: bool) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        match capability {
            ClientCapability::UniversalPlanes => {}
            ClientCapability::Atomic => {
                if enable && !self.atomic {
                    return Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP));
                }
                state.atomic = enable;
            }
        }
        Ok(())
    }

    fn resources(&self) -> io::Result<RawResources> {
        Ok(self.resources.clone())
    }

    fn object_properties(&self, object: ModeObject) -> io::Result<Vec<PropertyDescriptor>> {
        self.properties
            .get(&object)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn create_dumb_buffer(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        let mut state = self.state.borrow_mut();
        state.calls.create_dumb += 1;
        if !self.dumb_buffers {
            return Err(io::Error::from_raw_os_error(libc::ENOSYS));
        }

        let row = width
            .checked_mul(bpp.div_ceil(8))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let pitch = row
            .div_ceil(PITCH_ALIGN)
            .saturating_mul(PITCH_ALIGN)
            .saturating_sub(self.pitch_shortfall);
        let size = pitch as u64 * height as u64;

        let handle = state.allocate_id();
        state.dumb.insert(handle, DumbBuffer { pitch, size });
        Ok(DumbAllocation { handle, pitch, size })
    }

    fn map_dumb_buffer(&self, handle: u32) -> io::Result<u64> {
        if !self.state.borrow().dumb.contains_key(&handle) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        Ok((handle as u64) << 12)
    }

    fn map_memory(&self, offset: u64, len: usize) -> io::Result<VirtualMapping> {
        let state = self.state.borrow();
        let handle = u32::try_from(offset >> 12).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        match state.dumb.get(&handle) {
            Some(buffer) if len as u64 <= buffer.size => Ok(VirtualMapping(vec![0; len])),
            _ => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }

    fn destroy_dumb_buffer(&self, handle: u32) -> io::Result<()> {
        match self.state.borrow_mut().dumb.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn add_framebuffer(
        &self,
        width: u32,
        height: u32,
        format: DrmFourcc,
        layout: &[PlaneLayout; 4],
    ) -> io::Result<u32> {
        let mut state = self.state.borrow_mut();
        state.calls.add_framebuffer += 1;
        let einval = || io::Error::from_raw_os_error(libc::EINVAL);

        if !self.formats.contains(&format) {
            return Err(einval());
        }
        let cpp = match format {
            DrmFourcc::Rgb565 => 2,
            _ => 4,
        };
        let plane = layout[0];
        let buffer = state.dumb.get(&plane.handle).copied().ok_or_else(einval)?;
        let needed = plane.pitch as u64 * height as u64 + plane.offset as u64;
        if width == 0 || (plane.pitch as u64) < width as u64 * cpp || needed > buffer.size {
            return Err(einval());
        }
        if plane.pitch > buffer.pitch {
            return Err(einval());
        }
        if layout[1..].iter().any(|p| p.handle != 0) {
            return Err(einval());
        }

        let id = state.allocate_id();
        state.framebuffers.insert(id);
        Ok(id)
    }

    fn remove_framebuffer(&self, framebuffer: u32) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if !state.framebuffers.remove(&framebuffer) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        state.scanout.retain(|_, fb| *fb != framebuffer);
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc: u32,
        framebuffer: u32,
        _position: (u32, u32),
        connectors: &[u32],
        mode: &DisplayMode,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.set_crtc += 1;

        let known_connector = |id: &u32| self.resources.connectors.iter().any(|c| c.id == *id);
        if !self.has_crtc(crtc)
            || !state.framebuffers.contains(&framebuffer)
            || connectors.is_empty()
            || !connectors.iter().all(known_connector)
        {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let advertised = self
            .resources
            .connectors
            .iter()
            .filter(|c| connectors.contains(&c.id))
            .all(|c| c.modes.contains(mode));
        if !advertised {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        state.show(crtc, framebuffer);
        Ok(())
    }

    fn page_flip(&self, crtc: u32, framebuffer: u32, request_event: bool) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.page_flip += 1;

        if !state.scanout.contains_key(&crtc) || !state.framebuffers.contains(&framebuffer) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if state.pending_flips.contains(&crtc) {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }

        state.show(crtc, framebuffer);
        if request_event {
            state.pending_flips.push(crtc);
        }
        Ok(())
    }

    fn create_property_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut state = self.state.borrow_mut();
        state.calls.create_blob += 1;
        if data.is_empty() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let id = state.allocate_id();
        state.blobs.insert(id, data.to_vec());
        Ok(id)
    }

    fn destroy_property_blob(&self, blob: u32) -> io::Result<()> {
        match self.state.borrow_mut().blobs.remove(&blob) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn atomic_commit(&self, writes: &[PropertyWrite], flags: CommitFlags) -> Result<(), CommitFailure> {
        let mut state = self.state.borrow_mut();
        state.calls.atomic_commit += 1;

        if !state.atomic {
            return Err(io::Error::from_raw_os_error(libc::EINVAL).into());
        }
        if flags.contains(CommitFlags::PAGE_FLIP_EVENT | CommitFlags::TEST_ONLY) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL).into());
        }

        for write in writes {
            if let Err(source) = self.check_write(&state, write, flags) {
                return Err(CommitFailure {
                    object: Some(write.object),
                    property: Some(write.property),
                    source,
                });
            }
        }
        if flags.contains(CommitFlags::TEST_ONLY) {
            return Ok(());
        }

        let mut staged = state.committed.clone();
        for write in writes {
            staged
                .entry(write.object)
                .or_default()
                .insert(write.property, write.value);
        }
        state.committed = staged;

        if flags.contains(CommitFlags::PAGE_FLIP_EVENT) {
            let mut crtcs: Vec<u32> = writes
                .iter()
                .filter(|w| w.object.class == ObjectClass::Crtc)
                .map(|w| w.object.id)
                .collect();
            crtcs.dedup();
            state.pending_flips.extend(crtcs);
        }
        Ok(())
    }

    fn read_flip_events(&self, timeout: Duration) -> io::Result<Vec<FlipEvent>> {
        let mut state = self.state.borrow_mut();
        let mut events: Vec<FlipEvent> = state.injected.drain(..).collect();
        if !self.withhold_flip_events {
            let pending: Vec<u32> = state.pending_flips.drain(..).collect();
            for crtc in pending {
                state.frame = state.frame.wrapping_add(1);
                events.push(FlipEvent {
                    crtc,
                    frame: state.frame,
                });
            }
        }
        drop(state);

        if events.is_empty() {
            std::thread::sleep(timeout);
        }
        Ok(events)
    }
}

/// The property set a typical atomic driver exposes, with ids handed out per
/// (class, name) the way the kernel shares property objects.
fn standard_properties(
    resources: &RawResources,
    omitted: &[(ModeObject, String)],
) -> BTreeMap<ModeObject, Vec<PropertyDescriptor>> {
    let range = |max: u64| PropertyKind::Range { min: 0, max };
    let signed = PropertyKind::SignedRange {
        min: i32::MIN as i64,
        max: i32::MAX as i64,
    };

    let crtc: Vec<(&str, PropertyKind, bool)> = vec![
        ("ACTIVE", PropertyKind::Boolean, false),
        ("MODE_ID", PropertyKind::Blob, false),
    ];
    let connector: Vec<(&str, PropertyKind, bool)> = vec![
        ("CRTC_ID", PropertyKind::Other, false),
        (
            "DPMS",
            PropertyKind::Enum {
                values: vec![
                    ("On".to_string(), 0),
                    ("Standby".to_string(), 1),
                    ("Suspend".to_string(), 2),
                    ("Off".to_string(), 3),
                ],
            },
            false,
        ),
    ];
    let plane: Vec<(&str, PropertyKind, bool)> = vec![
        (
            "type",
            PropertyKind::Enum {
                values: vec![
                    ("Overlay".to_string(), 0),
                    ("Primary".to_string(), 1),
                    ("Cursor".to_string(), 2),
                ],
            },
            true,
        ),
        ("FB_ID", PropertyKind::Other, false),
        ("CRTC_ID", PropertyKind::Other, false),
        ("SRC_X", range(u32::MAX as u64), false),
        ("SRC_Y", range(u32::MAX as u64), false),
        ("SRC_W", range(u32::MAX as u64), false),
        ("SRC_H", range(u32::MAX as u64), false),
        ("CRTC_X", signed.clone(), false),
        ("CRTC_Y", signed, false),
        ("CRTC_W", range(i32::MAX as u64), false),
        ("CRTC_H", range(i32::MAX as u64), false),
    ];

    let mut ids: BTreeMap<(ObjectClass, &str), u32> = BTreeMap::new();
    let mut next = 1;
    for (class, list) in [
        (ObjectClass::Crtc, &crtc),
        (ObjectClass::Connector, &connector),
        (ObjectClass::Plane, &plane),
    ] {
        for (name, _, _) in list.iter() {
            ids.insert((class, *name), next);
            next += 1;
        }
    }

    let objects = resources
        .crtcs
        .iter()
        .map(|&id| (ModeObject::new(ObjectClass::Crtc, id), crtc.as_slice()))
        .chain(resources.encoders.iter().map(|e| {
            (
                ModeObject::new(ObjectClass::Encoder, e.id),
                &[] as &[(&str, PropertyKind, bool)],
            )
        }))
        .chain(resources.connectors.iter().map(|c| {
            (
                ModeObject::new(ObjectClass::Connector, c.id),
                connector.as_slice(),
            )
        }))
        .chain(
            resources
                .planes
                .iter()
                .map(|p| (ModeObject::new(ObjectClass::Plane, p.id), plane.as_slice())),
        );

    objects
        .map(|(object, list)| {
            let properties = list
                .iter()
                .filter(|(name, _, _)| !omitted.iter().any(|(o, n)| *o == object && n == name))
                .map(|(name, kind, immutable)| PropertyDescriptor {
                    name: name.to_string(),
                    id: ids[&(object.class, *name)],
                    object_class: object.class,
                    kind: kind.clone(),
                    immutable: *immutable,
                })
                .collect();
            (object, properties)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crtc() -> ModeObject {
        ModeObject::new(ObjectClass::Crtc, 38)
    }

    #[test]
    fn property_ids_are_shared_per_class() {
        let resources = RawResources {
            crtcs: vec![38, 41],
            ..VirtualCard::default_resources()
        };
        let card = VirtualCard::builder().resources(resources).build();
        let a = card.property_id(crtc(), "ACTIVE");
        let b = card.property_id(ModeObject::new(ObjectClass::Crtc, 41), "ACTIVE");
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_ne!(
            card.property_id(ModeObject::new(ObjectClass::Plane, 31), "CRTC_ID"),
            card.property_id(ModeObject::new(ObjectClass::Connector, 40), "CRTC_ID")
        );
    }

    #[test]
    fn omitted_properties_are_missing() {
        let card = VirtualCard::builder().omit_property(crtc(), "MODE_ID").build();
        assert!(card.property_id(crtc(), "MODE_ID").is_none());
        assert!(card.property_id(crtc(), "ACTIVE").is_some());
    }

    #[test]
    fn commits_apply_all_or_nothing() {
        let card = VirtualCard::new();
        card.set_client_capability(ClientCapability::Atomic, true).unwrap();
        let active = card.property_id(crtc(), "ACTIVE").unwrap();
        let writes = [
            PropertyWrite {
                object: crtc(),
                property: active,
                value: 1,
            },
            PropertyWrite {
                object: crtc(),
                property: 9999,
                value: 1,
            },
        ];
        let err = card.atomic_commit(&writes, CommitFlags::ALLOW_MODESET).unwrap_err();
        assert_eq!(err.object, Some(crtc()));
        assert_eq!(err.property, Some(9999));
        assert_eq!(card.property_value(crtc(), "ACTIVE"), None);

        card.atomic_commit(&writes[..1], CommitFlags::ALLOW_MODESET).unwrap();
        assert_eq!(card.property_value(crtc(), "ACTIVE"), Some(1));
    }

    #[test]
    fn modeset_properties_need_the_flag() {
        let card = VirtualCard::new();
        card.set_client_capability(ClientCapability::Atomic, true).unwrap();
        let write = PropertyWrite {
            object: crtc(),
            property: card.property_id(crtc(), "ACTIVE").unwrap(),
            value: 1,
        };
        assert!(card.atomic_commit(&[write], CommitFlags::empty()).is_err());
        assert!(card.atomic_commit(&[write], CommitFlags::TEST_ONLY).is_err());
        card.atomic_commit(&[write], CommitFlags::ALLOW_MODESET).unwrap();
        // Rewriting the current value is not a modeset.
        card.atomic_commit(&[write], CommitFlags::empty()).unwrap();
    }

    #[test]
    fn atomic_requires_client_capability() {
        let card = VirtualCard::builder().atomic(false).build();
        assert!(card.set_client_capability(ClientCapability::Atomic, true).is_err());
        assert!(card.atomic_commit(&[], CommitFlags::empty()).is_err());
    }

    #[test]
    fn flips_stay_pending_until_read() {
        let card = VirtualCard::new();
        let handle = card.create_dumb_buffer(64, 64, 32).unwrap().handle;
        let fb = card
            .add_framebuffer(64, 64, DrmFourcc::Xrgb8888, &PlaneLayout::single(handle, 256, 0))
            .unwrap();

        assert!(card.page_flip(38, fb, true).is_err());
        let mode = DisplayMode::with_size(1920, 1080);
        card.set_crtc(38, fb, (0, 0), &[40], &mode).unwrap();
        assert_eq!(card.scanout(38), Some(fb));

        card.page_flip(38, fb, true).unwrap();
        let busy = card.page_flip(38, fb, true).unwrap_err();
        assert_eq!(busy.raw_os_error(), Some(libc::EBUSY));

        let events = card.read_flip_events(Duration::ZERO).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].crtc, 38);
        assert!(card.pending_flips().is_empty());
    }

    #[test]
    fn set_crtc_refuses_unadvertised_modes() {
        let card = VirtualCard::new();
        let handle = card.create_dumb_buffer(64, 64, 32).unwrap().handle;
        let fb = card
            .add_framebuffer(64, 64, DrmFourcc::Xrgb8888, &PlaneLayout::single(handle, 256, 0))
            .unwrap();
        let mode = DisplayMode::with_size(800, 600);
        assert!(card.set_crtc(38, fb, (0, 0), &[40], &mode).is_err());
    }
}

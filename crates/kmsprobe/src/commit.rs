use std::io;

use crate::device::{CommitFailure, CommitFlags, KmsDevice, ModeObject, ObjectClass, PropertyWrite};
use crate::error::{KmsError, KmsResult};
use crate::mode::DisplayMode;
use crate::props::PropertyCatalog;
use crate::select::PipelineSelection;

/// A property blob that is destroyed when dropped.
pub struct PropertyBlob<'d, D: KmsDevice> {
    device: &'d D,
    id: u32,
}

impl<'d, D: KmsDevice> PropertyBlob<'d, D> {
    pub fn create(device: &'d D, data: &[u8]) -> io::Result<Self> {
        let id = device.create_property_blob(data)?;
        Ok(Self { device, id })
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl<D: KmsDevice> Drop for PropertyBlob<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.destroy_property_blob(self.id) {
            log::warn!("Failed to destroy property blob {}: {}", self.id, e);
        }
    }
}

/// Resolved property writes plus the flags they go out with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicTransaction {
    pub writes: Vec<PropertyWrite>,
    pub flags: CommitFlags,
}

/// Collects property writes by name and submits them as one atomic request.
///
/// Names are resolved against the catalog when they are added, so a typo
/// fails before anything reaches the driver. The builder is consumed by
/// [`TransactionBuilder::commit`]; blobs it created live on in the returned
/// [`CommittedState`] or are released if the commit fails.
pub struct TransactionBuilder<'d, D: KmsDevice> {
    device: &'d D,
    catalog: &'d PropertyCatalog,
    transaction: AtomicTransaction,
    blobs: Vec<PropertyBlob<'d, D>>,
}

impl<'d, D: KmsDevice> TransactionBuilder<'d, D> {
    pub fn new(device: &'d D, catalog: &'d PropertyCatalog) -> Self {
        Self {
            device,
            catalog,
            transaction: AtomicTransaction::default(),
            blobs: Vec::new(),
        }
    }

    pub fn set(&mut self, object: ModeObject, name: &str, value: u64) -> KmsResult<&mut Self> {
        let property = self.catalog.resolve(object.class, object.id, name)?;
        self.transaction.writes.push(PropertyWrite {
            object,
            property,
            value,
        });
        Ok(self)
    }

    /// Scans `fb` out at full size on `crtc` through `plane`.
    pub fn bind_plane(
        &mut self,
        plane: u32,
        crtc: u32,
        fb: u32,
        (width, height): (u32, u32),
    ) -> KmsResult<&mut Self> {
        let plane = ModeObject::new(ObjectClass::Plane, plane);
        let width = width as u64;
        let height = height as u64;

        // Source coordinates are 16.16 fixed point.
        self.set(plane, "SRC_X", 0)?
            .set(plane, "SRC_Y", 0)?
            .set(plane, "SRC_W", width << 16)?
            .set(plane, "SRC_H", height << 16)?
            .set(plane, "CRTC_X", 0)?
            .set(plane, "CRTC_Y", 0)?
            .set(plane, "CRTC_W", width)?
            .set(plane, "CRTC_H", height)?
            .set(plane, "CRTC_ID", crtc as u64)?
            .set(plane, "FB_ID", fb as u64)
    }

    /// Sets the CRTC's mode through a MODE_ID blob and turns it on.
    pub fn activate_crtc(&mut self, crtc: u32, mode: &DisplayMode) -> KmsResult<&mut Self> {
        let object = ModeObject::new(ObjectClass::Crtc, crtc);
        let mode_id = self.catalog.resolve(object.class, crtc, "MODE_ID")?;
        self.catalog.resolve(object.class, crtc, "ACTIVE")?;

        let blob = PropertyBlob::create(self.device, &mode.to_mode_info()).map_err(|source| {
            KmsError::CommitRejected {
                object: Some(object),
                property: Some(mode_id),
                source,
            }
        })?;
        log::debug!("Created mode blob {} for {} ({})", blob.id(), object, mode);
        let blob_id = blob.id() as u64;
        self.blobs.push(blob);

        self.set(object, "MODE_ID", blob_id)?.set(object, "ACTIVE", 1)
    }

    pub fn route_connector(&mut self, connector: u32, crtc: u32) -> KmsResult<&mut Self> {
        self.set(
            ModeObject::new(ObjectClass::Connector, connector),
            "CRTC_ID",
            crtc as u64,
        )
    }

    pub fn allow_modeset(&mut self) -> &mut Self {
        self.transaction.flags |= CommitFlags::ALLOW_MODESET;
        self
    }

    pub fn flags(&mut self, flags: CommitFlags) -> &mut Self {
        self.transaction.flags |= flags;
        self
    }

    pub fn transaction(&self) -> &AtomicTransaction {
        &self.transaction
    }

    /// Asks the driver whether the writes would be accepted, changing nothing.
    pub fn test(&self) -> KmsResult<()> {
        let flags = (self.transaction.flags - CommitFlags::PAGE_FLIP_EVENT) | CommitFlags::TEST_ONLY;
        self.device
            .atomic_commit(&self.transaction.writes, flags)
            .map_err(rejected)
    }

    pub fn commit(self) -> KmsResult<CommittedState<'d, D>> {
        let Self {
            device,
            transaction,
            blobs,
            ..
        } = self;

        log::debug!(
            "Committing {} property writes ({:?})",
            transaction.writes.len(),
            transaction.flags
        );
        for write in &transaction.writes {
            log::trace!("  {} [{}] = {}", write.object, write.property, write.value);
        }

        if let Err(failure) = device.atomic_commit(&transaction.writes, transaction.flags) {
            drop(blobs);
            return Err(rejected(failure));
        }

        log::info!("Atomic commit of {} writes applied", transaction.writes.len());
        Ok(CommittedState {
            writes: transaction.writes,
            blobs,
        })
    }
}

fn rejected(failure: CommitFailure) -> KmsError {
    KmsError::CommitRejected {
        object: failure.object,
        property: failure.property,
        source: failure.source,
    }
}

/// What a successful commit left on the device. Holds the blobs the
/// committed state refers to; dropping it releases them.
pub struct CommittedState<'d, D: KmsDevice> {
    writes: Vec<PropertyWrite>,
    blobs: Vec<PropertyBlob<'d, D>>,
}

impl<D: KmsDevice> CommittedState<'_, D> {
    pub fn writes(&self) -> &[PropertyWrite] {
        &self.writes
    }

    pub fn blob_ids(&self) -> Vec<u32> {
        self.blobs.iter().map(PropertyBlob::id).collect()
    }
}

/// The pre-atomic calls: a full mode-set in one request, and page flips.
pub struct LegacyModeset<'d, D: KmsDevice> {
    device: &'d D,
}

impl<'d, D: KmsDevice> LegacyModeset<'d, D> {
    pub fn new(device: &'d D) -> Self {
        Self { device }
    }

    /// Binds `fb`, the selected mode and connector to the selected CRTC.
    pub fn set_crtc(&self, selection: &PipelineSelection, fb: u32) -> KmsResult<()> {
        let crtc = selection.crtc.id;
        self.device
            .set_crtc(crtc, fb, (0, 0), &[selection.connector.id], &selection.mode)
            .map_err(|source| KmsError::CommitRejected {
                object: Some(ModeObject::new(ObjectClass::Crtc, crtc)),
                property: None,
                source,
            })?;
        log::info!(
            "Mode set: crtc {} -> connector {} at {} with framebuffer {}",
            crtc,
            selection.connector.id,
            selection.mode,
            fb
        );
        Ok(())
    }

    /// Swaps the CRTC's framebuffer; the mode and routing stay as they are.
    pub fn page_flip(&self, crtc: u32, fb: u32, request_event: bool) -> KmsResult<()> {
        self.device
            .page_flip(crtc, fb, request_event)
            .map_err(|source| match source.raw_os_error() {
                Some(libc::EBUSY) => KmsError::FlipPending { crtc },
                _ => KmsError::CommitRejected {
                    object: Some(ModeObject::new(ObjectClass::Crtc, crtc)),
                    property: None,
                    source,
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ClientCapability, PlaneLayout};
    use crate::graph::ResourceGraph;
    use crate::select::{select, PlaneRequirement};
    use crate::virt::VirtualCard;
    use drm_fourcc::DrmFourcc;

    const CRTC: u32 = 38;
    const CONNECTOR: u32 = 40;
    const PLANE: u32 = 31;

    fn setup(card: &VirtualCard) -> (PropertyCatalog, u32) {
        card.set_client_capability(ClientCapability::Atomic, true).unwrap();
        let graph = ResourceGraph::discover(card).unwrap();
        let catalog = PropertyCatalog::discover(card, &graph);
        let dumb = card.create_dumb_buffer(1920, 1080, 32).unwrap();
        let fb = card
            .add_framebuffer(
                1920,
                1080,
                DrmFourcc::Xrgb8888,
                &PlaneLayout::single(dumb.handle, dumb.pitch, 0),
            )
            .unwrap();
        (catalog, fb)
    }

    fn modeset<'d>(
        card: &'d VirtualCard,
        catalog: &'d PropertyCatalog,
        fb: u32,
    ) -> KmsResult<TransactionBuilder<'d, VirtualCard>> {
        let mode = DisplayMode::with_size(1920, 1080);
        let mut tx = TransactionBuilder::new(card, catalog);
        tx.bind_plane(PLANE, CRTC, fb, (1920, 1080))?
            .activate_crtc(CRTC, &mode)?
            .route_connector(CONNECTOR, CRTC)?
            .allow_modeset();
        Ok(tx)
    }

    #[test]
    fn full_modeset_is_applied() {
        let card = VirtualCard::new();
        let (catalog, fb) = setup(&card);
        let state = modeset(&card, &catalog, fb).unwrap().commit().unwrap();

        let plane = ModeObject::new(ObjectClass::Plane, PLANE);
        let crtc = ModeObject::new(ObjectClass::Crtc, CRTC);
        assert_eq!(state.writes().len(), 13);
        assert_eq!(card.property_value(plane, "FB_ID"), Some(fb as u64));
        assert_eq!(card.property_value(plane, "SRC_W"), Some(1920 << 16));
        assert_eq!(card.property_value(plane, "CRTC_H"), Some(1080));
        assert_eq!(card.property_value(crtc, "ACTIVE"), Some(1));
        assert_eq!(
            card.property_value(crtc, "MODE_ID"),
            state.blob_ids().first().map(|&id| id as u64)
        );
        assert_eq!(
            card.property_value(ModeObject::new(ObjectClass::Connector, CONNECTOR), "CRTC_ID"),
            Some(CRTC as u64)
        );

        assert_eq!(card.live_blobs(), 1);
        drop(state);
        assert_eq!(card.live_blobs(), 0);
    }

    #[test]
    fn rejection_changes_nothing_and_releases_blobs() {
        let plane = ModeObject::new(ObjectClass::Plane, PLANE);
        let card = VirtualCard::builder().reject_property(plane, "CRTC_W").build();
        let (catalog, fb) = setup(&card);

        let err = modeset(&card, &catalog, fb).unwrap().commit().err().unwrap();
        let crtc_w = card.property_id(plane, "CRTC_W");
        assert!(matches!(
            err,
            KmsError::CommitRejected { object: Some(o), property, .. } if o == plane && property == crtc_w
        ));
        assert_eq!(card.property_value(plane, "FB_ID"), None);
        assert_eq!(card.property_value(plane, "SRC_X"), None);
        assert_eq!(card.live_blobs(), 0);
    }

    #[test]
    fn missing_property_fails_before_commit() {
        let crtc = ModeObject::new(ObjectClass::Crtc, CRTC);
        let card = VirtualCard::builder().omit_property(crtc, "ACTIVE").build();
        let (catalog, fb) = setup(&card);

        let err = modeset(&card, &catalog, fb).err().unwrap();
        assert!(matches!(err, KmsError::PropertyNotFound { ref name, .. } if name == "ACTIVE"));
        assert_eq!(card.calls().atomic_commit, 0);
        assert_eq!(card.calls().create_blob, 0);
        assert_eq!(card.live_blobs(), 0);
    }

    #[test]
    fn modeset_without_flag_is_rejected() {
        let card = VirtualCard::new();
        let (catalog, _) = setup(&card);
        let mut tx = TransactionBuilder::new(&card, &catalog);
        tx.activate_crtc(CRTC, &DisplayMode::with_size(1920, 1080))
            .unwrap();
        assert!(tx.commit().is_err());
    }

    #[test]
    fn test_only_leaves_state_alone() {
        let card = VirtualCard::new();
        let (catalog, fb) = setup(&card);
        let tx = modeset(&card, &catalog, fb).unwrap();
        assert_eq!(tx.transaction().writes.len(), 13);
        assert_eq!(tx.transaction().flags, CommitFlags::ALLOW_MODESET);
        tx.test().unwrap();
        let plane = ModeObject::new(ObjectClass::Plane, PLANE);
        assert_eq!(card.property_value(plane, "FB_ID"), None);

        tx.commit().unwrap();
        assert_eq!(card.property_value(plane, "FB_ID"), Some(fb as u64));
    }

    #[test]
    fn legacy_set_crtc_and_flip() {
        let card = VirtualCard::new();
        let (_, fb) = setup(&card);
        let graph = ResourceGraph::discover(&card).unwrap();
        let selection = select(&graph, PlaneRequirement::Skip).unwrap();

        let legacy = LegacyModeset::new(&card);
        legacy.set_crtc(&selection, fb).unwrap();
        assert_eq!(card.scanout(CRTC), Some(fb));

        legacy.page_flip(CRTC, fb, true).unwrap();
        assert!(matches!(
            legacy.page_flip(CRTC, fb, true),
            Err(KmsError::FlipPending { crtc: CRTC })
        ));
        assert!(matches!(
            legacy.page_flip(CRTC, 4242, false),
            Err(KmsError::CommitRejected { object: Some(_), property: None, .. })
        ));
    }
}

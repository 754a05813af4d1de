use std::io;

use drm_fourcc::DrmFourcc;

use crate::device::{DriverCapability, KmsDevice, PlaneLayout};
use crate::error::{KmsError, KmsResult};

/// A dumb buffer with its CPU mapping and, once registered, its
/// framebuffer id. Hand it back to [`FramebufferAllocator::destroy`].
pub struct Framebuffer<M> {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    pub bpp: u32,
    pub pitch: u32,
    pub size: u64,
    mapping: M,
    id: Option<u32>,
}

impl<M> Framebuffer<M> {
    /// Framebuffer object id, if [`FramebufferAllocator::register`] succeeded.
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn mapping(&self) -> &M {
        &self.mapping
    }

    pub fn mapping_mut(&mut self) -> &mut M {
        &mut self.mapping
    }
}

impl<M> std::fmt::Debug for Framebuffer<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("handle", &self.handle)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bpp", &self.bpp)
            .field("pitch", &self.pitch)
            .field("size", &self.size)
            .field("id", &self.id)
            .finish()
    }
}

/// Allocates CPU-mappable dumb buffers on a device that supports them.
///
/// Holding one means the capability check already passed; copies share that
/// result instead of asking the driver again.
pub struct FramebufferAllocator<'d, D: KmsDevice> {
    device: &'d D,
}

impl<D: KmsDevice> Clone for FramebufferAllocator<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: KmsDevice> Copy for FramebufferAllocator<'_, D> {}

impl<'d, D: KmsDevice> FramebufferAllocator<'d, D> {
    /// Checks the dumb buffer capability; without it nothing is ever
    /// allocated.
    pub fn new(device: &'d D) -> KmsResult<Self> {
        match device.driver_capability(DriverCapability::DumbBuffer) {
            Ok(true) => Ok(Self { device }),
            Ok(false) => Err(KmsError::DeviceCapability {
                capability: "dumb buffers",
                source: None,
            }),
            Err(e) => Err(KmsError::DeviceCapability {
                capability: "dumb buffers",
                source: Some(e),
            }),
        }
    }

    pub fn allocate(&self, width: u32, height: u32, bpp: u32) -> KmsResult<Framebuffer<D::Mapping>> {
        let fail = |reason: &str, source: Option<io::Error>| KmsError::BufferAllocation {
            width,
            height,
            bpp,
            reason: reason.to_string(),
            source,
        };

        if width == 0 || height == 0 || bpp == 0 || bpp % 8 != 0 {
            return Err(fail("invalid dimensions", None));
        }

        let dumb = self
            .device
            .create_dumb_buffer(width, height, bpp)
            .map_err(|e| fail("create dumb buffer", Some(e)))?;

        let min_pitch = width as u64 * (bpp / 8) as u64;
        let min_size = dumb.pitch as u64 * height as u64;
        if (dumb.pitch as u64) < min_pitch || dumb.size < min_size {
            self.release_dumb(dumb.handle);
            return Err(fail(
                &format!(
                    "driver returned pitch {} size {} (need pitch >= {}, size >= {})",
                    dumb.pitch,
                    dumb.size,
                    min_pitch,
                    min_size
                ),
                None,
            ));
        }

        let mapping = self
            .device
            .map_dumb_buffer(dumb.handle)
            .and_then(|offset| {
                let len = usize::try_from(dumb.size)
                    .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
                self.device.map_memory(offset, len)
            });
        let mapping = match mapping {
            Ok(mapping) => mapping,
            Err(e) => {
                self.release_dumb(dumb.handle);
                return Err(fail("map dumb buffer", Some(e)));
            }
        };

        log::debug!(
            "Allocated {}x{}@{} dumb buffer {} (pitch {}, size {})",
            width,
            height,
            bpp,
            dumb.handle,
            dumb.pitch,
            dumb.size
        );

        Ok(Framebuffer {
            handle: dumb.handle,
            width,
            height,
            bpp,
            pitch: dumb.pitch,
            size: dumb.size,
            mapping,
            id: None,
        })
    }

    /// Registers the buffer as a single-plane framebuffer object.
    pub fn register(&self, fb: &mut Framebuffer<D::Mapping>, format: DrmFourcc) -> KmsResult<u32> {
        if let Some(id) = fb.id {
            return Ok(id);
        }
        let layout = PlaneLayout::single(fb.handle, fb.pitch, 0);
        let id = self
            .device
            .add_framebuffer(fb.width, fb.height, format, &layout)
            .map_err(|source| KmsError::InvalidFormat {
                format: format.to_string(),
                pitch: fb.pitch,
                source,
            })?;
        log::debug!("Registered framebuffer {} for dumb buffer {}", id, fb.handle);
        fb.id = Some(id);
        Ok(id)
    }

    /// Unmaps, removes the framebuffer object and frees the dumb buffer.
    /// Teardown keeps going past individual failures.
    pub fn destroy(&self, fb: Framebuffer<D::Mapping>) {
        let Framebuffer {
            handle, mapping, id, ..
        } = fb;
        drop(mapping);
        if let Some(id) = id {
            if let Err(e) = self.device.remove_framebuffer(id) {
                log::warn!("Failed to remove framebuffer {}: {}", id, e);
            }
        }
        self.release_dumb(handle);
    }

    fn release_dumb(&self, handle: u32) {
        if let Err(e) = self.device.destroy_dumb_buffer(handle) {
            log::warn!("Failed to destroy dumb buffer {}: {}", handle, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virt::VirtualCard;

    #[test]
    fn full_hd_buffer_is_large_enough() {
        let card = VirtualCard::new();
        let alloc = FramebufferAllocator::new(&card).unwrap();
        let fb = alloc.allocate(1920, 1080, 32).unwrap();
        assert!(fb.pitch >= 7680);
        assert!(fb.size >= fb.pitch as u64 * 1080);
        assert_eq!(fb.mapping().len() as u64, fb.size);
        alloc.destroy(fb);
        assert_eq!(card.live_dumb_buffers(), 0);
    }

    #[test]
    fn no_capability_means_no_allocation() {
        let card = VirtualCard::builder().dumb_buffers(false).build();
        let err = FramebufferAllocator::new(&card).err().unwrap();
        assert!(matches!(err, KmsError::DeviceCapability { capability: "dumb buffers", .. }));
        assert_eq!(card.calls().create_dumb, 0);
    }

    #[test]
    fn short_pitch_is_rejected_and_released() {
        let card = VirtualCard::builder().pitch_shortfall(4).build();
        let alloc = FramebufferAllocator::new(&card).unwrap();
        let err = alloc.allocate(640, 480, 32).unwrap_err();
        assert!(matches!(err, KmsError::BufferAllocation { width: 640, .. }));
        assert_eq!(card.live_dumb_buffers(), 0);
    }

    #[test]
    fn register_then_destroy() {
        let card = VirtualCard::new();
        let alloc = FramebufferAllocator::new(&card).unwrap();
        let mut fb = alloc.allocate(64, 32, 32).unwrap();
        assert_eq!(fb.id(), None);
        let id = alloc.register(&mut fb, DrmFourcc::Xrgb8888).unwrap();
        assert_eq!(fb.id(), Some(id));
        assert_eq!(alloc.register(&mut fb, DrmFourcc::Xrgb8888).unwrap(), id);
        assert_eq!(card.live_framebuffers(), 1);
        alloc.destroy(fb);
        assert_eq!(card.live_framebuffers(), 0);
        assert_eq!(card.live_dumb_buffers(), 0);
    }

    #[test]
    fn unsupported_format_is_invalid_format() {
        let card = VirtualCard::new();
        let alloc = FramebufferAllocator::new(&card).unwrap();
        let mut fb = alloc.allocate(64, 32, 32).unwrap();
        let err = alloc.register(&mut fb, DrmFourcc::Nv12).unwrap_err();
        assert!(matches!(err, KmsError::InvalidFormat { pitch, .. } if pitch == fb.pitch));
        alloc.destroy(fb);
    }

    #[test]
    fn only_formats_the_driver_lists_register() {
        let card = VirtualCard::builder().formats(vec![DrmFourcc::Rgb565]).build();
        let alloc = FramebufferAllocator::new(&card).unwrap();
        let mut fb = alloc.allocate(64, 32, 16).unwrap();
        assert!(matches!(
            alloc.register(&mut fb, DrmFourcc::Xrgb8888),
            Err(KmsError::InvalidFormat { .. })
        ));
        assert_eq!(fb.id(), None);
        assert!(alloc.register(&mut fb, DrmFourcc::Rgb565).is_ok());
        alloc.destroy(fb);
    }

    #[test]
    fn zero_sized_request_fails_before_the_driver() {
        let card = VirtualCard::new();
        let alloc = FramebufferAllocator::new(&card).unwrap();
        assert!(alloc.allocate(0, 1080, 32).is_err());
        assert!(alloc.allocate(64, 64, 12).is_err());
        assert_eq!(card.calls().create_dumb, 0);
    }
}

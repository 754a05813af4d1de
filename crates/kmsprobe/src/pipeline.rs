//! The three display programs and the probe report, built from the pieces in
//! the other modules.

use std::fmt;
use std::time::Duration;

use drm_fourcc::DrmFourcc;
use serde::Serialize;

use crate::commit::{CommittedState, LegacyModeset, TransactionBuilder};
use crate::device::{ClientCapability, KmsDevice};
use crate::error::{KmsError, KmsResult};
use crate::flip::{FlipCycle, FlipStats, PendingFlipPolicy};
use crate::framebuffer::{Framebuffer, FramebufferAllocator};
use crate::graph::ResourceGraph;
use crate::pattern::{Pattern, Surface};
use crate::props::PropertyCatalog;
use crate::select::{select, PipelineSelection, PlaneRequirement};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipOptions {
    pub cycles: usize,
    pub interval: Duration,
    pub pending: PendingFlipPolicy,
    pub timeout: Duration,
}

impl Default for FlipOptions {
    fn default() -> Self {
        Self {
            cycles: 10,
            interval: Duration::from_secs(1),
            pending: PendingFlipPolicy::Wait,
            timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub bpp: u32,
    pub format: DrmFourcc,
    pub primary: Pattern,
    pub secondary: Pattern,
    pub plain_color: u32,
    pub flip: FlipOptions,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            bpp: 32,
            format: DrmFourcc::Xrgb8888,
            primary: Pattern::Tiles,
            secondary: Pattern::Plain,
            plain_color: 0xFF77_7777,
            flip: FlipOptions::default(),
        }
    }
}

/// The device plus the graph and property catalog read from it once, and
/// the allocator when the device has dumb buffers.
pub struct Session<'d, D: KmsDevice> {
    device: &'d D,
    allocator: Option<FramebufferAllocator<'d, D>>,
    graph: ResourceGraph,
    catalog: PropertyCatalog,
}

impl<'d, D: KmsDevice> Session<'d, D> {
    /// Prepares a device for mode-setting. Dumb buffer support is checked
    /// before anything else; atomic mode-setting is enabled when asked for.
    pub fn open(device: &'d D, atomic: bool) -> KmsResult<Self> {
        let allocator = FramebufferAllocator::new(device)?;
        if atomic {
            device
                .set_client_capability(ClientCapability::Atomic, true)
                .map_err(|e| KmsError::DeviceCapability {
                    capability: "atomic mode-setting",
                    source: Some(e),
                })?;
            log::debug!("Atomic mode-setting enabled");
        }
        Self::discover(device, Some(allocator))
    }

    /// Read-only session for inspection. Asks for every plane but does not
    /// require any capability; without dumb buffers the programs fail with
    /// [`KmsError::DeviceCapability`].
    pub fn inspect(device: &'d D) -> KmsResult<Self> {
        let allocator = match FramebufferAllocator::new(device) {
            Ok(allocator) => Some(allocator),
            Err(e) => {
                log::warn!("{}", e);
                None
            }
        };
        if let Err(e) = device.set_client_capability(ClientCapability::Atomic, true) {
            log::warn!("Atomic mode-setting unavailable ({}), listing legacy view", e);
            if let Err(e) = device.set_client_capability(ClientCapability::UniversalPlanes, true) {
                log::warn!("Universal planes unavailable: {}", e);
            }
        }
        Self::discover(device, allocator)
    }

    fn discover(device: &'d D, allocator: Option<FramebufferAllocator<'d, D>>) -> KmsResult<Self> {
        let graph = ResourceGraph::discover(device)?;
        let catalog = PropertyCatalog::discover(device, &graph);
        Ok(Self {
            device,
            allocator,
            graph,
            catalog,
        })
    }

    pub fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    pub fn catalog(&self) -> &PropertyCatalog {
        &self.catalog
    }

    fn scanout(&self, selection: PipelineSelection) -> KmsResult<Scanout<'d, D>> {
        let allocator = self.allocator.ok_or_else(|| KmsError::DeviceCapability {
            capability: "dumb buffers",
            source: None,
        })?;
        Ok(Scanout::new(allocator, selection))
    }

    /// Atomic mode-set of one buffer on the first usable plane.
    pub fn run_atomic(&self, options: &PipelineOptions) -> KmsResult<Scanout<'_, D>> {
        let selection = select(&self.graph, PlaneRequirement::Required)?;
        let plane = selection
            .plane
            .ok_or(KmsError::InvalidSnapshot("selected chain has no plane".to_string()))?;
        let mut scanout = self.scanout(selection)?;
        let fb = scanout.add_framebuffer(options, options.primary)?;

        let size = scanout.selection.size();
        let crtc = scanout.selection.crtc.id;
        let mut tx = TransactionBuilder::new(self.device, &self.catalog);
        tx.bind_plane(plane.id, crtc, fb, size)?
            .activate_crtc(crtc, &scanout.selection.mode)?
            .route_connector(scanout.selection.connector.id, crtc)?
            .allow_modeset();
        tx.test()?;
        scanout.committed = Some(tx.commit()?);
        Ok(scanout)
    }

    /// Legacy single-shot mode-set of one buffer.
    pub fn run_setcrtc(&self, options: &PipelineOptions) -> KmsResult<Scanout<'_, D>> {
        let selection = select(&self.graph, PlaneRequirement::Skip)?;
        let mut scanout = self.scanout(selection)?;
        let fb = scanout.add_framebuffer(options, options.primary)?;
        LegacyModeset::new(self.device).set_crtc(&scanout.selection, fb)?;
        Ok(scanout)
    }

    /// Legacy mode-set of the primary buffer, then page flips between it and
    /// the secondary one.
    pub fn run_pageflip(&self, options: &PipelineOptions) -> KmsResult<Scanout<'_, D>> {
        let mut scanout = self.run_setcrtc(options)?;
        let first = scanout
            .framebuffers
            .first()
            .and_then(Framebuffer::id)
            .ok_or(KmsError::InvalidSnapshot("primary framebuffer missing".to_string()))?;
        let second = scanout.add_framebuffer(options, options.secondary)?;

        let flip = options.flip;
        let mut cycle = FlipCycle::new(
            self.device,
            scanout.selection.crtc.id,
            [second, first],
            flip.pending,
            flip.timeout,
        );
        scanout.flips = Some(cycle.run(flip.cycles, flip.interval)?);
        Ok(scanout)
    }

    pub fn probe(&self) -> ProbeReport<'_> {
        let selection = select(&self.graph, PlaneRequirement::Required)
            .or_else(|_| select(&self.graph, PlaneRequirement::Skip));
        let (selection, selection_error) = match selection {
            Ok(selection) => (Some(selection), None),
            Err(e) => (None, Some(e.to_string())),
        };
        ProbeReport {
            graph: &self.graph,
            selection,
            selection_error,
            properties: &self.catalog,
        }
    }
}

/// Framebuffers on screen and the state that keeps them there. Dropping it
/// frees the buffers and the committed blobs.
pub struct Scanout<'d, D: KmsDevice> {
    allocator: FramebufferAllocator<'d, D>,
    framebuffers: Vec<Framebuffer<D::Mapping>>,
    committed: Option<CommittedState<'d, D>>,
    pub selection: PipelineSelection,
    pub flips: Option<FlipStats>,
}

impl<'d, D: KmsDevice> Scanout<'d, D> {
    fn new(allocator: FramebufferAllocator<'d, D>, selection: PipelineSelection) -> Self {
        Self {
            allocator,
            framebuffers: Vec::new(),
            committed: None,
            selection,
            flips: None,
        }
    }

    /// Allocates a buffer of the selected mode's size, paints it and
    /// registers it.
    fn add_framebuffer(&mut self, options: &PipelineOptions, pattern: Pattern) -> KmsResult<u32> {
        let (width, height) = self.selection.size();
        let mut fb = self.allocator.allocate(width, height, options.bpp)?;
        let surface = Surface {
            width: fb.width,
            height: fb.height,
            bpp: fb.bpp,
            pitch: fb.pitch,
        };
        pattern.fill(&mut fb.mapping_mut()[..], surface, options.plain_color);

        let registered = self.allocator.register(&mut fb, options.format);
        self.framebuffers.push(fb);
        registered
    }

    pub fn framebuffer_ids(&self) -> Vec<u32> {
        self.framebuffers.iter().filter_map(Framebuffer::id).collect()
    }

    pub fn is_atomic(&self) -> bool {
        self.committed.is_some()
    }
}

impl<D: KmsDevice> Drop for Scanout<'_, D> {
    fn drop(&mut self) {
        for fb in self.framebuffers.drain(..) {
            self.allocator.destroy(fb);
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeReport<'a> {
    pub graph: &'a ResourceGraph,
    pub selection: Option<PipelineSelection>,
    pub selection_error: Option<String>,
    pub properties: &'a PropertyCatalog,
}

impl fmt::Display for ProbeReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Connectors:")?;
        for c in &self.graph.connectors {
            let modes: Vec<String> = c.modes.iter().map(|m| m.to_string()).collect();
            writeln!(
                f,
                "  {} {} ({:?}) encoders {:?} modes [{}]",
                c.id,
                c.name,
                c.state,
                c.encoder_ids,
                modes.join(", ")
            )?;
        }
        writeln!(f, "Encoders:")?;
        for e in &self.graph.encoders {
            writeln!(f, "  {} possible_crtcs {:#b}", e.id, e.possible_crtcs)?;
        }
        writeln!(f, "CRTCs:")?;
        for (i, c) in self.graph.crtcs.iter().enumerate() {
            writeln!(f, "  [{}] {}", i, c.id)?;
        }
        writeln!(f, "Planes:")?;
        for p in &self.graph.planes {
            writeln!(f, "  {} possible_crtcs {:#b}", p.id, p.possible_crtcs)?;
        }

        writeln!(f, "Properties:")?;
        for (object, properties) in self.properties.objects() {
            writeln!(f, "  {}:", object)?;
            for p in properties {
                let ro = if p.immutable { " (immutable)" } else { "" };
                writeln!(f, "    {:>4} {}{}", p.id, p.name, ro)?;
            }
        }

        match (&self.selection, &self.selection_error) {
            (Some(s), _) => write!(
                f,
                "Selected: connector {} -> encoder {} -> crtc {} (index {}){} @ {}",
                s.connector.id,
                s.encoder.id,
                s.crtc.id,
                s.crtc_index,
                s.plane.map(|p| format!(" -> plane {}", p.id)).unwrap_or_default(),
                s.mode
            ),
            (None, Some(e)) => write!(f, "No usable pipeline: {}", e),
            (None, None) => Ok(()),
        }
    }
}

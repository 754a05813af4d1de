use serde::Serialize;

use crate::error::PathError;
use crate::graph::{Connector, Crtc, Encoder, Plane, ResourceGraph};
use crate::mode::DisplayMode;

/// Whether the chain must end in a plane. Only the atomic path scans out
/// through an explicit plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneRequirement {
    Required,
    Skip,
}

/// One compatible (connector, encoder, crtc[, plane]) chain and the mode to
/// drive it with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSelection {
    pub connector: Connector,
    pub encoder: Encoder,
    pub crtc: Crtc,
    /// Position of `crtc` in the snapshot, derived from the encoder mask.
    pub crtc_index: usize,
    pub plane: Option<Plane>,
    pub mode: DisplayMode,
}

impl PipelineSelection {
    pub fn size(&self) -> (u32, u32) {
        self.mode.size()
    }
}

/// First-fit walk over the graph: first connector with modes, its first
/// encoder, the lowest CRTC that encoder can drive, and optionally the
/// first plane that can scan out on that CRTC.
pub fn select(
    graph: &ResourceGraph,
    planes: PlaneRequirement,
) -> Result<PipelineSelection, PathError> {
    let connector = graph
        .connectors
        .iter()
        .find(|c| !c.modes.is_empty())
        .ok_or(PathError::NoConnector)?;

    let encoder_id = *connector.encoder_ids.first().ok_or(PathError::NoEncoder {
        connector: connector.id,
    })?;
    let encoder = *graph
        .encoder(encoder_id)
        .ok_or(PathError::UnknownEncoder {
            connector: connector.id,
            encoder: encoder_id,
        })?;

    let (crtc_index, crtc) = crtc_for_encoder(graph, &encoder)?;

    let plane = match planes {
        PlaneRequirement::Required => Some(plane_for_crtc(graph, crtc)?),
        PlaneRequirement::Skip => None,
    };

    // Index 0 is the driver's preferred mode.
    let mode = connector.modes[0].clone();

    log::info!(
        "Selected connector {} ({}), encoder {}, crtc {} (index {}){}, mode {}",
        connector.id,
        connector.name,
        encoder.id,
        crtc.id,
        crtc_index,
        plane
            .map(|p| format!(", plane {}", p.id))
            .unwrap_or_default(),
        mode
    );

    Ok(PipelineSelection {
        connector: connector.clone(),
        encoder,
        crtc,
        crtc_index,
        plane,
        mode,
    })
}

fn crtc_for_encoder(graph: &ResourceGraph, encoder: &Encoder) -> Result<(usize, Crtc), PathError> {
    let no_crtc = PathError::NoCrtc {
        encoder: encoder.id,
        possible_crtcs: encoder.possible_crtcs,
    };
    if encoder.possible_crtcs == 0 {
        return Err(no_crtc);
    }
    let index = encoder.possible_crtcs.trailing_zeros() as usize;
    let crtc = *graph.crtcs.get(index).ok_or(no_crtc)?;
    Ok((index, crtc))
}

/// Plane masks are matched against the CRTC's position looked up by id,
/// not the bit that picked it from the encoder mask.
fn plane_for_crtc(graph: &ResourceGraph, crtc: Crtc) -> Result<Plane, PathError> {
    let index = graph
        .crtc_index(crtc.id)
        .ok_or(PathError::NoPlane { crtc: crtc.id, index: usize::MAX })?;
    let bit = 1u32.checked_shl(index as u32).unwrap_or(0);

    graph
        .planes
        .iter()
        .find(|p| p.possible_crtcs & bit != 0)
        .copied()
        .ok_or(PathError::NoPlane {
            crtc: crtc.id,
            index,
        })
}

use std::collections::HashSet;

use serde::Serialize;

use crate::device::{ConnectionState, KmsDevice, ObjectClass, RawResources};
use crate::error::{KmsError, KmsResult};
use crate::mode::DisplayMode;

/// `possible_crtcs` masks are 32 bits wide, so a snapshot can address at most
/// this many CRTCs.
pub const MAX_CRTCS: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connector {
    pub id: u32,
    pub name: String,
    pub state: ConnectionState,
    pub modes: Vec<DisplayMode>,
    pub encoder_ids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Encoder {
    pub id: u32,
    /// Bit k set means the encoder can be driven by `crtcs[k]`.
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Crtc {
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Plane {
    pub id: u32,
    /// Same bit semantics as [`Encoder::possible_crtcs`].
    pub possible_crtcs: u32,
}

/// One consistent snapshot of the device's mode objects.
///
/// Bit positions in the `possible_crtcs` masks index `crtcs` of this very
/// snapshot; they mean nothing against a graph fetched later.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceGraph {
    pub connectors: Vec<Connector>,
    pub encoders: Vec<Encoder>,
    pub crtcs: Vec<Crtc>,
    pub planes: Vec<Plane>,
}

impl ResourceGraph {
    pub fn discover<D: KmsDevice>(device: &D) -> KmsResult<Self> {
        let raw = device
            .resources()
            .map_err(|e| KmsError::discovery("enumerating mode resources", e))?;
        let graph = Self::from_raw(raw)?;

        log::info!(
            "Discovered {} connectors, {} encoders, {} crtcs, {} planes",
            graph.connectors.len(),
            graph.encoders.len(),
            graph.crtcs.len(),
            graph.planes.len()
        );
        for connector in &graph.connectors {
            log::debug!(
                "connector {} ({}, {:?}): {} modes, encoders {:?}",
                connector.id,
                connector.name,
                connector.state,
                connector.modes.len(),
                connector.encoder_ids
            );
        }

        Ok(graph)
    }

    /// Validates a raw driver reply and turns it into a graph.
    pub fn from_raw(raw: RawResources) -> KmsResult<Self> {
        if raw.crtcs.len() > MAX_CRTCS {
            return Err(KmsError::InvalidSnapshot(format!(
                "{} crtcs exceed the {} addressable by possible_crtcs",
                raw.crtcs.len(),
                MAX_CRTCS
            )));
        }

        check_ids(ObjectClass::Connector, raw.connectors.iter().map(|c| c.id))?;
        check_ids(ObjectClass::Encoder, raw.encoders.iter().map(|e| e.id))?;
        check_ids(ObjectClass::Crtc, raw.crtcs.iter().copied())?;
        check_ids(ObjectClass::Plane, raw.planes.iter().map(|p| p.id))?;

        let valid_bits = valid_crtc_bits(raw.crtcs.len());
        let trim = |class: ObjectClass, id: u32, mask: u32| {
            if mask & !valid_bits != 0 {
                log::warn!(
                    "{} {} claims crtcs beyond the snapshot (mask {:#x}, {} crtcs), ignoring extra bits",
                    class,
                    id,
                    mask,
                    raw.crtcs.len()
                );
            }
            mask & valid_bits
        };

        let mut connectors = Vec::with_capacity(raw.connectors.len());
        for c in raw.connectors {
            if c.encoder_ids.contains(&0) {
                return Err(KmsError::InvalidSnapshot(format!(
                    "connector {} lists encoder id 0",
                    c.id
                )));
            }
            connectors.push(Connector {
                id: c.id,
                name: c.name,
                state: c.state,
                modes: c.modes,
                encoder_ids: c.encoder_ids,
            });
        }

        let encoders = raw
            .encoders
            .iter()
            .map(|e| Encoder {
                id: e.id,
                possible_crtcs: trim(ObjectClass::Encoder, e.id, e.possible_crtcs),
            })
            .collect();
        let planes = raw
            .planes
            .iter()
            .map(|p| Plane {
                id: p.id,
                possible_crtcs: trim(ObjectClass::Plane, p.id, p.possible_crtcs),
            })
            .collect();
        let crtcs = raw.crtcs.iter().map(|&id| Crtc { id }).collect();

        Ok(Self {
            connectors,
            encoders,
            crtcs,
            planes,
        })
    }

    pub fn connector(&self, id: u32) -> Option<&Connector> {
        self.connectors.iter().find(|c| c.id == id)
    }

    pub fn encoder(&self, id: u32) -> Option<&Encoder> {
        self.encoders.iter().find(|e| e.id == id)
    }

    /// Position of a CRTC in this snapshot's `crtcs`, found by id.
    pub fn crtc_index(&self, id: u32) -> Option<usize> {
        self.crtcs.iter().position(|c| c.id == id)
    }

    pub fn object_ids(&self, class: ObjectClass) -> Vec<u32> {
        match class {
            ObjectClass::Crtc => self.crtcs.iter().map(|c| c.id).collect(),
            ObjectClass::Encoder => self.encoders.iter().map(|e| e.id).collect(),
            ObjectClass::Connector => self.connectors.iter().map(|c| c.id).collect(),
            ObjectClass::Plane => self.planes.iter().map(|p| p.id).collect(),
        }
    }
}

fn valid_crtc_bits(count: usize) -> u32 {
    if count >= MAX_CRTCS {
        u32::MAX
    } else {
        (1u32 << count) - 1
    }
}

fn check_ids(class: ObjectClass, ids: impl Iterator<Item = u32>) -> KmsResult<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id == 0 {
            return Err(KmsError::InvalidSnapshot(format!("{} with id 0", class)));
        }
        if !seen.insert(id) {
            return Err(KmsError::InvalidSnapshot(format!("duplicate {} id {}", class, id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{RawConnector, RawEncoder, RawPlane};

    fn raw() -> RawResources {
        RawResources {
            connectors: vec![RawConnector {
                id: 1,
                name: "HDMI-A-1".into(),
                state: ConnectionState::Connected,
                modes: vec![DisplayMode::with_size(1920, 1080)],
                encoder_ids: vec![10],
            }],
            encoders: vec![RawEncoder {
                id: 10,
                possible_crtcs: 0b11,
            }],
            crtcs: vec![100, 101],
            planes: vec![RawPlane {
                id: 5,
                possible_crtcs: 0b10,
            }],
        }
    }

    #[test]
    fn builds_graph_from_valid_reply() {
        let graph = ResourceGraph::from_raw(raw()).unwrap();
        assert_eq!(graph.crtcs, vec![Crtc { id: 100 }, Crtc { id: 101 }]);
        assert_eq!(graph.crtc_index(101), Some(1));
        assert_eq!(graph.crtc_index(7), None);
        assert_eq!(graph.encoder(10).unwrap().possible_crtcs, 0b11);
        assert_eq!(graph.object_ids(ObjectClass::Plane), vec![5]);
    }

    #[test]
    fn trims_mask_bits_beyond_snapshot() {
        let mut raw = raw();
        raw.encoders[0].possible_crtcs = 0b1110;
        raw.planes[0].possible_crtcs = 0x8000_0000;
        let graph = ResourceGraph::from_raw(raw).unwrap();
        assert_eq!(graph.encoders[0].possible_crtcs, 0b10);
        assert_eq!(graph.planes[0].possible_crtcs, 0);
    }

    #[test]
    fn rejects_zero_and_duplicate_ids() {
        let mut zero = raw();
        zero.crtcs.push(0);
        assert!(matches!(
            ResourceGraph::from_raw(zero),
            Err(KmsError::InvalidSnapshot(_))
        ));

        let mut dup = raw();
        dup.planes.push(RawPlane {
            id: 5,
            possible_crtcs: 1,
        });
        assert!(matches!(
            ResourceGraph::from_raw(dup),
            Err(KmsError::InvalidSnapshot(msg)) if msg == "duplicate plane id 5"
        ));

        let mut bad_encoder = raw();
        bad_encoder.connectors[0].encoder_ids = vec![0];
        assert!(ResourceGraph::from_raw(bad_encoder).is_err());
    }

    #[test]
    fn rejects_more_crtcs_than_mask_bits() {
        let mut raw = raw();
        raw.crtcs = (1..=33).collect();
        assert!(matches!(
            ResourceGraph::from_raw(raw),
            Err(KmsError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn full_width_masks_are_kept() {
        let mut raw = raw();
        raw.crtcs = (100..132).collect();
        raw.encoders[0].possible_crtcs = u32::MAX;
        let graph = ResourceGraph::from_raw(raw).unwrap();
        assert_eq!(graph.encoders[0].possible_crtcs, u32::MAX);
    }
}

use std::collections::BTreeMap;

use serde::Serialize;

use crate::device::{KmsDevice, ModeObject, ObjectClass, PropertyDescriptor};
use crate::error::{KmsError, KmsResult};
use crate::graph::ResourceGraph;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct ObjectProperties {
    id: u32,
    properties: Vec<PropertyDescriptor>,
}

/// Property descriptors of every object in a [`ResourceGraph`], fetched once.
///
/// Property ids are whatever the driver assigned this time around, so callers
/// always go through [`PropertyCatalog::resolve`] instead of keeping ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PropertyCatalog {
    tables: BTreeMap<ObjectClass, Vec<ObjectProperties>>,
}

impl PropertyCatalog {
    pub fn discover<D: KmsDevice>(device: &D, graph: &ResourceGraph) -> Self {
        let mut catalog = Self::default();
        for class in ObjectClass::ALL {
            let ids = graph.object_ids(class);
            catalog.fetch_class(device, class, &ids);
        }
        catalog
    }

    fn fetch_class<D: KmsDevice>(&mut self, device: &D, class: ObjectClass, ids: &[u32]) {
        let mut table = Vec::with_capacity(ids.len());
        for &id in ids {
            let object = ModeObject::new(class, id);
            let properties = match device.object_properties(object) {
                Ok(properties) => sanitize(object, properties),
                Err(e) => {
                    log::warn!("No properties for {}: {}", object, e);
                    Vec::new()
                }
            };
            log::debug!("{}: {} properties", object, properties.len());
            table.push(ObjectProperties { id, properties });
        }
        self.tables.insert(class, table);
    }

    /// Builds a catalog from already known descriptor sets.
    pub fn from_tables(
        tables: impl IntoIterator<Item = (ModeObject, Vec<PropertyDescriptor>)>,
    ) -> Self {
        let mut catalog = Self::default();
        for (object, properties) in tables {
            catalog
                .tables
                .entry(object.class)
                .or_default()
                .push(ObjectProperties {
                    id: object.id,
                    properties: sanitize(object, properties),
                });
        }
        catalog
    }

    /// Properties of `object`; empty when the object is unknown or has none.
    pub fn properties(&self, object: ModeObject) -> &[PropertyDescriptor] {
        self.lookup(object)
            .map(|entry| entry.properties.as_slice())
            .unwrap_or(&[])
    }

    pub fn descriptor(
        &self,
        class: ObjectClass,
        object_id: u32,
        name: &str,
    ) -> KmsResult<&PropertyDescriptor> {
        self.lookup(ModeObject::new(class, object_id))
            .and_then(|entry| entry.properties.iter().find(|p| p.name == name))
            .ok_or_else(|| KmsError::PropertyNotFound {
                class,
                object_id,
                name: name.to_string(),
            })
    }

    /// Resolves a property name (case-sensitive) to the driver's id.
    pub fn resolve(&self, class: ObjectClass, object_id: u32, name: &str) -> KmsResult<u32> {
        self.descriptor(class, object_id, name).map(|p| p.id)
    }

    pub fn objects(&self) -> impl Iterator<Item = (ModeObject, &[PropertyDescriptor])> + '_ {
        self.tables.iter().flat_map(|(&class, table)| {
            table
                .iter()
                .map(move |entry| (ModeObject::new(class, entry.id), entry.properties.as_slice()))
        })
    }

    fn lookup(&self, object: ModeObject) -> Option<&ObjectProperties> {
        self.tables
            .get(&object.class)?
            .iter()
            .find(|entry| entry.id == object.id)
    }
}

/// Drops descriptors that could never be written safely: id 0, a class that
/// does not match the owner, or a repeated name.
fn sanitize(object: ModeObject, properties: Vec<PropertyDescriptor>) -> Vec<PropertyDescriptor> {
    let mut kept: Vec<PropertyDescriptor> = Vec::with_capacity(properties.len());
    for property in properties {
        if property.id == 0 {
            log::warn!("{}: ignoring property {:?} with id 0", object, property.name);
        } else if property.object_class != object.class {
            log::warn!(
                "{}: ignoring property {:?} reported for class {}",
                object,
                property.name,
                property.object_class
            );
        } else if kept.iter().any(|p| p.name == property.name) {
            log::warn!("{}: ignoring duplicate property {:?}", object, property.name);
        } else {
            kept.push(property);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PropertyKind;

    fn prop(class: ObjectClass, name: &str, id: u32) -> PropertyDescriptor {
        PropertyDescriptor {
            name: name.into(),
            id,
            object_class: class,
            kind: PropertyKind::Other,
            immutable: false,
        }
    }

    fn catalog() -> PropertyCatalog {
        PropertyCatalog::from_tables([
            (
                ModeObject::new(ObjectClass::Plane, 5),
                vec![
                    prop(ObjectClass::Plane, "SRC_X", 200),
                    prop(ObjectClass::Plane, "FB_ID", 207),
                ],
            ),
            (ModeObject::new(ObjectClass::Plane, 6), vec![]),
            (
                ModeObject::new(ObjectClass::Crtc, 5),
                vec![prop(ObjectClass::Crtc, "ACTIVE", 20)],
            ),
        ])
    }

    #[test]
    fn resolves_by_name() {
        let catalog = catalog();
        assert_eq!(catalog.resolve(ObjectClass::Plane, 5, "FB_ID").unwrap(), 207);
        assert_eq!(catalog.resolve(ObjectClass::Plane, 5, "SRC_X").unwrap(), 200);
    }

    #[test]
    fn missing_name_is_an_error() {
        let err = catalog().resolve(ObjectClass::Plane, 5, "ZPOS").unwrap_err();
        assert!(matches!(
            err,
            KmsError::PropertyNotFound { class: ObjectClass::Plane, object_id: 5, ref name } if name == "ZPOS"
        ));
    }

    #[test]
    fn names_are_case_sensitive() {
        assert!(catalog().resolve(ObjectClass::Plane, 5, "fb_id").is_err());
    }

    #[test]
    fn classes_do_not_share_ids() {
        let catalog = catalog();
        assert_eq!(catalog.resolve(ObjectClass::Crtc, 5, "ACTIVE").unwrap(), 20);
        assert!(catalog.resolve(ObjectClass::Crtc, 5, "FB_ID").is_err());
        assert!(catalog.resolve(ObjectClass::Connector, 5, "ACTIVE").is_err());
    }

    #[test]
    fn unknown_and_empty_objects() {
        let catalog = catalog();
        assert!(catalog.properties(ModeObject::new(ObjectClass::Plane, 6)).is_empty());
        assert!(catalog.resolve(ObjectClass::Plane, 6, "FB_ID").is_err());
        assert!(catalog.resolve(ObjectClass::Plane, 99, "FB_ID").is_err());
    }

    #[test]
    fn resolution_is_idempotent() {
        let catalog = catalog();
        let first = catalog.resolve(ObjectClass::Plane, 5, "FB_ID").unwrap();
        for _ in 0..4 {
            assert_eq!(catalog.resolve(ObjectClass::Plane, 5, "FB_ID").unwrap(), first);
        }
    }

    #[test]
    fn zero_ids_and_duplicates_are_dropped() {
        let catalog = PropertyCatalog::from_tables([(
            ModeObject::new(ObjectClass::Plane, 1),
            vec![
                prop(ObjectClass::Plane, "FB_ID", 0),
                prop(ObjectClass::Plane, "CRTC_ID", 30),
                prop(ObjectClass::Plane, "CRTC_ID", 31),
                prop(ObjectClass::Crtc, "ACTIVE", 32),
            ],
        )]);
        assert!(catalog.resolve(ObjectClass::Plane, 1, "FB_ID").is_err());
        assert_eq!(catalog.resolve(ObjectClass::Plane, 1, "CRTC_ID").unwrap(), 30);
        assert!(catalog.resolve(ObjectClass::Plane, 1, "ACTIVE").is_err());
    }
}

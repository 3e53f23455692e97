//! The entity/relationship model registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};

use super::entity::EntityType;
use super::navigation::{Navigation, NavigationKind};
use super::property::Property;

/// A read-only registry of entity types.
///
/// The model is supplied by the caller fully resolved; this type only offers lookup
/// plus the consistency checks the compiler relies on.
#[derive(Debug, Clone, Default)]
pub struct Model {
    /// Model version, bumped by the owner whenever metadata changes.
    pub version: u64,
    entity_types: BTreeMap<String, Arc<EntityType>>,
}

impl Model {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the model version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Add an entity type.
    pub fn with_entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_types
            .insert(entity_type.name.clone(), Arc::new(entity_type));
        self
    }

    /// Get an entity type by name.
    pub fn entity_type(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.entity_types.get(name)
    }

    /// Get an entity type by name or fail.
    pub fn require_entity_type(&self, name: &str) -> Result<&Arc<EntityType>> {
        self.entity_type(name)
            .ok_or_else(|| Error::UnknownEntityType(name.to_string()))
    }

    /// Get a property or fail.
    pub fn require_property(&self, entity: &str, property: &str) -> Result<&Property> {
        self.require_entity_type(entity)?
            .property(property)
            .ok_or_else(|| Error::UnknownProperty {
                entity: entity.to_string(),
                property: property.to_string(),
            })
    }

    /// Find a navigation declared on an entity type.
    pub fn find_navigation(&self, entity: &str, navigation: &str) -> Option<&Navigation> {
        self.entity_type(entity)?.navigation(navigation)
    }

    /// Get a navigation or fail.
    pub fn require_navigation(&self, entity: &str, navigation: &str) -> Result<&Navigation> {
        self.find_navigation(entity, navigation)
            .ok_or_else(|| Error::UnknownNavigation {
                entity: entity.to_string(),
                navigation: navigation.to_string(),
            })
    }

    /// Iterate over all entity types in name order.
    pub fn entity_types(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.entity_types.values()
    }

    /// Check that keys and navigations resolve.
    pub fn validate(&self) -> Result<()> {
        for entity in self.entity_types.values() {
            if entity.primary_key.is_empty() {
                return Err(Error::InvalidModel(format!(
                    "entity type {} has no primary key",
                    entity.name
                )));
            }
            for key in &entity.primary_key {
                self.require_property(&entity.name, key)?;
            }
            for navigation in &entity.navigations {
                let target = self.require_entity_type(&navigation.target)?;
                let (dependent, principal) = match navigation.kind {
                    NavigationKind::Reference => (entity.as_ref(), target.as_ref()),
                    NavigationKind::Collection => (target.as_ref(), entity.as_ref()),
                };
                let fk = &navigation.foreign_key;
                if fk.properties.len() != fk.principal_key.len() {
                    return Err(Error::InvalidModel(format!(
                        "navigation {}.{} has mismatched key arity",
                        entity.name, navigation.name
                    )));
                }
                for property in &fk.properties {
                    self.require_property(&dependent.name, property)?;
                }
                for property in &fk.principal_key {
                    self.require_property(&principal.name, property)?;
                }
            }
        }
        Ok(())
    }
}

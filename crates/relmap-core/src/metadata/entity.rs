//! Entity type definitions.

use serde::{Deserialize, Serialize};

use super::navigation::Navigation;
use super::property::Property;

/// An entity type mapped to a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    /// Entity type name (unique within the model).
    pub name: String,
    /// Table name.
    pub table: String,
    /// Table schema, if any.
    pub schema: Option<String>,
    /// Properties in column order.
    pub properties: Vec<Property>,
    /// Primary key property names.
    pub primary_key: Vec<String>,
    /// Navigation properties.
    pub navigations: Vec<Navigation>,
}

impl EntityType {
    /// Create a new entity type mapped to a table of the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            schema: None,
            properties: Vec::new(),
            primary_key: Vec::new(),
            navigations: Vec::new(),
        }
    }

    /// Set the table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Set the table schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a property.
    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Add a property and make it the (single) primary key.
    pub fn with_key(mut self, property: Property) -> Self {
        self.primary_key = vec![property.name.clone()];
        self.properties.push(property);
        self
    }

    /// Set a composite primary key over existing properties.
    pub fn with_composite_key(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.primary_key = names.into_iter().map(Into::into).collect();
        self
    }

    /// Add a navigation.
    pub fn with_navigation(mut self, navigation: Navigation) -> Self {
        self.navigations.push(navigation);
        self
    }

    /// Get a property by name.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Position of a property in column order.
    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Get a navigation by name.
    pub fn navigation(&self, name: &str) -> Option<&Navigation> {
        self.navigations.iter().find(|n| n.name == name)
    }

    /// Primary key properties in key order.
    pub fn key_properties(&self) -> impl Iterator<Item = &Property> {
        self.primary_key.iter().filter_map(|k| self.property(k))
    }

    /// Check if a property is part of the primary key.
    pub fn is_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|k| k == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ScalarType;

    #[test]
    fn test_entity_builder() {
        let duck = EntityType::new("Duck")
            .with_table("Ducks")
            .with_schema("dbo")
            .with_key(Property::new("Id", ScalarType::Int32).identity())
            .with_property(Property::new("Name", ScalarType::String))
            .with_property(Property::new("Quacks", ScalarType::Int32));

        assert_eq!(duck.table, "Ducks");
        assert_eq!(duck.primary_key, vec!["Id".to_string()]);
        assert_eq!(duck.property_index("Quacks"), Some(2));
        assert!(duck.is_key("Id"));
        assert!(!duck.is_key("Name"));
        assert_eq!(duck.key_properties().count(), 1);
    }
}

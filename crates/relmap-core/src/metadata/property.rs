//! Property definitions for entity types.

use serde::{Deserialize, Serialize};

use super::types::{PropertyType, ScalarType, ValueGenerated};

/// A mapped property of an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// Column name in the owning table.
    pub column: String,
    /// Data type.
    pub property_type: PropertyType,
    /// Whether the original value participates in update/delete conditions.
    pub concurrency_token: bool,
    /// Store value generation.
    pub value_generated: ValueGenerated,
    /// Whether the column is an identity column.
    pub identity: bool,
    /// Explicit store type (e.g. `rowversion`), overriding the dialect mapping.
    pub store_type: Option<String>,
}

impl Property {
    /// Create a new required property mapped to a column of the same name.
    pub fn new(name: impl Into<String>, scalar: ScalarType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            property_type: PropertyType::required(scalar),
            concurrency_token: false,
            value_generated: ValueGenerated::Never,
            identity: false,
            store_type: None,
        }
    }

    /// Create a nullable property.
    pub fn optional(name: impl Into<String>, scalar: ScalarType) -> Self {
        let mut property = Self::new(name, scalar);
        property.property_type.nullable = true;
        property
    }

    /// Map to a differently named column.
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Mark as an identity column (generated on add).
    pub fn identity(mut self) -> Self {
        self.identity = true;
        self.value_generated = ValueGenerated::OnAdd;
        self
    }

    /// Mark as a concurrency token.
    pub fn concurrency_token(mut self) -> Self {
        self.concurrency_token = true;
        self
    }

    /// Set value generation.
    pub fn with_value_generated(mut self, generated: ValueGenerated) -> Self {
        self.value_generated = generated;
        self
    }

    /// Set an explicit store type.
    pub fn with_store_type(mut self, store_type: impl Into<String>) -> Self {
        self.store_type = Some(store_type.into());
        self
    }

    /// Scalar type of the property.
    pub fn scalar(&self) -> ScalarType {
        self.property_type.scalar
    }

    /// Whether the property is nullable.
    pub fn is_nullable(&self) -> bool {
        self.property_type.nullable
    }

    /// Whether the store produces a value on insert.
    pub fn generated_on_add(&self) -> bool {
        self.value_generated != ValueGenerated::Never
    }

    /// Whether the store produces a value on update.
    pub fn generated_on_update(&self) -> bool {
        self.value_generated == ValueGenerated::OnAddOrUpdate
    }

    /// Whether this is a row-version style token (`rowversion`/`timestamp`).
    pub fn is_row_version(&self) -> bool {
        self.concurrency_token
            && self.store_type.as_deref().is_some_and(|t| {
                t.eq_ignore_ascii_case("rowversion") || t.eq_ignore_ascii_case("timestamp")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_builder() {
        let id = Property::new("Id", ScalarType::Int32).identity();
        assert!(id.identity);
        assert!(id.generated_on_add());
        assert!(!id.generated_on_update());

        let name = Property::optional("Name", ScalarType::String).with_column("DuckName");
        assert!(name.is_nullable());
        assert_eq!(name.column, "DuckName");
    }

    #[test]
    fn test_row_version() {
        let token = Property::new("ConcurrencyToken", ScalarType::Bytes)
            .concurrency_token()
            .with_store_type("rowversion")
            .with_value_generated(ValueGenerated::OnAddOrUpdate);
        assert!(token.is_row_version());
        assert!(!Property::new("Token", ScalarType::Bytes)
            .concurrency_token()
            .is_row_version());
    }
}

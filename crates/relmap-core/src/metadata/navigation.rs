//! Navigation definitions between entity types.

use serde::{Deserialize, Serialize};

/// Shape of a navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavigationKind {
    /// Single related entity, declared on the dependent side of the foreign key.
    Reference,
    /// Collection of dependents, declared on the principal side.
    Collection,
}

/// A foreign key backing a navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Foreign key properties on the dependent entity type.
    pub properties: Vec<String>,
    /// Referenced key properties on the principal entity type.
    pub principal_key: Vec<String>,
}

impl ForeignKey {
    /// Create a foreign key.
    pub fn new(
        properties: impl IntoIterator<Item = impl Into<String>>,
        principal_key: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            properties: properties.into_iter().map(Into::into).collect(),
            principal_key: principal_key.into_iter().map(Into::into).collect(),
        }
    }

    /// The single dependent property, if the key is not composite.
    pub fn single_property(&self) -> Option<&str> {
        match self.properties.as_slice() {
            [p] => Some(p),
            _ => None,
        }
    }

    /// The single principal key property, if the key is not composite.
    pub fn single_principal_property(&self) -> Option<&str> {
        match self.principal_key.as_slice() {
            [p] => Some(p),
            _ => None,
        }
    }
}

/// A navigation property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Navigation {
    /// Navigation name (unique within the declaring entity type).
    pub name: String,
    /// Target entity type name.
    pub target: String,
    /// Backing foreign key.
    pub foreign_key: ForeignKey,
    /// Reference or collection.
    pub kind: NavigationKind,
}

impl Navigation {
    /// Create a dependent-to-principal reference navigation.
    ///
    /// `foreign_key` names properties on the declaring type, `principal_key` names
    /// properties on `target`.
    pub fn reference(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl IntoIterator<Item = impl Into<String>>,
        principal_key: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            foreign_key: ForeignKey::new(foreign_key, principal_key),
            kind: NavigationKind::Reference,
        }
    }

    /// Create a principal-to-dependents collection navigation.
    ///
    /// `foreign_key` names properties on `target`, `principal_key` names properties on
    /// the declaring type.
    pub fn collection(
        name: impl Into<String>,
        target: impl Into<String>,
        foreign_key: impl IntoIterator<Item = impl Into<String>>,
        principal_key: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            foreign_key: ForeignKey::new(foreign_key, principal_key),
            kind: NavigationKind::Collection,
        }
    }

    /// Check if this is a collection navigation.
    pub fn is_collection(&self) -> bool {
        self.kind == NavigationKind::Collection
    }
}

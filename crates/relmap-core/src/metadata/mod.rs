//! Entity/relationship metadata.
//!
//! The model is resolved by the caller; the compiler only reads it.

mod entity;
mod model;
mod navigation;
mod property;
mod types;

pub use entity::EntityType;
pub use model::Model;
pub use navigation::{ForeignKey, Navigation, NavigationKind};
pub use property::Property;
pub use types::{PropertyType, ScalarType, ValueGenerated};

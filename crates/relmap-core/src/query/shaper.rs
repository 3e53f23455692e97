//! Row buffers and shapers.
//!
//! A shaper turns one window of a result row into a per-source value: a materialized
//! entity (deduplicated through the per-execution identity map and optionally attached
//! to the change tracker) or a lightweight row of named values. Shaper offsets are
//! absolute positions in the command row, so flattening a join only has to shift them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use relmap_proto::Value;
use tracing::trace;

use crate::error::{Error, Result};
use crate::metadata::EntityType;

use super::model::QuerySourceId;

/// One result row, shared between the sources that read from it.
#[derive(Debug, Clone)]
pub struct ValueBuffer {
    values: Arc<[Value]>,
    offset: usize,
}

impl ValueBuffer {
    /// Wrap a row.
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values: values.into(),
            offset: 0,
        }
    }

    /// A window starting `offset` columns further in. No values are copied.
    pub fn with_offset(&self, offset: usize) -> Self {
        Self {
            values: Arc::clone(&self.values),
            offset: self.offset + offset,
        }
    }

    /// Value at `index` relative to the window start.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(self.offset + index)
    }

    /// Columns visible through the window.
    pub fn len(&self) -> usize {
        self.values.len().saturating_sub(self.offset)
    }

    /// Check if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Entity type plus primary key values.
#[derive(Debug, Clone)]
pub struct EntityKey {
    entity_type: String,
    values: Vec<Value>,
}

impl EntityKey {
    /// Create a key.
    pub fn new(entity_type: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values,
        }
    }

    /// Read a key from a buffer window; `None` when any key column is NULL.
    pub fn from_buffer(entity_type: &str, window: &ValueBuffer, indexes: &[usize]) -> Option<Self> {
        let mut values = Vec::with_capacity(indexes.len());
        for &index in indexes {
            match window.get(index) {
                None | Some(Value::Null) => return None,
                Some(value) => values.push(value.clone()),
            }
        }
        Some(Self::new(entity_type, values))
    }

    /// Entity type name.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Key values in key order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// A key is usable for identity only when no part is NULL.
    pub fn is_valid(&self) -> bool {
        !self.values.is_empty() && self.values.iter().all(|v| !v.is_null())
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity_type == other.entity_type
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| values_identical(a, b))
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_type.hash(state);
        for value in &self.values {
            hash_value(value, state);
        }
    }
}

/// Equality consistent with [`hash_value`]: floats compare by bit pattern.
pub(crate) fn values_identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float32(x), Value::Float32(y)) => x.to_bits() == y.to_bits(),
        (Value::Float64(x), Value::Float64(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}

pub(crate) fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    std::mem::discriminant(value).hash(state);
    match value {
        Value::Null => {}
        Value::Bool(b) => b.hash(state),
        Value::Int32(i) => i.hash(state),
        Value::Int64(i) | Value::Timestamp(i) => i.hash(state),
        Value::Float32(f) => f.to_bits().hash(state),
        Value::Float64(f) => f.to_bits().hash(state),
        Value::String(s) => s.hash(state),
        Value::Bytes(b) => b.hash(state),
        Value::Uuid(u) => u.hash(state),
    }
}

/// A materialized entity instance.
pub struct Entity {
    entity_type: Arc<EntityType>,
    key: EntityKey,
    values: Vec<Value>,
    navigations: RwLock<BTreeMap<String, Option<Arc<Entity>>>>,
}

impl Entity {
    /// Create an entity from property values in model order.
    pub fn new(entity_type: Arc<EntityType>, key: EntityKey, values: Vec<Value>) -> Self {
        Self {
            entity_type,
            key,
            values,
            navigations: RwLock::new(BTreeMap::new()),
        }
    }

    /// Entity type.
    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.entity_type
    }

    /// Identity key.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Property values in model order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of a property.
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.entity_type
            .property_index(property)
            .and_then(|i| self.values.get(i))
    }

    /// Related entity loaded into a reference navigation. `None` if not loaded or empty.
    pub fn navigation(&self, name: &str) -> Option<Arc<Entity>> {
        self.navigations.read().get(name).cloned().flatten()
    }

    /// Whether the navigation slot was populated (possibly with no related entity).
    pub fn is_loaded(&self, name: &str) -> bool {
        self.navigations.read().contains_key(name)
    }

    /// Fix up a reference navigation.
    pub fn set_navigation(&self, name: &str, related: Option<Arc<Entity>>) {
        self.navigations.write().insert(name.to_string(), related);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let navigations: Vec<String> = self.navigations.read().keys().cloned().collect();
        f.debug_struct("Entity")
            .field("entity_type", &self.entity_type.name)
            .field("key", &self.key.values)
            .field("values", &self.values)
            .field("navigations", &navigations)
            .finish()
    }
}

/// Value equality. Navigations compare by the related entity's key.
impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        if self.key != other.key || self.values != other.values {
            return false;
        }
        let mine = self.navigations.read();
        let theirs = other.navigations.read();
        mine.len() == theirs.len()
            && mine.iter().zip(theirs.iter()).all(|((a, x), (b, y))| {
                a == b
                    && match (x, y) {
                        (Some(x), Some(y)) => x.key == y.key,
                        (None, None) => true,
                        _ => false,
                    }
            })
    }
}

/// In-flight change tracker shared across executions.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    entries: Mutex<HashMap<EntityKey, Arc<Entity>>>,
}

impl ChangeTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an entity. If one with the same key is already tracked, that instance
    /// wins and is returned.
    pub fn start_tracking(&self, entity: Arc<Entity>) -> Arc<Entity> {
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(entity.key().clone()).or_insert(entity))
    }

    /// The tracked instance for a key.
    pub fn try_get(&self, key: &EntityKey) -> Option<Arc<Entity>> {
        self.entries.lock().get(key).cloned()
    }

    /// Number of tracked entities.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Track every entity reachable from `owner` along the include paths, replacing
    /// navigation slots with the tracked instances.
    pub fn track_includes(&self, owner: &Arc<Entity>, includes: &[Vec<String>]) {
        for path in includes {
            let mut current = Arc::clone(owner);
            for navigation in path {
                let Some(related) = current.navigation(navigation) else {
                    break;
                };
                let tracked = self.start_tracking(Arc::clone(&related));
                if !Arc::ptr_eq(&tracked, &related) {
                    current.set_navigation(navigation, Some(Arc::clone(&tracked)));
                }
                current = tracked;
            }
        }
    }
}

/// Entities materialized during one execution, keyed by identity.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entities: HashMap<EntityKey, Arc<Entity>>,
}

impl IdentityMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Entity for a key.
    pub fn get(&self, key: &EntityKey) -> Option<&Arc<Entity>> {
        self.entities.get(key)
    }

    /// Record an entity.
    pub fn insert(&mut self, entity: Arc<Entity>) {
        self.entities.insert(entity.key().clone(), entity);
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Check if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Named values read by a value-only shaper.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRow {
    names: Arc<[String]>,
    values: Vec<Value>,
}

impl ValueRow {
    /// Property names in projection order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Value of a named property.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i))
    }

    /// Values in projection order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Final result item of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapedResult {
    /// Plain value.
    Scalar(Value),
    /// Entity instance.
    Entity(Arc<Entity>),
    /// No entity (outer join without a match, or `*OrDefault` on an empty sequence).
    Absent,
    /// Anonymous object with named members.
    Object(Vec<(String, ShapedResult)>),
    /// A sequence, e.g. a group.
    Collection(Vec<ShapedResult>),
}

impl ShapedResult {
    /// The scalar value, if this is one.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ShapedResult::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// The entity, if this is one.
    pub fn as_entity(&self) -> Option<&Arc<Entity>> {
        match self {
            ShapedResult::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    /// Member of an object result.
    pub fn field(&self, name: &str) -> Option<&ShapedResult> {
        match self {
            ShapedResult::Object(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Check if this is [`ShapedResult::Absent`].
    pub fn is_absent(&self) -> bool {
        matches!(self, ShapedResult::Absent)
    }
}

/// What one source contributes to a row scope.
#[derive(Debug, Clone)]
pub enum SourceValue {
    Entity(Arc<Entity>),
    Row(ValueRow),
    Absent,
    /// Elements of a group join, one per matching inner row.
    Group(Vec<ShapedResult>),
    Shaped(ShapedResult),
}

impl From<ShapedResult> for SourceValue {
    fn from(result: ShapedResult) -> Self {
        match result {
            ShapedResult::Entity(entity) => SourceValue::Entity(entity),
            ShapedResult::Absent => SourceValue::Absent,
            other => SourceValue::Shaped(other),
        }
    }
}

/// The per-source values of one logical result row.
#[derive(Debug, Clone, Default)]
pub struct RowScope {
    sources: Vec<(QuerySourceId, SourceValue)>,
    row: Option<ValueBuffer>,
}

impl RowScope {
    /// Scope over a raw command row.
    pub fn for_row(row: ValueBuffer) -> Self {
        Self {
            sources: Vec::new(),
            row: Some(row),
        }
    }

    /// Bind a source, replacing an earlier binding.
    pub fn bind(&mut self, source: QuerySourceId, value: SourceValue) {
        match self.sources.iter_mut().find(|(id, _)| *id == source) {
            Some(slot) => slot.1 = value,
            None => self.sources.push((source, value)),
        }
    }

    /// Value bound to a source.
    pub fn get(&self, source: QuerySourceId) -> Option<&SourceValue> {
        self.sources
            .iter()
            .find(|(id, _)| *id == source)
            .map(|(_, v)| v)
    }

    /// The raw command row, if the scope came from exactly one row.
    pub fn row(&self) -> Option<&ValueBuffer> {
        self.row.as_ref()
    }

    /// Combine with the scope of a joined row.
    pub fn merged(&self, other: &RowScope) -> RowScope {
        let mut merged = self.clone();
        for (id, value) in &other.sources {
            merged.bind(*id, value.clone());
        }
        merged
    }

    /// Keep only the given sources.
    pub fn project(&self, sources: &[QuerySourceId]) -> RowScope {
        RowScope {
            sources: self
                .sources
                .iter()
                .filter(|(id, _)| sources.contains(id))
                .cloned()
                .collect(),
            row: self.row.clone(),
        }
    }
}

/// Per-execution state consulted by shapers.
pub struct ShapingContext<'e> {
    pub identity_map: &'e mut IdentityMap,
    pub tracker: &'e ChangeTracker,
}

/// A reference include loaded alongside its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct IncludeShaper {
    /// Navigation fixed up on the owner.
    pub navigation: String,
    /// Shaper for the related entity.
    pub shaper: EntityShaper,
}

/// Materializes one entity per row.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityShaper {
    pub source: QuerySourceId,
    pub entity_type: Arc<EntityType>,
    /// Column of the first property.
    pub offset: usize,
    /// Key property positions relative to `offset`.
    pub key_indexes: Vec<usize>,
    /// Attach new instances to the change tracker.
    pub track: bool,
    pub includes: Vec<IncludeShaper>,
    /// Include paths tracked along with the owner.
    pub trackable_includes: Vec<Vec<String>>,
}

impl EntityShaper {
    /// Create a shaper reading every property starting at `offset`.
    pub fn new(source: QuerySourceId, entity_type: Arc<EntityType>, offset: usize, track: bool) -> Self {
        let key_indexes = entity_type
            .primary_key
            .iter()
            .filter_map(|name| entity_type.property_index(name))
            .collect();
        Self {
            source,
            entity_type,
            offset,
            key_indexes,
            track,
            includes: Vec::new(),
            trackable_includes: Vec::new(),
        }
    }

    /// Number of columns this shaper and its includes read.
    pub fn width(&self) -> usize {
        self.entity_type.properties.len()
            + self.includes.iter().map(|i| i.shaper.width()).sum::<usize>()
    }

    fn shift(&mut self, delta: usize) {
        self.offset += delta;
        for include in &mut self.includes {
            include.shaper.shift(delta);
        }
    }

    /// Materialize the entity in `row`, or `None` when its key is NULL.
    pub fn materialize(&self, row: &ValueBuffer, cx: &mut ShapingContext<'_>) -> Result<Option<Arc<Entity>>> {
        let window = row.with_offset(self.offset);
        let Some(key) = EntityKey::from_buffer(&self.entity_type.name, &window, &self.key_indexes) else {
            return Ok(None);
        };

        let entity = match cx.identity_map.get(&key).cloned() {
            // An instance first read by an untracked shaper is attached here.
            Some(existing) if self.track => {
                let tracked = cx.tracker.start_tracking(Arc::clone(&existing));
                if !Arc::ptr_eq(&tracked, &existing) {
                    cx.identity_map.insert(Arc::clone(&tracked));
                }
                tracked
            }
            Some(existing) => existing,
            None => {
                let entity = match cx.tracker.try_get(&key).filter(|_| self.track) {
                    Some(tracked) => tracked,
                    None => {
                        let entity = Arc::new(self.read_entity(&window, key)?);
                        if self.track {
                            cx.tracker.start_tracking(entity)
                        } else {
                            entity
                        }
                    }
                };
                cx.identity_map.insert(Arc::clone(&entity));
                entity
            }
        };

        for include in &self.includes {
            let related = include.shaper.materialize(row, cx)?;
            entity.set_navigation(&include.navigation, related);
        }
        if self.track && !self.trackable_includes.is_empty() {
            cx.tracker.track_includes(&entity, &self.trackable_includes);
        }
        Ok(Some(entity))
    }

    fn read_entity(&self, window: &ValueBuffer, key: EntityKey) -> Result<Entity> {
        let mut values = Vec::with_capacity(self.entity_type.properties.len());
        for (i, property) in self.entity_type.properties.iter().enumerate() {
            let value = window.get(i).cloned().ok_or_else(|| {
                Error::ResultShape(format!(
                    "row too short for {} property {}",
                    self.entity_type.name, property.name
                ))
            })?;
            values.push(property.scalar().coerce(value));
        }
        trace!(entity = %self.entity_type.name, "materialized entity");
        Ok(Entity::new(Arc::clone(&self.entity_type), key, values))
    }
}

/// Reads named columns without materializing an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueShaper {
    pub source: QuerySourceId,
    pub offset: usize,
    pub names: Arc<[String]>,
}

impl ValueShaper {
    /// Read the window.
    pub fn read(&self, row: &ValueBuffer) -> Result<ValueRow> {
        let window = row.with_offset(self.offset);
        let values = (0..self.names.len())
            .map(|i| {
                window.get(i).cloned().ok_or_else(|| {
                    Error::ResultShape(format!("row too short for column {}", self.names[i]))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ValueRow {
            names: Arc::clone(&self.names),
            values,
        })
    }
}

/// Shape plan for one source of a command row.
#[derive(Debug, Clone, PartialEq)]
pub enum Shaper {
    Entity(EntityShaper),
    Values(ValueShaper),
}

impl Shaper {
    /// The source this shaper binds.
    pub fn source(&self) -> QuerySourceId {
        match self {
            Shaper::Entity(shaper) => shaper.source,
            Shaper::Values(shaper) => shaper.source,
        }
    }

    /// First column read.
    pub fn offset(&self) -> usize {
        match self {
            Shaper::Entity(shaper) => shaper.offset,
            Shaper::Values(shaper) => shaper.offset,
        }
    }

    /// Move the shaper `delta` columns to the right.
    pub fn shift(&mut self, delta: usize) {
        match self {
            Shaper::Entity(shaper) => shaper.shift(delta),
            Shaper::Values(shaper) => shaper.offset += delta,
        }
    }

    /// Shape `row` and bind the result into `scope`. Earlier bindings in the scope are
    /// the parent result.
    pub fn shape(&self, row: &ValueBuffer, scope: &mut RowScope, cx: &mut ShapingContext<'_>) -> Result<()> {
        let value = match self {
            Shaper::Entity(shaper) => match shaper.materialize(row, cx)? {
                Some(entity) => SourceValue::Entity(entity),
                None => SourceValue::Absent,
            },
            Shaper::Values(shaper) => SourceValue::Row(shaper.read(row)?),
        };
        scope.bind(self.source(), value);
        Ok(())
    }
}

impl ValueShaper {
    /// Create a value-only shaper.
    pub fn new(source: QuerySourceId, offset: usize, names: Vec<String>) -> Self {
        Self {
            source,
            offset,
            names: names.into(),
        }
    }
}

//! Query model: sources, clauses, result operators and annotations.
//!
//! A query model is the already-parsed input of the compiler. Query sources are
//! identified by an opaque [`QuerySourceId`]; two sources are equal only when they are
//! the same source, never because they look alike.

use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use relmap_proto::Value;
use serde::Serialize;

use crate::error::Result;

use super::expression::{Expression, ItemType, SourceRef};

static NEXT_SOURCE_ID: AtomicU32 = AtomicU32::new(1);

/// Opaque identity of a query source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct QuerySourceId(u32);

impl QuerySourceId {
    fn next() -> Self {
        QuerySourceId(NEXT_SOURCE_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }

    /// Create an id with a fixed value (used when canonicalizing models).
    pub fn from_raw(raw: u32) -> Self {
        QuerySourceId(raw)
    }

    /// Raw numeric value.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// One row-producing clause of a query: a from clause, a join or a group join.
#[derive(Debug, Clone, Serialize)]
pub struct QuerySource {
    id: QuerySourceId,
    item_name: String,
    generated_name: bool,
    item_type: ItemType,
}

impl PartialEq for QuerySource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QuerySource {}

impl std::hash::Hash for QuerySource {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl QuerySource {
    /// Create a new source with a fresh identity.
    pub fn new(item_name: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            id: QuerySourceId::next(),
            item_name: item_name.into(),
            generated_name: false,
            item_type,
        }
    }

    /// Create a source over an entity type.
    pub fn entity(item_name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self::new(item_name, ItemType::Entity(entity_type.into()))
    }

    /// Create a source whose item name was generated rather than written by the user.
    pub fn generated(item_type: ItemType) -> Self {
        let id = QuerySourceId::next();
        Self {
            item_name: format!("<generated>_{}", id.0),
            id,
            generated_name: true,
            item_type,
        }
    }

    /// Identity of this source.
    pub fn id(&self) -> QuerySourceId {
        self.id
    }

    /// Item name (the range variable).
    pub fn item_name(&self) -> &str {
        &self.item_name
    }

    /// Whether the item name was generated.
    pub fn has_generated_name(&self) -> bool {
        self.generated_name
    }

    /// Item type.
    pub fn item_type(&self) -> &ItemType {
        &self.item_type
    }

    /// Expression referencing this source.
    pub fn reference(&self) -> Expression {
        Expression::Source(SourceRef {
            id: self.id,
            item_type: self.item_type.clone(),
        })
    }

    /// Member access on this source.
    pub fn member(&self, name: impl Into<String>) -> Expression {
        self.reference().member(name)
    }

    pub(crate) fn set_id(&mut self, id: QuerySourceId) {
        self.id = id;
    }
}

/// What a from clause or join ranges over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SourceOrigin {
    /// All rows of an entity type.
    EntitySet(String),
    /// A nested query.
    SubQuery(Box<QueryModel>),
}

/// A from clause (main or additional).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FromClause {
    pub source: QuerySource,
    pub origin: SourceOrigin,
}

impl FromClause {
    /// Range over the entity set named by the source's item type.
    pub fn entity_set(source: &QuerySource) -> Self {
        let entity = match source.item_type() {
            ItemType::Entity(name) | ItemType::Group(name) => name.clone(),
            ItemType::Value => source.item_name().to_string(),
        };
        Self {
            source: source.clone(),
            origin: SourceOrigin::EntitySet(entity),
        }
    }

    /// Range over a nested query.
    pub fn subquery(source: &QuerySource, model: QueryModel) -> Self {
        Self {
            source: source.clone(),
            origin: SourceOrigin::SubQuery(Box::new(model)),
        }
    }
}

/// Join flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

/// An equi-join against another source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinClause {
    pub source: QuerySource,
    pub origin: SourceOrigin,
    pub kind: JoinKind,
    pub outer_key: Expression,
    pub inner_key: Expression,
}

impl JoinClause {
    /// Create an inner join over an entity set.
    pub fn new(inner: &QuerySource, outer_key: Expression, inner_key: Expression) -> Self {
        let from = FromClause::entity_set(inner);
        Self {
            source: from.source,
            origin: from.origin,
            kind: JoinKind::Inner,
            outer_key,
            inner_key,
        }
    }

    /// Set the join kind.
    pub fn with_kind(mut self, kind: JoinKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A group join: the group source yields, per outer item, the matching inner items.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupJoinClause {
    pub source: QuerySource,
    pub join: JoinClause,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// One ordering key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ordering {
    pub expression: Expression,
    pub direction: OrderDirection,
}

/// A clause between the main from clause and the selector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BodyClause {
    AdditionalFrom(FromClause),
    Join(JoinClause),
    GroupJoin(GroupJoinClause),
    Where(Expression),
    OrderBy(Vec<Ordering>),
}

impl BodyClause {
    /// Whether this clause introduces the given source.
    pub fn defines(&self, id: QuerySourceId) -> bool {
        match self {
            BodyClause::AdditionalFrom(from) => from.source.id() == id,
            BodyClause::Join(join) => join.source.id() == id,
            BodyClause::GroupJoin(group) => {
                group.source.id() == id || group.join.source.id() == id
            }
            BodyClause::Where(_) | BodyClause::OrderBy(_) => false,
        }
    }
}

/// Operators applied to the selected sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResultOperator {
    Take(u64),
    Skip(u64),
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Count,
    Any,
    Distinct,
}

/// Custom annotations attached to a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QueryAnnotation {
    /// Do not track entities. `None` applies to every source of the query.
    NoTracking { source: Option<QuerySourceId> },
    /// The source is backed by literal SQL with `{0}`-style placeholders.
    FromSql {
        source: QuerySourceId,
        sql: String,
        parameters: Vec<Value>,
    },
    /// Eagerly load a navigation path from the source.
    Include {
        source: QuerySourceId,
        path: Vec<String>,
    },
}

/// A complete query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryModel {
    pub main_from: FromClause,
    pub body_clauses: Vec<BodyClause>,
    pub selector: Expression,
    pub result_operators: Vec<ResultOperator>,
    pub annotations: Vec<QueryAnnotation>,
}

impl QueryModel {
    /// Create a query selecting every item of the main from clause.
    pub fn new(main_from: FromClause) -> Self {
        Self {
            selector: main_from.source.reference(),
            main_from,
            body_clauses: Vec::new(),
            result_operators: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// Create a query over an entity set.
    pub fn from_entity(source: &QuerySource) -> Self {
        Self::new(FromClause::entity_set(source))
    }

    /// Create a query over a nested query.
    pub fn from_subquery(source: &QuerySource, subquery: QueryModel) -> Self {
        Self::new(FromClause::subquery(source, subquery))
    }

    /// Add an inner join.
    pub fn join(mut self, inner: &QuerySource, outer_key: Expression, inner_key: Expression) -> Self {
        self.body_clauses
            .push(BodyClause::Join(JoinClause::new(inner, outer_key, inner_key)));
        self
    }

    /// Add a left outer join.
    pub fn left_join(
        mut self,
        inner: &QuerySource,
        outer_key: Expression,
        inner_key: Expression,
    ) -> Self {
        self.body_clauses.push(BodyClause::Join(
            JoinClause::new(inner, outer_key, inner_key).with_kind(JoinKind::LeftOuter),
        ));
        self
    }

    /// Add a group join; `group` must have an [`ItemType::Group`] item type.
    pub fn group_join(
        mut self,
        group: &QuerySource,
        inner: &QuerySource,
        outer_key: Expression,
        inner_key: Expression,
    ) -> Self {
        self.body_clauses.push(BodyClause::GroupJoin(GroupJoinClause {
            source: group.clone(),
            join: JoinClause::new(inner, outer_key, inner_key),
        }));
        self
    }

    /// Add an additional from clause over an entity set.
    pub fn from_also(mut self, source: &QuerySource) -> Self {
        self.body_clauses
            .push(BodyClause::AdditionalFrom(FromClause::entity_set(source)));
        self
    }

    /// Add a where clause.
    pub fn filter(mut self, predicate: Expression) -> Self {
        self.body_clauses.push(BodyClause::Where(predicate));
        self
    }

    /// Add an order-by clause with one key.
    pub fn order_by(mut self, expression: Expression, direction: OrderDirection) -> Self {
        self.body_clauses.push(BodyClause::OrderBy(vec![Ordering {
            expression,
            direction,
        }]));
        self
    }

    /// Set the selector.
    pub fn select(mut self, selector: Expression) -> Self {
        self.selector = selector;
        self
    }

    /// Append a result operator.
    pub fn with_result_operator(mut self, operator: ResultOperator) -> Self {
        self.result_operators.push(operator);
        self
    }

    /// Append `Take(count)`.
    pub fn take(self, count: u64) -> Self {
        self.with_result_operator(ResultOperator::Take(count))
    }

    /// Append `Skip(count)`.
    pub fn skip(self, count: u64) -> Self {
        self.with_result_operator(ResultOperator::Skip(count))
    }

    /// Disable tracking for the whole query.
    pub fn as_no_tracking(mut self) -> Self {
        self.annotations
            .push(QueryAnnotation::NoTracking { source: None });
        self
    }

    /// Disable tracking for one source.
    pub fn as_no_tracking_source(mut self, source: &QuerySource) -> Self {
        self.annotations.push(QueryAnnotation::NoTracking {
            source: Some(source.id()),
        });
        self
    }

    /// Back a source with literal SQL.
    pub fn from_sql(
        mut self,
        source: &QuerySource,
        sql: impl Into<String>,
        parameters: Vec<Value>,
    ) -> Self {
        self.annotations.push(QueryAnnotation::FromSql {
            source: source.id(),
            sql: sql.into(),
            parameters,
        });
        self
    }

    /// Eagerly load a navigation path.
    pub fn include(mut self, source: &QuerySource, path: &[&str]) -> Self {
        self.annotations.push(QueryAnnotation::Include {
            source: source.id(),
            path: path.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Every source introduced by this model, in declaration order.
    pub fn sources(&self) -> Vec<&QuerySource> {
        let mut sources = vec![&self.main_from.source];
        for clause in &self.body_clauses {
            match clause {
                BodyClause::AdditionalFrom(from) => sources.push(&from.source),
                BodyClause::Join(join) => sources.push(&join.source),
                BodyClause::GroupJoin(group) => {
                    sources.push(&group.join.source);
                    sources.push(&group.source);
                }
                BodyClause::Where(_) | BodyClause::OrderBy(_) => {}
            }
        }
        sources
    }

    /// Find a source introduced by this model.
    pub fn find_source(&self, id: QuerySourceId) -> Option<&QuerySource> {
        self.sources().into_iter().find(|s| s.id() == id)
    }

    /// Index of the body clause introducing the source; `None` for the main from clause.
    pub fn body_clause_index_of(&self, id: QuerySourceId) -> Option<usize> {
        self.body_clauses.iter().position(|c| c.defines(id))
    }

    /// Visit every top-level expression of the model (not nested subquery bodies).
    pub fn for_each_expression<'a>(&'a self, f: &mut dyn FnMut(&'a Expression)) {
        for clause in &self.body_clauses {
            match clause {
                BodyClause::Join(join) => {
                    f(&join.outer_key);
                    f(&join.inner_key);
                }
                BodyClause::GroupJoin(group) => {
                    f(&group.join.outer_key);
                    f(&group.join.inner_key);
                }
                BodyClause::Where(predicate) => f(predicate),
                BodyClause::OrderBy(orderings) => orderings.iter().for_each(|o| f(&o.expression)),
                BodyClause::AdditionalFrom(_) => {}
            }
        }
        f(&self.selector);
    }

    /// Replace every top-level expression with `f(expression)`.
    pub fn transform_expressions(
        &mut self,
        f: &mut dyn FnMut(Expression) -> Result<Expression>,
    ) -> Result<()> {
        fn apply(
            slot: &mut Expression,
            f: &mut dyn FnMut(Expression) -> Result<Expression>,
        ) -> Result<()> {
            let taken = std::mem::replace(slot, Expression::Constant(Value::Null));
            *slot = f(taken)?;
            Ok(())
        }

        for clause in &mut self.body_clauses {
            match clause {
                BodyClause::Join(join) => {
                    apply(&mut join.outer_key, f)?;
                    apply(&mut join.inner_key, f)?;
                }
                BodyClause::GroupJoin(group) => {
                    apply(&mut group.join.outer_key, f)?;
                    apply(&mut group.join.inner_key, f)?;
                }
                BodyClause::Where(predicate) => apply(predicate, f)?,
                BodyClause::OrderBy(orderings) => {
                    for ordering in orderings {
                        apply(&mut ordering.expression, f)?;
                    }
                }
                BodyClause::AdditionalFrom(_) => {}
            }
        }
        apply(&mut self.selector, f)
    }

    /// Rewrite every source id, including those of nested subqueries.
    pub fn remap_sources(
        &mut self,
        map: &mut dyn FnMut(QuerySourceId) -> QuerySourceId,
    ) -> Result<()> {
        fn remap_origin(
            origin: &mut SourceOrigin,
            map: &mut dyn FnMut(QuerySourceId) -> QuerySourceId,
        ) -> Result<()> {
            match origin {
                SourceOrigin::SubQuery(model) => model.remap_sources(map),
                SourceOrigin::EntitySet(_) => Ok(()),
            }
        }

        fn remap_expression(
            expression: Expression,
            map: &mut dyn FnMut(QuerySourceId) -> QuerySourceId,
        ) -> Result<Expression> {
            match expression {
                Expression::Source(mut r) => {
                    r.id = map(r.id);
                    Ok(Expression::Source(r))
                }
                Expression::SubQuery(mut model) => {
                    model.remap_sources(map)?;
                    Ok(Expression::SubQuery(model))
                }
                other => other.map_children(&mut |child| remap_expression(child, map)),
            }
        }

        let id = map(self.main_from.source.id());
        self.main_from.source.set_id(id);
        remap_origin(&mut self.main_from.origin, map)?;

        for clause in &mut self.body_clauses {
            match clause {
                BodyClause::AdditionalFrom(from) => {
                    let id = map(from.source.id());
                    from.source.set_id(id);
                    remap_origin(&mut from.origin, map)?;
                }
                BodyClause::Join(join) => {
                    let id = map(join.source.id());
                    join.source.set_id(id);
                    remap_origin(&mut join.origin, map)?;
                }
                BodyClause::GroupJoin(group) => {
                    let id = map(group.join.source.id());
                    group.join.source.set_id(id);
                    remap_origin(&mut group.join.origin, map)?;
                    let id = map(group.source.id());
                    group.source.set_id(id);
                }
                BodyClause::Where(_) | BodyClause::OrderBy(_) => {}
            }
        }

        for annotation in &mut self.annotations {
            match annotation {
                QueryAnnotation::NoTracking { source } => *source = source.map(&mut *map),
                QueryAnnotation::FromSql { source, .. } | QueryAnnotation::Include { source, .. } => {
                    *source = map(*source)
                }
            }
        }

        self.transform_expressions(&mut |e| remap_expression(e, map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_identity() {
        let a = QuerySource::entity("c", "Customer");
        let b = QuerySource::entity("c", "Customer");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(QuerySource::generated(ItemType::Value).has_generated_name());
    }

    #[test]
    fn test_sources_in_declaration_order() {
        let c = QuerySource::entity("c", "Customer");
        let o = QuerySource::entity("o", "Order");
        let g = QuerySource::new("g", ItemType::Group("Order".into()));
        let d = QuerySource::entity("d", "OrderDetail");

        let query = QueryModel::from_entity(&c)
            .join(&o, c.member("CustomerID"), o.member("CustomerID"))
            .group_join(&g, &d, o.member("OrderID"), d.member("OrderID"))
            .filter(c.member("City").equal(Expression::constant("London")));

        let ids: Vec<_> = query.sources().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![c.id(), o.id(), d.id(), g.id()]);
        assert_eq!(query.body_clause_index_of(o.id()), Some(0));
        assert_eq!(query.body_clause_index_of(g.id()), Some(1));
        assert_eq!(query.body_clause_index_of(d.id()), Some(1));
        assert_eq!(query.body_clause_index_of(c.id()), None);
    }

    #[test]
    fn test_remap_sources_reaches_every_reference() {
        let c = QuerySource::entity("c", "Customer");
        let o = QuerySource::entity("o", "Order");
        let mut query = QueryModel::from_entity(&c)
            .join(&o, c.member("CustomerID"), o.member("CustomerID"))
            .as_no_tracking_source(&o)
            .select(o.reference());

        query
            .remap_sources(&mut |id| QuerySourceId::from_raw(id.raw() + 1000))
            .unwrap();

        assert_eq!(query.main_from.source.id().raw(), c.id().raw() + 1000);
        assert_eq!(
            query.selector.as_source().map(|r| r.id.raw()),
            Some(o.id().raw() + 1000)
        );
        assert_eq!(
            query.annotations[0],
            QueryAnnotation::NoTracking {
                source: Some(QuerySourceId::from_raw(o.id().raw() + 1000))
            }
        );
    }
}

//! Navigation rewriting.
//!
//! Member chains such as `o.Customer.City` are rewritten into explicit joins against
//! freshly introduced query sources, so that later stages only ever see property
//! access on a bare source. Joins are memoized per (originating source, navigation):
//! however often a path is used, it yields one join.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::metadata::{Model, NavigationKind};

use super::expression::{Expression, ItemType, SourceRef};
use super::model::{BodyClause, JoinClause, JoinKind, QueryModel, QuerySource, QuerySourceId, SourceOrigin};

/// A join synthesized for one navigation.
#[derive(Debug, Clone)]
pub struct NavigationJoin {
    /// Source the navigation was accessed from.
    pub origin: QuerySourceId,
    /// Navigation name.
    pub navigation: String,
    /// The synthesized join clause (its source is the joined source).
    pub join: JoinClause,
    /// Records for navigations accessed from this join's source.
    pub children: Vec<usize>,
}

/// What a rewrite pass changed.
#[derive(Debug, Clone, Default)]
pub struct RewriteOutcome {
    /// `(joined source, originating source)` for every join introduced, nested
    /// subqueries included.
    pub derived_sources: Vec<(QuerySourceId, QuerySourceId)>,
}

impl RewriteOutcome {
    /// Number of joins introduced.
    pub fn join_count(&self) -> usize {
        self.derived_sources.len()
    }

    fn merge(&mut self, other: RewriteOutcome) {
        self.derived_sources.extend(other.derived_sources);
    }
}

#[derive(Debug, Clone)]
struct KnownSource {
    item_name: String,
    entity: String,
}

/// Rewrites navigation chains of one query model into joins.
pub struct NavigationRewriter<'m> {
    model: &'m Model,
    joins: Vec<NavigationJoin>,
    memo: HashMap<(QuerySourceId, String), usize>,
    roots: Vec<usize>,
    joined: HashMap<QuerySourceId, usize>,
    known: HashMap<QuerySourceId, KnownSource>,
    outcome: RewriteOutcome,
}

impl<'m> NavigationRewriter<'m> {
    /// Create a rewriter for one query model.
    pub fn new(model: &'m Model) -> Self {
        Self {
            model,
            joins: Vec::new(),
            memo: HashMap::new(),
            roots: Vec::new(),
            joined: HashMap::new(),
            known: HashMap::new(),
            outcome: RewriteOutcome::default(),
        }
    }

    /// The join records created so far.
    pub fn joins(&self) -> &[NavigationJoin] {
        &self.joins
    }

    /// Rewrite the query model in place.
    pub fn rewrite(mut self, query: &mut QueryModel) -> Result<RewriteOutcome> {
        for source in query.sources() {
            if let ItemType::Entity(entity) = source.item_type() {
                self.known.insert(
                    source.id(),
                    KnownSource {
                        item_name: source.item_name().to_string(),
                        entity: entity.clone(),
                    },
                );
            }
        }

        self.rewrite_origin(&mut query.main_from.origin)?;
        for clause in &mut query.body_clauses {
            match clause {
                BodyClause::AdditionalFrom(from) => self.rewrite_origin(&mut from.origin)?,
                BodyClause::Join(join) => self.rewrite_origin(&mut join.origin)?,
                BodyClause::GroupJoin(group) => self.rewrite_origin(&mut group.join.origin)?,
                BodyClause::Where(_) | BodyClause::OrderBy(_) => {}
            }
        }

        query.transform_expressions(&mut |e| self.rewrite_expression(e))?;
        self.insert_joins(query);

        Ok(self.outcome)
    }

    fn rewrite_origin(&mut self, origin: &mut SourceOrigin) -> Result<()> {
        if let SourceOrigin::SubQuery(nested) = origin {
            let outcome = NavigationRewriter::new(self.model).rewrite(nested)?;
            self.outcome.merge(outcome);
        }
        Ok(())
    }

    fn rewrite_expression(&mut self, expression: Expression) -> Result<Expression> {
        match expression {
            Expression::SubQuery(mut nested) => {
                nested.transform_expressions(&mut |e| self.rewrite_correlated(e))?;
                let outcome = NavigationRewriter::new(self.model).rewrite(&mut nested)?;
                self.outcome.merge(outcome);
                Ok(Expression::SubQuery(nested))
            }
            member @ Expression::Member { .. } => match self.try_rewrite_chain(&member)? {
                Some(rewritten) => Ok(rewritten),
                None => member.map_children(&mut |c| self.rewrite_expression(c)),
            },
            other => other.map_children(&mut |c| self.rewrite_expression(c)),
        }
    }

    /// Rewrite chains inside a nested query that start at one of this query's sources.
    /// Their joins land in this query and the nested query refers to the joined
    /// source as a correlated reference.
    fn rewrite_correlated(&mut self, expression: Expression) -> Result<Expression> {
        match expression {
            Expression::SubQuery(mut nested) => {
                nested.transform_expressions(&mut |e| self.rewrite_correlated(e))?;
                Ok(Expression::SubQuery(nested))
            }
            member @ Expression::Member { .. } => match self.try_rewrite_chain(&member)? {
                Some(rewritten) => Ok(rewritten),
                None => member.map_children(&mut |c| self.rewrite_correlated(c)),
            },
            other => other.map_children(&mut |c| self.rewrite_correlated(c)),
        }
    }

    /// Rewrite a member chain rooted at a known entity source, if it starts with at
    /// least one reference navigation.
    fn try_rewrite_chain(&mut self, expression: &Expression) -> Result<Option<Expression>> {
        let mut names = Vec::new();
        let mut current = expression;
        while let Expression::Member { target, name } = current {
            names.push(name.clone());
            current = target;
        }
        names.reverse();

        let Some(root) = current.as_source() else {
            return Ok(None);
        };
        let Some(known) = self.known.get(&root.id).cloned() else {
            return Ok(None);
        };

        let model = self.model;
        let mut source_id = root.id;
        let mut item_name = known.item_name;
        let mut entity = known.entity;
        let mut consumed = 0;

        for name in &names {
            let Some(navigation) = model.find_navigation(&entity, name) else {
                break;
            };
            if navigation.kind != NavigationKind::Reference {
                break;
            }
            let index = self.join_for(source_id, &item_name, &entity, name)?;
            let joined = &self.joins[index].join.source;
            source_id = joined.id();
            item_name = joined.item_name().to_string();
            entity = navigation.target.clone();
            consumed += 1;
        }

        if consumed == 0 {
            return Ok(None);
        }

        let mut rewritten = Expression::Source(SourceRef {
            id: source_id,
            item_type: ItemType::Entity(entity),
        });
        for name in &names[consumed..] {
            rewritten = rewritten.member(name.clone());
        }
        Ok(Some(rewritten))
    }

    /// Find or create the join for `navigation` accessed from `origin`.
    fn join_for(
        &mut self,
        origin: QuerySourceId,
        origin_name: &str,
        origin_entity: &str,
        navigation: &str,
    ) -> Result<usize> {
        let memo_key = (origin, navigation.to_string());
        if let Some(&index) = self.memo.get(&memo_key) {
            return Ok(index);
        }

        let model = self.model;
        let nav = model.require_navigation(origin_entity, navigation)?;
        let (Some(fk_name), Some(pk_name)) = (
            nav.foreign_key.single_property(),
            nav.foreign_key.single_principal_property(),
        ) else {
            return Err(Error::Translation(format!(
                "navigation {origin_entity}.{navigation} uses a composite foreign key"
            )));
        };
        let fk = model.require_property(origin_entity, fk_name)?;
        let pk = model.require_property(&nav.target, pk_name)?;

        let joined = QuerySource::entity(format!("{origin_name}.{navigation}"), nav.target.clone());
        let outer_key = Expression::Source(SourceRef {
            id: origin,
            item_type: ItemType::Entity(origin_entity.to_string()),
        })
        .property(fk_name);
        let mut inner_key = joined.reference().property(pk_name);
        if fk.property_type != pk.property_type {
            inner_key = inner_key.convert(fk.property_type);
        }
        let kind = if fk.is_nullable() {
            JoinKind::LeftOuter
        } else {
            JoinKind::Inner
        };

        debug!(
            source = origin_name,
            navigation,
            joined = joined.item_name(),
            ?kind,
            "navigation rewritten as join"
        );

        let index = self.joins.len();
        self.known.insert(
            joined.id(),
            KnownSource {
                item_name: joined.item_name().to_string(),
                entity: nav.target.clone(),
            },
        );
        self.outcome.derived_sources.push((joined.id(), origin));
        self.joins.push(NavigationJoin {
            origin,
            navigation: navigation.to_string(),
            join: JoinClause::new(&joined, outer_key, inner_key).with_kind(kind),
            children: Vec::new(),
        });
        match self.joined.get(&origin) {
            Some(&parent) => self.joins[parent].children.push(index),
            None => self.roots.push(index),
        }
        self.joined.insert(joined.id(), index);
        self.memo.insert(memo_key, index);
        Ok(index)
    }

    fn pre_order(&self, index: usize, out: &mut Vec<BodyClause>) {
        out.push(BodyClause::Join(self.joins[index].join.clone()));
        for &child in &self.joins[index].children {
            self.pre_order(child, out);
        }
    }

    /// Insert each root join (with its subtree) right after the clause owning its
    /// originating source; joins off the main from clause go first.
    fn insert_joins(&self, query: &mut QueryModel) {
        if self.roots.is_empty() {
            return;
        }

        let mut front = Vec::new();
        let mut after: HashMap<usize, Vec<BodyClause>> = HashMap::new();
        for &root in &self.roots {
            let origin = self.joins[root].origin;
            match query.body_clause_index_of(origin) {
                Some(index) => self.pre_order(root, after.entry(index).or_default()),
                None => self.pre_order(root, &mut front),
            }
        }

        let existing = std::mem::take(&mut query.body_clauses);
        let mut clauses = front;
        for (index, clause) in existing.into_iter().enumerate() {
            clauses.push(clause);
            if let Some(joins) = after.remove(&index) {
                clauses.extend(joins);
            }
        }
        query.body_clauses = clauses;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityType, Navigation, Property, ScalarType};
    use crate::query::OrderDirection;

    fn create_test_model() -> Model {
        Model::new()
            .with_entity_type(
                EntityType::new("Customer")
                    .with_table("Customers")
                    .with_key(Property::new("CustomerID", ScalarType::String))
                    .with_property(Property::optional("City", ScalarType::String))
                    .with_property(Property::new("RegionID", ScalarType::Int32))
                    .with_navigation(Navigation::reference("Region", "Region", ["RegionID"], ["RegionID"]))
                    .with_navigation(Navigation::collection(
                        "Orders",
                        "Order",
                        ["CustomerID"],
                        ["CustomerID"],
                    )),
            )
            .with_entity_type(
                EntityType::new("Region")
                    .with_table("Regions")
                    .with_key(Property::new("RegionID", ScalarType::Int32))
                    .with_property(Property::new("Name", ScalarType::String)),
            )
            .with_entity_type(
                EntityType::new("Order")
                    .with_table("Orders")
                    .with_key(Property::new("OrderID", ScalarType::Int32))
                    .with_property(Property::optional("CustomerID", ScalarType::String))
                    .with_navigation(Navigation::reference(
                        "Customer",
                        "Customer",
                        ["CustomerID"],
                        ["CustomerID"],
                    )),
            )
    }

    fn joins(query: &QueryModel) -> Vec<&JoinClause> {
        query
            .body_clauses
            .iter()
            .filter_map(|c| match c {
                BodyClause::Join(j) => Some(j),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_repeated_path_creates_one_join_per_navigation() {
        let model = create_test_model();
        let o = QuerySource::entity("o", "Order");
        let region_name = || o.member("Customer").member("Region").member("Name");
        let mut query = QueryModel::from_entity(&o)
            .filter(region_name().equal(Expression::constant("West")))
            .order_by(region_name(), OrderDirection::Asc)
            .select(Expression::new_object(vec![
                ("region", region_name()),
                ("city", o.member("Customer").member("City")),
            ]));

        let outcome = NavigationRewriter::new(&model).rewrite(&mut query).unwrap();

        assert_eq!(outcome.join_count(), 2);
        let joins = joins(&query);
        assert_eq!(joins.len(), 2);
        assert_eq!(joins[0].source.item_name(), "o.Customer");
        assert_eq!(joins[1].source.item_name(), "o.Customer.Region");

        let region = joins[1].source.id();
        let customer = joins[0].source.id();
        let Expression::New(members) = &query.selector else {
            panic!("selector should stay an object");
        };
        let (r, name) = members[0].1.as_source_property().unwrap();
        assert_eq!((r.id, name), (region, "Name"));
        let (r, name) = members[1].1.as_source_property().unwrap();
        assert_eq!((r.id, name), (customer, "City"));
        let BodyClause::Where(predicate) = &query.body_clauses[2] else {
            panic!("where clause should follow the joins");
        };
        assert_eq!(predicate.referenced_sources(), vec![region]);
    }

    #[test]
    fn test_join_keys_and_kind() {
        let model = create_test_model();
        let o = QuerySource::entity("o", "Order");
        let mut query =
            QueryModel::from_entity(&o).select(o.member("Customer").member("Region"));

        NavigationRewriter::new(&model).rewrite(&mut query).unwrap();

        let joins = joins(&query);
        // Optional CustomerID: left join; inner key converted to the nullable FK type.
        assert_eq!(joins[0].kind, JoinKind::LeftOuter);
        assert_eq!(
            joins[0].outer_key,
            o.reference().property("CustomerID")
        );
        assert!(matches!(&joins[0].inner_key, Expression::Convert { to, .. } if to.nullable));
        // Required RegionID: inner join, no conversion.
        assert_eq!(joins[1].kind, JoinKind::Inner);
        assert!(matches!(&joins[1].inner_key, Expression::Property { name, .. } if name == "RegionID"));
        assert_eq!(
            query.selector.as_source().map(|r| r.id),
            Some(joins[1].source.id())
        );
    }

    #[test]
    fn test_joins_inserted_after_owning_clause() {
        let model = create_test_model();
        let c = QuerySource::entity("c", "Customer");
        let o = QuerySource::entity("o", "Order");
        let mut query = QueryModel::from_entity(&c)
            .filter(c.member("City").equal(Expression::constant("London")))
            .from_also(&o)
            .filter(o.member("Customer").member("City").equal(c.member("City")))
            .select(c.member("Region").member("Name"));

        NavigationRewriter::new(&model).rewrite(&mut query).unwrap();

        let layout: Vec<_> = query
            .body_clauses
            .iter()
            .map(|clause| match clause {
                BodyClause::Join(j) => j.source.item_name().to_string(),
                BodyClause::AdditionalFrom(f) => f.source.item_name().to_string(),
                BodyClause::Where(_) => "where".to_string(),
                _ => "other".to_string(),
            })
            .collect();
        assert_eq!(layout, vec!["c.Region", "where", "o", "o.Customer", "where"]);
    }

    #[test]
    fn test_collection_navigation_left_alone() {
        let model = create_test_model();
        let c = QuerySource::entity("c", "Customer");
        let mut query = QueryModel::from_entity(&c).select(c.member("Orders"));

        let outcome = NavigationRewriter::new(&model).rewrite(&mut query).unwrap();

        assert_eq!(outcome.join_count(), 0);
        assert_eq!(query.selector, c.member("Orders"));
    }

    #[test]
    fn test_nested_subquery_rewritten_independently() {
        let model = create_test_model();
        let c = QuerySource::entity("c", "Customer");
        let o = QuerySource::entity("o", "Order");
        let inner = QueryModel::from_entity(&o)
            .filter(o.member("Customer").member("City").equal(Expression::constant("Berlin")));
        let mut query = QueryModel::from_entity(&c)
            .select(Expression::subquery(inner).call("Count", vec![]));

        let outcome = NavigationRewriter::new(&model).rewrite(&mut query).unwrap();

        assert_eq!(outcome.join_count(), 1);
        assert!(query.body_clauses.is_empty());
    }

    #[test]
    fn test_correlated_navigation_in_subquery_joins_outer_query() {
        let model = create_test_model();
        let c = QuerySource::entity("c", "Customer");
        let o = QuerySource::entity("o", "Order");
        let region_id = || c.member("Region").member("RegionID");
        let inner = QueryModel::from_entity(&o).filter(o.member("CustomerID").equal(region_id()));
        let mut query = QueryModel::from_entity(&c).select(Expression::new_object(vec![
            ("orders", Expression::subquery(inner).call("Count", vec![])),
            ("region", region_id()),
        ]));

        let outcome = NavigationRewriter::new(&model).rewrite(&mut query).unwrap();

        assert_eq!(outcome.join_count(), 1);
        let joins = joins(&query);
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].source.item_name(), "c.Region");
        let region = joins[0].source.id();

        let Expression::New(members) = &query.selector else {
            panic!("selector should stay an object");
        };
        let Expression::MethodCall { target: Some(target), .. } = &members[0].1 else {
            panic!("count should stay a method call");
        };
        let Expression::SubQuery(nested) = target.as_ref() else {
            panic!("count target should stay a subquery");
        };
        assert!(nested.body_clauses.iter().all(|c| !matches!(c, BodyClause::Join(_))));
        let BodyClause::Where(predicate) = &nested.body_clauses[0] else {
            panic!("nested where clause should be kept");
        };
        assert!(predicate.referenced_sources().contains(&region));
        let (r, name) = members[1].1.as_source_property().unwrap();
        assert_eq!((r.id, name), (region, "RegionID"));
    }
}

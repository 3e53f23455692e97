//! Per-compilation state.
//!
//! One [`QueryCompilationContext`] drives one query translation: it runs the navigation
//! rewriter, records which sources must be materialized or tracked, hands out table
//! aliases and literal-SQL parameter names, and creates the relational translator.
//! It is used by exactly one compilation and dropped once the plan exists.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::config::QueryOptions;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::metadata::Model;

use super::expression::{Expression, ItemType};
use super::model::{BodyClause, QueryAnnotation, QueryModel, QuerySourceId, SourceOrigin};
use super::navigation::NavigationRewriter;
use super::tracking::{group_inner_sources, EntityTrackingAnalyzer, EntityTrackingInfo};
use super::translate::RelationalQueryModelVisitor;

/// Whether a compiled query runs against a blocking or an async connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Sync,
    Async,
}

impl ExecutionMode {
    /// Lowercase name, used in errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sync => "sync",
            ExecutionMode::Async => "async",
        }
    }
}

/// State of one query compilation.
pub struct QueryCompilationContext {
    model: Arc<Model>,
    dialect: Arc<dyn SqlDialect>,
    options: QueryOptions,
    mode: Option<ExecutionMode>,
    materialized: Option<HashSet<QuerySourceId>>,
    untracked: HashSet<QuerySourceId>,
    all_untracked: bool,
    tracking_infos: Vec<EntityTrackingInfo>,
    trackable_includes: HashMap<QuerySourceId, Vec<Vec<String>>>,
    aliases: HashSet<String>,
    next_parameter: usize,
}

impl QueryCompilationContext {
    /// Create a context for one compilation.
    pub fn new(model: Arc<Model>, dialect: Arc<dyn SqlDialect>, options: QueryOptions) -> Self {
        Self {
            model,
            dialect,
            options,
            mode: None,
            materialized: None,
            untracked: HashSet::new(),
            all_untracked: false,
            tracking_infos: Vec::new(),
            trackable_includes: HashMap::new(),
            aliases: HashSet::new(),
            next_parameter: 0,
        }
    }

    /// Select the execution mode. Must be called exactly once.
    pub fn initialize(&mut self, mode: ExecutionMode) -> Result<()> {
        if self.mode.is_some() {
            return Err(Error::Usage("query compilation context is already initialized"));
        }
        self.mode = Some(mode);
        Ok(())
    }

    /// The execution mode chosen by [`initialize`](Self::initialize).
    pub fn execution_mode(&self) -> Result<ExecutionMode> {
        self.mode
            .ok_or(Error::Usage("execution mode requested before the context was initialized"))
    }

    /// Entity model.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// SQL dialect.
    pub fn dialect(&self) -> &Arc<dyn SqlDialect> {
        &self.dialect
    }

    /// Query options.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Rewrite navigation chains into joins and derive the untracked sources.
    pub fn rewrite_navigations(&mut self, query: &mut QueryModel) -> Result<()> {
        let outcome = NavigationRewriter::new(&self.model).rewrite(query)?;

        let mut whole_query = !self.options.tracking;
        let mut untracked = HashSet::new();
        visit_models(query, &mut |model| {
            for annotation in &model.annotations {
                match annotation {
                    QueryAnnotation::NoTracking { source: None } => whole_query = true,
                    QueryAnnotation::NoTracking { source: Some(id) } => {
                        untracked.insert(*id);
                    }
                    _ => {}
                }
            }
        });

        // Joins are recorded parent first, so one pass reaches whole chains.
        for (joined, origin) in &outcome.derived_sources {
            if untracked.contains(origin) {
                untracked.insert(*joined);
            }
        }

        debug!(
            joins = outcome.join_count(),
            untracked = untracked.len(),
            whole_query,
            "navigations rewritten"
        );
        self.all_untracked = whole_query;
        self.untracked = untracked;
        Ok(())
    }

    /// Compute the sources whose rows must become entity instances, and the tracked ones.
    pub fn find_query_sources_requiring_materialization(&mut self, query: &QueryModel) {
        let none = HashSet::new();
        let analyzer = EntityTrackingAnalyzer::new(&none);
        let mut materialized = HashSet::new();

        visit_models(query, &mut |model| {
            materialized.extend(analyzer.analyze(model).into_iter().map(|info| info.source));

            // Regrouping keys outer rows by identity, so every entity on the outer side
            // of a group join projects its key columns.
            let group_inners = group_inner_sources(model);
            let mut outer = vec![&model.main_from.source];
            for clause in &model.body_clauses {
                match clause {
                    BodyClause::AdditionalFrom(from) => outer.push(&from.source),
                    BodyClause::Join(join) => outer.push(&join.source),
                    BodyClause::GroupJoin(group) => {
                        materialized.extend(
                            outer
                                .iter()
                                .filter(|source| matches!(source.item_type(), ItemType::Entity(_)))
                                .map(|source| source.id()),
                        );
                        materialized.extend(group.join.outer_key.referenced_sources());
                        materialized.insert(group.join.source.id());
                        outer.push(&group.join.source);
                    }
                    BodyClause::Where(_) | BodyClause::OrderBy(_) => {}
                }
            }
            // A group referenced as a key owner materializes its elements.
            for id in materialized.clone() {
                if let Some(inner) = group_inners.get(&id) {
                    materialized.insert(*inner);
                }
            }

            for annotation in &model.annotations {
                if let QueryAnnotation::Include { source, .. } = annotation {
                    materialized.insert(*source);
                }
            }
        });

        self.tracking_infos = if self.all_untracked {
            Vec::new()
        } else {
            let analyzer = EntityTrackingAnalyzer::new(&self.untracked);
            let mut infos = Vec::new();
            visit_selector_models(query, &mut |model| {
                for info in analyzer.analyze(model) {
                    if !infos.iter().any(|i: &EntityTrackingInfo| i.source == info.source) {
                        infos.push(info);
                    }
                }
            });
            infos
        };

        debug!(
            materialized = materialized.len(),
            tracked = self.tracking_infos.len(),
            "materialization analyzed"
        );
        self.materialized = Some(materialized);
    }

    /// Whether the source must be shaped into entity instances.
    pub fn query_source_requires_materialization(&self, source: QuerySourceId) -> Result<bool> {
        self.materialized
            .as_ref()
            .map(|set| set.contains(&source))
            .ok_or(Error::Usage(
                "materialization requested before query sources were analyzed",
            ))
    }

    /// Whether entities of the source are attached to the change tracker.
    pub fn query_source_requires_tracking(&self, source: QuerySourceId) -> bool {
        !self.all_untracked && self.tracking_infos.iter().any(|info| info.source == source)
    }

    /// Tracked entity results found by the last analysis.
    pub fn tracking_infos(&self) -> &[EntityTrackingInfo] {
        &self.tracking_infos
    }

    /// Record an include path to attach along with the source's entities.
    pub fn add_trackable_include(&mut self, source: QuerySourceId, path: Vec<String>) {
        self.trackable_includes.entry(source).or_default().push(path);
    }

    /// Include paths recorded for the source.
    pub fn trackable_includes(&self, source: QuerySourceId) -> Option<&[Vec<String>]> {
        self.trackable_includes.get(&source).map(Vec::as_slice)
    }

    /// Allocate a table alias, suffixing a counter on collision.
    pub fn unique_alias(&mut self, preferred: &str) -> String {
        if self.aliases.insert(preferred.to_string()) {
            return preferred.to_string();
        }
        let mut counter = 0;
        loop {
            let candidate = format!("{preferred}{counter}");
            if self.aliases.insert(candidate.clone()) {
                return candidate;
            }
            counter += 1;
        }
    }

    /// Allocate a parameter name for a literal SQL argument.
    pub fn parameter_name(&mut self) -> String {
        let name = format!("p{}", self.next_parameter);
        self.next_parameter += 1;
        name
    }

    /// The relational translator for this compilation.
    pub fn create_query_model_visitor(&mut self) -> RelationalQueryModelVisitor<'_> {
        RelationalQueryModelVisitor::new(self)
    }
}

/// Visit the model and every model nested in it: subquery origins and subquery
/// expressions, at any depth.
pub(crate) fn visit_models<'a>(model: &'a QueryModel, f: &mut dyn FnMut(&'a QueryModel)) {
    f(model);
    for_each_origin(model, &mut |origin| {
        if let SourceOrigin::SubQuery(nested) = origin {
            visit_models(nested, f);
        }
    });
    model.for_each_expression(&mut |expression| {
        for nested in nested_models(expression) {
            visit_models(nested, f);
        }
    });
}

/// Visit the model and the subquery expressions reachable from selectors.
fn visit_selector_models<'a>(model: &'a QueryModel, f: &mut dyn FnMut(&'a QueryModel)) {
    f(model);
    for nested in nested_models(&model.selector) {
        visit_selector_models(nested, f);
    }
}

fn for_each_origin<'a>(model: &'a QueryModel, f: &mut dyn FnMut(&'a SourceOrigin)) {
    f(&model.main_from.origin);
    for clause in &model.body_clauses {
        match clause {
            BodyClause::AdditionalFrom(from) => f(&from.origin),
            BodyClause::Join(join) => f(&join.origin),
            BodyClause::GroupJoin(group) => f(&group.join.origin),
            BodyClause::Where(_) | BodyClause::OrderBy(_) => {}
        }
    }
}

/// Subquery models directly inside an expression.
pub(crate) fn nested_models(expression: &Expression) -> Vec<&QueryModel> {
    let mut nested = Vec::new();
    expression.walk(&mut |node| {
        if let Expression::SubQuery(model) = node {
            nested.push(model.as_ref());
        }
        true
    });
    nested
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::SqlServerDialect;
    use crate::metadata::{EntityType, Navigation, Property, ScalarType};
    use crate::query::{ItemType, QuerySource};

    fn create_test_model() -> Arc<Model> {
        Arc::new(
            Model::new()
                .with_entity_type(
                    EntityType::new("Customer")
                        .with_table("Customers")
                        .with_key(Property::new("CustomerID", ScalarType::String))
                        .with_property(Property::optional("City", ScalarType::String)),
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
                ),
        )
    }

    fn context() -> QueryCompilationContext {
        QueryCompilationContext::new(
            create_test_model(),
            Arc::new(SqlServerDialect::new()),
            QueryOptions::default(),
        )
    }

    #[test]
    fn test_execution_mode_selected_once() {
        let mut context = context();
        assert!(matches!(context.execution_mode(), Err(Error::Usage(_))));

        context.initialize(ExecutionMode::Async).unwrap();
        assert_eq!(context.execution_mode().unwrap(), ExecutionMode::Async);
        assert!(matches!(
            context.initialize(ExecutionMode::Sync),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_materialization_requires_analysis() {
        let context = context();
        let c = QuerySource::entity("c", "Customer");
        assert!(matches!(
            context.query_source_requires_materialization(c.id()),
            Err(Error::Usage(_))
        ));
    }

    #[test]
    fn test_group_join_sources_materialized_without_tracking() {
        let mut context = context();
        let c = QuerySource::entity("c", "Customer");
        let o = QuerySource::entity("o", "Order");
        let g = QuerySource::new("g", ItemType::Group("Order".into()));
        let mut query = QueryModel::from_entity(&c)
            .group_join(&g, &o, c.member("CustomerID"), o.member("CustomerID"))
            .select(c.member("City"))
            .as_no_tracking();

        context.rewrite_navigations(&mut query).unwrap();
        context.find_query_sources_requiring_materialization(&query);

        assert!(context.query_source_requires_materialization(c.id()).unwrap());
        assert!(context.query_source_requires_materialization(o.id()).unwrap());
        assert!(!context.query_source_requires_tracking(c.id()));
        assert!(context.tracking_infos().is_empty());
    }

    #[test]
    fn test_group_join_materializes_outer_source_behind_navigation_key() {
        let mut context = context();
        let o = QuerySource::entity("o", "Order");
        let c = QuerySource::entity("c", "Customer");
        let g = QuerySource::new("g", ItemType::Group("Customer".into()));
        let mut query = QueryModel::from_entity(&o)
            .group_join(&g, &c, o.member("Customer").member("CustomerID"), c.member("CustomerID"))
            .select(Expression::new_object(vec![
                ("order", o.member("OrderID")),
                ("customers", g.reference()),
            ]))
            .as_no_tracking();

        context.rewrite_navigations(&mut query).unwrap();
        context.find_query_sources_requiring_materialization(&query);

        let BodyClause::Join(navigation) = &query.body_clauses[0] else {
            panic!("navigation join should come first");
        };
        assert!(context.query_source_requires_materialization(o.id()).unwrap());
        assert!(context
            .query_source_requires_materialization(navigation.source.id())
            .unwrap());
        assert!(context.query_source_requires_materialization(c.id()).unwrap());
    }

    #[test]
    fn test_untracked_source_propagates_to_derived_joins() {
        let mut context = context();
        let o = QuerySource::entity("o", "Order");
        let mut query = QueryModel::from_entity(&o)
            .select(Expression::new_object(vec![
                ("order", o.reference()),
                ("customer", o.member("Customer")),
            ]))
            .as_no_tracking_source(&o);

        context.rewrite_navigations(&mut query).unwrap();
        context.find_query_sources_requiring_materialization(&query);

        let Expression::New(members) = &query.selector else {
            panic!("selector should stay an object");
        };
        let customer = members[1].1.as_source().unwrap().id;
        assert!(context.query_source_requires_materialization(customer).unwrap());
        assert!(!context.query_source_requires_tracking(o.id()));
        assert!(!context.query_source_requires_tracking(customer));
    }

    #[test]
    fn test_aliases_and_parameter_names() {
        let mut context = context();
        assert_eq!(context.unique_alias("c"), "c");
        assert_eq!(context.unique_alias("c"), "c0");
        assert_eq!(context.unique_alias("c"), "c1");
        assert_eq!(context.parameter_name(), "p0");
        assert_eq!(context.parameter_name(), "p1");

        let c = QuerySource::entity("c", "Customer");
        assert!(context.trackable_includes(c.id()).is_none());
        context.add_trackable_include(c.id(), vec!["Region".into()]);
        assert_eq!(context.trackable_includes(c.id()).map(|p| p.len()), Some(1));
    }
}

//! Relational translation of query models.
//!
//! [`RelationalQueryModelVisitor`] walks a navigation-rewritten query model clause by
//! clause. Every source becomes a command over its table (or literal SQL) with a
//! shaper; joins, filters, orderings and result operators are merged into the SQL
//! select while the query stays a single composable command, and fall back to
//! in-memory plan nodes once it does not.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use relmap_proto::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::metadata::{EntityType, Model, NavigationKind, ScalarType};

use super::context::{visit_models, QueryCompilationContext};
use super::expression::{BinaryOp, Expression};
use super::flatten::{FlattenOperator, QueryFlattener};
use super::model::{
    BodyClause, GroupJoinClause, JoinClause, JoinKind, Ordering, QueryAnnotation, QueryModel,
    QuerySource, QuerySourceId, ResultOperator, SourceOrigin,
};
use super::plan::{CommandPlan, CompiledPlan, ScopePlan};
use super::projection::Projection;
use super::select::{
    JoinExpression, ProjectionColumn, SelectExpression, SqlExpression, SqlJoinKind, SqlOrdering,
    TableExpression,
};
use super::shaper::{EntityShaper, IncludeShaper, Shaper, ValueShaper};
use super::tracking::subquery_origin;

/// Where a source's columns live in the current select.
#[derive(Debug, Clone)]
struct Binding {
    alias: String,
    entity_type: Arc<EntityType>,
}

type Bindings = HashMap<QuerySourceId, Binding>;

/// The query translated so far. `bindings` is only meaningful while `plan` is a
/// single command.
struct Translated {
    plan: ScopePlan,
    bindings: Bindings,
}

impl Translated {
    fn client(plan: ScopePlan) -> Self {
        Self {
            plan,
            bindings: HashMap::new(),
        }
    }

    fn command(command: CommandPlan, source: QuerySourceId, binding: Binding) -> Self {
        Self {
            plan: ScopePlan::Command(command),
            bindings: HashMap::from([(source, binding)]),
        }
    }

    /// The command, if further SQL may be merged into it.
    fn mergeable_command(&mut self) -> Option<&mut CommandPlan> {
        match &mut self.plan {
            ScopePlan::Command(command) if command.select.is_mergeable() => Some(command),
            _ => None,
        }
    }

    fn is_mergeable(&self) -> bool {
        matches!(&self.plan, ScopePlan::Command(command) if command.select.is_mergeable())
    }
}

/// Aggregates a subquery can reduce to in SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Count,
    Any,
}

impl Aggregate {
    fn from_method(method: &str) -> Option<Self> {
        match method {
            "Count" => Some(Aggregate::Count),
            "Any" => Some(Aggregate::Any),
            _ => None,
        }
    }

    fn operator(self) -> ResultOperator {
        match self {
            Aggregate::Count => ResultOperator::Count,
            Aggregate::Any => ResultOperator::Any,
        }
    }

    fn scalar(self) -> ScalarType {
        match self {
            Aggregate::Count => ScalarType::Int32,
            Aggregate::Any => ScalarType::Bool,
        }
    }
}

/// Outcome of pushing one result operator into SQL.
enum Pushed {
    Server,
    ServerAndClient,
    Client,
}

/// Translates query models into compiled plans.
pub struct RelationalQueryModelVisitor<'c> {
    context: &'c mut QueryCompilationContext,
    metadata: Arc<Model>,
    referenced: HashMap<QuerySourceId, Vec<String>>,
    include_aliases: HashMap<(QuerySourceId, Vec<String>), String>,
}

impl<'c> RelationalQueryModelVisitor<'c> {
    /// Create a visitor bound to a compilation context.
    pub fn new(context: &'c mut QueryCompilationContext) -> Self {
        let metadata = Arc::clone(context.model());
        Self {
            context,
            metadata,
            referenced: HashMap::new(),
            include_aliases: HashMap::new(),
        }
    }

    /// Translate a rewritten and analyzed query model.
    pub fn translate(mut self, query: &QueryModel) -> Result<CompiledPlan> {
        check_includes(query)?;
        self.collect_references(query);
        let plan = self.translate_model(query)?;
        debug!(
            commands = plan.commands().len(),
            client_operators = plan.operators.len(),
            scalar = plan.scalar,
            "query translated"
        );
        Ok(plan)
    }

    /// Record, per source, the properties the query reads from it. A source ranging
    /// over a subquery passes its reads on to the subquery's selected source.
    fn collect_references(&mut self, model: &QueryModel) {
        let mut nested = Vec::new();
        let referenced = &mut self.referenced;
        model.for_each_expression(&mut |expression| {
            expression.walk(&mut |node| {
                if let Some((source, name)) = node.as_source_property() {
                    push_unique(referenced.entry(source.id).or_default(), name);
                }
                if let Expression::SubQuery(inner) = node {
                    nested.push(inner.as_ref());
                }
                true
            })
        });

        for source in model.sources() {
            let Some(inner) = subquery_origin(model, source.id()) else {
                continue;
            };
            if let Some(selected) = inner.selector.as_source() {
                let mut names = self.referenced.get(&source.id()).cloned().unwrap_or_default();
                if names.is_empty() {
                    if let Some(key) = selected
                        .item_type
                        .entity_name()
                        .and_then(|name| self.metadata.entity_type(name))
                        .and_then(|entity| entity.primary_key.first())
                    {
                        names.push(key.clone());
                    }
                }
                let target = self.referenced.entry(selected.id).or_default();
                for name in &names {
                    push_unique(target, name);
                }
            }
            self.collect_references(inner);
        }

        for inner in nested {
            self.collect_references(inner);
        }
    }

    fn translate_model(&mut self, model: &QueryModel) -> Result<CompiledPlan> {
        let main = model.main_from.source.id();
        let mut current = self.translate_source(model, &model.main_from.source, &model.main_from.origin)?;

        for clause in &model.body_clauses {
            current = match clause {
                BodyClause::AdditionalFrom(from) => {
                    let inner = self.translate_source(model, &from.source, &from.origin)?;
                    self.select_many(current, inner, main, from.source.id())?
                }
                BodyClause::Join(join) => {
                    let inner = self.translate_source(model, &join.source, &join.origin)?;
                    self.join(current, inner, join, main)?
                }
                BodyClause::GroupJoin(group) => {
                    let inner = self.translate_source(model, &group.join.source, &group.join.origin)?;
                    self.group_join(current, inner, group, main)?
                }
                BodyClause::Where(predicate) => self.filter(current, predicate)?,
                BodyClause::OrderBy(orderings) => self.order_by(current, orderings)?,
            };
        }

        let selector = self.compile_projection(&model.selector, &mut current)?;
        let (selector, operators, scalar) =
            self.apply_result_operators(&model.result_operators, &mut current, selector)?;

        Ok(CompiledPlan {
            scopes: current.plan,
            selector,
            operators,
            scalar,
        })
    }

    fn translate_source(
        &mut self,
        model: &QueryModel,
        source: &QuerySource,
        origin: &SourceOrigin,
    ) -> Result<Translated> {
        match origin {
            SourceOrigin::EntitySet(name) => self.translate_entity_set(model, source, name),
            SourceOrigin::SubQuery(inner) => self.translate_subquery_source(model, source, inner),
        }
    }

    fn translate_entity_set(
        &mut self,
        model: &QueryModel,
        source: &QuerySource,
        entity_name: &str,
    ) -> Result<Translated> {
        let entity_type = Arc::clone(self.metadata.require_entity_type(entity_name)?);
        let id = source.id();
        let alias = self.alias_for(source, &entity_type);

        let from_sql = model.annotations.iter().find_map(|annotation| match annotation {
            QueryAnnotation::FromSql {
                source,
                sql,
                parameters,
            } if *source == id => Some((sql.as_str(), parameters.as_slice())),
            _ => None,
        });

        let Some((sql, parameters)) = from_sql else {
            let mut select = SelectExpression::new(TableExpression::Table {
                name: entity_type.table.clone(),
                schema: entity_type.schema.clone(),
                alias: alias.clone(),
            });
            let shaper = self.project_source(model, id, &entity_type, &alias, &mut select)?;
            debug!(source = source.item_name(), alias = %alias, "entity set translated");
            return Ok(Translated::command(
                CommandPlan::new(select, vec![shaper]),
                id,
                Binding { alias, entity_type },
            ));
        };

        let (sql, fixed_parameters) = self.bind_sql_parameters(sql, parameters);
        let stands_alone = model.main_from.source.id() == id
            && model.body_clauses.is_empty()
            && model.result_operators.is_empty()
            && include_paths(model, id).is_empty();

        if !is_composable_sql(&sql) || stands_alone {
            let (shaper, columns) = self.by_name_shaper(id, &entity_type)?;
            let mut command = CommandPlan::new(SelectExpression::verbatim(sql), vec![shaper]);
            command.fixed_parameters = fixed_parameters;
            command.by_name = Some(columns);
            debug!(source = source.item_name(), "literal SQL sent as written");
            return Ok(Translated::client(ScopePlan::Command(command)));
        }

        let mut select = SelectExpression::new(TableExpression::RawSql {
            sql,
            alias: alias.clone(),
        });
        let shaper = self.project_source(model, id, &entity_type, &alias, &mut select)?;
        let mut command = CommandPlan::new(select, vec![shaper]);
        command.fixed_parameters = fixed_parameters;
        debug!(source = source.item_name(), alias = %alias, "literal SQL composed as derived table");
        Ok(Translated::command(command, id, Binding { alias, entity_type }))
    }

    fn translate_subquery_source(
        &mut self,
        model: &QueryModel,
        source: &QuerySource,
        inner: &QueryModel,
    ) -> Result<Translated> {
        let plan = self.translate_model(inner)?;
        let inner_main = inner.main_from.source.id();
        let entity_type = source
            .item_type()
            .entity_name()
            .and_then(|name| self.metadata.entity_type(name))
            .cloned();

        let lifted = match (&plan.scopes, &entity_type) {
            (ScopePlan::Command(command), Some(_))
                if plan.operators.is_empty()
                    && !plan.scalar
                    && plan.selector == Projection::Source(inner_main)
                    && command.select.is_composable()
                    && command.by_name.is_none()
                    && command.shapers.len() == 1
                    && command.shapers[0].source() == inner_main
                    && !has_includes(&command.shapers[0]) =>
            {
                liftable_orderings(&command.select)
            }
            _ => None,
        };

        let (Some(orderings), Some(entity_type), ScopePlan::Command(command)) =
            (lifted, entity_type, plan.scopes.clone())
        else {
            debug!(source = source.item_name(), "subquery source evaluated separately");
            return Ok(Translated::client(ScopePlan::SubQuery {
                source: source.id(),
                plan: Box::new(plan),
            }));
        };

        let alias = self.alias_for(source, &entity_type);
        let CommandPlan {
            mut select,
            fixed_parameters,
            ..
        } = command;
        if select.limit.is_none() && select.offset.is_none() {
            select.order_by.clear();
        }

        let mut outer = SelectExpression::new(TableExpression::SubQuery {
            select: Box::new(select),
            alias: alias.clone(),
        });
        outer.order_by = orderings
            .into_iter()
            .map(|(column, direction)| SqlOrdering {
                expression: SqlExpression::column(alias.clone(), column),
                direction,
            })
            .collect();

        let shaper = self.project_source(model, source.id(), &entity_type, &alias, &mut outer)?;
        let mut command = CommandPlan::new(outer, vec![shaper]);
        command.fixed_parameters = fixed_parameters;
        debug!(source = source.item_name(), alias = %alias, "subquery inlined as derived table");
        Ok(Translated::command(command, source.id(), Binding { alias, entity_type }))
    }

    /// Project a source's columns into `select` and build its shaper.
    fn project_source(
        &mut self,
        model: &QueryModel,
        source: QuerySourceId,
        entity_type: &Arc<EntityType>,
        alias: &str,
        select: &mut SelectExpression,
    ) -> Result<Shaper> {
        let offset = select.projection.len();
        if self.context.query_source_requires_materialization(source)? {
            for property in &entity_type.properties {
                select.add_column(SqlExpression::column(alias, property.column.clone()));
            }
            let track = self.context.query_source_requires_tracking(source);
            let mut shaper = EntityShaper::new(source, Arc::clone(entity_type), offset, track);
            self.add_includes(model, source, &mut shaper, alias, select)?;
            trace!(source = source.raw(), offset, track, "entity shaper");
            return Ok(Shaper::Entity(shaper));
        }

        let names = self.projected_properties(source, entity_type);
        for name in &names {
            let property = self.metadata.require_property(&entity_type.name, name)?;
            select.add_column(SqlExpression::column(alias, property.column.clone()));
        }
        trace!(source = source.raw(), offset, columns = names.len(), "value shaper");
        Ok(Shaper::Values(ValueShaper::new(source, offset, names)))
    }

    /// Shaper over a literal SQL result matched by column name.
    fn by_name_shaper(
        &mut self,
        source: QuerySourceId,
        entity_type: &Arc<EntityType>,
    ) -> Result<(Shaper, Vec<String>)> {
        if self.context.query_source_requires_materialization(source)? {
            let columns = entity_type.properties.iter().map(|p| p.column.clone()).collect();
            let track = self.context.query_source_requires_tracking(source);
            let shaper = EntityShaper::new(source, Arc::clone(entity_type), 0, track);
            return Ok((Shaper::Entity(shaper), columns));
        }
        let names = self.projected_properties(source, entity_type);
        let columns = names
            .iter()
            .map(|name| {
                self.metadata
                    .require_property(&entity_type.name, name)
                    .map(|p| p.column.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((Shaper::Values(ValueShaper::new(source, 0, names)), columns))
    }

    /// Properties a value-only source projects, in model order; the first key
    /// property when the query reads none.
    fn projected_properties(&self, source: QuerySourceId, entity_type: &EntityType) -> Vec<String> {
        let referenced = self.referenced.get(&source);
        let names: Vec<String> = entity_type
            .properties
            .iter()
            .filter(|p| referenced.map_or(false, |names| names.contains(&p.name)))
            .map(|p| p.name.clone())
            .collect();
        if !names.is_empty() {
            return names;
        }
        entity_type
            .primary_key
            .first()
            .or_else(|| entity_type.properties.first().map(|p| &p.name))
            .cloned()
            .into_iter()
            .collect()
    }

    fn add_includes(
        &mut self,
        model: &QueryModel,
        owner: QuerySourceId,
        shaper: &mut EntityShaper,
        alias: &str,
        select: &mut SelectExpression,
    ) -> Result<()> {
        for path in include_paths(model, owner) {
            self.add_include_path(owner, shaper, &path, alias, select)?;
            if shaper.track {
                self.context.add_trackable_include(owner, path);
            }
        }
        shaper.trackable_includes = self
            .context
            .trackable_includes(owner)
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        Ok(())
    }

    /// Left-join every navigation on `path` and nest an include shaper per step.
    /// Steps shared with an earlier path reuse its join.
    fn add_include_path(
        &mut self,
        owner: QuerySourceId,
        shaper: &mut EntityShaper,
        path: &[String],
        alias: &str,
        select: &mut SelectExpression,
    ) -> Result<()> {
        let mut current = shaper;
        let mut current_alias = alias.to_string();

        for (depth, name) in path.iter().enumerate() {
            let owner_type = Arc::clone(&current.entity_type);
            let navigation = self.metadata.require_navigation(&owner_type.name, name)?;
            if navigation.kind != NavigationKind::Reference {
                return Err(Error::Translation(format!(
                    "include of collection navigation {}.{name} is not supported",
                    owner_type.name
                )));
            }

            let key = (owner, path[..=depth].to_vec());
            let index = match current.includes.iter().position(|i| i.navigation == *name) {
                Some(index) => index,
                None => {
                    let (Some(fk_name), Some(pk_name)) = (
                        navigation.foreign_key.single_property(),
                        navigation.foreign_key.single_principal_property(),
                    ) else {
                        return Err(Error::Translation(format!(
                            "include of {}.{name} uses a composite foreign key",
                            owner_type.name
                        )));
                    };
                    let target = Arc::clone(self.metadata.require_entity_type(&navigation.target)?);
                    let fk = self.metadata.require_property(&owner_type.name, fk_name)?;
                    let pk = self.metadata.require_property(&target.name, pk_name)?;
                    let target_alias = self.context.unique_alias(&format!("{current_alias}.{name}"));

                    select.joins.push(JoinExpression {
                        kind: SqlJoinKind::LeftOuter,
                        table: TableExpression::Table {
                            name: target.table.clone(),
                            schema: target.schema.clone(),
                            alias: target_alias.clone(),
                        },
                        predicate: Some(SqlExpression::binary(
                            BinaryOp::Equal,
                            SqlExpression::column(current_alias.clone(), fk.column.clone()),
                            SqlExpression::column(target_alias.clone(), pk.column.clone()),
                        )),
                    });
                    let offset = select.projection.len();
                    for property in &target.properties {
                        select.add_column(SqlExpression::column(target_alias.clone(), property.column.clone()));
                    }

                    let related = QuerySource::generated(super::expression::ItemType::Entity(target.name.clone()));
                    let track = current.track;
                    current.includes.push(IncludeShaper {
                        navigation: name.clone(),
                        shaper: EntityShaper::new(related.id(), target, offset, track),
                    });
                    debug!(navigation = %name, alias = %target_alias, "include joined");
                    self.include_aliases.insert(key.clone(), target_alias);
                    current.includes.len() - 1
                }
            };

            current_alias = self
                .include_aliases
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::Translation(format!("include step {name} has no alias")))?;
            current = &mut current.includes[index].shaper;
        }
        Ok(())
    }

    fn select_many(
        &mut self,
        outer: Translated,
        inner: Translated,
        outer_source: QuerySourceId,
        inner_source: QuerySourceId,
    ) -> Result<Translated> {
        if outer.is_mergeable() && inner.is_mergeable() {
            let bindings = merged_bindings(&outer, &inner);
            let (plan, offset) = merge_selects(outer.plan, inner.plan, SqlJoinKind::Cross, None)?;
            let plan = QueryFlattener::new(outer_source, inner_source, offset, FlattenOperator::SelectMany)
                .flatten(plan_select_many(plan))?;
            return Ok(Translated { plan, bindings });
        }
        Ok(Translated::client(ScopePlan::SelectMany {
            outer: Box::new(outer.plan),
            inner: Box::new(inner.plan),
        }))
    }

    fn join(
        &mut self,
        mut outer: Translated,
        mut inner: Translated,
        join: &JoinClause,
        outer_source: QuerySourceId,
    ) -> Result<Translated> {
        let outer_key = self.compile_projection(&join.outer_key, &mut outer)?;
        let inner_key = self.compile_projection(&join.inner_key, &mut inner)?;

        if let Some(on) = self.join_predicate(&outer, &inner, join)? {
            let bindings = merged_bindings(&outer, &inner);
            let kind = sql_join_kind(join.kind);
            let (plans, offset) = merge_selects(outer.plan, inner.plan, kind, Some(on))?;
            let (outer_plan, inner_plan) = plans;
            let plan = ScopePlan::Join {
                outer: Box::new(outer_plan),
                inner: Box::new(inner_plan),
                outer_key,
                inner_key,
                kind: join.kind,
            };
            let plan = QueryFlattener::new(outer_source, join.source.id(), offset, FlattenOperator::Join)
                .flatten(plan)?;
            return Ok(Translated { plan, bindings });
        }

        debug!(source = join.source.item_name(), "join evaluated on the client");
        Ok(Translated::client(ScopePlan::Join {
            outer: Box::new(outer.plan),
            inner: Box::new(inner.plan),
            outer_key,
            inner_key,
            kind: join.kind,
        }))
    }

    fn group_join(
        &mut self,
        mut outer: Translated,
        mut inner: Translated,
        group: &GroupJoinClause,
        outer_source: QuerySourceId,
    ) -> Result<Translated> {
        let join = &group.join;
        let outer_key = self.compile_projection(&join.outer_key, &mut outer)?;
        let inner_key = self.compile_projection(&join.inner_key, &mut inner)?;
        let element = join.source.id();
        let group_source = group.source.id();

        if let Some(on) = self.join_predicate(&outer, &inner, join)? {
            if let (Some(command), SqlExpression::Binary { left, .. }) = (outer.mergeable_command(), &on) {
                command.select.order_by.push(SqlOrdering {
                    expression: left.as_ref().clone(),
                    direction: super::model::OrderDirection::Asc,
                });
            }
            let (plans, offset) = merge_selects(outer.plan, inner.plan, SqlJoinKind::LeftOuter, Some(on))?;
            let (outer_plan, inner_plan) = plans;
            let plan = ScopePlan::GroupJoin {
                outer: Box::new(outer_plan),
                inner: Box::new(inner_plan),
                outer_key,
                inner_key,
                element,
                group: group_source,
            };
            let plan = QueryFlattener::new(
                outer_source,
                element,
                offset,
                FlattenOperator::GroupJoin { group: group_source },
            )
            .flatten(plan)?;
            return Ok(Translated::client(plan));
        }

        debug!(source = group.source.item_name(), "group join evaluated on the client");
        Ok(Translated::client(ScopePlan::GroupJoin {
            outer: Box::new(outer.plan),
            inner: Box::new(inner.plan),
            outer_key,
            inner_key,
            element,
            group: group_source,
        }))
    }

    /// `outer_key = inner_key` in SQL, when both sides can merge.
    fn join_predicate(
        &mut self,
        outer: &Translated,
        inner: &Translated,
        join: &JoinClause,
    ) -> Result<Option<SqlExpression>> {
        if !outer.is_mergeable() || !inner.is_mergeable() {
            return Ok(None);
        }
        let Some(outer_key) = self.translate_sql(&join.outer_key, &outer.bindings)? else {
            return Ok(None);
        };
        let Some(inner_key) = self.translate_sql(&join.inner_key, &inner.bindings)? else {
            return Ok(None);
        };
        Ok(Some(SqlExpression::binary(BinaryOp::Equal, outer_key, inner_key)))
    }

    fn filter(&mut self, mut current: Translated, predicate: &Expression) -> Result<Translated> {
        let mut client = Vec::new();
        for conjunct in conjuncts(predicate) {
            let sql = if current.is_mergeable() {
                self.translate_sql(conjunct, &current.bindings)?
            } else {
                None
            };
            match (sql, current.mergeable_command()) {
                (Some(sql), Some(command)) => command.select.add_predicate(sql),
                _ => client.push(conjunct),
            }
        }

        let Some(first) = client.first() else {
            return Ok(current);
        };
        let mut predicate = self.compile_projection(first, &mut current)?;
        for conjunct in &client[1..] {
            predicate = Projection::Binary {
                op: BinaryOp::And,
                left: Box::new(predicate),
                right: Box::new(self.compile_projection(conjunct, &mut current)?),
            };
        }
        trace!(conjuncts = client.len(), "predicate evaluated on the client");
        Ok(Translated::client(ScopePlan::Filter {
            input: Box::new(current.plan),
            predicate,
        }))
    }

    fn order_by(&mut self, mut current: Translated, orderings: &[Ordering]) -> Result<Translated> {
        if current.is_mergeable() {
            let mut translated = Vec::with_capacity(orderings.len());
            for ordering in orderings {
                match self.translate_sql(&ordering.expression, &current.bindings)? {
                    Some(expression) => translated.push(SqlOrdering {
                        expression,
                        direction: ordering.direction,
                    }),
                    None => break,
                }
            }
            if translated.len() == orderings.len() {
                if let Some(command) = current.mergeable_command() {
                    command.select.prepend_orderings(translated);
                    return Ok(current);
                }
            }
        }

        let mut keys = Vec::with_capacity(orderings.len());
        for ordering in orderings {
            keys.push((
                self.compile_projection(&ordering.expression, &mut current)?,
                ordering.direction,
            ));
        }
        Ok(Translated::client(ScopePlan::OrderBy {
            input: Box::new(current.plan),
            orderings: keys,
        }))
    }

    fn apply_result_operators(
        &mut self,
        operators: &[ResultOperator],
        current: &mut Translated,
        mut selector: Projection,
    ) -> Result<(Projection, Vec<ResultOperator>, bool)> {
        let push_down = self.context.options().push_down_operators;
        let mut client = Vec::new();
        let mut scalar = false;

        for operator in operators {
            scalar |= matches!(
                operator,
                ResultOperator::First
                    | ResultOperator::FirstOrDefault
                    | ResultOperator::Single
                    | ResultOperator::SingleOrDefault
                    | ResultOperator::Count
                    | ResultOperator::Any
            );

            let pushed = match &mut current.plan {
                ScopePlan::Command(command)
                    if push_down && client.is_empty() && command.select.is_composable() =>
                {
                    self.push_operator(*operator, command, &mut selector)
                }
                _ => Pushed::Client,
            };
            match pushed {
                Pushed::Server => trace!(?operator, "result operator pushed down"),
                Pushed::ServerAndClient | Pushed::Client => client.push(*operator),
            }
        }
        Ok((selector, client, scalar))
    }

    fn push_operator(
        &mut self,
        operator: ResultOperator,
        command: &mut CommandPlan,
        selector: &mut Projection,
    ) -> Pushed {
        let select = &mut command.select;
        match operator {
            ResultOperator::Take(count) => {
                select.apply_limit(count);
                Pushed::Server
            }
            ResultOperator::Skip(count) if select.limit.is_none() => {
                select.apply_offset(count);
                Pushed::Server
            }
            ResultOperator::Skip(_) => Pushed::Client,
            ResultOperator::First | ResultOperator::FirstOrDefault | ResultOperator::Any => {
                select.apply_limit(1);
                Pushed::ServerAndClient
            }
            ResultOperator::Single | ResultOperator::SingleOrDefault => {
                select.apply_limit(2);
                Pushed::ServerAndClient
            }
            ResultOperator::Count => {
                if select.limit.is_some() || select.offset.is_some() || select.distinct {
                    let mut inner = std::mem::take(select);
                    if inner.limit.is_none() && inner.offset.is_none() {
                        inner.order_by.clear();
                    }
                    let alias = self.context.unique_alias("t");
                    *select = SelectExpression::new(TableExpression::SubQuery {
                        select: Box::new(inner),
                        alias,
                    });
                } else {
                    select.order_by.clear();
                }
                select.projection = vec![ProjectionColumn {
                    expression: SqlExpression::CountAll,
                    alias: None,
                }];
                command.shapers.clear();
                *selector = Projection::Column {
                    index: 0,
                    scalar: Some(ScalarType::Int32),
                };
                Pushed::Server
            }
            ResultOperator::Distinct => {
                let bare_entity = matches!(
                    (&*selector, command.shapers.as_slice()),
                    (Projection::Source(source), [Shaper::Entity(shaper)])
                        if shaper.source == *source && shaper.includes.is_empty()
                );
                if bare_entity && select.limit.is_none() && select.offset.is_none() {
                    select.distinct = true;
                    Pushed::Server
                } else {
                    Pushed::Client
                }
            }
        }
    }

    /// Compile an expression for evaluation against row scopes.
    fn compile_projection(&mut self, expression: &Expression, current: &mut Translated) -> Result<Projection> {
        Ok(match expression {
            Expression::Constant(value) => Projection::Constant(value.clone()),
            Expression::Parameter(name) => Projection::Parameter(name.clone()),
            Expression::Source(source) => Projection::Source(source.id),
            Expression::Member { target, name } | Expression::Property { target, name } => {
                match target.as_source() {
                    Some(source) => Projection::Property {
                        source: source.id,
                        name: name.clone(),
                    },
                    None => Projection::Member {
                        target: Box::new(self.compile_projection(target, current)?),
                        name: name.clone(),
                    },
                }
            }
            Expression::Convert { operand, to } => Projection::Convert {
                operand: Box::new(self.compile_projection(operand, current)?),
                to: *to,
            },
            Expression::Binary { op, left, right } => Projection::Binary {
                op: *op,
                left: Box::new(self.compile_projection(left, current)?),
                right: Box::new(self.compile_projection(right, current)?),
            },
            Expression::Not(operand) => Projection::Not(Box::new(self.compile_projection(operand, current)?)),
            Expression::Conditional {
                test,
                if_true,
                if_false,
            } => Projection::Conditional {
                test: Box::new(self.compile_projection(test, current)?),
                if_true: Box::new(self.compile_projection(if_true, current)?),
                if_false: Box::new(self.compile_projection(if_false, current)?),
            },
            Expression::MethodCall {
                method,
                target,
                arguments,
            } => {
                if let (Some(aggregate), Some(Expression::SubQuery(inner)), true) = (
                    Aggregate::from_method(method),
                    target.as_deref(),
                    arguments.is_empty(),
                ) {
                    return self.compile_subquery(inner, Some(aggregate), current);
                }
                let target = match target {
                    Some(target) => Some(Box::new(self.compile_projection(target, current)?)),
                    None => None,
                };
                let mut compiled = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    compiled.push(self.compile_projection(argument, current)?);
                }
                Projection::Method {
                    method: method.clone(),
                    target,
                    arguments: compiled,
                }
            }
            Expression::New(members) => {
                let mut compiled = Vec::with_capacity(members.len());
                for (name, member) in members {
                    compiled.push((name.clone(), self.compile_projection(member, current)?));
                }
                Projection::Object(compiled)
            }
            Expression::SubQuery(inner) => match split_aggregate(inner) {
                Some((stripped, aggregate)) => return self.compile_subquery(&stripped, Some(aggregate), current),
                None => return self.compile_subquery(inner, None, current),
            },
            Expression::Lambda { .. } | Expression::Invocation { .. } | Expression::TypeIs { .. } => {
                return Err(Error::Translation(
                    "lambdas, invocations and type tests cannot be evaluated on the client".into(),
                ))
            }
        })
    }

    /// Compile a nested query in client position.
    fn compile_subquery(
        &mut self,
        inner: &QueryModel,
        aggregate: Option<Aggregate>,
        current: &mut Translated,
    ) -> Result<Projection> {
        if !is_correlated(inner) {
            let mut model = inner.clone();
            if let Some(aggregate) = aggregate {
                model.result_operators.push(aggregate.operator());
            }
            let plan = self.translate_model(&model)?;
            return Ok(Projection::SubQuery(Box::new(plan)));
        }

        let Some(aggregate) = aggregate else {
            return Err(Error::Translation(
                "correlated subqueries are only supported as Count or Any".into(),
            ));
        };
        let sql = if current.is_mergeable() {
            self.translate_aggregate_sql(inner, aggregate, &current.bindings)?
        } else {
            None
        };
        match (sql, current.mergeable_command()) {
            (Some(sql), Some(command)) => {
                let index = command.select.add_column(sql);
                Ok(Projection::Column {
                    index,
                    scalar: Some(aggregate.scalar()),
                })
            }
            _ => Err(Error::Translation(
                "correlated subquery could not be translated to SQL".into(),
            )),
        }
    }

    /// Translate an expression to SQL over the bound sources; `None` when it has no
    /// SQL form.
    fn translate_sql(&mut self, expression: &Expression, bindings: &Bindings) -> Result<Option<SqlExpression>> {
        Ok(Some(match expression {
            Expression::Constant(value) => SqlExpression::Literal(value.clone()),
            Expression::Parameter(name) => SqlExpression::Parameter(name.clone()),
            Expression::Member { .. } | Expression::Property { .. } => {
                let Some((source, name)) = expression.as_source_property() else {
                    return Ok(None);
                };
                let Some(binding) = bindings.get(&source.id) else {
                    return Ok(None);
                };
                let Some(property) = binding.entity_type.property(name) else {
                    return Ok(None);
                };
                SqlExpression::column(binding.alias.clone(), property.column.clone())
            }
            Expression::Convert { operand, .. } => return self.translate_sql(operand, bindings),
            Expression::Binary { op, left, right } => {
                if matches!(op, BinaryOp::Equal | BinaryOp::NotEqual) {
                    if let Some(operand) = null_comparison_operand(left, right) {
                        let Some(operand) = self.translate_sql(operand, bindings)? else {
                            return Ok(None);
                        };
                        return Ok(Some(match op {
                            BinaryOp::Equal => SqlExpression::IsNull(Box::new(operand)),
                            _ => SqlExpression::IsNotNull(Box::new(operand)),
                        }));
                    }
                }
                let Some(l) = self.translate_sql(left, bindings)? else {
                    return Ok(None);
                };
                let Some(r) = self.translate_sql(right, bindings)? else {
                    return Ok(None);
                };
                match op {
                    BinaryOp::And | BinaryOp::Or => SqlExpression::binary(*op, l.into_predicate(), r.into_predicate()),
                    BinaryOp::Add if is_string(left, bindings) || is_string(right, bindings) => {
                        SqlExpression::Concat(Box::new(l), Box::new(r))
                    }
                    _ => SqlExpression::binary(*op, l, r),
                }
            }
            Expression::Not(operand) => {
                let Some(operand) = self.translate_sql(operand, bindings)? else {
                    return Ok(None);
                };
                SqlExpression::Not(Box::new(operand.into_predicate()))
            }
            Expression::Conditional {
                test,
                if_true,
                if_false,
            } => {
                let Some(test) = self.translate_sql(test, bindings)? else {
                    return Ok(None);
                };
                let Some(if_true) = self.translate_sql(if_true, bindings)? else {
                    return Ok(None);
                };
                let Some(if_false) = self.translate_sql(if_false, bindings)? else {
                    return Ok(None);
                };
                SqlExpression::Case {
                    test: Box::new(test.into_predicate()),
                    if_true: Box::new(if_true),
                    if_false: Box::new(if_false),
                }
            }
            Expression::MethodCall {
                method,
                target,
                arguments,
            } => {
                let Some(target) = target.as_deref() else {
                    return Ok(None);
                };
                if let (Some(aggregate), Expression::SubQuery(inner), true) =
                    (Aggregate::from_method(method), target, arguments.is_empty())
                {
                    return self.translate_aggregate_sql(inner, aggregate, bindings);
                }
                let Some(operand) = self.translate_sql(target, bindings)? else {
                    return Ok(None);
                };
                match (method.as_str(), arguments.as_slice()) {
                    ("StartsWith" | "EndsWith" | "Contains", [argument]) => {
                        let Some(argument) = self.translate_sql(argument, bindings)? else {
                            return Ok(None);
                        };
                        let (pattern, escape) = like_pattern(method, argument);
                        SqlExpression::Like {
                            operand: Box::new(operand),
                            pattern: Box::new(pattern),
                            escape,
                        }
                    }
                    ("ToUpper", []) => function("UPPER", vec![operand]),
                    ("ToLower", []) => function("LOWER", vec![operand]),
                    ("Trim", []) => function("LTRIM", vec![function("RTRIM", vec![operand])]),
                    _ => return Ok(None),
                }
            }
            Expression::SubQuery(inner) => match split_aggregate(inner) {
                Some((stripped, aggregate)) => return self.translate_aggregate_sql(&stripped, aggregate, bindings),
                None => return Ok(None),
            },
            Expression::Source(_)
            | Expression::New(_)
            | Expression::Lambda { .. }
            | Expression::Invocation { .. }
            | Expression::TypeIs { .. } => return Ok(None),
        }))
    }

    /// `COUNT(*)` or `EXISTS` over a nested query that may refer to outer sources.
    fn translate_aggregate_sql(
        &mut self,
        inner: &QueryModel,
        aggregate: Aggregate,
        outer: &Bindings,
    ) -> Result<Option<SqlExpression>> {
        let only_tracking_annotations = inner
            .annotations
            .iter()
            .all(|a| matches!(a, QueryAnnotation::NoTracking { .. }));
        if !inner.result_operators.is_empty() || !only_tracking_annotations {
            return Ok(None);
        }
        let SourceOrigin::EntitySet(name) = &inner.main_from.origin else {
            return Ok(None);
        };

        let entity_type = Arc::clone(self.metadata.require_entity_type(name)?);
        let alias = self.alias_for(&inner.main_from.source, &entity_type);
        let mut select = SelectExpression::new(TableExpression::Table {
            name: entity_type.table.clone(),
            schema: entity_type.schema.clone(),
            alias: alias.clone(),
        });
        let mut bindings = outer.clone();
        bindings.insert(inner.main_from.source.id(), Binding { alias, entity_type });

        for clause in &inner.body_clauses {
            match clause {
                BodyClause::Where(predicate) => {
                    let Some(predicate) = self.translate_sql(predicate, &bindings)? else {
                        return Ok(None);
                    };
                    select.add_predicate(predicate);
                }
                BodyClause::Join(join) => {
                    let SourceOrigin::EntitySet(name) = &join.origin else {
                        return Ok(None);
                    };
                    let entity_type = Arc::clone(self.metadata.require_entity_type(name)?);
                    let alias = self.alias_for(&join.source, &entity_type);
                    let table = TableExpression::Table {
                        name: entity_type.table.clone(),
                        schema: entity_type.schema.clone(),
                        alias: alias.clone(),
                    };
                    bindings.insert(join.source.id(), Binding { alias, entity_type });
                    let Some(outer_key) = self.translate_sql(&join.outer_key, &bindings)? else {
                        return Ok(None);
                    };
                    let Some(inner_key) = self.translate_sql(&join.inner_key, &bindings)? else {
                        return Ok(None);
                    };
                    select.joins.push(JoinExpression {
                        kind: sql_join_kind(join.kind),
                        table,
                        predicate: Some(SqlExpression::binary(BinaryOp::Equal, outer_key, inner_key)),
                    });
                }
                BodyClause::OrderBy(_) => {}
                BodyClause::AdditionalFrom(_) | BodyClause::GroupJoin(_) => return Ok(None),
            }
        }

        Ok(Some(match aggregate {
            Aggregate::Count => {
                select.add_column(SqlExpression::CountAll);
                SqlExpression::SubQuery(Box::new(select))
            }
            Aggregate::Any => SqlExpression::Exists(Box::new(select)),
        }))
    }

    /// Table alias: the item name, or the table's lowercased initial for generated names.
    fn alias_for(&mut self, source: &QuerySource, entity_type: &EntityType) -> String {
        let preferred = if source.has_generated_name() {
            entity_type
                .table
                .chars()
                .next()
                .map(|c| c.to_lowercase().to_string())
                .unwrap_or_else(|| "t".to_string())
        } else {
            source.item_name().to_string()
        };
        self.context.unique_alias(&preferred)
    }

    /// Replace `{n}` placeholders with parameter names, reusing one name per index.
    fn bind_sql_parameters(&mut self, sql: &str, parameters: &[Value]) -> (String, Vec<(String, Value)>) {
        let mut names: Vec<Option<String>> = vec![None; parameters.len()];
        let mut text = String::with_capacity(sql.len());
        let mut rest = sql;

        while let Some(start) = rest.find('{') {
            text.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let placeholder = after.find('}').and_then(|end| {
                after[..end]
                    .parse::<usize>()
                    .ok()
                    .filter(|index| *index < parameters.len())
                    .map(|index| (index, end))
            });
            match placeholder {
                Some((index, end)) => {
                    let name = match names[index].clone() {
                        Some(name) => name,
                        None => {
                            let name = self.context.parameter_name();
                            names[index] = Some(name.clone());
                            name
                        }
                    };
                    text.push_str(&self.context.dialect().parameter(&name));
                    rest = &after[end + 1..];
                }
                None => {
                    text.push('{');
                    rest = after;
                }
            }
        }
        text.push_str(rest);

        let fixed = names
            .into_iter()
            .zip(parameters)
            .filter_map(|(name, value)| name.map(|name| (name, value.clone())))
            .collect();
        (text, fixed)
    }
}

/// Literal SQL is composable when it is a plain `SELECT`.
pub(crate) fn is_composable_sql(sql: &str) -> bool {
    let trimmed = sql.trim_start();
    trimmed
        .get(..6)
        .map_or(false, |keyword| keyword.eq_ignore_ascii_case("select"))
        && trimmed[6..].starts_with(char::is_whitespace)
}

/// Reject includes on sources backed by non-composable literal SQL.
fn check_includes(query: &QueryModel) -> Result<()> {
    let mut failure = None;
    visit_models(query, &mut |model| {
        for annotation in &model.annotations {
            let QueryAnnotation::Include { source, .. } = annotation else {
                continue;
            };
            let raw = model.annotations.iter().any(|a| {
                matches!(a, QueryAnnotation::FromSql { source: s, sql, .. }
                    if s == source && !is_composable_sql(sql))
            });
            if raw && failure.is_none() {
                let source_name = model
                    .find_source(*source)
                    .map(|s| s.item_name().to_string())
                    .unwrap_or_default();
                failure = Some(Error::IncludeOnRawSql { source_name });
            }
        }
    });
    failure.map_or(Ok(()), Err)
}

fn include_paths(model: &QueryModel, source: QuerySourceId) -> Vec<Vec<String>> {
    model
        .annotations
        .iter()
        .filter_map(|annotation| match annotation {
            QueryAnnotation::Include { source: s, path } if *s == source => Some(path.clone()),
            _ => None,
        })
        .collect()
}

fn has_includes(shaper: &Shaper) -> bool {
    matches!(shaper, Shaper::Entity(entity) if !entity.includes.is_empty())
}

/// Orderings of a nested select expressed as its projected column names.
fn liftable_orderings(select: &SelectExpression) -> Option<Vec<(String, super::model::OrderDirection)>> {
    select
        .order_by
        .iter()
        .map(|ordering| match &ordering.expression {
            SqlExpression::Column { column, .. }
                if select.projection.iter().any(
                    |p| matches!(&p.expression, SqlExpression::Column { column: c, .. } if c == column),
                ) =>
            {
                Some((column.clone(), ordering.direction))
            }
            _ => None,
        })
        .collect()
}

fn merged_bindings(outer: &Translated, inner: &Translated) -> Bindings {
    let mut bindings = outer.bindings.clone();
    bindings.extend(inner.bindings.iter().map(|(k, v)| (*k, v.clone())));
    bindings
}

/// Move the inner select into the outer one, leaving both commands in place for
/// the flattener. Returns the reader offset of the inner columns.
fn merge_selects(
    outer: ScopePlan,
    inner: ScopePlan,
    kind: SqlJoinKind,
    on: Option<SqlExpression>,
) -> Result<((ScopePlan, ScopePlan), usize)> {
    let (ScopePlan::Command(mut outer), ScopePlan::Command(mut inner)) = (outer, inner) else {
        return Err(Error::Translation("only commands can be merged".into()));
    };
    let select = std::mem::take(&mut inner.select);
    let offset = outer.select.merge_join(select, kind, on);
    Ok(((ScopePlan::Command(outer), ScopePlan::Command(inner)), offset))
}

fn plan_select_many((outer, inner): (ScopePlan, ScopePlan)) -> ScopePlan {
    ScopePlan::SelectMany {
        outer: Box::new(outer),
        inner: Box::new(inner),
    }
}

fn sql_join_kind(kind: JoinKind) -> SqlJoinKind {
    match kind {
        JoinKind::Inner => SqlJoinKind::Inner,
        JoinKind::LeftOuter => SqlJoinKind::LeftOuter,
    }
}

fn conjuncts(predicate: &Expression) -> Vec<&Expression> {
    match predicate {
        Expression::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            let mut parts = conjuncts(left);
            parts.extend(conjuncts(right));
            parts
        }
        other => vec![other],
    }
}

fn null_comparison_operand<'e>(left: &'e Expression, right: &'e Expression) -> Option<&'e Expression> {
    match (left, right) {
        (other, Expression::Constant(Value::Null)) | (Expression::Constant(Value::Null), other) => Some(other),
        _ => None,
    }
}

fn is_string(expression: &Expression, bindings: &Bindings) -> bool {
    match expression {
        Expression::Constant(value) => matches!(value, Value::String(_)),
        Expression::Convert { to, .. } => to.scalar == ScalarType::String,
        Expression::Binary {
            op: BinaryOp::Add,
            left,
            right,
        } => is_string(left, bindings) || is_string(right, bindings),
        Expression::MethodCall { method, .. } => matches!(method.as_str(), "ToUpper" | "ToLower" | "Trim"),
        _ => expression
            .as_source_property()
            .and_then(|(source, name)| bindings.get(&source.id)?.entity_type.property(name))
            .map_or(false, |property| property.scalar() == ScalarType::String),
    }
}

const LIKE_ESCAPE: char = '\\';

/// LIKE pattern for a string method. Literal text is escaped so its wildcard
/// characters match themselves.
fn like_pattern(method: &str, argument: SqlExpression) -> (SqlExpression, Option<char>) {
    let wildcard = || SqlExpression::Literal(Value::from("%"));
    if let SqlExpression::Literal(Value::String(text)) = &argument {
        let (text, escape) = escape_like(text);
        let pattern = match method {
            "StartsWith" => format!("{text}%"),
            "EndsWith" => format!("%{text}"),
            _ => format!("%{text}%"),
        };
        return (SqlExpression::Literal(Value::String(pattern)), escape);
    }
    let concat = |l, r| SqlExpression::Concat(Box::new(l), Box::new(r));
    let pattern = match method {
        "StartsWith" => concat(argument, wildcard()),
        "EndsWith" => concat(wildcard(), argument),
        _ => concat(concat(wildcard(), argument), wildcard()),
    };
    (pattern, None)
}

fn escape_like(text: &str) -> (String, Option<char>) {
    if !text.contains(['%', '_', '[', LIKE_ESCAPE]) {
        return (text.to_string(), None);
    }
    let mut escaped = String::with_capacity(text.len() + 2);
    for c in text.chars() {
        if matches!(c, '%' | '_' | '[' | LIKE_ESCAPE) {
            escaped.push(LIKE_ESCAPE);
        }
        escaped.push(c);
    }
    (escaped, Some(LIKE_ESCAPE))
}

fn function(name: &str, arguments: Vec<SqlExpression>) -> SqlExpression {
    SqlExpression::Function {
        name: name.to_string(),
        arguments,
    }
}

/// A nested query ending in `Count` or `Any`, without that operator.
fn split_aggregate(model: &QueryModel) -> Option<(QueryModel, Aggregate)> {
    let aggregate = match model.result_operators.last()? {
        ResultOperator::Count => Aggregate::Count,
        ResultOperator::Any => Aggregate::Any,
        _ => return None,
    };
    let mut stripped = model.clone();
    stripped.result_operators.pop();
    Some((stripped, aggregate))
}

/// Whether a nested query refers to sources it does not define.
fn is_correlated(model: &QueryModel) -> bool {
    let mut defined = HashSet::new();
    let mut referenced = HashSet::new();
    visit_models(model, &mut |m| {
        defined.extend(m.sources().into_iter().map(QuerySource::id));
        m.for_each_expression(&mut |e| referenced.extend(e.referenced_sources()));
    });
    referenced.iter().any(|id| !defined.contains(id))
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    if !names.iter().any(|n| n == name) {
        names.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::QueryOptions;
    use crate::dialect::{SqlDialect, SqlServerDialect};
    use crate::metadata::{Navigation, Property};
    use crate::query::context::ExecutionMode;
    use crate::query::expression::ItemType;
    use crate::query::model::OrderDirection;

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

    fn translate(query: QueryModel) -> Result<CompiledPlan> {
        let dialect: Arc<dyn SqlDialect> = Arc::new(SqlServerDialect::new());
        let mut context = QueryCompilationContext::new(create_test_model(), Arc::clone(&dialect), QueryOptions::default());
        context.initialize(ExecutionMode::Sync)?;
        let mut query = query;
        context.rewrite_navigations(&mut query)?;
        context.find_query_sources_requiring_materialization(&query);
        let mut plan = context.create_query_model_visitor().translate(&query)?;
        plan.finalize(dialect.as_ref())?;
        Ok(plan)
    }

    fn sql(plan: &CompiledPlan) -> Vec<String> {
        plan.commands()
            .iter()
            .map(|c| c.sql().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_entity_query_projects_every_column() {
        let c = QuerySource::entity("c", "Customer");
        let plan = translate(
            QueryModel::from_entity(&c)
                .filter(c.member("City").equal(Expression::constant("London")))
                .order_by(c.member("CustomerID"), OrderDirection::Asc),
        )
        .unwrap();

        assert_eq!(
            sql(&plan),
            vec![
                "SELECT [c].[CustomerID], [c].[City]\n\
                 FROM [Customers] AS [c]\n\
                 WHERE [c].[City] = N'London'\n\
                 ORDER BY [c].[CustomerID]"
                    .to_string()
            ]
        );
        assert!(plan.operators.is_empty());
    }

    #[test]
    fn test_value_projection_reads_referenced_columns() {
        let c = QuerySource::entity("c", "Customer");
        let plan = translate(QueryModel::from_entity(&c).select(c.member("City"))).unwrap();

        assert_eq!(sql(&plan), vec!["SELECT [c].[City]\nFROM [Customers] AS [c]".to_string()]);
        let command = plan.scopes.as_command().unwrap();
        assert!(matches!(&command.shapers[0], Shaper::Values(v) if v.names.len() == 1));
    }

    #[test]
    fn test_navigation_becomes_left_join() {
        let o = QuerySource::entity("o", "Order");
        let plan = translate(QueryModel::from_entity(&o).select(o.member("Customer").member("City"))).unwrap();

        assert_eq!(
            sql(&plan),
            vec![
                "SELECT [o].[CustomerID], [o.Customer].[CustomerID], [o.Customer].[City]\n\
                 FROM [Orders] AS [o]\n\
                 LEFT JOIN [Customers] AS [o.Customer] ON [o].[CustomerID] = [o.Customer].[CustomerID]"
                    .to_string()
            ]
        );
        let command = plan.scopes.as_command().unwrap();
        assert_eq!(command.shapers.len(), 2);
        assert_eq!(command.shapers[1].offset(), 1);
    }

    #[test]
    fn test_like_escapes_wildcards_in_literal_text() {
        let c = QuerySource::entity("c", "Customer");
        let starts_with = |text: &str| {
            translate(
                QueryModel::from_entity(&c)
                    .filter(c.member("City").call("StartsWith", vec![Expression::constant(text)])),
            )
            .unwrap()
        };

        let plain = sql(&starts_with("Ber"));
        assert!(plain[0].ends_with("WHERE [c].[City] LIKE N'Ber%'"), "{}", plain[0]);

        let wild = sql(&starts_with("50%_off[1]\\"));
        assert!(
            wild[0].ends_with("WHERE [c].[City] LIKE N'50\\%\\_off\\[1]\\\\%' ESCAPE N'\\'"),
            "{}",
            wild[0]
        );
    }

    #[test]
    fn test_count_pushed_down() {
        let c = QuerySource::entity("c", "Customer");
        let plan = translate(QueryModel::from_entity(&c).with_result_operator(ResultOperator::Count)).unwrap();

        assert_eq!(sql(&plan), vec!["SELECT COUNT(*)\nFROM [Customers] AS [c]".to_string()]);
        assert!(plan.scalar);
        assert!(plan.operators.is_empty());
    }

    #[test]
    fn test_first_limits_and_keeps_client_operator() {
        let c = QuerySource::entity("c", "Customer");
        let plan = translate(QueryModel::from_entity(&c).with_result_operator(ResultOperator::First)).unwrap();

        assert!(sql(&plan)[0].starts_with("SELECT TOP(1) "));
        assert_eq!(plan.operators, vec![ResultOperator::First]);
    }

    #[test]
    fn test_group_join_is_regrouped() {
        let c = QuerySource::entity("c", "Customer");
        let o = QuerySource::entity("o", "Order");
        let g = QuerySource::new("g", ItemType::Group("Order".into()));
        let plan = translate(
            QueryModel::from_entity(&c)
                .group_join(&g, &o, c.member("CustomerID"), o.member("CustomerID"))
                .select(Expression::new_object(vec![("customer", c.reference()), ("orders", g.reference())])),
        )
        .unwrap();

        assert!(matches!(plan.scopes, ScopePlan::Regroup { .. }));
        assert_eq!(
            sql(&plan),
            vec![
                "SELECT [c].[CustomerID], [c].[City], [o].[OrderID], [o].[CustomerID]\n\
                 FROM [Customers] AS [c]\n\
                 LEFT JOIN [Orders] AS [o] ON [c].[CustomerID] = [o].[CustomerID]\n\
                 ORDER BY [c].[CustomerID]"
                    .to_string()
            ]
        );
    }

    #[test]
    fn test_correlated_count_becomes_scalar_subquery() {
        let c = QuerySource::entity("c", "Customer");
        let o = QuerySource::entity("o", "Order");
        let orders = QueryModel::from_entity(&o).filter(o.member("CustomerID").equal(c.member("CustomerID")));
        let plan = translate(
            QueryModel::from_entity(&c).select(Expression::new_object(vec![
                ("city", c.member("City")),
                ("orders", Expression::subquery(orders).call("Count", vec![])),
            ])),
        )
        .unwrap();

        let text = &sql(&plan)[0];
        assert!(text.contains("SELECT COUNT(*)"), "{text}");
        assert!(text.contains("WHERE [o].[CustomerID] = [c].[CustomerID]"), "{text}");
        assert_eq!(plan.commands().len(), 1);
    }

    #[test]
    fn test_literal_sql_parameters() {
        let c = QuerySource::entity("c", "Customer");
        let plan = translate(
            QueryModel::from_entity(&c)
                .from_sql(&c, "SELECT * FROM Customers WHERE City = {0}", vec![Value::from("London")])
                .filter(c.member("CustomerID").not_equal(Expression::constant(Value::Null))),
        )
        .unwrap();

        let command = plan.scopes.as_command().unwrap();
        assert_eq!(
            command.sql().unwrap(),
            "SELECT [c].[CustomerID], [c].[City]\n\
             FROM (\n    SELECT * FROM Customers WHERE City = @p0\n) AS [c]\n\
             WHERE [c].[CustomerID] IS NOT NULL"
        );
        assert_eq!(command.fixed_parameters, vec![("p0".to_string(), Value::from("London"))]);
    }

    #[test]
    fn test_composable_sql_detection() {
        assert!(is_composable_sql("  select * from Customers"));
        assert!(is_composable_sql("SELECT\n*"));
        assert!(!is_composable_sql("SELECTED"));
        assert!(!is_composable_sql("EXEC GetCustomers"));
        assert!(!is_composable_sql("é"));
    }

    #[test]
    fn test_include_on_stored_procedure_rejected() {
        let o = QuerySource::entity("o", "Order");
        let err = translate(
            QueryModel::from_entity(&o)
                .from_sql(&o, "EXEC GetOrders", vec![])
                .include(&o, &["Customer"]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::IncludeOnRawSql { source_name } if source_name == "o"));
    }
}

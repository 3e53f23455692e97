//! Compiled query plans and their in-memory evaluation.
//!
//! A plan is a tree of [`ScopePlan`] nodes producing row scopes, a selector producing
//! one result per scope, and the result operators left to the client. Commands are
//! the only leaves that talk to the database; everything above them runs in memory
//! over the rows they return.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use relmap_proto::{SqlCommand, Value};
use tracing::debug;

use crate::dialect::SqlDialect;
use crate::error::{Error, Result};

use super::model::{JoinKind, OrderDirection, QuerySourceId, ResultOperator};
use super::projection::{compare_values, results_equal, truth, Projection};
use super::select::SelectExpression;
use super::shaper::{
    hash_value, values_identical, ChangeTracker, IdentityMap, RowScope, ShapedResult, Shaper,
    ShapingContext, SourceValue, ValueBuffer,
};
use super::sql::QuerySqlGenerator;

/// How a rendered parameter gets its value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterBinding {
    /// Value fixed at compile time (literal SQL arguments).
    Fixed { name: String, value: Value },
    /// Value supplied per execution under `key`.
    Runtime { name: String, key: String },
}

/// SQL text and parameter bindings of one command.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedCommand {
    pub sql: String,
    pub parameters: Vec<ParameterBinding>,
}

impl RenderedCommand {
    /// Bind parameter values for one execution.
    pub fn bind(&self, parameters: &HashMap<String, Value>) -> Result<SqlCommand> {
        let mut command = SqlCommand::new(self.sql.clone());
        for binding in &self.parameters {
            match binding {
                ParameterBinding::Fixed { name, value } => command.bind(name.clone(), value.clone())?,
                ParameterBinding::Runtime { name, key } => {
                    let value = parameters
                        .get(key)
                        .cloned()
                        .ok_or_else(|| Error::MissingParameter(key.clone()))?;
                    command.bind(name.clone(), value)?;
                }
            }
        }
        Ok(command)
    }
}

/// One SQL round trip plus the shapers reading its rows.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPlan {
    pub id: usize,
    pub select: SelectExpression,
    pub shapers: Vec<Shaper>,
    /// Literal SQL arguments, by unprefixed parameter name.
    pub fixed_parameters: Vec<(String, Value)>,
    /// Reorder reader columns to these names before shaping.
    pub by_name: Option<Vec<String>>,
    pub rendered: Option<RenderedCommand>,
}

impl CommandPlan {
    /// A command over a select with its shapers.
    pub fn new(select: SelectExpression, shapers: Vec<Shaper>) -> Self {
        Self {
            id: 0,
            select,
            shapers,
            fixed_parameters: Vec::new(),
            by_name: None,
            rendered: None,
        }
    }

    /// SQL text, once rendered.
    pub fn sql(&self) -> Option<&str> {
        self.rendered.as_ref().map(|r| r.sql.as_str())
    }

    /// Render through a dialect.
    pub fn render(&mut self, dialect: &dyn SqlDialect) {
        let generated = QuerySqlGenerator::new(dialect).generate(&self.select);
        let mut parameters: Vec<ParameterBinding> = self
            .fixed_parameters
            .iter()
            .map(|(name, value)| ParameterBinding::Fixed {
                name: dialect.parameter(name),
                value: value.clone(),
            })
            .collect();
        for name in generated.parameters {
            if self.fixed_parameters.iter().all(|(fixed, _)| *fixed != name) {
                parameters.push(ParameterBinding::Runtime {
                    name: dialect.parameter(&name),
                    key: name,
                });
            }
        }
        self.rendered = Some(RenderedCommand {
            sql: generated.text,
            parameters,
        });
    }

    /// Reorder a reader row to the expected columns.
    pub(crate) fn column_map(&self, columns: &[String]) -> Result<Option<Vec<usize>>> {
        let Some(expected) = &self.by_name else {
            return Ok(None);
        };
        expected
            .iter()
            .map(|name| {
                columns
                    .iter()
                    .position(|c| c.eq_ignore_ascii_case(name))
                    .ok_or_else(|| {
                        Error::ResultShape(format!("required column '{name}' was not present in the results"))
                    })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Shape one row into a scope.
    pub fn shape_row(&self, row: Vec<Value>, cx: &mut ShapingContext<'_>) -> Result<RowScope> {
        let buffer = ValueBuffer::new(row);
        let mut scope = RowScope::for_row(buffer.clone());
        for shaper in &self.shapers {
            shaper.shape(&buffer, &mut scope, cx)?;
        }
        Ok(scope)
    }
}

/// Producer of row scopes.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopePlan {
    Command(CommandPlan),
    /// A nested query evaluated separately; each result is bound to `source`.
    SubQuery {
        source: QuerySourceId,
        plan: Box<CompiledPlan>,
    },
    /// Cross product.
    SelectMany {
        outer: Box<ScopePlan>,
        inner: Box<ScopePlan>,
    },
    /// Hash join on client-evaluated keys.
    Join {
        outer: Box<ScopePlan>,
        inner: Box<ScopePlan>,
        outer_key: Projection,
        inner_key: Projection,
        kind: JoinKind,
    },
    /// Hash group join; `element` values of the matches are bound to `group`.
    GroupJoin {
        outer: Box<ScopePlan>,
        inner: Box<ScopePlan>,
        outer_key: Projection,
        inner_key: Projection,
        element: QuerySourceId,
        group: QuerySourceId,
    },
    Filter {
        input: Box<ScopePlan>,
        predicate: Projection,
    },
    OrderBy {
        input: Box<ScopePlan>,
        orderings: Vec<(Projection, OrderDirection)>,
    },
    /// Rebuild groups from a flattened left join.
    Regroup {
        input: Box<ScopePlan>,
        outer_sources: Vec<QuerySourceId>,
        element: QuerySourceId,
        group: QuerySourceId,
    },
}

impl ScopePlan {
    /// Sources bound by the scopes this plan produces.
    pub fn sources(&self) -> Vec<QuerySourceId> {
        match self {
            ScopePlan::Command(command) => command.shapers.iter().map(Shaper::source).collect(),
            ScopePlan::SubQuery { source, .. } => vec![*source],
            ScopePlan::SelectMany { outer, inner } | ScopePlan::Join { outer, inner, .. } => {
                let mut sources = outer.sources();
                sources.extend(inner.sources());
                sources
            }
            ScopePlan::GroupJoin { outer, group, .. } => {
                let mut sources = outer.sources();
                sources.push(*group);
                sources
            }
            ScopePlan::Filter { input, .. } | ScopePlan::OrderBy { input, .. } => input.sources(),
            ScopePlan::Regroup {
                outer_sources,
                group,
                ..
            } => {
                let mut sources = outer_sources.clone();
                sources.push(*group);
                sources
            }
        }
    }

    /// The single command, if the whole plan is one.
    pub fn as_command(&self) -> Option<&CommandPlan> {
        match self {
            ScopePlan::Command(command) => Some(command),
            _ => None,
        }
    }

    fn for_each_command<'a>(&'a self, f: &mut dyn FnMut(&'a CommandPlan)) {
        match self {
            ScopePlan::Command(command) => f(command),
            ScopePlan::SubQuery { plan, .. } => plan.for_each_command(f),
            ScopePlan::SelectMany { outer, inner } => {
                outer.for_each_command(f);
                inner.for_each_command(f);
            }
            ScopePlan::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                ..
            }
            | ScopePlan::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                ..
            } => {
                outer.for_each_command(f);
                inner.for_each_command(f);
                outer_key.for_each_plan(&mut |p| p.for_each_command(f));
                inner_key.for_each_plan(&mut |p| p.for_each_command(f));
            }
            ScopePlan::Filter { input, predicate } => {
                input.for_each_command(f);
                predicate.for_each_plan(&mut |p| p.for_each_command(f));
            }
            ScopePlan::OrderBy { input, orderings } => {
                input.for_each_command(f);
                for (key, _) in orderings {
                    key.for_each_plan(&mut |p| p.for_each_command(f));
                }
            }
            ScopePlan::Regroup { input, .. } => input.for_each_command(f),
        }
    }

    fn for_each_command_mut(&mut self, f: &mut dyn FnMut(&mut CommandPlan) -> Result<()>) -> Result<()> {
        match self {
            ScopePlan::Command(command) => f(command),
            ScopePlan::SubQuery { plan, .. } => plan.for_each_command_mut(f),
            ScopePlan::SelectMany { outer, inner } => {
                outer.for_each_command_mut(f)?;
                inner.for_each_command_mut(f)
            }
            ScopePlan::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                ..
            }
            | ScopePlan::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                ..
            } => {
                outer.for_each_command_mut(f)?;
                inner.for_each_command_mut(f)?;
                outer_key.for_each_plan_mut(&mut |p| p.for_each_command_mut(f))?;
                inner_key.for_each_plan_mut(&mut |p| p.for_each_command_mut(f))
            }
            ScopePlan::Filter { input, predicate } => {
                input.for_each_command_mut(f)?;
                predicate.for_each_plan_mut(&mut |p| p.for_each_command_mut(f))
            }
            ScopePlan::OrderBy { input, orderings } => {
                input.for_each_command_mut(f)?;
                for (key, _) in orderings {
                    key.for_each_plan_mut(&mut |p| p.for_each_command_mut(f))?;
                }
                Ok(())
            }
            ScopePlan::Regroup { input, .. } => input.for_each_command_mut(f),
        }
    }
}

/// A translated query.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPlan {
    pub scopes: ScopePlan,
    pub selector: Projection,
    /// Result operators evaluated on the client, in order.
    pub operators: Vec<ResultOperator>,
    /// The query reduces to a single value (`Count`, `First`, ...).
    pub scalar: bool,
}

impl CompiledPlan {
    /// Every command in evaluation order, nested plans included.
    pub fn commands(&self) -> Vec<&CommandPlan> {
        let mut commands = Vec::new();
        self.for_each_command(&mut |c| commands.push(c));
        commands
    }

    fn for_each_command<'a>(&'a self, f: &mut dyn FnMut(&'a CommandPlan)) {
        self.scopes.for_each_command(f);
        self.selector.for_each_plan(&mut |p| p.for_each_command(f));
    }

    pub(crate) fn for_each_command_mut(
        &mut self,
        f: &mut dyn FnMut(&mut CommandPlan) -> Result<()>,
    ) -> Result<()> {
        self.scopes.for_each_command_mut(f)?;
        self.selector
            .for_each_plan_mut(&mut |p| p.for_each_command_mut(f))
    }

    /// Number commands and render their SQL.
    pub fn finalize(&mut self, dialect: &dyn SqlDialect) -> Result<()> {
        let mut next = 0;
        self.for_each_command_mut(&mut |command| {
            command.id = next;
            next += 1;
            command.render(dialect);
            debug!(command = command.id, sql = command.sql().unwrap_or_default(), "rendered query command");
            Ok(())
        })
    }

    /// Whether rows can stream straight from one command without buffering.
    pub fn is_streaming(&self) -> bool {
        let mut nested = false;
        self.selector.for_each_plan(&mut |_| nested = true);
        self.scopes.as_command().is_some()
            && !nested
            && self
                .operators
                .iter()
                .all(|op| matches!(op, ResultOperator::Take(_) | ResultOperator::Skip(_)))
    }
}

/// Rows of every command of a plan, fetched before evaluation.
#[derive(Debug, Default)]
pub struct FetchedRows {
    rows: HashMap<usize, Vec<Vec<Value>>>,
}

impl FetchedRows {
    /// Record the rows of one command, reordered to the command's expected columns.
    pub fn insert(&mut self, command: &CommandPlan, columns: &[String], rows: Vec<Vec<Value>>) -> Result<()> {
        let rows = match command.column_map(columns)? {
            Some(map) => rows
                .into_iter()
                .map(|row| map.iter().map(|&i| row.get(i).cloned().unwrap_or(Value::Null)).collect())
                .collect(),
            None => rows,
        };
        self.rows.insert(command.id, rows);
        Ok(())
    }

    fn get(&self, id: usize) -> Result<&[Vec<Value>]> {
        self.rows
            .get(&id)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::ResultShape(format!("no rows fetched for command {id}")))
    }
}

/// In-memory evaluation state of one execution.
pub struct Evaluator {
    fetched: Arc<FetchedRows>,
    identity_map: IdentityMap,
    tracker: Arc<ChangeTracker>,
    parameters: Arc<HashMap<String, Value>>,
}

impl Evaluator {
    /// Create an evaluator with a fresh identity map.
    pub fn new(
        fetched: Arc<FetchedRows>,
        tracker: Arc<ChangeTracker>,
        parameters: Arc<HashMap<String, Value>>,
    ) -> Self {
        Self {
            fetched,
            identity_map: IdentityMap::new(),
            tracker,
            parameters,
        }
    }

    /// Value of an execution parameter.
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Shape one command row.
    pub fn shape_row(&mut self, command: &CommandPlan, row: Vec<Value>) -> Result<RowScope> {
        let mut cx = ShapingContext {
            identity_map: &mut self.identity_map,
            tracker: &self.tracker,
        };
        command.shape_row(row, &mut cx)
    }

    /// Evaluate a whole plan.
    pub fn evaluate_plan(&mut self, plan: &CompiledPlan) -> Result<Vec<ShapedResult>> {
        let scopes = self.evaluate_scopes(&plan.scopes)?;
        let results = scopes
            .iter()
            .map(|scope| plan.selector.evaluate(scope, self))
            .collect::<Result<Vec<_>>>()?;
        apply_operators(results, &plan.operators)
    }

    fn evaluate_scopes(&mut self, plan: &ScopePlan) -> Result<Vec<RowScope>> {
        match plan {
            ScopePlan::Command(command) => {
                let fetched = Arc::clone(&self.fetched);
                fetched
                    .get(command.id)?
                    .iter()
                    .map(|row| self.shape_row(command, row.clone()))
                    .collect()
            }
            ScopePlan::SubQuery { source, plan } => Ok(self
                .evaluate_plan(plan)?
                .into_iter()
                .map(|result| {
                    let mut scope = RowScope::default();
                    scope.bind(*source, SourceValue::from(result));
                    scope
                })
                .collect()),
            ScopePlan::SelectMany { outer, inner } => {
                let outer = self.evaluate_scopes(outer)?;
                let inner = self.evaluate_scopes(inner)?;
                Ok(outer
                    .iter()
                    .flat_map(|o| inner.iter().map(move |i| o.merged(i)))
                    .collect())
            }
            ScopePlan::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                kind,
            } => {
                let inner_sources = inner.sources();
                let outer = self.evaluate_scopes(outer)?;
                let inner = self.evaluate_scopes(inner)?;
                let lookup = self.build_lookup(&inner, inner_key)?;

                let mut joined = Vec::new();
                for o in &outer {
                    let matches = self.probe(&lookup, o, outer_key)?;
                    if matches.is_empty() && *kind == JoinKind::LeftOuter {
                        let mut scope = o.clone();
                        for source in &inner_sources {
                            scope.bind(*source, SourceValue::Absent);
                        }
                        joined.push(scope);
                    }
                    joined.extend(matches.iter().map(|&i| o.merged(&inner[i])));
                }
                Ok(joined)
            }
            ScopePlan::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                element,
                group,
            } => {
                let outer = self.evaluate_scopes(outer)?;
                let inner = self.evaluate_scopes(inner)?;
                let lookup = self.build_lookup(&inner, inner_key)?;

                let mut grouped = Vec::with_capacity(outer.len());
                for o in outer {
                    let items = self
                        .probe(&lookup, &o, outer_key)?
                        .into_iter()
                        .filter_map(|i| element_of(&inner[i], *element))
                        .collect();
                    let mut scope = o;
                    scope.bind(*group, SourceValue::Group(items));
                    grouped.push(scope);
                }
                Ok(grouped)
            }
            ScopePlan::Filter { input, predicate } => {
                let mut kept = Vec::new();
                for scope in self.evaluate_scopes(input)? {
                    if truth(&predicate.evaluate(&scope, self)?)? == Some(true) {
                        kept.push(scope);
                    }
                }
                Ok(kept)
            }
            ScopePlan::OrderBy { input, orderings } => {
                let scopes = self.evaluate_scopes(input)?;
                let mut keyed = Vec::with_capacity(scopes.len());
                for scope in scopes {
                    let keys = orderings
                        .iter()
                        .map(|(key, _)| key.evaluate(&scope, self))
                        .collect::<Result<Vec<_>>>()?;
                    keyed.push((keys, scope));
                }
                keyed.sort_by(|(a, _), (b, _)| {
                    for ((x, y), (_, direction)) in a.iter().zip(b).zip(orderings) {
                        let ordering = compare_results(x, y);
                        let ordering = match direction {
                            OrderDirection::Asc => ordering,
                            OrderDirection::Desc => ordering.reverse(),
                        };
                        if ordering != CmpOrdering::Equal {
                            return ordering;
                        }
                    }
                    CmpOrdering::Equal
                });
                Ok(keyed.into_iter().map(|(_, scope)| scope).collect())
            }
            ScopePlan::Regroup {
                input,
                outer_sources,
                element,
                group,
            } => {
                let scopes = self.evaluate_scopes(input)?;
                let mut groups: Vec<(RowScope, Vec<ShapedResult>)> = Vec::new();
                let mut index: HashMap<Vec<GroupKey>, usize> = HashMap::new();
                for scope in scopes {
                    let item = element_of(&scope, *element);
                    let key: Option<Vec<GroupKey>> = outer_sources
                        .iter()
                        .map(|source| GroupKey::of(scope.get(*source)))
                        .collect();
                    let position = match key {
                        Some(key) => match index.get(&key) {
                            Some(&position) => position,
                            None => {
                                index.insert(key, groups.len());
                                groups.push((scope.project(outer_sources), Vec::new()));
                                groups.len() - 1
                            }
                        },
                        None => {
                            groups.push((scope.project(outer_sources), Vec::new()));
                            groups.len() - 1
                        }
                    };
                    if let Some(item) = item {
                        groups[position].1.push(item);
                    }
                }
                Ok(groups
                    .into_iter()
                    .map(|(mut scope, items)| {
                        scope.bind(*group, SourceValue::Group(items));
                        scope
                    })
                    .collect())
            }
        }
    }

    fn build_lookup(&mut self, inner: &[RowScope], key: &Projection) -> Result<HashMap<JoinKey, Vec<usize>>> {
        let mut lookup: HashMap<JoinKey, Vec<usize>> = HashMap::new();
        for (i, scope) in inner.iter().enumerate() {
            if let Some(key) = JoinKey::new(key.evaluate(scope, self)?) {
                lookup.entry(key).or_default().push(i);
            }
        }
        Ok(lookup)
    }

    fn probe(
        &mut self,
        lookup: &HashMap<JoinKey, Vec<usize>>,
        scope: &RowScope,
        key: &Projection,
    ) -> Result<Vec<usize>> {
        Ok(JoinKey::new(key.evaluate(scope, self)?)
            .and_then(|key| lookup.get(&key).cloned())
            .unwrap_or_default())
    }
}

fn element_of(scope: &RowScope, element: QuerySourceId) -> Option<ShapedResult> {
    match scope.get(element)? {
        SourceValue::Entity(entity) => Some(ShapedResult::Entity(entity.clone())),
        SourceValue::Absent => None,
        SourceValue::Row(row) => Some(ShapedResult::Object(
            row.names()
                .iter()
                .cloned()
                .zip(row.values().iter().cloned().map(ShapedResult::Scalar))
                .collect(),
        )),
        SourceValue::Group(items) => Some(ShapedResult::Collection(items.clone())),
        SourceValue::Shaped(result) => Some(result.clone()),
    }
}

fn compare_results(a: &ShapedResult, b: &ShapedResult) -> CmpOrdering {
    match (a.as_scalar(), b.as_scalar()) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(CmpOrdering::Equal),
        _ => match (a.is_absent(), b.is_absent()) {
            (true, false) => CmpOrdering::Less,
            (false, true) => CmpOrdering::Greater,
            _ => CmpOrdering::Equal,
        },
    }
}

/// Identity of an outer source within a regrouped row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Entity(super::shaper::EntityKey),
    Row(RowKey),
    Absent,
}

impl GroupKey {
    fn of(value: Option<&SourceValue>) -> Option<Self> {
        match value? {
            SourceValue::Entity(entity) => Some(GroupKey::Entity(entity.key().clone())),
            SourceValue::Row(row) => Some(GroupKey::Row(RowKey(row.values().to_vec()))),
            SourceValue::Absent => Some(GroupKey::Absent),
            SourceValue::Group(_) | SourceValue::Shaped(_) => None,
        }
    }
}

/// Projected values of an unmaterialized source. NULLs compare equal here.
#[derive(Debug, Clone)]
struct RowKey(Vec<Value>);

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| values_identical(a, b))
    }
}

impl Eq for RowKey {}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for value in &self.0 {
            hash_value(value, state);
        }
    }
}

/// Hashable join key. NULL keys never match.
#[derive(Debug, Clone)]
struct JoinKey(ShapedResult);

impl JoinKey {
    fn new(result: ShapedResult) -> Option<Self> {
        match result {
            ShapedResult::Absent | ShapedResult::Scalar(Value::Null) => None,
            other => Some(JoinKey(normalize(other))),
        }
    }
}

fn normalize(result: ShapedResult) -> ShapedResult {
    match result {
        ShapedResult::Scalar(Value::Int32(i)) => ShapedResult::Scalar(Value::Int64(i as i64)),
        ShapedResult::Scalar(Value::Float32(f)) => ShapedResult::Scalar(Value::Float64(f as f64)),
        ShapedResult::Object(fields) => {
            ShapedResult::Object(fields.into_iter().map(|(n, v)| (n, normalize(v))).collect())
        }
        other => other,
    }
}

impl PartialEq for JoinKey {
    fn eq(&self, other: &Self) -> bool {
        results_equal(&self.0, &other.0)
    }
}

impl Eq for JoinKey {}

impl Hash for JoinKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_result(&self.0, state);
    }
}

fn hash_result<H: Hasher>(result: &ShapedResult, state: &mut H) {
    std::mem::discriminant(result).hash(state);
    match result {
        ShapedResult::Scalar(value) => hash_value(value, state),
        ShapedResult::Entity(entity) => entity.key().hash(state),
        ShapedResult::Absent => {}
        ShapedResult::Object(fields) => {
            for (name, value) in fields {
                name.hash(state);
                hash_result(value, state);
            }
        }
        ShapedResult::Collection(items) => items.iter().for_each(|i| hash_result(i, state)),
    }
}

/// Apply result operators to an evaluated sequence.
pub fn apply_operators(mut results: Vec<ShapedResult>, operators: &[ResultOperator]) -> Result<Vec<ShapedResult>> {
    for operator in operators {
        results = match operator {
            ResultOperator::Take(n) => results.into_iter().take(*n as usize).collect(),
            ResultOperator::Skip(n) => results.into_iter().skip(*n as usize).collect(),
            ResultOperator::First => vec![results.into_iter().next().ok_or(Error::NoElements)?],
            ResultOperator::FirstOrDefault => {
                vec![results.into_iter().next().unwrap_or(ShapedResult::Absent)]
            }
            ResultOperator::Single | ResultOperator::SingleOrDefault => {
                let mut iter = results.into_iter();
                let single = match (iter.next(), iter.next()) {
                    (Some(_), Some(_)) => return Err(Error::MoreThanOneElement),
                    (Some(single), None) => single,
                    (None, _) if *operator == ResultOperator::Single => return Err(Error::NoElements),
                    (None, _) => ShapedResult::Absent,
                };
                vec![single]
            }
            ResultOperator::Count => vec![ShapedResult::Scalar(Value::Int32(results.len() as i32))],
            ResultOperator::Any => vec![ShapedResult::Scalar(Value::Bool(!results.is_empty()))],
            ResultOperator::Distinct => {
                let mut distinct: Vec<ShapedResult> = Vec::with_capacity(results.len());
                for result in results {
                    if !distinct.contains(&result) {
                        distinct.push(result);
                    }
                }
                distinct
            }
        };
    }
    Ok(results)
}

//! Flattening of merged commands.
//!
//! When the translator joins two commands into one SQL select, the plan still holds
//! the join node with both commands below it. [`QueryFlattener`] replaces that node by
//! a single command: the outer shapers keep their offsets, the inner shapers move to
//! the right by the reader offset, and the inner command is dropped. A flattened group
//! join is wrapped in a regroup step because the joined stream has lost its group
//! boundaries.

use tracing::trace;

use crate::error::{Error, Result};

use super::model::QuerySourceId;
use super::plan::{CommandPlan, ScopePlan};

/// The operator being flattened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenOperator {
    SelectMany,
    Join,
    GroupJoin { group: QuerySourceId },
}

/// Merges the operator node joining `outer` and `inner` into one command.
#[derive(Debug, Clone)]
pub struct QueryFlattener {
    outer: QuerySourceId,
    inner: QuerySourceId,
    reader_offset: usize,
    operator: FlattenOperator,
}

impl QueryFlattener {
    /// Create a flattener. `reader_offset` is where the inner columns start in the
    /// merged row.
    pub fn new(
        outer: QuerySourceId,
        inner: QuerySourceId,
        reader_offset: usize,
        operator: FlattenOperator,
    ) -> Self {
        Self {
            outer,
            inner,
            reader_offset,
            operator,
        }
    }

    /// Rewrite `plan`, failing when no matching operator node exists.
    pub fn flatten(&self, plan: ScopePlan) -> Result<ScopePlan> {
        let (plan, found) = self.visit(plan)?;
        if !found {
            return Err(Error::Translation(format!(
                "no {:?} between sources {} and {} to flatten",
                self.operator,
                self.outer.raw(),
                self.inner.raw()
            )));
        }
        Ok(plan)
    }

    fn visit(&self, plan: ScopePlan) -> Result<(ScopePlan, bool)> {
        match plan {
            ScopePlan::SelectMany { outer, inner }
                if self.operator == FlattenOperator::SelectMany && self.binds(&outer, &inner) =>
            {
                Ok((self.merge(*outer, *inner)?, true))
            }
            ScopePlan::Join { outer, inner, .. }
                if self.operator == FlattenOperator::Join && self.binds(&outer, &inner) =>
            {
                Ok((self.merge(*outer, *inner)?, true))
            }
            ScopePlan::GroupJoin {
                outer,
                inner,
                element,
                group,
                ..
            } if self.operator == (FlattenOperator::GroupJoin { group }) && self.binds(&outer, &inner) => {
                let outer_sources = outer.sources();
                let merged = self.merge(*outer, *inner)?;
                Ok((
                    ScopePlan::Regroup {
                        input: Box::new(merged),
                        outer_sources,
                        element,
                        group,
                    },
                    true,
                ))
            }
            ScopePlan::SelectMany { outer, inner } => {
                let (outer, inner, found) = self.visit_pair(*outer, *inner)?;
                Ok((ScopePlan::SelectMany { outer, inner }, found))
            }
            ScopePlan::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                kind,
            } => {
                let (outer, inner, found) = self.visit_pair(*outer, *inner)?;
                Ok((
                    ScopePlan::Join {
                        outer,
                        inner,
                        outer_key,
                        inner_key,
                        kind,
                    },
                    found,
                ))
            }
            ScopePlan::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                element,
                group,
            } => {
                let (outer, inner, found) = self.visit_pair(*outer, *inner)?;
                Ok((
                    ScopePlan::GroupJoin {
                        outer,
                        inner,
                        outer_key,
                        inner_key,
                        element,
                        group,
                    },
                    found,
                ))
            }
            ScopePlan::Filter { input, predicate } => {
                let (input, found) = self.visit(*input)?;
                Ok((
                    ScopePlan::Filter {
                        input: Box::new(input),
                        predicate,
                    },
                    found,
                ))
            }
            ScopePlan::OrderBy { input, orderings } => {
                let (input, found) = self.visit(*input)?;
                Ok((
                    ScopePlan::OrderBy {
                        input: Box::new(input),
                        orderings,
                    },
                    found,
                ))
            }
            ScopePlan::Regroup {
                input,
                outer_sources,
                element,
                group,
            } => {
                let (input, found) = self.visit(*input)?;
                Ok((
                    ScopePlan::Regroup {
                        input: Box::new(input),
                        outer_sources,
                        element,
                        group,
                    },
                    found,
                ))
            }
            leaf @ (ScopePlan::Command(_) | ScopePlan::SubQuery { .. }) => Ok((leaf, false)),
        }
    }

    fn visit_pair(
        &self,
        outer: ScopePlan,
        inner: ScopePlan,
    ) -> Result<(Box<ScopePlan>, Box<ScopePlan>, bool)> {
        let (outer, found) = self.visit(outer)?;
        if found {
            return Ok((Box::new(outer), Box::new(inner), true));
        }
        let (inner, found) = self.visit(inner)?;
        Ok((Box::new(outer), Box::new(inner), found))
    }

    fn binds(&self, outer: &ScopePlan, inner: &ScopePlan) -> bool {
        outer.sources().contains(&self.outer) && inner.sources().contains(&self.inner)
    }

    fn merge(&self, outer: ScopePlan, inner: ScopePlan) -> Result<ScopePlan> {
        let (ScopePlan::Command(mut outer), ScopePlan::Command(inner)) = (outer, inner) else {
            return Err(Error::Translation(
                "only single commands can be flattened into one row".into(),
            ));
        };
        let CommandPlan {
            shapers,
            fixed_parameters,
            ..
        } = inner;
        for mut shaper in shapers {
            shaper.shift(self.reader_offset);
            trace!(
                source = shaper.source().raw(),
                offset = shaper.offset(),
                "inner shaper moved"
            );
            outer.shapers.push(shaper);
        }
        outer.fixed_parameters.extend(fixed_parameters);
        Ok(ScopePlan::Command(outer))
    }
}

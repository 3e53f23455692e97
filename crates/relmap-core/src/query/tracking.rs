//! Entity tracking analysis.
//!
//! Finds the query sources whose entity instances escape into the query result and
//! therefore have to be attached to the change tracker.

use std::collections::{HashMap, HashSet};

use super::expression::{Expression, ItemType};
use super::model::{BodyClause, QueryAnnotation, QueryModel, QuerySourceId, SourceOrigin};

/// A query source whose entities are tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTrackingInfo {
    /// The source producing the entities.
    pub source: QuerySourceId,
    /// Entity type name.
    pub entity_type: String,
    /// Include paths annotated on the source.
    pub includes: Vec<Vec<String>>,
}

/// Finds entity-typed query sources referenced in result position.
///
/// Only bare source references count. The traversal descends through object
/// construction and conversions and stops at member access, method calls, operators,
/// lambdas, invocations, type tests and subquery bodies.
pub struct EntityTrackingAnalyzer<'a> {
    untracked: &'a HashSet<QuerySourceId>,
}

impl<'a> EntityTrackingAnalyzer<'a> {
    /// Create an analyzer excluding the given sources.
    pub fn new(untracked: &'a HashSet<QuerySourceId>) -> Self {
        Self { untracked }
    }

    /// Entity results of the model's selector, one record per source.
    pub fn analyze(&self, model: &QueryModel) -> Vec<EntityTrackingInfo> {
        let mut infos = Vec::new();
        self.collect(model, &model.selector, &mut infos);
        infos
    }

    fn collect(&self, model: &QueryModel, selector: &Expression, infos: &mut Vec<EntityTrackingInfo>) {
        let mut found = Vec::new();
        selector.walk(&mut |node| match node {
            Expression::Source(r) => {
                found.push(r.clone());
                false
            }
            Expression::New(_) | Expression::Convert { .. } => true,
            _ => false,
        });

        let group_inners = group_inner_sources(model);
        for r in found {
            let id = match &r.item_type {
                ItemType::Group(_) => match group_inners.get(&r.id) {
                    Some(inner) => *inner,
                    None => continue,
                },
                _ => r.id,
            };
            let Some(source) = model.find_source(id) else {
                continue;
            };
            let Some(entity) = source.item_type().entity_name() else {
                continue;
            };

            if let Some(nested) = subquery_origin(model, id) {
                self.collect(nested, &nested.selector, infos);
            }

            if self.untracked.contains(&id) || infos.iter().any(|i| i.source == id) {
                continue;
            }
            infos.push(EntityTrackingInfo {
                source: id,
                entity_type: entity.to_string(),
                includes: include_paths(model, id),
            });
        }
    }
}

/// Group source id → inner join source id, for every group join of the model.
pub(crate) fn group_inner_sources(model: &QueryModel) -> HashMap<QuerySourceId, QuerySourceId> {
    model
        .body_clauses
        .iter()
        .filter_map(|clause| match clause {
            BodyClause::GroupJoin(group) => Some((group.source.id(), group.join.source.id())),
            _ => None,
        })
        .collect()
}

/// The nested model behind a source, if it ranges over a subquery.
pub(crate) fn subquery_origin(model: &QueryModel, id: QuerySourceId) -> Option<&QueryModel> {
    let origin = if model.main_from.source.id() == id {
        &model.main_from.origin
    } else {
        model.body_clauses.iter().find_map(|clause| match clause {
            BodyClause::AdditionalFrom(from) if from.source.id() == id => Some(&from.origin),
            BodyClause::Join(join) if join.source.id() == id => Some(&join.origin),
            BodyClause::GroupJoin(group) if group.join.source.id() == id => Some(&group.join.origin),
            _ => None,
        })?
    };
    match origin {
        SourceOrigin::SubQuery(nested) => Some(nested),
        SourceOrigin::EntitySet(_) => None,
    }
}

fn include_paths(model: &QueryModel, id: QuerySourceId) -> Vec<Vec<String>> {
    model
        .annotations
        .iter()
        .filter_map(|annotation| match annotation {
            QueryAnnotation::Include { source, path } if *source == id => Some(path.clone()),
            _ => None,
        })
        .collect()
}

//! Query optimizer and executor: turns a filter set into a plan, then
//! executes that plan against storage and the index manager.

use crate::document::DistributedDocument;
use crate::error::DbResult;
use crate::index::ann::Vector;
use crate::index::IndexManager;
use crate::storage::StorageBackend;
use serde_json::Value as JsonValue;
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Contains,
    StartsWith,
    SimilarTo,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    pub value: JsonValue,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            field: field.into(),
            operator: Operator::Eq,
            value: value.into(),
        }
    }

    pub fn matches(&self, doc: &DistributedDocument) -> bool {
        let actual = doc.field(&self.field);
        match self.operator {
            Operator::Eq => actual == Some(&self.value),
            Operator::Ne => actual != Some(&self.value),
            Operator::Lt => compare(actual, &self.value) == Some(CmpOrdering::Less),
            Operator::Lte => {
                matches!(compare(actual, &self.value), Some(CmpOrdering::Less | CmpOrdering::Equal))
            }
            Operator::Gt => compare(actual, &self.value) == Some(CmpOrdering::Greater),
            Operator::Gte => matches!(
                compare(actual, &self.value),
                Some(CmpOrdering::Greater | CmpOrdering::Equal)
            ),
            Operator::Contains => match actual {
                Some(JsonValue::String(s)) => {
                    self.value.as_str().is_some_and(|needle| s.contains(needle))
                }
                Some(JsonValue::Array(items)) => items.contains(&self.value),
                _ => false,
            },
            Operator::StartsWith => match (actual, self.value.as_str()) {
                (Some(JsonValue::String(s)), Some(prefix)) => s.starts_with(prefix),
                _ => false,
            },
            // similar-to is resolved by the ANN index, not by residual scan
            Operator::SimilarTo => true,
        }
    }
}

fn compare(actual: Option<&JsonValue>, expected: &JsonValue) -> Option<CmpOrdering> {
    match (actual?, expected) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Sort {
    pub field: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub sort: Option<Sort>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, f: Filter) -> Self {
        self.filters.push(f);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, ascending: bool) -> Self {
        self.sort = Some(Sort {
            field: field.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanType {
    Full,
    Index,
    IndexOnly,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub scan_type: ScanType,
    pub index_name: Option<String>,
    pub residual_filters: Vec<Filter>,
    pub estimated_rows: usize,
    pub estimated_cost: f64,
}

/// Picks the lowest-cost plan for `query` against `collection`. The
/// optimizer only looks at filter shape and rough cardinality; it does not
/// need index contents to decide, only whether one is attached.
pub fn plan(query: &Query, cardinality_hint: usize) -> Plan {
    let mut best: Option<Plan> = None;

    for filter in &query.filters {
        let (selectivity, index_label) = match filter.operator {
            Operator::Eq => (1.0 / (cardinality_hint.max(1) as f64), "btree"),
            Operator::Contains if matches!(filter.value, JsonValue::String(_)) => (0.01, "inverted"),
            Operator::SimilarTo => (0.1, "ann"),
            _ => continue,
        };

        let residual: Vec<Filter> = query
            .filters
            .iter()
            .filter(|f| !std::ptr::eq(*f, filter))
            .cloned()
            .collect();

        let rows = ((cardinality_hint as f64) * selectivity).ceil().max(1.0) as usize;
        let avg_bucket = 1.0;
        let cost = 1.0 + rows as f64 * avg_bucket;

        let candidate = Plan {
            scan_type: if residual.is_empty() {
                ScanType::IndexOnly
            } else {
                ScanType::Index
            },
            index_name: Some(format!("{index_label}:{}", filter.field)),
            residual_filters: residual,
            estimated_rows: rows,
            estimated_cost: cost,
        };

        if best.as_ref().map(|b| candidate.estimated_cost < b.estimated_cost).unwrap_or(true) {
            best = Some(candidate);
        }
    }

    best.unwrap_or_else(|| Plan {
        scan_type: ScanType::Full,
        index_name: None,
        residual_filters: query.filters.clone(),
        estimated_rows: cardinality_hint,
        estimated_cost: cardinality_hint as f64,
    })
}

/// Executes `query` against `collection`, using `indexes` when the
/// optimizer finds a usable one.
pub fn execute(
    storage: &Arc<dyn StorageBackend>,
    indexes: &IndexManager,
    collection: &str,
    query: &Query,
) -> DbResult<Vec<DistributedDocument>> {
    let all = storage.find_all(collection)?;
    let cardinality = all.len().max(1);
    let chosen = plan(query, cardinality);

    let mut results = match chosen.scan_type {
        ScanType::Full => all.into_iter().filter(|d| !d.deleted).collect::<Vec<_>>(),
        ScanType::Index | ScanType::IndexOnly => {
            let ids = candidate_ids(indexes, collection, query)
                .unwrap_or_else(|| all.iter().map(|d| d.id.clone()).collect());
            ids.into_iter()
                .filter_map(|id| storage.get(collection, &id).ok().flatten())
                .filter(|d| !d.deleted)
                .collect()
        }
    };

    for filter in &chosen.residual_filters {
        results.retain(|d| filter.matches(d));
    }

    if let Some(sort) = &query.sort {
        results.sort_by(|a, b| {
            let ordering = compare(a.field(&sort.field), b.field(&sort.field).unwrap_or(&JsonValue::Null))
                .unwrap_or(CmpOrdering::Equal);
            if sort.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
    }

    if let Some(limit) = query.limit {
        results.truncate(limit);
    }

    Ok(results)
}

fn candidate_ids(indexes: &IndexManager, collection: &str, query: &Query) -> Option<Vec<String>> {
    for filter in &query.filters {
        match filter.operator {
            Operator::Eq => {
                if let Some(ids) = indexes.query_eq(collection, &filter.field, &filter.value) {
                    return Some(ids);
                }
            }
            Operator::Contains => {
                if let Some(term) = filter.value.as_str() {
                    if let Some(ids) = indexes.query_contains(collection, &filter.field, term) {
                        return Some(ids);
                    }
                }
            }
            Operator::SimilarTo => {
                if let JsonValue::Array(values) = &filter.value {
                    let floats: Vec<f32> = values.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect();
                    if floats.len() == values.len() {
                        let vector = Vector::new(floats);
                        if let Some(Ok(hits)) = indexes.query_similar(collection, &filter.field, &vector, 100) {
                            return Some(hits.into_iter().map(|(id, _)| id).collect());
                        }
                    }
                }
            }
            _ => {}
        }
    }
    None
}

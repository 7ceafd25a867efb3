//! Query conditions over contained entities.
//!
//! `contained_entities` and `compute_on_contained_entities` interpret their
//! query children into these condition records and run them in order over
//! the current entity's children. Filtering conditions narrow the working
//! set; aggregate conditions end the chain with a computed value.

use std::sync::Arc;

use crate::entity::Entity;
use crate::intern;
use crate::node::NodeKind;
use crate::rand::RandomStream;

/// A label value sampled from an entity, for comparisons.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Number(f64),
    Text(String),
}

impl QueryValue {
    pub fn as_number(&self) -> f64 {
        match self {
            QueryValue::Number(v) => *v,
            QueryValue::Text(text) => crate::parser::parse_number(text).unwrap_or(f64::NAN),
        }
    }
}

/// One step of a query chain.
#[derive(Debug, Clone)]
pub enum QueryCondition {
    Exists { label: String },
    NotExists { label: String },
    Equals { label: String, value: QueryValue },
    NotEquals { label: String, value: QueryValue },
    Between { label: String, low: f64, high: f64 },
    NotBetween { label: String, low: f64, high: f64 },
    Among { label: String, values: Vec<QueryValue> },
    NotAmong { label: String, values: Vec<QueryValue> },
    GreaterOrEqualTo { label: String, value: f64 },
    LessOrEqualTo { label: String, value: f64 },
    InEntityList { ids: Vec<String> },
    NotInEntityList { ids: Vec<String> },
    Select { count: usize, start: usize },
    Sample { count: usize },
    WeightedSample { label: String, count: usize },
    WithinDistance { labels: Vec<String>, center: Vec<f64>, p: f64, max: f64 },
    NearestDistance { labels: Vec<String>, center: Vec<f64>, p: f64, count: usize },
    Count,
    Max { label: String, count: usize },
    Min { label: String, count: usize },
    Sum { label: String },
    Mode { label: String },
    Quantile { label: String, q: f64 },
    GeneralizedMean { label: String, p: f64 },
    MinDifference { label: String },
    MaxDifference { label: String },
    ValueMasses { label: String },
}

/// Result of running a chain.
#[derive(Debug)]
pub enum QueryOutcome {
    /// Surviving entity ids, in deterministic order.
    Entities(Vec<String>),
    Value(f64),
    /// id or value-mass pairs.
    Pairs(Vec<(String, f64)>),
}

/// Reads a (public) label value off an entity's root.
pub fn label_value(entity: &Arc<Entity>, label: &str) -> Option<QueryValue> {
    let sid = intern::pool().id_if_exists(label)?;
    let node = entity.symbol_value(sid, false)?;
    let manager = entity.manager();
    match manager.kind_of(node) {
        NodeKind::Number => Some(QueryValue::Number(manager.number_of(node))),
        NodeKind::String | NodeKind::Symbol => {
            Some(QueryValue::Text(intern::text(manager.symbol_of(node))))
        }
        NodeKind::True => Some(QueryValue::Number(1.0)),
        NodeKind::False => Some(QueryValue::Number(0.0)),
        _ => None,
    }
}

fn label_number(entity: &Arc<Entity>, label: &str) -> Option<f64> {
    label_value(entity, label).map(|v| v.as_number()).filter(|v| !v.is_nan())
}

/// Runs a condition chain over `entity`'s direct children.
pub fn run_query(
    entity: &Arc<Entity>,
    conditions: &[QueryCondition],
    rand: &mut RandomStream,
) -> QueryOutcome {
    let mut working: Vec<(String, Arc<Entity>)> = entity
        .child_names()
        .into_iter()
        .filter_map(|name| entity.child(&name).map(|e| (name, e)))
        .collect();

    for condition in conditions {
        match condition {
            QueryCondition::Exists { label } => {
                working.retain(|(_, e)| label_value(e, label).is_some());
            }
            QueryCondition::NotExists { label } => {
                working.retain(|(_, e)| label_value(e, label).is_none());
            }
            QueryCondition::Equals { label, value } => {
                working.retain(|(_, e)| label_value(e, label).as_ref() == Some(value));
            }
            QueryCondition::NotEquals { label, value } => {
                working.retain(|(_, e)| label_value(e, label).as_ref() != Some(value));
            }
            QueryCondition::Between { label, low, high } => {
                working.retain(|(_, e)| {
                    label_number(e, label).is_some_and(|v| v >= *low && v <= *high)
                });
            }
            QueryCondition::NotBetween { label, low, high } => {
                working.retain(|(_, e)| {
                    label_number(e, label).is_some_and(|v| v < *low || v > *high)
                });
            }
            QueryCondition::Among { label, values } => {
                working.retain(|(_, e)| {
                    label_value(e, label).is_some_and(|v| values.contains(&v))
                });
            }
            QueryCondition::NotAmong { label, values } => {
                working.retain(|(_, e)| {
                    label_value(e, label).is_some_and(|v| !values.contains(&v))
                });
            }
            QueryCondition::GreaterOrEqualTo { label, value } => {
                working.retain(|(_, e)| label_number(e, label).is_some_and(|v| v >= *value));
            }
            QueryCondition::LessOrEqualTo { label, value } => {
                working.retain(|(_, e)| label_number(e, label).is_some_and(|v| v <= *value));
            }
            QueryCondition::InEntityList { ids } => {
                working.retain(|(name, _)| ids.contains(name));
            }
            QueryCondition::NotInEntityList { ids } => {
                working.retain(|(name, _)| !ids.contains(name));
            }
            QueryCondition::Select { count, start } => {
                let end = start.saturating_add(*count).min(working.len());
                let start = (*start).min(working.len());
                working = working[start..end].to_vec();
            }
            QueryCondition::Sample { count } => {
                let mut sampled = Vec::with_capacity(*count);
                for _ in 0..*count {
                    if working.is_empty() {
                        break;
                    }
                    let pick = rand.next_index(working.len());
                    sampled.push(working[pick].clone());
                }
                working = sampled;
            }
            QueryCondition::WeightedSample { label, count } => {
                let weights: Vec<f64> = working
                    .iter()
                    .map(|(_, e)| label_number(e, label).unwrap_or(0.0).max(0.0))
                    .collect();
                let total: f64 = weights.iter().sum();
                let mut sampled = Vec::with_capacity(*count);
                for _ in 0..*count {
                    if total <= 0.0 || working.is_empty() {
                        break;
                    }
                    let mut roll = rand.next_double() * total;
                    let mut chosen = working.len() - 1;
                    for (i, w) in weights.iter().enumerate() {
                        roll -= w;
                        if roll <= 0.0 {
                            chosen = i;
                            break;
                        }
                    }
                    sampled.push(working[chosen].clone());
                }
                working = sampled;
            }
            QueryCondition::WithinDistance { labels, center, p, max } => {
                working.retain(|(_, e)| {
                    entity_distance(e, labels, center, *p).is_some_and(|d| d <= *max)
                });
            }
            QueryCondition::NearestDistance { labels, center, p, count } => {
                let mut measured: Vec<(String, Arc<Entity>, f64)> = working
                    .iter()
                    .filter_map(|(name, e)| {
                        entity_distance(e, labels, center, *p)
                            .map(|d| (name.clone(), e.clone(), d))
                    })
                    .collect();
                measured.sort_by(|a, b| {
                    a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal)
                });
                measured.truncate(*count);
                working = measured.into_iter().map(|(n, e, _)| (n, e)).collect();
            }

            // Aggregates end the chain.
            QueryCondition::Count => return QueryOutcome::Value(working.len() as f64),
            QueryCondition::Max { label, count } | QueryCondition::Min { label, count } => {
                let ascending = matches!(condition, QueryCondition::Min { .. });
                let mut measured: Vec<(String, f64)> = working
                    .iter()
                    .filter_map(|(name, e)| {
                        label_number(e, label).map(|v| (name.clone(), v))
                    })
                    .collect();
                measured.sort_by(|a, b| {
                    let ordering =
                        a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
                    if ascending {
                        ordering
                    } else {
                        ordering.reverse()
                    }
                });
                measured.truncate((*count).max(1));
                return QueryOutcome::Pairs(measured);
            }
            QueryCondition::Sum { label } => {
                let sum = working
                    .iter()
                    .filter_map(|(_, e)| label_number(e, label))
                    .sum();
                return QueryOutcome::Value(sum);
            }
            QueryCondition::Mode { label } => {
                let mut masses: Vec<(f64, usize)> = Vec::new();
                for value in working.iter().filter_map(|(_, e)| label_number(e, label)) {
                    match masses.iter_mut().find(|(v, _)| *v == value) {
                        Some((_, count)) => *count += 1,
                        None => masses.push((value, 1)),
                    }
                }
                let mode = masses
                    .into_iter()
                    .max_by_key(|&(_, count)| count)
                    .map(|(v, _)| v)
                    .unwrap_or(f64::NAN);
                return QueryOutcome::Value(mode);
            }
            QueryCondition::Quantile { label, q } => {
                let mut values: Vec<f64> = working
                    .iter()
                    .filter_map(|(_, e)| label_number(e, label))
                    .collect();
                if values.is_empty() {
                    return QueryOutcome::Value(f64::NAN);
                }
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let rank = (q.clamp(0.0, 1.0) * (values.len() - 1) as f64).round() as usize;
                return QueryOutcome::Value(values[rank]);
            }
            QueryCondition::GeneralizedMean { label, p } => {
                let values: Vec<f64> = working
                    .iter()
                    .filter_map(|(_, e)| label_number(e, label))
                    .collect();
                if values.is_empty() {
                    return QueryOutcome::Value(f64::NAN);
                }
                let mean = if *p == 0.0 {
                    // Geometric mean via logs.
                    (values.iter().map(|v| v.ln()).sum::<f64>() / values.len() as f64).exp()
                } else {
                    (values.iter().map(|v| v.powf(*p)).sum::<f64>() / values.len() as f64)
                        .powf(1.0 / p)
                };
                return QueryOutcome::Value(mean);
            }
            QueryCondition::MinDifference { label }
            | QueryCondition::MaxDifference { label } => {
                let mut values: Vec<f64> = working
                    .iter()
                    .filter_map(|(_, e)| label_number(e, label))
                    .collect();
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                if values.len() < 2 {
                    return QueryOutcome::Value(f64::NAN);
                }
                let diffs = values.windows(2).map(|w| w[1] - w[0]);
                let value = if matches!(condition, QueryCondition::MinDifference { .. }) {
                    diffs.fold(f64::INFINITY, f64::min)
                } else {
                    diffs.fold(f64::NEG_INFINITY, f64::max)
                };
                return QueryOutcome::Value(value);
            }
            QueryCondition::ValueMasses { label } => {
                let mut masses: Vec<(String, f64)> = Vec::new();
                for value in working.iter().filter_map(|(_, e)| label_value(e, label)) {
                    let key = match &value {
                        QueryValue::Number(v) => crate::parser::format_number(*v),
                        QueryValue::Text(text) => text.clone(),
                    };
                    match masses.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, mass)) => *mass += 1.0,
                        None => masses.push((key, 1.0)),
                    }
                }
                return QueryOutcome::Pairs(masses);
            }
        }
    }

    QueryOutcome::Entities(working.into_iter().map(|(name, _)| name).collect())
}

/// Minkowski distance between an entity's labeled values and a center
/// point; `None` when any coordinate is missing.
fn entity_distance(
    entity: &Arc<Entity>,
    labels: &[String],
    center: &[f64],
    p: f64,
) -> Option<f64> {
    if labels.len() != center.len() || labels.is_empty() {
        return None;
    }
    let mut sum = 0.0;
    let mut max = 0.0f64;
    for (label, &c) in labels.iter().zip(center) {
        let v = label_number(entity, label)?;
        let d = (v - c).abs();
        sum += d.powf(p);
        max = max.max(d);
    }
    if p == f64::INFINITY {
        Some(max)
    } else {
        Some(sum.powf(1.0 / p))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn entity_with_labels(id: &str, pairs: &[(&str, f64)]) -> Arc<Entity> {
        let entity = Entity::with_seed(id, id);
        let source = format!(
            "(list {})",
            pairs
                .iter()
                .map(|(label, value)| format!("#{} {}", label, value))
                .collect::<Vec<_>>()
                .join(" ")
        );
        let root = parse(&source, entity.manager(), "test", false).unwrap();
        entity.set_root(Some(root));
        entity
    }

    fn world() -> Arc<Entity> {
        let root = Entity::with_seed("world", "seed");
        root.add_child("a", entity_with_labels("a", &[("x", 1.0), ("y", 10.0)]));
        root.add_child("b", entity_with_labels("b", &[("x", 2.0), ("y", 20.0)]));
        root.add_child("c", entity_with_labels("c", &[("x", 3.0)]));
        root
    }

    fn names(outcome: QueryOutcome) -> Vec<String> {
        match outcome {
            QueryOutcome::Entities(names) => names,
            other => panic!("expected entities, got {:?}", other),
        }
    }

    #[test]
    fn exists_filters() {
        let world = world();
        let mut rand = RandomStream::seeded("q");
        let outcome = run_query(
            &world,
            &[QueryCondition::Exists { label: "y".into() }],
            &mut rand,
        );
        assert_eq!(names(outcome), vec!["a", "b"]);
    }

    #[test]
    fn between_and_count_compose() {
        let world = world();
        let mut rand = RandomStream::seeded("q");
        let outcome = run_query(
            &world,
            &[
                QueryCondition::Between {
                    label: "x".into(),
                    low: 2.0,
                    high: 3.0,
                },
                QueryCondition::Count,
            ],
            &mut rand,
        );
        match outcome {
            QueryOutcome::Value(v) => assert_eq!(v, 2.0),
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn sum_over_label() {
        let world = world();
        let mut rand = RandomStream::seeded("q");
        let outcome = run_query(
            &world,
            &[QueryCondition::Sum { label: "x".into() }],
            &mut rand,
        );
        match outcome {
            QueryOutcome::Value(v) => assert_eq!(v, 6.0),
            other => panic!("expected value, got {:?}", other),
        }
    }

    #[test]
    fn max_returns_top_pairs() {
        let world = world();
        let mut rand = RandomStream::seeded("q");
        let outcome = run_query(
            &world,
            &[QueryCondition::Max {
                label: "x".into(),
                count: 2,
            }],
            &mut rand,
        );
        match outcome {
            QueryOutcome::Pairs(pairs) => {
                assert_eq!(pairs[0].0, "c");
                assert_eq!(pairs[1].0, "b");
            }
            other => panic!("expected pairs, got {:?}", other),
        }
    }

    #[test]
    fn sampling_is_deterministic_per_seed() {
        let world = world();
        let mut r1 = RandomStream::seeded("sample");
        let mut r2 = RandomStream::seeded("sample");
        let a = names(run_query(
            &world,
            &[QueryCondition::Sample { count: 2 }],
            &mut r1,
        ));
        let b = names(run_query(
            &world,
            &[QueryCondition::Sample { count: 2 }],
            &mut r2,
        ));
        assert_eq!(a, b);
    }

    #[test]
    fn nearest_distance_orders_by_proximity() {
        let world = world();
        let mut rand = RandomStream::seeded("q");
        let outcome = run_query(
            &world,
            &[QueryCondition::NearestDistance {
                labels: vec!["x".into()],
                center: vec![2.1],
                p: 2.0,
                count: 2,
            }],
            &mut rand,
        );
        assert_eq!(names(outcome), vec!["b", "c"]);
    }
}

//! Entity query opcodes.
//!
//! `query_*` nodes are condition records, not computations: evaluating one
//! on its own yields null. `contained_entities` and
//! `compute_on_contained_entities` interpret their query children into
//! [`QueryCondition`]s and run the chain over the resolved entity's
//! children under its read contract.

use crate::intern;
use crate::node::{NodeId, NodeKind};
use crate::query::{run_query, QueryCondition, QueryOutcome, QueryValue};
use crate::value::{EvalResult, Immediate};

use super::Interpreter;

impl Interpreter {
    /// `(contained_entities path? conditions...)` — ids of the entities
    /// that survive the condition chain, or the aggregate value when the
    /// chain ends in an aggregate condition.
    pub(crate) fn op_contained_entities(&mut self, n: NodeId, _kind: NodeKind) -> EvalResult {
        let children = self.manager.children_of(n);

        // A leading non-query child is the entity path.
        let (path_node, condition_nodes) = match children.first() {
            Some(&first) if !self.manager.kind_of(first).is_query() => {
                (Some(first), &children[1..])
            }
            _ => (None, &children[..]),
        };
        let Some(target) = self.resolve_entity(path_node) else {
            return EvalResult::NULL;
        };

        let mut conditions = Vec::with_capacity(condition_nodes.len());
        for &node in condition_nodes {
            match self.parse_condition(node) {
                Some(condition) => conditions.push(condition),
                None => {
                    log::warn!(
                        "ignoring non-query child {:?} in entity query",
                        self.manager.kind_of(node).name()
                    );
                }
            }
        }

        let mut stream = self.scratch_stream();
        let outcome = run_query(&target, &conditions, &mut stream);
        self.outcome_to_result(outcome)
    }

    /// A bare `query_*` opcode is only meaningful inside an entity query.
    pub(crate) fn op_query_condition(&mut self, _n: NodeId) -> EvalResult {
        EvalResult::NULL
    }

    /// The aggregate statistics family delegates to the external analysis
    /// library, which this engine does not embed.
    pub(crate) fn op_aggregate_analysis(&mut self, _n: NodeId, kind: NodeKind) -> EvalResult {
        log::warn!(
            "{} is delegated to the analysis library and yields null here",
            kind.name()
        );
        EvalResult::NULL
    }

    fn outcome_to_result(&mut self, outcome: QueryOutcome) -> EvalResult {
        match outcome {
            QueryOutcome::Value(v) => EvalResult::number(v),
            QueryOutcome::Entities(names) => {
                let out = self.manager.alloc(NodeKind::List);
                for name in names {
                    let node = self.manager.alloc_string(&name);
                    self.manager.push_child(out, node);
                }
                EvalResult::node(out, true)
            }
            QueryOutcome::Pairs(pairs) => {
                let out = self.manager.alloc(NodeKind::Assoc);
                for (key, value) in pairs {
                    let node = self.manager.alloc_number(value);
                    self.manager.set_mapped_child(out, intern::intern(&key), node);
                }
                EvalResult::node(out, true)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Condition parsing
    // -----------------------------------------------------------------------

    fn parse_condition(&mut self, node: NodeId) -> Option<QueryCondition> {
        use NodeKind::*;
        let kind = self.manager.kind_of(node);
        let children = self.manager.children_of(node);
        let label = |this: &mut Self, index: usize| -> Option<::std::string::String> {
            this.interpret_into_string(children.get(index).copied())
        };
        let number = |this: &mut Self, index: usize| -> Option<f64> {
            let v = this.interpret_into_number(children.get(index).copied());
            if v.is_nan() {
                None
            } else {
                Some(v)
            }
        };

        let condition = match kind {
            QueryExists => QueryCondition::Exists {
                label: label(self, 0)?,
            },
            QueryNotExists => QueryCondition::NotExists {
                label: label(self, 0)?,
            },
            QueryEquals => QueryCondition::Equals {
                label: label(self, 0)?,
                value: self.query_value(children.get(1).copied())?,
            },
            QueryNotEquals => QueryCondition::NotEquals {
                label: label(self, 0)?,
                value: self.query_value(children.get(1).copied())?,
            },
            QueryBetween => QueryCondition::Between {
                label: label(self, 0)?,
                low: number(self, 1)?,
                high: number(self, 2)?,
            },
            QueryNotBetween => QueryCondition::NotBetween {
                label: label(self, 0)?,
                low: number(self, 1)?,
                high: number(self, 2)?,
            },
            QueryAmong => QueryCondition::Among {
                label: label(self, 0)?,
                values: self.query_values(children.get(1).copied()),
            },
            QueryNotAmong => QueryCondition::NotAmong {
                label: label(self, 0)?,
                values: self.query_values(children.get(1).copied()),
            },
            QueryGreaterOrEqualTo => QueryCondition::GreaterOrEqualTo {
                label: label(self, 0)?,
                value: number(self, 1)?,
            },
            QueryLessOrEqualTo => QueryCondition::LessOrEqualTo {
                label: label(self, 0)?,
                value: number(self, 1)?,
            },
            QueryInEntityList => QueryCondition::InEntityList {
                ids: self.string_list(children.first().copied()),
            },
            QueryNotInEntityList => QueryCondition::NotInEntityList {
                ids: self.string_list(children.first().copied()),
            },
            QuerySelect => QueryCondition::Select {
                count: number(self, 0)? as usize,
                start: number(self, 1).unwrap_or(0.0) as usize,
            },
            QuerySample => QueryCondition::Sample {
                count: number(self, 0).unwrap_or(1.0) as usize,
            },
            QueryWeightedSample => QueryCondition::WeightedSample {
                label: label(self, 0)?,
                count: number(self, 1).unwrap_or(1.0) as usize,
            },
            QueryCount => QueryCondition::Count,
            QueryMax => QueryCondition::Max {
                label: label(self, 0)?,
                count: number(self, 1).unwrap_or(1.0) as usize,
            },
            QueryMin => QueryCondition::Min {
                label: label(self, 0)?,
                count: number(self, 1).unwrap_or(1.0) as usize,
            },
            QuerySum => QueryCondition::Sum {
                label: label(self, 0)?,
            },
            QueryMode => QueryCondition::Mode {
                label: label(self, 0)?,
            },
            QueryQuantile => QueryCondition::Quantile {
                label: label(self, 0)?,
                q: number(self, 1).unwrap_or(0.5),
            },
            QueryGeneralizedMean => QueryCondition::GeneralizedMean {
                label: label(self, 0)?,
                p: number(self, 1).unwrap_or(1.0),
            },
            QueryMinDifference => QueryCondition::MinDifference {
                label: label(self, 0)?,
            },
            QueryMaxDifference => QueryCondition::MaxDifference {
                label: label(self, 0)?,
            },
            QueryValueMasses => QueryCondition::ValueMasses {
                label: label(self, 0)?,
            },
            QueryWithinGeneralizedDistance => QueryCondition::WithinDistance {
                max: number(self, 0)?,
                labels: self.string_list(children.get(1).copied()),
                center: self.numeric_vector(children.get(2).copied()),
                p: number(self, 3).unwrap_or(2.0),
            },
            QueryNearestGeneralizedDistance => QueryCondition::NearestDistance {
                count: number(self, 0)? as usize,
                labels: self.string_list(children.get(1).copied()),
                center: self.numeric_vector(children.get(2).copied()),
                p: number(self, 3).unwrap_or(2.0),
            },
            _ => return None,
        };
        Some(condition)
    }

    fn query_value(&mut self, node: Option<NodeId>) -> Option<QueryValue> {
        let result = self.interpret(node, true);
        let value = match result.value {
            Immediate::Number(v) => Some(QueryValue::Number(v)),
            Immediate::Str(sid) => Some(QueryValue::Text(intern::text(sid))),
            Immediate::Node(id) => match self.manager.kind_of(id) {
                NodeKind::Number => Some(QueryValue::Number(self.manager.number_of(id))),
                NodeKind::String | NodeKind::Symbol => {
                    Some(QueryValue::Text(intern::text(self.manager.symbol_of(id))))
                }
                _ => None,
            },
            Immediate::Null => None,
        };
        self.free_result(result);
        value
    }

    fn query_values(&mut self, node: Option<NodeId>) -> Vec<QueryValue> {
        let result = self.interpret(node, false);
        let values = match result.node_id() {
            Some(id) if self.manager.kind_of(id) == NodeKind::List => self
                .manager
                .children_of(id)
                .into_iter()
                .filter_map(|c| match self.manager.kind_of(c) {
                    NodeKind::Number => Some(QueryValue::Number(self.manager.number_of(c))),
                    NodeKind::String | NodeKind::Symbol => {
                        Some(QueryValue::Text(intern::text(self.manager.symbol_of(c))))
                    }
                    _ => None,
                })
                .collect(),
            Some(id) => match self.manager.kind_of(id) {
                NodeKind::Number => vec![QueryValue::Number(self.manager.number_of(id))],
                NodeKind::String | NodeKind::Symbol => {
                    vec![QueryValue::Text(intern::text(self.manager.symbol_of(id)))]
                }
                _ => Vec::new(),
            },
            None => Vec::new(),
        };
        self.free_result(result);
        values
    }
}

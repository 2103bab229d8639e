// src/resource/sequence.rs

//! Processing-sequence construction.
//!
//! A sequence is: dependencies (recursively, as `update`), the primary
//! entry, then side effects (as `update`). Each level is de-duplicated by
//! `(resource identity, action)` keeping the first occurrence.
//!
//! Dependency edges are recorded in a `petgraph` graph while expanding so a
//! cyclic catalog (A requires B requires A) fails with
//! [`ResolutionError::DependencyCycle`] instead of recursing forever.
//!
//! Side effects are not expanded, but what they require is still recorded as
//! ordering edges. The finished sequence is put in a stable topological
//! order, so a side effect of an early dependency never runs ahead of a
//! later dependency it needs itself.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde_json::json;
use tracing::debug;

use super::{Resource, ResourceGraph};
use crate::errors::ResolutionError;
use crate::task::Action;
use crate::task::Params;
use crate::task::params::{CAUSED_BY, PARAMS_FOR_AFFECTED, PARAMS_FOR_REQUIRED, REQUIRED_FOR};

/// One handler invocation in a processing sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceEntry {
    pub res_type: String,
    pub resource: Resource,
    pub action: Action,
    /// Params handed to the handler: the task's own for the primary entry,
    /// a `requiredFor` / `causedBy` marker for generated ones.
    pub params: Params,
}

impl SequenceEntry {
    /// De-duplication key.
    pub fn key(&self) -> (String, Action) {
        (self.resource.identity().to_string(), self.action)
    }

    pub fn is_required_for(&self) -> bool {
        self.params.contains(REQUIRED_FOR)
    }

    pub fn is_caused_by(&self) -> bool {
        self.params.contains(CAUSED_BY)
    }
}

type BoxedExpansion<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<SequenceEntry>, ResolutionError>> + Send + 'a>>;

/// Edges seen so far in one build, `before -> after`.
///
/// `graph` holds expanded dependencies only and is what cycles are checked
/// against. `order` also holds the edges around side effects and decides
/// the final order.
#[derive(Default)]
struct Expansion {
    graph: DiGraphMap<usize, ()>,
    order: DiGraphMap<usize, ()>,
    ids: HashMap<String, usize>,
}

fn node_key(res_type: &str, resource: &Resource) -> String {
    format!("{res_type}/{}", resource.identity())
}

impl Expansion {
    fn node(&mut self, res_type: &str, resource: &Resource) -> usize {
        let next = self.ids.len();
        let id = *self.ids.entry(node_key(res_type, resource)).or_insert(next);
        self.graph.add_node(id);
        self.order.add_node(id);
        id
    }

    fn lookup(&self, res_type: &str, resource: &Resource) -> Option<usize> {
        self.ids.get(&node_key(res_type, resource)).copied()
    }

    fn add_dependency(&mut self, dep: usize, dependent: usize) -> bool {
        self.graph.add_edge(dep, dependent, ());
        if dep == dependent || toposort(&self.graph, None).is_err() {
            return false;
        }
        self.add_ordering(dep, dependent);
        true
    }

    /// Ask for `before` to run ahead of `after`. An edge that contradicts
    /// the ones already recorded is left out; returns whether it was kept.
    fn add_ordering(&mut self, before: usize, after: usize) -> bool {
        if before == after {
            return false;
        }
        if self.order.contains_edge(before, after) {
            return true;
        }
        self.order.add_edge(before, after, ());
        if toposort(&self.order, None).is_ok() {
            return true;
        }
        self.order.remove_edge(before, after);
        false
    }

    /// Stable topological order of `sequence`: an entry only moves when one
    /// of its recorded predecessors sits behind it.
    fn arrange(&self, sequence: Vec<SequenceEntry>) -> Vec<SequenceEntry> {
        let nodes: Vec<Option<usize>> = sequence
            .iter()
            .map(|e| self.lookup(&e.res_type, &e.resource))
            .collect();
        let len = sequence.len();
        let mut indegree = vec![0usize; len];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); len];
        for (i, a) in nodes.iter().enumerate() {
            for (j, b) in nodes.iter().enumerate() {
                if let (Some(a), Some(b)) = (a, b) {
                    if a != b && self.order.contains_edge(*a, *b) {
                        successors[i].push(j);
                        indegree[j] += 1;
                    }
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..len)
            .filter(|i| indegree[*i] == 0)
            .map(Reverse)
            .collect();
        let mut placed = Vec::with_capacity(len);
        while let Some(Reverse(i)) = ready.pop() {
            placed.push(i);
            for &j in &successors[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }
        // unreachable while `order` stays acyclic
        let mut seen = vec![false; len];
        for &i in &placed {
            seen[i] = true;
        }
        placed.extend((0..len).filter(|i| !seen[*i]));

        let mut slots: Vec<Option<SequenceEntry>> = sequence.into_iter().map(Some).collect();
        placed.into_iter().filter_map(|i| slots[i].take()).collect()
    }
}

/// Builds processing sequences against a [`ResourceGraph`].
pub struct SequenceBuilder<'g> {
    graph: &'g ResourceGraph,
}

impl<'g> SequenceBuilder<'g> {
    pub fn new(graph: &'g ResourceGraph) -> Self {
        Self { graph }
    }

    pub async fn build(
        &self,
        res_type: &str,
        resource: &Resource,
        action: Action,
        params: &Params,
    ) -> Result<Vec<SequenceEntry>, ResolutionError> {
        let mut expansion = Expansion::default();
        let sequence = self
            .expand(
                res_type.to_string(),
                resource.clone(),
                action,
                params.clone(),
                &mut expansion,
            )
            .await?;
        let sequence = expansion.arrange(sequence);
        debug!(
            res_type,
            resource = %resource,
            entries = sequence.len(),
            "built processing sequence"
        );
        Ok(sequence)
    }

    fn expand<'a>(
        &'a self,
        res_type: String,
        resource: Resource,
        action: Action,
        params: Params,
        expansion: &'a mut Expansion,
    ) -> BoxedExpansion<'a> {
        Box::pin(async move {
            let isolated = params.is_isolated();
            let node = expansion.node(&res_type, &resource);
            let marker = json!({
                "resType": res_type,
                "resourceId": resource.identity(),
                "action": action.as_str(),
            });

            let mut sequence = Vec::new();

            if !isolated {
                let required = self
                    .graph
                    .required_resources(&res_type, &resource, &params)
                    .await?;
                for dep in required {
                    let dep_node = expansion.node(&dep.res_type, &dep.resource);
                    if !expansion.add_dependency(dep_node, node) {
                        return Err(ResolutionError::DependencyCycle(format!(
                            "{}/{} <-> {}/{}",
                            dep.res_type,
                            dep.resource.identity(),
                            res_type,
                            resource.identity()
                        )));
                    }

                    let mut dep_params = Params::new();
                    dep_params.insert(REQUIRED_FOR, marker.clone());
                    dep_params.merge_value(params.get(PARAMS_FOR_REQUIRED));

                    let nested = self
                        .expand(
                            dep.res_type,
                            dep.resource,
                            Action::Update,
                            dep_params,
                            &mut *expansion,
                        )
                        .await?;
                    sequence.extend(nested);
                }
            }

            let affected = if isolated {
                Vec::new()
            } else {
                self.graph
                    .affected_resources(&res_type, &resource, &params)
                    .await?
            };

            sequence.push(SequenceEntry {
                res_type,
                resource,
                action,
                params: params.clone(),
            });

            if isolated {
                return Ok(sequence);
            }

            for aff in affected {
                let mut aff_params = Params::new();
                aff_params.insert(CAUSED_BY, marker.clone());
                aff_params.merge_value(params.get(PARAMS_FOR_AFFECTED));

                let aff_node = expansion.node(&aff.res_type, &aff.resource);
                expansion.add_ordering(node, aff_node);
                let needs = self
                    .graph
                    .required_resources(&aff.res_type, &aff.resource, &aff_params)
                    .await?;
                for dep in needs {
                    let dep_node = expansion.node(&dep.res_type, &dep.resource);
                    if !expansion.add_ordering(dep_node, aff_node) {
                        debug!(
                            side_effect = %aff.resource,
                            dependency = %dep.resource,
                            "conflicting order for side effect, keeping it where it is"
                        );
                    }
                }

                sequence.push(SequenceEntry {
                    res_type: aff.res_type,
                    resource: aff.resource,
                    action: Action::Update,
                    params: aff_params,
                });
            }

            Ok(dedup_keep_first(sequence))
        })
    }
}

fn dedup_keep_first(sequence: Vec<SequenceEntry>) -> Vec<SequenceEntry> {
    let mut seen = HashSet::new();
    sequence
        .into_iter()
        .filter(|entry| seen.insert(entry.key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(id: &str, action: Action) -> SequenceEntry {
        SequenceEntry {
            res_type: "website".into(),
            resource: Resource::from(json!({ "id": id })),
            action,
            params: Params::new(),
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence_and_order() {
        let seq = vec![
            entry("a", Action::Update),
            entry("b", Action::Update),
            entry("a", Action::Update),
            entry("a", Action::Create),
            entry("c", Action::Update),
            entry("b", Action::Update),
        ];
        let keys: Vec<_> = dedup_keep_first(seq)
            .into_iter()
            .map(|e| (e.resource.identity().to_string(), e.action))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".to_string(), Action::Update),
                ("b".to_string(), Action::Update),
                ("a".to_string(), Action::Create),
                ("c".to_string(), Action::Update),
            ]
        );
    }

    #[test]
    fn expansion_rejects_back_edges() {
        let mut exp = Expansion::default();
        let a = exp.node("database", &Resource::from(json!({"id": "a"})));
        let b = exp.node("database-user", &Resource::from(json!({"id": "b"})));
        assert!(exp.add_dependency(b, a));
        assert!(!exp.add_dependency(a, b));
        assert!(!exp.add_dependency(a, a));
    }

    fn typed(res_type: &str, id: &str, action: Action) -> SequenceEntry {
        SequenceEntry {
            res_type: res_type.into(),
            resource: Resource::from(json!({ "id": id })),
            action,
            params: Params::new(),
        }
    }

    #[test]
    fn arrange_moves_only_what_is_out_of_order() {
        let mut exp = Expansion::default();
        let seq = vec![
            typed("database-user", "u1", Action::Update),
            typed("database", "d2", Action::Update),
            typed("database-user", "u2", Action::Update),
            typed("database", "d1", Action::Update),
        ];
        let ids: Vec<usize> = seq.iter().map(|e| exp.node(&e.res_type, &e.resource)).collect();
        let (u1, d2, u2, d1) = (ids[0], ids[1], ids[2], ids[3]);
        assert!(exp.add_dependency(u1, d1));
        assert!(exp.add_dependency(u2, d1));
        assert!(exp.add_ordering(u1, d2));
        assert!(exp.add_ordering(u2, d2));
        // contradicts u2 -> d2
        assert!(!exp.add_ordering(d2, u2));

        let order: Vec<_> = exp
            .arrange(seq)
            .into_iter()
            .map(|e| e.resource.identity().to_string())
            .collect();
        assert_eq!(order, vec!["u1", "u2", "d2", "d1"]);
    }
}

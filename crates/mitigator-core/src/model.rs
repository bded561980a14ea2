//! Domain Model
//!
//! Attack-graph templates and their live instances, and mitigation
//! workflow signatures and their parameter-bound instances.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::{resolve_args, ArgSpec};
use crate::{Alert, FieldValue, MitigatorError, Result};

/// Soft scores are kept integral; costs are scaled by this factor and
/// rounded, and every comparison the planner makes must use the same
/// arithmetic.
pub const COST_SCALE: f64 = 1000.0;

/// A node of an attack-graph template: one observable attack step, tagged
/// with the MITRE technique that fires it and gated by conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackNode {
    pub id: u32,
    pub technique: String,
    /// Forward edges; predecessors are derivable and not authoritative.
    #[serde(default)]
    pub next: Vec<u32>,
    #[serde(default)]
    pub conditions: Vec<u32>,
    #[serde(default)]
    pub description: String,
}

/// An attack-graph template: a forward graph of nodes with a designated
/// initial node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackGraph {
    pub id: u32,
    #[serde(default)]
    pub description: String,
    pub nodes: BTreeMap<u32, AttackNode>,
    pub initial: u32,
}

impl AttackGraph {
    /// Check the template invariants: node ids are consistent, every edge
    /// and the initial pointer resolve, and the subgraph reachable from
    /// the initial node is acyclic.
    pub fn validate(&self) -> Result<()> {
        let invariant =
            |msg: String| -> MitigatorError { MitigatorError::CatalogInvariant(msg) };

        for (&id, node) in &self.nodes {
            if id != node.id {
                return Err(invariant(format!(
                    "graph {}: node keyed {id} carries id {}",
                    self.id, node.id
                )));
            }
            for next in &node.next {
                if !self.nodes.contains_key(next) {
                    return Err(invariant(format!(
                        "graph {}: node {id} points at unknown node {next}",
                        self.id
                    )));
                }
            }
        }
        if !self.nodes.contains_key(&self.initial) {
            return Err(invariant(format!(
                "graph {}: initial node {} does not exist",
                self.id, self.initial
            )));
        }

        // DFS cycle check over the subgraph reachable from the initial node
        let mut visiting = BTreeSet::new();
        let mut done = BTreeSet::new();
        let mut stack = vec![(self.initial, 0usize)];
        visiting.insert(self.initial);
        while let Some((node, edge)) = stack.pop() {
            let next = &self.nodes[&node].next;
            if edge < next.len() {
                stack.push((node, edge + 1));
                let child = next[edge];
                if visiting.contains(&child) {
                    return Err(invariant(format!(
                        "graph {}: cycle through node {child}",
                        self.id
                    )));
                }
                if done.insert(child) {
                    visiting.insert(child);
                    stack.push((child, 0));
                }
            } else {
                visiting.remove(&node);
            }
        }
        Ok(())
    }

    /// The node holding the template's entry point.
    pub fn initial_node(&self) -> &AttackNode {
        &self.nodes[&self.initial]
    }

    /// Ancestors of a node: every node from which it is reachable.
    pub fn ancestors(&self, target: u32) -> BTreeSet<u32> {
        self.nodes
            .keys()
            .copied()
            .filter(|&candidate| candidate != target && self.reaches(candidate, target))
            .collect()
    }

    /// Descendants of a node: every node reachable from it.
    pub fn descendants(&self, source: u32) -> BTreeSet<u32> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<u32> = self
            .nodes
            .get(&source)
            .map(|n| n.next.clone())
            .unwrap_or_default();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                if let Some(n) = self.nodes.get(&node) {
                    stack.extend(&n.next);
                }
            }
        }
        seen.remove(&source);
        seen
    }

    fn reaches(&self, from: u32, to: u32) -> bool {
        self.descendants(from).contains(&to)
    }
}

/// A live traversal of an attack-graph template. Instances are engine
/// state, never persisted.
#[derive(Debug, Clone)]
pub struct AttackInstance {
    pub id: Uuid,
    pub graph: u32,
    /// Alerts that advanced this instance, newest first.
    pub ctx: Vec<Arc<Alert>>,
    /// Nodes currently eligible to fire.
    pub front: Vec<u32>,
}

impl AttackInstance {
    pub fn new(graph: u32, alert: Arc<Alert>, front: Vec<u32>) -> Self {
        Self {
            id: Uuid::new_v4(),
            graph,
            ctx: vec![alert],
            front,
        }
    }

    /// Whether this instance already consumed a structurally equal alert.
    pub fn tracks(&self, alert: &Alert) -> bool {
        self.ctx.iter().any(|seen| seen.as_ref() == alert)
    }
}

/// Static description of a mitigation workflow: what it targets, what it
/// needs from the alert, where its webhook lives, and what it costs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSignature {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    /// MITRE technique this workflow mitigates.
    pub target: String,
    pub cost: f64,
    #[serde(default)]
    pub params: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub args: BTreeMap<String, ArgSpec>,
    #[serde(default)]
    pub conditions: Vec<u32>,
}

impl WorkflowSignature {
    /// Invariants checked at load and on CRUD.
    pub fn validate(&self) -> Result<()> {
        if self.cost < 0.0 || !self.cost.is_finite() {
            return Err(MitigatorError::CatalogInvariant(format!(
                "workflow {}: cost must be finite and non-negative",
                self.id
            )));
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(MitigatorError::CatalogInvariant(format!(
                "workflow {}: url must be http(s)",
                self.id
            )));
        }
        Ok(())
    }

    /// A signature applies to an alert when the alert carries its target
    /// technique.
    pub fn applicable_to(&self, alert: &Alert) -> bool {
        alert.has_technique(&self.target)
    }

    /// Bind the signature to an alert, resolving its arguments. `None`
    /// when a required argument is unresolvable (not instantiable).
    pub fn instantiate(self: &Arc<Self>, alert: &Alert) -> Option<WorkflowInstance> {
        let resolved_params = resolve_args(&self.params, &self.args, alert)?;
        Some(WorkflowInstance {
            signature: Arc::clone(self),
            resolved_params,
            cost_factor: 1.0,
        })
    }
}

/// A signature bound to parameters resolved from a specific alert.
#[derive(Debug, Clone)]
pub struct WorkflowInstance {
    pub signature: Arc<WorkflowSignature>,
    pub resolved_params: BTreeMap<String, FieldValue>,
    pub cost_factor: f64,
}

impl WorkflowInstance {
    /// Integer effective cost used by the planner.
    pub fn effective_cost(&self) -> i64 {
        (self.signature.cost * self.cost_factor * COST_SCALE).round() as i64
    }
}

/// One planner assignment: an alert and the workflow chosen for it (or
/// none, which the planner treats as a hard violation).
#[derive(Debug, Clone)]
pub struct Mitigation {
    pub alert: Arc<Alert>,
    pub workflow: Option<WorkflowInstance>,
}

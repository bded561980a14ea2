//! Attack-Instance Engine
//!
//! Tracks the live population of attack instances across all templates and
//! advances their fronts on every incoming alert. Alert handling is
//! serialized: the engine is owned exclusively by the alert worker and
//! `step` takes `&mut self`, so a step is atomic with respect to the
//! catalog snapshots it takes at entry.
//!
//! Advancement returns the ordered list of node-trigger events instead of
//! invoking callbacks mid-traversal; the caller routes them.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::catalog::Catalogs;
use crate::condition::Condition;
use crate::graphdb::GraphQuery;
use crate::model::{AttackGraph, AttackInstance, AttackNode};
use crate::Alert;

/// Reference to a template node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTrigger {
    pub graph: u32,
    pub node: u32,
}

/// What one engine step did.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub alert: Arc<Alert>,
    /// Node-trigger events, in tie-break order (template id, instance
    /// creation order, front enumeration order; spawn checks last).
    pub triggers: Vec<NodeTrigger>,
    pub spawned: Vec<Uuid>,
    pub advanced: Vec<Uuid>,
    pub completed: Vec<Uuid>,
    /// Nodes behind a live front whose probability history has been
    /// persistently high (already-executed steps worth mitigating).
    pub risky_nodes: Vec<NodeTrigger>,
    /// Nodes ahead of a live front currently likely to execute.
    pub likely_nodes: Vec<NodeTrigger>,
}

impl StepOutcome {
    fn new(alert: Arc<Alert>) -> Self {
        Self {
            alert,
            triggers: Vec::new(),
            spawned: Vec::new(),
            advanced: Vec::new(),
            completed: Vec::new(),
            risky_nodes: Vec::new(),
            likely_nodes: Vec::new(),
        }
    }

    /// True when the step left the instance population untouched.
    pub fn is_noop(&self) -> bool {
        self.spawned.is_empty() && self.advanced.is_empty() && self.completed.is_empty()
    }
}

/// Node risk-scoring knobs.
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Lower values keep early nodes improbable until the graph is nearly
    /// complete; higher values grow probability almost linearly.
    pub graph_interest: f64,
    /// Cap on how much overall precondition scarcity can contribute.
    pub ease_impact: f64,
    /// Precondition count a graph is normalized against.
    pub max_conditions: usize,
    /// Minimum probability change worth recording.
    pub epsilon: f64,
    /// Probability above which a node counts as risky/likely.
    pub threshold: f64,
    /// History entries kept per node.
    pub history_limit: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            graph_interest: 0.5,
            ease_impact: 0.3,
            max_conditions: 100,
            epsilon: 1e-4,
            threshold: 0.75,
            history_limit: 256,
        }
    }
}

/// The attack-instance engine (C4).
pub struct AttackEngine {
    catalogs: Arc<Catalogs>,
    graphdb: Arc<dyn GraphQuery>,
    risk: RiskConfig,
    /// Live instances per template, in creation order.
    instances: BTreeMap<u32, Vec<AttackInstance>>,
    /// Probability history per template node.
    histories: BTreeMap<(u32, u32), Vec<f64>>,
}

impl AttackEngine {
    pub fn new(catalogs: Arc<Catalogs>, graphdb: Arc<dyn GraphQuery>) -> Self {
        Self::with_risk(catalogs, graphdb, RiskConfig::default())
    }

    pub fn with_risk(
        catalogs: Arc<Catalogs>,
        graphdb: Arc<dyn GraphQuery>,
        risk: RiskConfig,
    ) -> Self {
        Self {
            catalogs,
            graphdb,
            risk,
            instances: BTreeMap::new(),
            histories: BTreeMap::new(),
        }
    }

    /// Live instances of one template, in creation order.
    pub fn instances_of(&self, graph: u32) -> &[AttackInstance] {
        self.instances.get(&graph).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total live instances across all templates.
    pub fn total_instances(&self) -> usize {
        self.instances.values().map(Vec::len).sum()
    }

    /// Probability history of a template node (risk scoring state).
    pub fn history_of(&self, graph: u32, node: u32) -> &[f64] {
        self.histories
            .get(&(graph, node))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Run one step against every template for an incoming alert.
    pub async fn step(&mut self, alert: Arc<Alert>) -> StepOutcome {
        let graphs = self.catalogs.graphs.snapshot();
        let conditions = self.catalogs.conditions.snapshot();
        let mut outcome = StepOutcome::new(Arc::clone(&alert));

        // Templates removed from the catalog take their instances with them.
        self.instances.retain(|id, _| graphs.contains_key(id));

        for (&graph_id, graph) in graphs.iter() {
            let mut live = self.instances.remove(&graph_id).unwrap_or_default();

            self.advance_instances(graph, &mut live, &alert, &conditions, &mut outcome)
                .await;
            self.try_spawn(graph, &mut live, &alert, &conditions, &mut outcome)
                .await;

            if !live.is_empty() {
                self.update_risk(graph, &live, &alert, &conditions, &mut outcome)
                    .await;
                self.instances.insert(graph_id, live);
            }
        }

        tracing::debug!(
            triggers = outcome.triggers.len(),
            spawned = outcome.spawned.len(),
            advanced = outcome.advanced.len(),
            completed = outcome.completed.len(),
            live = self.total_instances(),
            "engine step done"
        );
        outcome
    }

    async fn advance_instances(
        &self,
        graph: &AttackGraph,
        live: &mut Vec<AttackInstance>,
        alert: &Arc<Alert>,
        conditions: &BTreeMap<u32, Arc<Condition>>,
        outcome: &mut StepOutcome,
    ) {
        let mut kept = Vec::with_capacity(live.len());
        for mut instance in live.drain(..) {
            let mut new_front: Vec<u32> = Vec::new();
            for &node_id in &instance.front {
                // A front entry whose node was edited away is dropped.
                let Some(node) = graph.nodes.get(&node_id) else {
                    tracing::warn!(graph = graph.id, node = node_id, "front references removed node, dropping");
                    continue;
                };
                if node_fires(node, alert, conditions, self.graphdb.as_ref()).await {
                    outcome.triggers.push(NodeTrigger {
                        graph: graph.id,
                        node: node_id,
                    });
                    for &successor in &node.next {
                        if !new_front.contains(&successor) {
                            new_front.push(successor);
                        }
                    }
                } else if !new_front.contains(&node_id) {
                    new_front.push(node_id);
                }
            }

            if new_front.is_empty() {
                tracing::info!(graph = graph.id, instance = %instance.id, "attack instance completed");
                outcome.completed.push(instance.id);
                continue;
            }
            if new_front != instance.front {
                instance.ctx.insert(0, Arc::clone(alert));
                instance.front = new_front;
                outcome.advanced.push(instance.id);
            }
            kept.push(instance);
        }
        *live = kept;
    }

    async fn try_spawn(
        &self,
        graph: &AttackGraph,
        live: &mut Vec<AttackInstance>,
        alert: &Arc<Alert>,
        conditions: &BTreeMap<u32, Arc<Condition>>,
        outcome: &mut StepOutcome,
    ) {
        // An alert already recorded by one of the template's instances
        // never spawns another traversal of the same template.
        if live.iter().any(|i| i.tracks(alert)) {
            return;
        }
        let initial = graph.initial_node();
        if !node_fires(initial, alert, conditions, self.graphdb.as_ref()).await {
            return;
        }
        outcome.triggers.push(NodeTrigger {
            graph: graph.id,
            node: initial.id,
        });
        if initial.next.is_empty() {
            // Single-node pattern: triggered and immediately terminal.
            tracing::info!(graph = graph.id, "single-node attack pattern triggered");
            return;
        }
        let instance = AttackInstance::new(graph.id, Arc::clone(alert), initial.next.clone());
        tracing::info!(graph = graph.id, instance = %instance.id, "attack instance spawned");
        outcome.spawned.push(instance.id);
        live.push(instance);
    }

    /// Recompute per-node probabilities for a template with live
    /// instances, and report risky past / likely future nodes relative to
    /// the current fronts.
    async fn update_risk(
        &mut self,
        graph: &AttackGraph,
        live: &[AttackInstance],
        alert: &Arc<Alert>,
        conditions: &BTreeMap<u32, Arc<Condition>>,
        outcome: &mut StepOutcome,
    ) {
        let total_conditions: usize = graph.nodes.values().map(|n| n.conditions.len()).sum();
        let factor_2 = total_conditions as f64 / self.risk.max_conditions as f64
            * self.risk.ease_impact;
        let exponent = (1.0 - self.risk.graph_interest) * 4.0 + 1.0;

        for (&node_id, node) in &graph.nodes {
            let before = graph.ancestors(node_id).len() as f64;
            let after = graph.descendants(node_id).len() as f64;
            let factor_1 = (before / (before + 1.0 + after)).powf(exponent);
            let factor_3 = if node.conditions.is_empty() {
                1.0
            } else {
                let mut met = 0usize;
                for id in &node.conditions {
                    if let Some(condition) = conditions.get(id) {
                        if condition.is_met(alert, self.graphdb.as_ref()).await {
                            met += 1;
                        }
                    }
                }
                met as f64 / node.conditions.len() as f64
            };

            let probability = (factor_1 + factor_2 + factor_3) / 3.0;
            let history = self.histories.entry((graph.id, node_id)).or_default();
            let current = history.last().copied().unwrap_or(0.0);
            if (probability - current).abs() >= self.risk.epsilon {
                history.push(probability);
                if history.len() > self.risk.history_limit {
                    history.remove(0);
                }
            }
        }

        for instance in live {
            for &front_node in &instance.front {
                for past in graph.ancestors(front_node) {
                    let history = self.history_of(graph.id, past);
                    if !history.is_empty()
                        && history.iter().sum::<f64>() / history.len() as f64
                            > self.risk.threshold
                    {
                        let entry = NodeTrigger {
                            graph: graph.id,
                            node: past,
                        };
                        if !outcome.risky_nodes.contains(&entry) {
                            outcome.risky_nodes.push(entry);
                        }
                    }
                }
                for future in graph.descendants(front_node) {
                    let current = self
                        .history_of(graph.id, future)
                        .last()
                        .copied()
                        .unwrap_or(0.0);
                    if current > self.risk.threshold {
                        let entry = NodeTrigger {
                            graph: graph.id,
                            node: future,
                        };
                        if !outcome.likely_nodes.contains(&entry) {
                            outcome.likely_nodes.push(entry);
                        }
                    }
                }
            }
        }
    }
}

async fn node_fires(
    node: &AttackNode,
    alert: &Alert,
    conditions: &BTreeMap<u32, Arc<Condition>>,
    graphdb: &dyn GraphQuery,
) -> bool {
    if !alert.has_technique(&node.technique) {
        return false;
    }
    for id in &node.conditions {
        let Some(condition) = conditions.get(id) else {
            tracing::warn!(node = node.id, condition = id, "node references unknown condition, treating as unmet");
            return false;
        };
        if !condition.is_met(alert, graphdb).await {
            tracing::debug!(node = node.id, condition = id, "node condition not met");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphdb::NoGraphDb;
    use crate::FieldValue;
    use chrono::Utc;

    fn alert(techniques: &[&str], data: &[(&str, &str)]) -> Arc<Alert> {
        Arc::new(Alert {
            description: String::new(),
            timestamp: Utc::now(),
            techniques: techniques.iter().map(|t| t.to_string()).collect(),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), FieldValue::Str(v.to_string())))
                .collect(),
        })
    }

    fn node(id: u32, technique: &str, next: &[u32], conditions: &[u32]) -> AttackNode {
        AttackNode {
            id,
            technique: technique.to_string(),
            next: next.to_vec(),
            conditions: conditions.to_vec(),
            description: String::new(),
        }
    }

    fn chain_catalogs() -> Arc<Catalogs> {
        let catalogs = Catalogs::new();
        catalogs
            .insert_condition(
                serde_json::from_value(serde_json::json!({
                    "id": 201,
                    "description": "File is a python script",
                    "args": {"file_path": "file_path"},
                    "check": "(endswith (get parameters \"file_path\") \".py\")"
                }))
                .unwrap(),
            )
            .unwrap();
        catalogs
            .insert_graph(AttackGraph {
                id: 1,
                description: "ncat, then chmod, then ransomware".into(),
                nodes: [
                    (101, node(101, "T1041", &[102], &[])),
                    (102, node(102, "T1222.002", &[103], &[201])),
                    (103, node(103, "T1204.002", &[], &[201])),
                ]
                .into_iter()
                .collect(),
                initial: 101,
            })
            .unwrap();
        Arc::new(catalogs)
    }

    fn engine(catalogs: Arc<Catalogs>) -> AttackEngine {
        AttackEngine::new(catalogs, Arc::new(NoGraphDb))
    }

    #[tokio::test]
    async fn test_spawn_advance_complete() {
        let mut engine = engine(chain_catalogs());

        // Step 1: exfiltration alert spawns an instance at node102
        let outcome = engine.step(alert(&["T1041", "T1219"], &[])).await;
        assert_eq!(outcome.spawned.len(), 1);
        assert_eq!(
            outcome.triggers,
            vec![NodeTrigger { graph: 1, node: 101 }]
        );
        let instance = &engine.instances_of(1)[0];
        assert_eq!(instance.front, vec![102]);
        assert_eq!(instance.ctx.len(), 1);

        // Step 2: chmod alert advances the front to node103
        let outcome = engine
            .step(alert(&["T1222.002"], &[("file_path", "/tmp/zerologon_tester.py")]))
            .await;
        assert_eq!(outcome.advanced.len(), 1);
        assert_eq!(
            outcome.triggers,
            vec![NodeTrigger { graph: 1, node: 102 }]
        );
        let instance = &engine.instances_of(1)[0];
        assert_eq!(instance.front, vec![103]);
        assert_eq!(instance.ctx.len(), 2);

        // Step 3: execution alert completes and removes the instance
        let outcome = engine
            .step(alert(&["T1204.002"], &[("file_path", "/tmp/zerologon_tester.py")]))
            .await;
        assert_eq!(outcome.completed.len(), 1);
        assert_eq!(engine.total_instances(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_technique_is_noop() {
        let mut engine = engine(chain_catalogs());
        let outcome = engine.step(alert(&["T9999"], &[])).await;
        assert!(outcome.is_noop());
        assert!(outcome.triggers.is_empty());
        assert_eq!(engine.total_instances(), 0);
    }

    #[tokio::test]
    async fn test_condition_blocks_advancement() {
        let mut engine = engine(chain_catalogs());
        engine.step(alert(&["T1041"], &[])).await;

        // Right technique, wrong file: node102's condition fails
        let outcome = engine
            .step(alert(&["T1222.002"], &[("file_path", "/tmp/note.txt")]))
            .await;
        assert!(outcome.is_noop());
        assert!(outcome.triggers.is_empty());
        let instance = &engine.instances_of(1)[0];
        assert_eq!(instance.front, vec![102]);
        assert_eq!(instance.ctx.len(), 1);
    }

    #[tokio::test]
    async fn test_front_closure_and_uniqueness() {
        // Diamond: both branches fire on the same alert, the join node
        // must appear once.
        let catalogs = Catalogs::new();
        catalogs
            .insert_graph(AttackGraph {
                id: 2,
                description: String::new(),
                nodes: [
                    (1, node(1, "T0001", &[2, 3], &[])),
                    (2, node(2, "T0002", &[4], &[])),
                    (3, node(3, "T0002", &[4], &[])),
                    (4, node(4, "T0004", &[], &[])),
                ]
                .into_iter()
                .collect(),
                initial: 1,
            })
            .unwrap();
        let catalogs = Arc::new(catalogs);
        let mut engine = engine(Arc::clone(&catalogs));

        engine.step(alert(&["T0001"], &[])).await;
        assert_eq!(engine.instances_of(2)[0].front, vec![2, 3]);

        let outcome = engine.step(alert(&["T0002"], &[])).await;
        assert_eq!(
            outcome.triggers,
            vec![
                NodeTrigger { graph: 2, node: 2 },
                NodeTrigger { graph: 2, node: 3 }
            ]
        );
        let front = &engine.instances_of(2)[0].front;
        assert_eq!(front, &vec![4]);

        // P1: front nodes exist and are unique
        let graph = catalogs.graphs.get(2).unwrap();
        for n in front {
            assert!(graph.nodes.contains_key(n));
        }
    }

    #[tokio::test]
    async fn test_single_node_pattern_triggers_without_instance() {
        let catalogs = Catalogs::new();
        catalogs
            .insert_graph(AttackGraph {
                id: 3,
                description: String::new(),
                nodes: [(10, node(10, "T1110", &[], &[]))].into_iter().collect(),
                initial: 10,
            })
            .unwrap();
        let mut engine = engine(Arc::new(catalogs));

        let outcome = engine.step(alert(&["T1110"], &[])).await;
        assert_eq!(
            outcome.triggers,
            vec![NodeTrigger { graph: 3, node: 10 }]
        );
        assert_eq!(engine.total_instances(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_alert_does_not_spawn_twice() {
        let mut engine = engine(chain_catalogs());
        let a = alert(&["T1041"], &[("agent_id", "001")]);
        engine.step(Arc::clone(&a)).await;
        assert_eq!(engine.total_instances(), 1);

        // The identical alert is already tracked by the live instance
        let outcome = engine.step(a).await;
        assert!(outcome.spawned.is_empty());
        assert_eq!(engine.total_instances(), 1);
    }

    #[tokio::test]
    async fn test_distinct_alert_spawns_second_instance() {
        let mut engine = engine(chain_catalogs());
        engine.step(alert(&["T1041"], &[("agent_id", "001")])).await;
        let outcome = engine.step(alert(&["T1041"], &[("agent_id", "002")])).await;
        assert_eq!(outcome.spawned.len(), 1);
        assert_eq!(engine.total_instances(), 2);
    }

    #[tokio::test]
    async fn test_risk_histories_accumulate() {
        let mut engine = engine(chain_catalogs());
        engine.step(alert(&["T1041"], &[])).await;
        // Histories exist for the template's nodes once an instance lives
        assert!(!engine.history_of(1, 101).is_empty());
        assert!(!engine.history_of(1, 102).is_empty());
    }
}

//! Catalogs
//!
//! Read-mostly registries for conditions, attack-graph templates and
//! workflow signatures. Readers snapshot the backing map wait-free at the
//! start of an alert-handling pass and see a consistent view for the whole
//! pass; mutations clone, validate and atomically swap.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::condition::{Condition, ConditionSpec};
use crate::model::{AttackGraph, AttackNode, WorkflowSignature};
use crate::{MitigatorError, Result};

/// Copy-on-write registry keyed by entity id.
pub struct Catalog<T> {
    entries: ArcSwap<BTreeMap<u32, Arc<T>>>,
    /// Bumped on every swap, for cache invalidation and diagnostics.
    version: AtomicU64,
}

impl<T> Catalog<T> {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(BTreeMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Wait-free consistent view of the catalog.
    pub fn snapshot(&self) -> Arc<BTreeMap<u32, Arc<T>>> {
        self.entries.load_full()
    }

    pub fn get(&self, id: u32) -> Option<Arc<T>> {
        self.entries.load().get(&id).cloned()
    }

    pub fn insert(&self, id: u32, entry: T) {
        let mut next = BTreeMap::clone(&self.entries.load());
        next.insert(id, Arc::new(entry));
        self.entries.store(Arc::new(next));
        self.version.fetch_add(1, Ordering::Release);
    }

    pub fn remove(&self, id: u32) -> bool {
        let mut next = BTreeMap::clone(&self.entries.load());
        let removed = next.remove(&id).is_some();
        if removed {
            self.entries.store(Arc::new(next));
            self.version.fetch_add(1, Ordering::Release);
        }
        removed
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

impl<T> Default for Catalog<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub type ConditionCatalog = Catalog<Condition>;
pub type GraphCatalog = Catalog<AttackGraph>;
pub type WorkflowCatalog = Catalog<WorkflowSignature>;

/// The three catalogs plus cross-catalog validation. All CRUD goes
/// through here so an entity that violates the invariants never lands in
/// a registry.
#[derive(Default)]
pub struct Catalogs {
    pub conditions: ConditionCatalog,
    pub graphs: GraphCatalog,
    pub workflows: WorkflowCatalog,
}

impl Catalogs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and store a condition. Rejected (not stored) on syntax errors.
    pub fn insert_condition(&self, spec: ConditionSpec) -> Result<()> {
        let condition = Condition::try_from(spec)?;
        self.conditions.insert(condition.id, condition);
        Ok(())
    }

    /// Validate and store an attack-graph template.
    pub fn insert_graph(&self, graph: AttackGraph) -> Result<()> {
        graph.validate()?;
        self.check_condition_refs(
            graph.nodes.values().flat_map(|n| n.conditions.iter()),
            &format!("graph {}", graph.id),
        )?;
        self.graphs.insert(graph.id, graph);
        Ok(())
    }

    /// Validate and store a workflow signature.
    pub fn insert_workflow(&self, workflow: WorkflowSignature) -> Result<()> {
        workflow.validate()?;
        self.check_condition_refs(
            workflow.conditions.iter(),
            &format!("workflow {}", workflow.id),
        )?;
        self.workflows.insert(workflow.id, workflow);
        Ok(())
    }

    /// Replace a node inside whichever template owns it. Node ids are
    /// unique across the graph document; a node nobody owns is rejected.
    pub fn update_node(&self, node: AttackNode) -> Result<()> {
        self.check_condition_refs(node.conditions.iter(), &format!("node {}", node.id))?;
        let snapshot = self.graphs.snapshot();
        let owner = snapshot
            .values()
            .find(|g| g.nodes.contains_key(&node.id))
            .ok_or_else(|| {
                MitigatorError::CatalogInvariant(format!(
                    "node {} does not belong to any attack graph",
                    node.id
                ))
            })?;
        let mut updated = AttackGraph::clone(owner);
        updated.nodes.insert(node.id, node);
        updated.validate()?;
        self.graphs.insert(updated.id, updated);
        Ok(())
    }

    /// Find a node across all templates.
    pub fn find_node(&self, id: u32) -> Option<AttackNode> {
        self.graphs
            .snapshot()
            .values()
            .find_map(|g| g.nodes.get(&id).cloned())
    }

    fn check_condition_refs<'a>(
        &self,
        mut refs: impl Iterator<Item = &'a u32>,
        owner: &str,
    ) -> Result<()> {
        let conditions = self.conditions.snapshot();
        match refs.find(|id| !conditions.contains_key(id)) {
            Some(missing) => Err(MitigatorError::CatalogInvariant(format!(
                "{owner} references unknown condition {missing}"
            ))),
            None => Ok(()),
        }
    }
}

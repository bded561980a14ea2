//! Catalog Persistence
//!
//! Three on-disk JSON documents, one each for conditions, attack graphs
//! and workflow signatures. Each document is a list of entity objects,
//! read in full at startup and rewritten in full on CRUD. Rewrites go
//! through a sibling temp file and `rename`, so readers only ever observe
//! a complete document.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::catalog::Catalogs;
use crate::condition::ConditionSpec;
use crate::model::{AttackGraph, WorkflowSignature};
use crate::Result;

pub struct CatalogStore {
    conditions_path: PathBuf,
    graphs_path: PathBuf,
    workflows_path: PathBuf,
}

impl CatalogStore {
    pub fn new(
        conditions_path: impl Into<PathBuf>,
        graphs_path: impl Into<PathBuf>,
        workflows_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            conditions_path: conditions_path.into(),
            graphs_path: graphs_path.into(),
            workflows_path: workflows_path.into(),
        }
    }

    /// Load all three documents into the catalogs. Conditions load first
    /// so graph and workflow references validate against them. Any
    /// invariant violation aborts the load; at startup that is fatal.
    pub fn load_into(&self, catalogs: &Catalogs) -> Result<()> {
        let conditions: Vec<ConditionSpec> = read_list(&self.conditions_path)?;
        for spec in conditions {
            catalogs.insert_condition(spec)?;
        }
        let graphs: Vec<AttackGraph> = read_list(&self.graphs_path)?;
        for graph in graphs {
            catalogs.insert_graph(graph)?;
        }
        let workflows: Vec<WorkflowSignature> = read_list(&self.workflows_path)?;
        for workflow in workflows {
            catalogs.insert_workflow(workflow)?;
        }
        tracing::info!(
            conditions = catalogs.conditions.len(),
            graphs = catalogs.graphs.len(),
            workflows = catalogs.workflows.len(),
            "catalogs loaded"
        );
        Ok(())
    }

    pub fn persist_conditions(&self, catalogs: &Catalogs) -> Result<()> {
        let specs: Vec<ConditionSpec> = catalogs
            .conditions
            .snapshot()
            .values()
            .map(|c| ConditionSpec::from(c.as_ref()))
            .collect();
        write_atomic(&self.conditions_path, &specs)
    }

    pub fn persist_graphs(&self, catalogs: &Catalogs) -> Result<()> {
        let graphs: Vec<AttackGraph> = catalogs
            .graphs
            .snapshot()
            .values()
            .map(|g| AttackGraph::clone(g))
            .collect();
        write_atomic(&self.graphs_path, &graphs)
    }

    pub fn persist_workflows(&self, catalogs: &Catalogs) -> Result<()> {
        let workflows: Vec<WorkflowSignature> = catalogs
            .workflows
            .snapshot()
            .values()
            .map(|w| WorkflowSignature::clone(w))
            .collect();
        write_atomic(&self.workflows_path, &workflows)
    }

    /// Rewrite all three documents.
    pub fn persist(&self, catalogs: &Catalogs) -> Result<()> {
        self.persist_conditions(catalogs)?;
        self.persist_graphs(catalogs)?;
        self.persist_workflows(catalogs)
    }
}

fn read_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic<T: Serialize>(path: &Path, entries: &[T]) -> Result<()> {
    let content = serde_json::to_string_pretty(entries)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

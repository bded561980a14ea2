//! Mitigation Engine Core
//!
//! Consumes intrusion-detection alerts tagged with MITRE ATT&CK technique
//! identifiers and reacts on two fronts:
//!
//! - **Attack tracking**: advances a population of live attack-graph
//!   instances so multi-step attack patterns are recognized as they unfold
//! - **Mitigation**: selects the cheapest set of applicable mitigation
//!   workflows for each alert and fires their webhooks
//!
//! ## Components
//!
//! - [`normalize`] — flatten inbound alert documents via a mapping schema
//! - [`condition`] — stored predicates over alert fields (Lisp-ish dialect)
//! - [`catalog`] — copy-on-write registries for graphs/workflows/conditions
//! - [`engine`] — live attack-instance population and front advancement
//! - [`planner`] — cost-minimizing alert→workflow assignment
//! - [`dispatch`] — concurrent webhook fan-out
//! - [`graphdb`] — client seam for the situational-awareness graph database
//! - [`store`] — persisted catalog documents with atomic rewrite

pub mod catalog;
pub mod condition;
pub mod dispatch;
pub mod engine;
pub mod graphdb;
pub mod model;
pub mod normalize;
pub mod planner;
pub mod store;

pub use catalog::{Catalogs, ConditionCatalog, GraphCatalog, WorkflowCatalog};
pub use condition::{ArgSpec, Condition, ConditionSpec};
pub use dispatch::{DispatchOutcome, Dispatcher, DispatcherConfig};
pub use engine::{AttackEngine, NodeTrigger, RiskConfig, StepOutcome};
pub use graphdb::{GraphDbError, GraphQuery, HttpGraphClient, NoGraphDb};
pub use model::{AttackGraph, AttackInstance, AttackNode, Mitigation, WorkflowInstance, WorkflowSignature};
pub use normalize::MappingSchema;
pub use planner::{Plan, Planner, PlannerConfig};

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mitigation engine errors
#[derive(Error, Debug)]
pub enum MitigatorError {
    /// Alert failed normalization
    #[error("malformed alert: {0}")]
    MalformedAlert(String),

    /// Condition expression rejected at load time
    #[error("condition syntax error: {0}")]
    ConditionSyntax(String),

    /// Condition expression failed at evaluation time
    #[error("condition evaluation error: {0}")]
    ConditionEval(String),

    /// Persisted or posted entity violates a catalog invariant
    #[error("catalog invariant violated: {0}")]
    CatalogInvariant(String),

    /// No assignment satisfies the hard constraints
    #[error("no feasible mitigation plan: {0}")]
    PlannerInfeasible(String),

    /// Webhook dispatch failed
    #[error("dispatch failure: {0}")]
    DispatchFailure(String),

    /// Graph database error
    #[error(transparent)]
    GraphDb(#[from] GraphDbError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MitigatorError>;

/// A flat alert field value: a scalar or a homogeneous vector of scalars.
///
/// Lists never nest; the normalizer enforces this on ingest and the stored
/// catalogs reject anything deeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            FieldValue::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "none",
            FieldValue::Bool(_) => "bool",
            FieldValue::Num(_) => "number",
            FieldValue::Str(_) => "string",
            FieldValue::List(_) => "list",
        }
    }

    /// Total order used for deterministic tie-breaking. Values of different
    /// shapes order by shape rank; numbers use IEEE total order.
    pub fn lexical_cmp(&self, other: &FieldValue) -> Ordering {
        fn rank(v: &FieldValue) -> u8 {
            match v {
                FieldValue::Null => 0,
                FieldValue::Bool(_) => 1,
                FieldValue::Num(_) => 2,
                FieldValue::Str(_) => 3,
                FieldValue::List(_) => 4,
            }
        }
        match (self, other) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::Num(a), FieldValue::Num(b)) => a.total_cmp(b),
            (FieldValue::Str(a), FieldValue::Str(b)) => a.cmp(b),
            (FieldValue::List(a), FieldValue::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.lexical_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

/// Deterministic order over parameter maps, keys first, then values.
pub fn lexical_cmp_params(
    a: &BTreeMap<String, FieldValue>,
    b: &BTreeMap<String, FieldValue>,
) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        let ord = ka.cmp(kb).then_with(|| va.lexical_cmp(vb));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// A normalized intrusion-detection alert.
///
/// Immutable after normalization; shared by reference throughout the
/// pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub description: String,
    pub timestamp: DateTime<Utc>,
    /// MITRE ATT&CK technique identifiers (`T####` or `T####.###`)
    pub techniques: BTreeSet<String>,
    /// Flat symbolic field name → value mapping
    pub data: BTreeMap<String, FieldValue>,
}

impl Alert {
    /// Look up a field that is present in the alert data.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.data.get(name)
    }

    /// Whether the alert carries the given technique.
    pub fn has_technique(&self, technique: &str) -> bool {
        self.techniques.contains(technique)
    }
}

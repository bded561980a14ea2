//! Conditions
//!
//! A condition gates an attack-graph edge or a workflow on alert payload
//! fields: literal default parameters, a declaration of which alert fields
//! must resolve, and a check expression over the merged map. A condition is
//! met iff every declared argument resolves *and* the expression returns
//! true; a resolution failure short-circuits to false without evaluating.

pub mod expr;

pub use expr::{EvalContext, Expr};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graphdb::GraphQuery;
use crate::{Alert, FieldValue, MitigatorError, Result};

/// How one named argument resolves from alert data: a single required
/// field, or the first present and non-null field of a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgSpec {
    Field(String),
    AnyOf(Vec<String>),
}

/// Wire/persisted form of a condition; `check` is the expression source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionSpec {
    pub id: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub args: BTreeMap<String, ArgSpec>,
    pub check: String,
}

/// A loaded condition with its check expression parsed.
#[derive(Debug, Clone)]
pub struct Condition {
    pub id: u32,
    pub description: String,
    pub params: BTreeMap<String, FieldValue>,
    pub args: BTreeMap<String, ArgSpec>,
    pub check: Expr,
    /// Original expression text, kept so the condition round-trips.
    pub source: String,
}

impl TryFrom<ConditionSpec> for Condition {
    type Error = MitigatorError;

    fn try_from(spec: ConditionSpec) -> Result<Self> {
        let check = Expr::parse(&spec.check).map_err(|e| {
            MitigatorError::ConditionSyntax(format!("condition {}: {e}", spec.id))
        })?;
        Ok(Self {
            id: spec.id,
            description: spec.description,
            params: spec.params,
            args: spec.args,
            check,
            source: spec.check,
        })
    }
}

impl From<&Condition> for ConditionSpec {
    fn from(condition: &Condition) -> Self {
        Self {
            id: condition.id,
            description: condition.description.clone(),
            params: condition.params.clone(),
            args: condition.args.clone(),
            check: condition.source.clone(),
        }
    }
}

/// Resolve declared arguments against alert data and merge them over the
/// literal parameters (resolved entries win). Returns `None` when any
/// required argument is unresolvable.
pub fn resolve_args(
    params: &BTreeMap<String, FieldValue>,
    args: &BTreeMap<String, ArgSpec>,
    alert: &Alert,
) -> Option<BTreeMap<String, FieldValue>> {
    let mut merged = params.clone();
    for (key, spec) in args {
        let value = match spec {
            ArgSpec::Field(field) => alert.field(field)?.clone(),
            ArgSpec::AnyOf(fields) => fields
                .iter()
                .filter_map(|f| alert.field(f))
                .find(|v| !v.is_null())?
                .clone(),
        };
        merged.insert(key.clone(), value);
    }
    Some(merged)
}

impl Condition {
    /// Effective parameters for an alert, or `None` if an argument is
    /// unresolvable.
    pub fn parameters(&self, alert: &Alert) -> Option<BTreeMap<String, FieldValue>> {
        resolve_args(&self.params, &self.args, alert)
    }

    /// Whether the condition is met by the alert.
    ///
    /// Evaluation failures (including graph-database errors) yield `false`
    /// so that a collaborator blip never advances an attack graph.
    pub async fn is_met(&self, alert: &Alert, graph: &dyn GraphQuery) -> bool {
        let Some(parameters) = self.parameters(alert) else {
            tracing::debug!(condition = self.id, "required argument unresolved, condition unmet");
            return false;
        };
        let ctx = EvalContext {
            parameters: &parameters,
            graph,
        };
        match self.check.eval_bool(&ctx).await {
            Ok(met) => {
                tracing::debug!(condition = self.id, met, "condition evaluated");
                met
            }
            Err(MitigatorError::GraphDb(e)) => {
                tracing::warn!(condition = self.id, error = %e, "graph database unavailable, treating condition as unmet");
                false
            }
            Err(e) => {
                tracing::debug!(condition = self.id, error = %e, "condition evaluation failed, treating as unmet");
                false
            }
        }
    }
}

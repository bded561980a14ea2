//! Mitigation Planner
//!
//! Assigns workflows to alerts under two hard constraints and one soft
//! objective:
//!
//! - **H1 applicability** — an assigned workflow must target one of the
//!   alert's techniques and all of its conditions must be met
//! - **H2 coverage** — every alert gets at least one workflow, or is
//!   reported unmitigated
//! - **S1 cost** — the total effective cost of chosen instances is minimal
//!
//! Candidates are searched branch-and-bound under a wall-clock budget; on
//! expiry the best feasible solution found so far is returned. Equal costs
//! break ties by workflow id ascending, then by parameter-map order, which
//! keeps plans deterministic for identical inputs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::Catalogs;
use crate::graphdb::GraphQuery;
use crate::model::{Mitigation, WorkflowInstance};
use crate::{lexical_cmp_params, Alert};

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Hard wall-clock deadline for the search.
    pub time_limit: Duration,
    /// Assignment slots per alert; bounds how many candidate instances
    /// are carried into the search.
    pub mitigation_slots: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            time_limit: Duration::from_secs(1),
            mitigation_slots: 10,
        }
    }
}

/// The planner's result for one batch of alerts.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Chosen assignments; every entry carries a workflow instance.
    pub mitigations: Vec<Mitigation>,
    /// Alerts for which no feasible assignment exists.
    pub unmitigated: Vec<Arc<Alert>>,
    /// Total effective cost of the chosen instances.
    pub cost: i64,
}

pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Plan mitigations for a batch of alerts (typically one per engine
    /// step). Conditions are evaluated here, so the call may suspend on
    /// the graph-database escape.
    pub async fn plan(
        &self,
        alerts: &[Arc<Alert>],
        catalogs: &Catalogs,
        graphdb: &dyn GraphQuery,
    ) -> Plan {
        let deadline = Instant::now() + self.config.time_limit;
        let mut plan = Plan::default();
        let mut per_alert: Vec<(Arc<Alert>, Vec<WorkflowInstance>)> = Vec::new();

        for alert in alerts {
            let candidates = self.candidates(alert, catalogs, graphdb).await;
            if candidates.is_empty() {
                tracing::warn!(
                    alert = %alert.description,
                    techniques = ?alert.techniques,
                    "no feasible mitigation, alert unmitigated"
                );
                plan.unmitigated.push(Arc::clone(alert));
            } else {
                per_alert.push((Arc::clone(alert), candidates));
            }
        }

        if per_alert.is_empty() {
            return plan;
        }

        let candidate_lists: Vec<&[WorkflowInstance]> =
            per_alert.iter().map(|(_, c)| c.as_slice()).collect();
        let Some(chosen) = search(&candidate_lists, deadline) else {
            // Deadline too tight for even one descent
            plan.unmitigated
                .extend(per_alert.iter().map(|(a, _)| Arc::clone(a)));
            return plan;
        };

        for ((alert, candidates), index) in per_alert.iter().zip(chosen) {
            let workflow = candidates[index].clone();
            plan.cost += workflow.effective_cost();
            plan.mitigations.push(Mitigation {
                alert: Arc::clone(alert),
                workflow: Some(workflow),
            });
        }
        tracing::debug!(
            assignments = plan.mitigations.len(),
            unmitigated = plan.unmitigated.len(),
            cost = plan.cost,
            "plan computed"
        );
        plan
    }

    /// Generate the candidate instances for one alert: applicable target,
    /// all conditions met, arguments resolvable. Sorted by effective cost
    /// with the deterministic tie-break, bounded by the slot count.
    async fn candidates(
        &self,
        alert: &Alert,
        catalogs: &Catalogs,
        graphdb: &dyn GraphQuery,
    ) -> Vec<WorkflowInstance> {
        let workflows = catalogs.workflows.snapshot();
        let conditions = catalogs.conditions.snapshot();
        let mut out = Vec::new();

        'workflows: for signature in workflows.values() {
            if !signature.applicable_to(alert) {
                continue;
            }
            for id in &signature.conditions {
                let Some(condition) = conditions.get(id) else {
                    tracing::warn!(workflow = signature.id, condition = id, "workflow references unknown condition, skipping");
                    continue 'workflows;
                };
                if !condition.is_met(alert, graphdb).await {
                    continue 'workflows;
                }
            }
            let Some(instance) = signature.instantiate(alert) else {
                tracing::debug!(workflow = signature.id, "arguments unresolvable, not instantiable");
                continue;
            };
            out.push(instance);
        }

        out.sort_by(|a, b| {
            a.effective_cost()
                .cmp(&b.effective_cost())
                .then_with(|| a.signature.id.cmp(&b.signature.id))
                .then_with(|| lexical_cmp_params(&a.resolved_params, &b.resolved_params))
        });
        out.truncate(self.config.mitigation_slots);
        out
    }
}

/// Branch-and-bound over per-alert candidate lists. Lists are sorted by
/// cost, so the first leaf reached is already feasible and the remaining
/// search only tightens it; on deadline expiry the best so far wins.
fn search(candidates: &[&[WorkflowInstance]], deadline: Instant) -> Option<Vec<usize>> {
    // Cheapest completion from alert i onward, for pruning.
    let mut suffix_min = vec![0i64; candidates.len() + 1];
    for i in (0..candidates.len()).rev() {
        suffix_min[i] = suffix_min[i + 1] + candidates[i][0].effective_cost();
    }

    let mut best: Option<(i64, Vec<usize>)> = None;
    let mut current = Vec::with_capacity(candidates.len());
    descend(
        candidates,
        &suffix_min,
        deadline,
        0,
        0,
        &mut current,
        &mut best,
    );
    best.map(|(_, choice)| choice)
}

fn descend(
    candidates: &[&[WorkflowInstance]],
    suffix_min: &[i64],
    deadline: Instant,
    depth: usize,
    cost_so_far: i64,
    current: &mut Vec<usize>,
    best: &mut Option<(i64, Vec<usize>)>,
) {
    if depth == candidates.len() {
        if best.as_ref().map_or(true, |(c, _)| cost_so_far < *c) {
            *best = Some((cost_so_far, current.clone()));
        }
        return;
    }
    for (index, candidate) in candidates[depth].iter().enumerate() {
        // Keep the first complete assignment even when the deadline fires
        // mid-descent, so a result always exists.
        if best.is_some() && Instant::now() >= deadline {
            return;
        }
        let cost = cost_so_far + candidate.effective_cost();
        if let Some((bound, _)) = best {
            if cost + suffix_min[depth + 1] >= *bound {
                // Candidates are cost-sorted: later ones only cost more.
                return;
            }
        }
        current.push(index);
        descend(
            candidates,
            suffix_min,
            deadline,
            depth + 1,
            cost,
            current,
            best,
        );
        current.pop();
    }
}

//! Webhook Dispatch
//!
//! Enacts a mitigation plan: each chosen workflow instance is POSTed as a
//! JSON body of its resolved parameters to the signature's webhook URL.
//! 2xx counts as success; anything else (status, connect error, timeout)
//! is a dispatch failure that is logged and reported to the caller.
//! Failures are **never** retried here, webhooks are not idempotent in
//! general.
//!
//! Dispatches within one plan run concurrently; a workflow instance is
//! never POSTed twice for the same plan.

use std::time::Duration;

use crate::model::WorkflowInstance;
use crate::planner::Plan;
use crate::{MitigatorError, Result};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Result of one webhook POST.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub workflow: u32,
    pub name: String,
    pub url: String,
    pub status: Option<u16>,
    pub error: Option<String>,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Dispatcher {
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MitigatorError::DispatchFailure(e.to_string()))?;
        Ok(Self { client })
    }

    /// Fire every chosen workflow of a plan, concurrently, deduplicated.
    pub async fn dispatch(&self, plan: &Plan) -> Vec<DispatchOutcome> {
        let mut unique: Vec<WorkflowInstance> = Vec::new();
        for mitigation in &plan.mitigations {
            let Some(instance) = &mitigation.workflow else {
                continue;
            };
            let duplicate = unique.iter().any(|seen| {
                seen.signature.id == instance.signature.id
                    && seen.resolved_params == instance.resolved_params
            });
            if !duplicate {
                unique.push(instance.clone());
            }
        }

        let mut handles = Vec::with_capacity(unique.len());
        for instance in unique {
            let client = self.client.clone();
            handles.push(tokio::spawn(deliver(client, instance)));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::error!(error = %e, "dispatch task failed"),
            }
        }
        outcomes
    }
}

async fn deliver(client: reqwest::Client, instance: WorkflowInstance) -> DispatchOutcome {
    let signature = &instance.signature;
    let mut outcome = DispatchOutcome {
        workflow: signature.id,
        name: signature.name.clone(),
        url: signature.url.clone(),
        status: None,
        error: None,
    };

    tracing::debug!(workflow = signature.id, url = %signature.url, "dispatching workflow");
    let response = client
        .post(&signature.url)
        .json(&instance.resolved_params)
        .send()
        .await;

    match response {
        Ok(response) => {
            outcome.status = Some(response.status().as_u16());
            if response.status().is_success() {
                tracing::info!(workflow = %signature.name, url = %signature.url, "workflow dispatched");
            } else {
                outcome.error = Some(format!("HTTP {}", response.status()));
                tracing::error!(
                    workflow = %signature.name,
                    url = %signature.url,
                    status = response.status().as_u16(),
                    "workflow dispatch failed"
                );
            }
        }
        Err(e) => {
            outcome.error = Some(e.to_string());
            tracing::error!(workflow = %signature.name, url = %signature.url, error = %e, "workflow dispatch failed");
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mitigation, WorkflowSignature};
    use crate::{Alert, FieldValue};
    use chrono::Utc;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal one-shot HTTP responder; returns the body it received.
    async fn http_responder(status: u16) -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            let request = loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let expected: usize = head
                        .to_ascii_lowercase()
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length: ")?.trim().parse().ok())
                        .unwrap_or(0);
                    if body.len() >= expected || n == 0 {
                        break text;
                    }
                }
                if n == 0 {
                    break String::from_utf8_lossy(&raw).to_string();
                }
            };
            let body = request
                .split("\r\n\r\n")
                .nth(1)
                .unwrap_or_default()
                .to_string();
            let reply = format!(
                "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            assert!(request
                .to_ascii_lowercase()
                .contains("content-type: application/json"));
            let _ = tx.send(body);
        });
        (format!("http://{addr}"), rx)
    }

    fn instance(id: u32, url: &str, params: &[(&str, &str)]) -> WorkflowInstance {
        WorkflowInstance {
            signature: Arc::new(WorkflowSignature {
                id,
                name: format!("workflow_{id}"),
                description: String::new(),
                url: url.to_string(),
                target: "T1041".into(),
                cost: 1.0,
                params: BTreeMap::new(),
                args: BTreeMap::new(),
                conditions: vec![],
            }),
            resolved_params: params
                .iter()
                .map(|(k, v)| (k.to_string(), FieldValue::Str(v.to_string())))
                .collect(),
            cost_factor: 1.0,
        }
    }

    fn plan_of(instances: Vec<WorkflowInstance>) -> Plan {
        let alert = Arc::new(Alert {
            description: String::new(),
            timestamp: Utc::now(),
            techniques: BTreeSet::from(["T1041".to_string()]),
            data: BTreeMap::new(),
        });
        Plan {
            cost: instances.iter().map(|i| i.effective_cost()).sum(),
            mitigations: instances
                .into_iter()
                .map(|w| Mitigation {
                    alert: Arc::clone(&alert),
                    workflow: Some(w),
                })
                .collect(),
            unmitigated: vec![],
        }
    }

    #[tokio::test]
    async fn test_posts_resolved_params_as_json() {
        let (url, body) = http_responder(200).await;
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).unwrap();

        let outcomes = dispatcher
            .dispatch(&plan_of(vec![instance(
                1,
                &url,
                &[("file_path", "/tmp/zerologon_tester.py")],
            )]))
            .await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].succeeded());
        assert_eq!(outcomes[0].status, Some(200));

        let received: serde_json::Value =
            serde_json::from_str(&body.await.unwrap()).unwrap();
        assert_eq!(received["file_path"], "/tmp/zerologon_tester.py");
    }

    #[tokio::test]
    async fn test_non_2xx_is_a_failure_without_retry() {
        let (url, body) = http_responder(500).await;
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).unwrap();

        let outcomes = dispatcher
            .dispatch(&plan_of(vec![instance(1, &url, &[])]))
            .await;
        assert!(!outcomes[0].succeeded());
        assert_eq!(outcomes[0].status, Some(500));

        // The responder accepts exactly one request; a retry would hang
        // the test instead of completing it.
        body.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_error_is_reported() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            timeout: Duration::from_millis(500),
        })
        .unwrap();
        // Nothing listens here
        let outcomes = dispatcher
            .dispatch(&plan_of(vec![instance(1, "http://127.0.0.1:1/x", &[])]))
            .await;
        assert!(!outcomes[0].succeeded());
        assert!(outcomes[0].status.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_both_hit() {
        let (url_a, body_a) = http_responder(200).await;
        let (url_b, body_b) = http_responder(204).await;
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).unwrap();

        let outcomes = dispatcher
            .dispatch(&plan_of(vec![
                instance(1, &url_a, &[("k", "a")]),
                instance(2, &url_b, &[("k", "b")]),
            ]))
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(DispatchOutcome::succeeded));
        body_a.await.unwrap();
        body_b.await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_instances_dispatch_once() {
        let (url, body) = http_responder(200).await;
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).unwrap();

        let twice = vec![
            instance(1, &url, &[("k", "v")]),
            instance(1, &url, &[("k", "v")]),
        ];
        let outcomes = dispatcher.dispatch(&plan_of(twice)).await;
        assert_eq!(outcomes.len(), 1);
        body.await.unwrap();
    }
}

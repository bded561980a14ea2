//! Graph-Database Collaborator
//!
//! Some conditions consult a situational-awareness graph database (the
//! `query-rows` escape). The core only ever needs the row count of a
//! parameterized query, so the seam is a single-method trait; the HTTP
//! implementation posts `{query, parameters}` and reads the count from the
//! response.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::FieldValue;

/// Graph-database failures. Always recoverable: the evaluator maps them to
/// an unmet condition.
#[derive(Error, Debug)]
pub enum GraphDbError {
    #[error("graph database unreachable: {0}")]
    Unreachable(String),

    #[error("graph database returned status {0}")]
    Status(u16),

    #[error("invalid graph database response: {0}")]
    Decode(String),

    #[error("graph database not configured")]
    NotConfigured,
}

/// Query seam used by the condition evaluator.
#[async_trait]
pub trait GraphQuery: Send + Sync {
    /// Run a parameterized query and return its row count.
    async fn row_count(
        &self,
        query: &str,
        parameters: &BTreeMap<String, FieldValue>,
    ) -> Result<u64, GraphDbError>;
}

/// HTTP graph-database client.
pub struct HttpGraphClient {
    client: reqwest::Client,
    url: String,
    credentials: Option<(String, String)>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    rows: Option<Vec<serde_json::Value>>,
}

impl HttpGraphClient {
    pub fn new(
        url: impl Into<String>,
        credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self, GraphDbError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GraphDbError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            credentials,
        })
    }
}

#[async_trait]
impl GraphQuery for HttpGraphClient {
    async fn row_count(
        &self,
        query: &str,
        parameters: &BTreeMap<String, FieldValue>,
    ) -> Result<u64, GraphDbError> {
        let body = serde_json::json!({
            "query": query,
            "parameters": parameters,
        });
        let mut request = self.client.post(&self.url).json(&body);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| GraphDbError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GraphDbError::Status(response.status().as_u16()));
        }
        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| GraphDbError::Decode(e.to_string()))?;
        match (parsed.count, parsed.rows) {
            (Some(count), _) => Ok(count),
            (None, Some(rows)) => Ok(rows.len() as u64),
            (None, None) => Err(GraphDbError::Decode(
                "response carries neither 'count' nor 'rows'".to_string(),
            )),
        }
    }
}

/// Placeholder used when no graph database is configured; every query
/// fails, so conditions using the escape evaluate to false.
pub struct NoGraphDb;

#[async_trait]
impl GraphQuery for NoGraphDb {
    async fn row_count(
        &self,
        _query: &str,
        _parameters: &BTreeMap<String, FieldValue>,
    ) -> Result<u64, GraphDbError> {
        Err(GraphDbError::NotConfigured)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Fixed-count graph database for tests.
    pub struct StaticGraphDb(pub u64);

    #[async_trait]
    impl GraphQuery for StaticGraphDb {
        async fn row_count(
            &self,
            _query: &str,
            _parameters: &BTreeMap<String, FieldValue>,
        ) -> Result<u64, GraphDbError> {
            Ok(self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticGraphDb;
    use super::*;
    use crate::condition::{EvalContext, Expr};

    #[tokio::test]
    async fn test_query_rows_against_static_rows() {
        let expr = Expr::parse("(> (query-rows \"MATCH (n) RETURN n\") 0)").unwrap();
        let parameters = BTreeMap::new();

        let ctx = EvalContext {
            parameters: &parameters,
            graph: &StaticGraphDb(3),
        };
        assert!(expr.eval_bool(&ctx).await.unwrap());

        let ctx = EvalContext {
            parameters: &parameters,
            graph: &StaticGraphDb(0),
        };
        assert!(!expr.eval_bool(&ctx).await.unwrap());
    }
}

//! Alert Normalization
//!
//! Flattens inbound alert documents into the typed field map of [`Alert`]
//! via a declarative mapping schema. The schema mirrors the nesting of the
//! source document; its leaves name the flat target fields. Keys absent from
//! the document are silently dropped, anything that is not a scalar or a
//! homogeneous vector of scalars is rejected.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Alert, FieldValue, MitigatorError, Result};

/// Target field the MITRE technique set is read from.
pub const MITRE_TARGET: &str = "mitre_ids";
/// Target field for the human-readable alert description.
pub const DESCRIPTION_TARGET: &str = "description";
/// Target field for the alert timestamp.
pub const TIMESTAMP_TARGET: &str = "timestamp";

/// One level of a mapping schema: either a leaf naming the flat target
/// field, or a nested branch mirroring the document structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MappingNode {
    Leaf(String),
    Branch(BTreeMap<String, MappingNode>),
}

/// Declarative field-mapping schema for inbound alert documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingSchema {
    root: BTreeMap<String, MappingNode>,
}

impl MappingSchema {
    pub fn new(root: BTreeMap<String, MappingNode>) -> Self {
        Self { root }
    }

    /// The default schema for Wazuh alert documents.
    pub fn wazuh() -> Self {
        fn leaf(target: &str) -> MappingNode {
            MappingNode::Leaf(target.to_string())
        }
        fn branch(entries: Vec<(&str, MappingNode)>) -> MappingNode {
            MappingNode::Branch(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
            )
        }

        let mut root = BTreeMap::new();
        root.insert("timestamp".to_string(), leaf(TIMESTAMP_TARGET));
        root.insert(
            "rule".to_string(),
            branch(vec![
                ("id", leaf("rule_id")),
                ("description", leaf(DESCRIPTION_TARGET)),
                ("mitre", branch(vec![("id", leaf(MITRE_TARGET))])),
            ]),
        );
        root.insert(
            "syscheck".to_string(),
            branch(vec![
                ("sha1_after", leaf("file_hash")),
                ("path", leaf("file_path")),
                ("perm_after", leaf("file_permissions")),
            ]),
        );
        root.insert(
            "agent".to_string(),
            branch(vec![("id", leaf("agent_id")), ("ip", leaf("agent_ip"))]),
        );
        root.insert(
            "data".to_string(),
            branch(vec![
                ("dst_ip", leaf("connection_dst_ip")),
                ("src_port", leaf("connection_src_port")),
                ("dst_port", leaf("connection_dst_port")),
                ("pid", leaf("connection_pid")),
            ]),
        );
        Self { root }
    }

    /// Normalize an inbound document into an [`Alert`].
    pub fn normalize(&self, doc: &Value) -> Result<Alert> {
        let obj = doc.as_object().ok_or_else(|| {
            MitigatorError::MalformedAlert("alert document is not a JSON object".to_string())
        })?;

        let mut flat = BTreeMap::new();
        walk(obj, &self.root, &mut flat)?;

        let techniques = extract_techniques(flat.remove(MITRE_TARGET))?;
        let description = match flat.remove(DESCRIPTION_TARGET) {
            Some(FieldValue::Str(s)) => s,
            Some(other) => {
                return Err(MitigatorError::MalformedAlert(format!(
                    "expected string description, got {}",
                    other.type_name()
                )))
            }
            None => String::new(),
        };
        let timestamp = match flat.remove(TIMESTAMP_TARGET) {
            Some(FieldValue::Str(s)) => parse_timestamp(&s)?,
            _ => Utc::now(),
        };

        Ok(Alert {
            description,
            timestamp,
            techniques,
            data: flat,
        })
    }
}

fn walk(
    doc: &serde_json::Map<String, Value>,
    schema: &BTreeMap<String, MappingNode>,
    out: &mut BTreeMap<String, FieldValue>,
) -> Result<()> {
    for (key, node) in schema {
        let Some(value) = doc.get(key) else {
            continue;
        };
        match node {
            MappingNode::Branch(inner) => {
                let nested = value.as_object().ok_or_else(|| {
                    MitigatorError::MalformedAlert(format!(
                        "expected object in alert field '{key}'"
                    ))
                })?;
                walk(nested, inner, out)?;
            }
            MappingNode::Leaf(target) => {
                out.insert(target.clone(), coerce(key, value)?);
            }
        }
    }
    Ok(())
}

/// Convert a document value into a flat field value. Objects and nested or
/// mixed-type arrays are malformed.
fn coerce(key: &str, value: &Value) -> Result<FieldValue> {
    let scalar = |v: &Value| -> Option<FieldValue> {
        match v {
            Value::Null => Some(FieldValue::Null),
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(FieldValue::Num),
            Value::String(s) => Some(FieldValue::Str(s.clone())),
            _ => None,
        }
    };

    match value {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let fv = scalar(item).ok_or_else(|| {
                    MitigatorError::MalformedAlert(format!(
                        "vector in alert field '{key}' contains a non-scalar element"
                    ))
                })?;
                if let Some(first) = out.first() {
                    if std::mem::discriminant(first) != std::mem::discriminant(&fv) {
                        return Err(MitigatorError::MalformedAlert(format!(
                            "vector in alert field '{key}' is not homogeneous"
                        )));
                    }
                }
                out.push(fv);
            }
            Ok(FieldValue::List(out))
        }
        other => scalar(other).ok_or_else(|| {
            MitigatorError::MalformedAlert(format!(
                "expected scalar or vector in alert field '{key}'"
            ))
        }),
    }
}

fn extract_techniques(value: Option<FieldValue>) -> Result<BTreeSet<String>> {
    match value {
        None | Some(FieldValue::Null) => Ok(BTreeSet::new()),
        Some(FieldValue::Str(s)) => Ok(BTreeSet::from([s])),
        Some(FieldValue::List(items)) => items
            .into_iter()
            .map(|item| match item {
                FieldValue::Str(s) => Ok(s),
                other => Err(MitigatorError::MalformedAlert(format!(
                    "MITRE identifier is not a string (got {})",
                    other.type_name()
                ))),
            })
            .collect(),
        Some(other) => Err(MitigatorError::MalformedAlert(format!(
            "MITRE identifiers are not a string set (got {})",
            other.type_name()
        ))),
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Wazuh emits offsets without a colon, e.g. 2024-10-22T09:18:46.153+0000
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z")
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| MitigatorError::MalformedAlert(format!("invalid timestamp '{raw}': {e}")))
}

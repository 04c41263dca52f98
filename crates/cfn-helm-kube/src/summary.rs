//! Resource summaries exposed as the `Resources` attribute of a release

use kube::api::DynamicObject;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Kinds left out of the summary
const IGNORED_KINDS: &[&str] = &["ConfigMap", "Secret"];

/// Kinds whose spec is part of the summary
const KINDS_WITH_SPEC: &[&str] = &["Service"];

/// Condensed view of one live object
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSummary {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub spec: Option<Value>,
    pub status: Option<Value>,
}

impl ResourceSummary {
    /// Summarise a live object; ignored kinds and unnamed objects yield `None`
    pub fn from_object(obj: &DynamicObject, default_namespace: &str) -> Option<Self> {
        let kind = obj.types.as_ref()?.kind.clone();
        if IGNORED_KINDS.contains(&kind.as_str()) {
            return None;
        }
        let name = obj.metadata.name.clone()?;

        let spec = if KINDS_WITH_SPEC.contains(&kind.as_str()) {
            obj.data.get("spec").cloned()
        } else {
            None
        };

        Some(Self {
            namespace: obj
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
            status: obj.data.get("status").cloned(),
            spec,
            kind,
            name,
        })
    }

    fn entry(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("Namespace".to_string(), Value::String(self.namespace.clone()));
        entry.insert("Spec".to_string(), self.spec.clone().unwrap_or(Value::Null));
        entry.insert("Status".to_string(), self.status.clone().unwrap_or(Value::Null));
        Value::Object(entry)
    }
}

/// Group summaries as `kind -> name -> {Namespace, Spec, Status}`
///
/// Collection stops as soon as the serialized map reaches `limit` bytes.
pub fn group_summaries(summaries: &[ResourceSummary], limit: usize) -> BTreeMap<String, Value> {
    let mut grouped: BTreeMap<String, Value> = BTreeMap::new();

    for summary in summaries {
        if serialized_len(&grouped) >= limit {
            tracing::warn!(limit, "resource output limit reached, truncating");
            break;
        }

        let by_name = grouped
            .entry(summary.kind.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = by_name {
            map.insert(summary.name.clone(), summary.entry());
        }
    }

    grouped
}

fn serialized_len(map: &BTreeMap<String, Value>) -> usize {
    serde_json::to_vec(map).map(|b| b.len()).unwrap_or(0)
}

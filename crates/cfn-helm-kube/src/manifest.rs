//! Rendered manifest parsing and live object lookup
//!
//! A release manifest is the ground truth for which objects belong to the
//! release. Each document is reduced to its address, and the live object is
//! fetched through an [`ObjectFetcher`].

use async_trait::async_trait;
use kube::{
    Client,
    api::{Api, DynamicObject},
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::OnceCell;

use crate::error::{KubeError, Result};
use crate::kubeconfig::client_from_file;

/// Address of one object of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestObject {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Namespace written in the manifest, if any
    pub namespace: Option<String>,
}

impl ManifestObject {
    pub fn new(api_version: &str, kind: &str, name: &str, namespace: Option<&str>) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        }
    }

    /// Convert apiVersion + kind to a GroupVersionKind
    ///
    /// - "apps/v1" -> group="apps", version="v1"
    /// - "v1" -> group="", version="v1" (core API)
    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = match self.api_version.rsplit_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), self.api_version.clone()),
        };

        GroupVersionKind {
            group,
            version,
            kind: self.kind.clone(),
        }
    }
}

impl std::fmt::Display for ManifestObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawObject {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: RawMetadata,
    #[serde(default)]
    items: Vec<serde_yaml::Value>,
}

#[derive(Default, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

/// Parse a multi-document manifest into object addresses
///
/// Empty and comment-only documents are skipped and `List` documents are
/// flattened into their items.
pub fn parse_manifest(manifest: &str) -> Result<Vec<ManifestObject>> {
    let mut objects = Vec::new();

    for (index, doc) in manifest.split("\n---").enumerate() {
        let doc = doc.trim().trim_start_matches("---").trim();
        if doc.is_empty() {
            continue;
        }

        // Skip YAML comments-only documents
        if doc
            .lines()
            .all(|l| l.trim().is_empty() || l.trim().starts_with('#'))
        {
            continue;
        }

        let raw: RawObject = serde_yaml::from_str(doc).map_err(|e| {
            KubeError::InvalidManifest(format!("failed to parse document {}: {}", index, e))
        })?;
        collect(raw, index, &mut objects)?;
    }

    Ok(objects)
}

fn collect(raw: RawObject, index: usize, out: &mut Vec<ManifestObject>) -> Result<()> {
    if raw.kind.ends_with("List") && !raw.items.is_empty() {
        for item in raw.items {
            let item: RawObject = serde_yaml::from_value(item)?;
            collect(item, index, out)?;
        }
        return Ok(());
    }

    if raw.api_version.is_empty() || raw.kind.is_empty() {
        return Err(KubeError::InvalidManifest(format!(
            "document {} is missing apiVersion or kind",
            index
        )));
    }

    out.push(ManifestObject {
        api_version: raw.api_version,
        kind: raw.kind,
        name: raw.metadata.name,
        namespace: raw.metadata.namespace.filter(|ns| !ns.is_empty()),
    });
    Ok(())
}

/// Reads the live state of manifest objects
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Fetch one object; namespaced objects without a namespace use `default_namespace`
    async fn fetch(&self, object: &ManifestObject, default_namespace: &str) -> Result<DynamicObject>;
}

/// Fetches objects from the API server, resolving kinds through discovery
pub struct KubeFetcher {
    client: Client,
    discovery: Discovery,
}

impl KubeFetcher {
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(KubeError::Api)?;

        Ok(Self { client, discovery })
    }
}

#[async_trait]
impl ObjectFetcher for KubeFetcher {
    async fn fetch(&self, object: &ManifestObject, default_namespace: &str) -> Result<DynamicObject> {
        let gvk = object.gvk();
        let (api_resource, capabilities) = self.discovery.resolve_gvk(&gvk).ok_or_else(|| {
            KubeError::InvalidManifest(format!(
                "resource type not found: {}/{}",
                object.api_version, object.kind
            ))
        })?;

        let api: Api<DynamicObject> = if capabilities.scope == Scope::Namespaced {
            let ns = object.namespace.as_deref().unwrap_or(default_namespace);
            Api::namespaced_with(self.client.clone(), ns, &api_resource)
        } else {
            Api::all_with(self.client.clone(), &api_resource)
        };

        Ok(api.get(&object.name).await?)
    }
}

/// [`KubeFetcher`] connected on first use from a kubeconfig file
///
/// Discovery only runs when an object is actually looked up.
pub struct LazyKubeFetcher {
    kubeconfig: PathBuf,
    inner: OnceCell<KubeFetcher>,
}

impl LazyKubeFetcher {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            inner: OnceCell::new(),
        }
    }

    async fn connected(&self) -> Result<&KubeFetcher> {
        self.inner
            .get_or_try_init(|| async {
                let client = client_from_file(&self.kubeconfig).await?;
                KubeFetcher::new(client).await
            })
            .await
    }
}

#[async_trait]
impl ObjectFetcher for LazyKubeFetcher {
    async fn fetch(&self, object: &ManifestObject, default_namespace: &str) -> Result<DynamicObject> {
        self.connected().await?.fetch(object, default_namespace).await
    }
}

/// In-memory object fetcher for testing
#[derive(Clone, Default)]
pub struct MockObjectFetcher {
    /// Objects keyed by kind, namespace and name
    objects: Arc<RwLock<HashMap<(String, String, String), DynamicObject>>>,
    /// Names whose lookup fails with a server error
    failing: Arc<RwLock<Vec<String>>>,
    fetches: Arc<RwLock<usize>>,
}

impl MockObjectFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a live object given as JSON
    pub fn with_object(self, object: serde_json::Value) -> Self {
        let obj: DynamicObject =
            serde_json::from_value(object).expect("mock object must be a Kubernetes object");
        let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.objects
            .write()
            .unwrap()
            .insert((kind, namespace, name), obj);
        self
    }

    /// Make lookups of `name` fail with an internal server error
    pub fn with_failing(self, name: &str) -> Self {
        self.failing.write().unwrap().push(name.to_string());
        self
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.read().unwrap()
    }
}

fn api_error(code: u16, reason: &str, message: String) -> KubeError {
    KubeError::Api(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

#[async_trait]
impl ObjectFetcher for MockObjectFetcher {
    async fn fetch(&self, object: &ManifestObject, default_namespace: &str) -> Result<DynamicObject> {
        *self.fetches.write().unwrap() += 1;

        if self.failing.read().unwrap().contains(&object.name) {
            return Err(api_error(
                500,
                "InternalError",
                format!("failed to get {}", object.name),
            ));
        }

        let objects = self.objects.read().unwrap();
        let namespace = object.namespace.as_deref().unwrap_or(default_namespace);
        objects
            .get(&(object.kind.clone(), namespace.to_string(), object.name.clone()))
            .or_else(|| objects.get(&(object.kind.clone(), String::new(), object.name.clone())))
            .cloned()
            .ok_or_else(|| {
                api_error(
                    404,
                    "NotFound",
                    format!("{} \"{}\" not found", object.kind, object.name),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"---
# Source: web/templates/service.yaml
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  ports:
  - port: 80
---
# Source: web/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: prod
spec:
  replicas: 2
---
# Source: web/templates/empty.yaml
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.com
"#;

    #[test]
    fn test_parse_manifest() {
        let objects = parse_manifest(MANIFEST).unwrap();
        assert_eq!(
            objects,
            vec![
                ManifestObject::new("v1", "Service", "web", None),
                ManifestObject::new("apps/v1", "Deployment", "web", Some("prod")),
                ManifestObject::new(
                    "apiextensions.k8s.io/v1",
                    "CustomResourceDefinition",
                    "widgets.example.com",
                    None
                ),
            ]
        );
    }

    #[test]
    fn test_parse_list_document() {
        let manifest = r#"
apiVersion: v1
kind: List
items:
- apiVersion: v1
  kind: ConfigMap
  metadata:
    name: a
- apiVersion: v1
  kind: ConfigMap
  metadata:
    name: b
"#;
        let objects = parse_manifest(manifest).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].name, "b");
    }

    #[test]
    fn test_parse_rejects_untyped_document() {
        let err = parse_manifest("metadata:\n  name: x\n").unwrap_err();
        assert!(matches!(err, KubeError::InvalidManifest(_)));
    }

    #[test]
    fn test_gvk() {
        let gvk = ManifestObject::new("apps/v1", "Deployment", "web", None).gvk();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");

        let gvk_core = ManifestObject::new("v1", "ConfigMap", "cm", None).gvk();
        assert_eq!(gvk_core.group, "");
        assert_eq!(gvk_core.version, "v1");
    }

    #[tokio::test]
    async fn test_mock_fetcher_defaults_namespace() {
        let fetcher = MockObjectFetcher::new().with_object(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "web", "namespace": "default"}
        }));

        let object = ManifestObject::new("v1", "Service", "web", None);
        assert!(fetcher.fetch(&object, "default").await.is_ok());

        let err = fetcher.fetch(&object, "other").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(fetcher.fetch_count(), 2);
    }
}

//! Per-kind readiness rules
//!
//! Each rule decides whether one live object has converged. A not-ready
//! object records a reason in the [`Diagnostics`]; a ready one clears any
//! earlier reason for its name.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use serde::Deserialize;

use crate::diagnostics::Diagnostics;
use crate::error::{KubeError, Result};

const ROLLING_UPDATE: &str = "RollingUpdate";

/// Status conditions of a CustomResourceDefinition
///
/// Only the conditions are read, which lets one shape serve every served
/// version of the CRD API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrdObject {
    #[serde(default)]
    pub metadata: kube::core::ObjectMeta,
    #[serde(default)]
    pub status: Option<CrdStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrdStatus {
    #[serde(default)]
    pub conditions: Vec<CrdCondition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrdCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

/// A live object whose kind has a readiness rule
#[derive(Debug, Clone)]
pub enum TrackedObject {
    Deployment(Box<Deployment>),
    DaemonSet(Box<DaemonSet>),
    StatefulSet(Box<StatefulSet>),
    PersistentVolumeClaim(Box<PersistentVolumeClaim>),
    Service(Box<Service>),
    Ingress(Box<Ingress>),
    CustomResourceDefinition(Box<CrdObject>),
}

impl TrackedObject {
    /// Type a fetched object; kinds without a rule yield `None`
    pub fn from_dynamic(obj: &DynamicObject) -> Result<Option<Self>> {
        let Some(kind) = obj.types.as_ref().map(|t| t.kind.as_str()) else {
            return Err(KubeError::InvalidManifest(
                "object has no kind".to_string(),
            ));
        };

        // Legacy group versions share the status shape of the typed version,
        // but the typed decoders reject any apiVersion other than their own
        let mut value = serde_json::to_value(obj)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("apiVersion");
            map.remove("kind");
        }

        let tracked = match kind {
            "Deployment" => Self::Deployment(Box::new(serde_json::from_value(value)?)),
            "DaemonSet" => Self::DaemonSet(Box::new(serde_json::from_value(value)?)),
            "StatefulSet" => Self::StatefulSet(Box::new(serde_json::from_value(value)?)),
            "PersistentVolumeClaim" => {
                Self::PersistentVolumeClaim(Box::new(serde_json::from_value(value)?))
            }
            "Service" => Self::Service(Box::new(serde_json::from_value(value)?)),
            "Ingress" => Self::Ingress(Box::new(serde_json::from_value(value)?)),
            "CustomResourceDefinition" => {
                Self::CustomResourceDefinition(Box::new(serde_json::from_value(value)?))
            }
            _ => return Ok(None),
        };
        Ok(Some(tracked))
    }

    pub fn is_ready(&self, diags: &mut Diagnostics) -> bool {
        match self {
            Self::Deployment(d) => deployment_ready(d, diags),
            Self::DaemonSet(ds) => daemon_set_ready(ds, diags),
            Self::StatefulSet(sts) => stateful_set_ready(sts, diags),
            Self::PersistentVolumeClaim(pvc) => volume_ready(pvc, diags),
            Self::Service(svc) => service_ready(svc, diags),
            Self::Ingress(ing) => ingress_ready(ing, diags),
            Self::CustomResourceDefinition(crd) => crd_ready(crd, diags),
        }
    }
}

fn address(meta: &kube::core::ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn not_ready(diags: &mut Diagnostics, message: String) -> bool {
    tracing::info!("{}", message);
    diags.push(message);
    false
}

fn ready(diags: &mut Diagnostics, name: &str) -> bool {
    diags.pop(name);
    true
}

/// Ready once enough replicas report ready; a paused deployment never blocks
pub fn deployment_ready(dep: &Deployment, diags: &mut Diagnostics) -> bool {
    let (namespace, name) = address(&dep.metadata);
    let spec = dep.spec.as_ref();

    if spec.and_then(|s| s.paused).unwrap_or(false) {
        tracing::debug!(deployment = %name, "deployment is paused, skipping");
        return true;
    }

    let desired = spec.and_then(|s| s.replicas).unwrap_or(1);
    let ready_replicas = dep
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    if ready_replicas < desired {
        return not_ready(
            diags,
            format!(
                "Deployment is not ready: {}/{}. {} out of {} expected pods are ready",
                namespace, name, ready_replicas, desired
            ),
        );
    }
    ready(diags, &name)
}

pub fn daemon_set_ready(ds: &DaemonSet, diags: &mut Diagnostics) -> bool {
    let (namespace, name) = address(&ds.metadata);
    let strategy = ds.spec.as_ref().and_then(|s| s.update_strategy.as_ref());

    // The API server defaults a missing strategy type to RollingUpdate
    let strategy_type = strategy
        .and_then(|s| s.type_.as_deref())
        .unwrap_or(ROLLING_UPDATE);
    if strategy_type != ROLLING_UPDATE {
        return true;
    }

    let status = ds.status.clone().unwrap_or_default();
    let desired = status.desired_number_scheduled;
    let updated = status.updated_number_scheduled.unwrap_or(0);

    if updated != desired {
        return not_ready(
            diags,
            format!(
                "DaemonSet is not ready: {}/{}. {} out of {} expected pods have been scheduled",
                namespace, name, updated, desired
            ),
        );
    }

    let max_unavailable = strategy
        .and_then(|s| s.rolling_update.as_ref())
        .and_then(|r| r.max_unavailable.as_ref())
        .and_then(|v| scaled_value(v, desired))
        .unwrap_or(desired);

    let expected_ready = desired - max_unavailable;
    if status.number_ready < expected_ready {
        return not_ready(
            diags,
            format!(
                "DaemonSet is not ready: {}/{}. {} out of {} expected pods are ready",
                namespace, name, status.number_ready, expected_ready
            ),
        );
    }
    ready(diags, &name)
}

/// Resolve an absolute or percentage value against `total`, rounding up
fn scaled_value(value: &IntOrString, total: i32) -> Option<i32> {
    match value {
        IntOrString::Int(n) => Some(*n),
        IntOrString::String(s) => {
            let percent: i64 = s.strip_suffix('%')?.trim().parse().ok()?;
            let scaled = (percent * i64::from(total) + 99) / 100;
            i32::try_from(scaled).ok()
        }
    }
}

pub fn stateful_set_ready(sts: &StatefulSet, diags: &mut Diagnostics) -> bool {
    let (namespace, name) = address(&sts.metadata);
    let spec = sts.spec.as_ref();
    let strategy = spec.and_then(|s| s.update_strategy.as_ref());

    let strategy_type = strategy
        .and_then(|s| s.type_.as_deref())
        .unwrap_or(ROLLING_UPDATE);
    if strategy_type != ROLLING_UPDATE {
        return true;
    }

    let partition = strategy
        .and_then(|s| s.rolling_update.as_ref())
        .and_then(|r| r.partition)
        .unwrap_or(0);
    let replicas = spec.and_then(|s| s.replicas).unwrap_or(1);
    // With a partition only the ordinals at or above it are updated
    let expected_updated = replicas - partition;

    let status = sts.status.as_ref();
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
    let ready_replicas = status.and_then(|s| s.ready_replicas).unwrap_or(0);

    if updated != expected_updated {
        return not_ready(
            diags,
            format!(
                "StatefulSet is not ready: {}/{}. {} out of {} expected pods have been scheduled",
                namespace, name, updated, expected_updated
            ),
        );
    }

    if ready_replicas != replicas {
        return not_ready(
            diags,
            format!(
                "StatefulSet is not ready: {}/{}. {} out of {} expected pods are ready",
                namespace, name, ready_replicas, replicas
            ),
        );
    }
    ready(diags, &name)
}

pub fn volume_ready(pvc: &PersistentVolumeClaim, diags: &mut Diagnostics) -> bool {
    let (namespace, name) = address(&pvc.metadata);
    let phase = pvc.status.as_ref().and_then(|s| s.phase.as_deref());

    if phase != Some("Bound") {
        return not_ready(
            diags,
            format!(
                "PersistentVolumeClaim is not bound: {}/{}",
                namespace, name
            ),
        );
    }
    ready(diags, &name)
}

pub fn service_ready(svc: &Service, diags: &mut Diagnostics) -> bool {
    let (namespace, name) = address(&svc.metadata);
    let spec = svc.spec.clone().unwrap_or_default();
    let service_type = spec.type_.as_deref().unwrap_or("ClusterIP");

    // External names live outside the cluster
    if service_type == "ExternalName" {
        return true;
    }

    let cluster_ip = spec.cluster_ip.as_deref().unwrap_or_default();
    if cluster_ip != "None" && cluster_ip.is_empty() {
        return not_ready(
            diags,
            format!(
                "Service does not have cluster IP address: {}/{}",
                namespace, name
            ),
        );
    }

    if service_type == "LoadBalancer" {
        if spec.external_ips.as_ref().is_some_and(|ips| !ips.is_empty()) {
            tracing::info!(service = %name, "service has external IP addresses, marking as ready");
            return ready(diags, &name);
        }

        let has_ingress = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .is_some_and(|ingress| !ingress.is_empty());
        if !has_ingress {
            return not_ready(
                diags,
                format!(
                    "Service does not have load balancer ingress IP address: {}/{}",
                    namespace, name
                ),
            );
        }
    }
    ready(diags, &name)
}

pub fn ingress_ready(ing: &Ingress, diags: &mut Diagnostics) -> bool {
    let (namespace, name) = address(&ing.metadata);
    let has_address = ing
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| !ingress.is_empty());

    if !has_address {
        return not_ready(
            diags,
            format!("Ingress does not have address: {}/{}", namespace, name),
        );
    }
    ready(diags, &name)
}

/// Established, or a rejected name, counts as ready
pub fn crd_ready(crd: &CrdObject, diags: &mut Diagnostics) -> bool {
    let (namespace, name) = address(&crd.metadata);
    let conditions = crd
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();

    for condition in conditions {
        match condition.type_.as_str() {
            "Established" if condition.status == "True" => return ready(diags, &name),
            // A naming conflict must not hold the release back
            "NamesAccepted" if condition.status == "False" => return ready(diags, &name),
            _ => {}
        }
    }

    not_ready(diags, format!("CRD is not ready {}/{}.", namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stateful_set(replicas: i32, partition: i32, updated: i32, ready: i32) -> StatefulSet {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {"name": "db", "namespace": "data"},
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": {"app": "db"}},
                "serviceName": "db",
                "template": {"spec": {"containers": []}},
                "updateStrategy": {
                    "type": "RollingUpdate",
                    "rollingUpdate": {"partition": partition}
                }
            },
            "status": {"replicas": replicas, "updatedReplicas": updated, "readyReplicas": ready}
        }))
        .unwrap()
    }

    fn deployment(replicas: i32, ready: i32, paused: bool) -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "replicas": replicas,
                "paused": paused,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {"spec": {"containers": []}}
            },
            "status": {"readyReplicas": ready}
        }))
        .unwrap()
    }

    fn daemon_set(strategy: serde_json::Value, desired: i32, updated: i32, ready: i32) -> DaemonSet {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": {"name": "agent", "namespace": "kube-system"},
            "spec": {
                "selector": {"matchLabels": {"app": "agent"}},
                "template": {"spec": {"containers": []}},
                "updateStrategy": strategy
            },
            "status": {
                "currentNumberScheduled": desired,
                "desiredNumberScheduled": desired,
                "numberMisscheduled": 0,
                "numberReady": ready,
                "updatedNumberScheduled": updated
            }
        }))
        .unwrap()
    }

    fn service(spec: serde_json::Value, status: serde_json::Value) -> Service {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc", "namespace": "default"},
            "spec": spec,
            "status": status
        }))
        .unwrap()
    }

    #[test]
    fn test_stateful_set_partitioned_rollout() {
        let mut diags = Diagnostics::new();
        assert!(stateful_set_ready(&stateful_set(2, 1, 1, 2), &mut diags));
        assert!(diags.is_empty());

        assert!(!stateful_set_ready(&stateful_set(2, 1, 1, 1), &mut diags));
        assert_eq!(
            diags.entries(),
            &["StatefulSet is not ready: data/db. 1 out of 2 expected pods are ready".to_string()]
        );
    }

    #[test]
    fn test_stateful_set_on_delete_is_ready() {
        let mut sts = stateful_set(3, 0, 0, 0);
        if let Some(strategy) = sts.spec.as_mut().and_then(|s| s.update_strategy.as_mut()) {
            strategy.type_ = Some("OnDelete".to_string());
        }
        assert!(stateful_set_ready(&sts, &mut Diagnostics::new()));
    }

    #[test]
    fn test_deployment_rules() {
        let mut diags = Diagnostics::new();
        assert!(!deployment_ready(&deployment(3, 1, false), &mut diags));
        assert_eq!(
            diags.entries(),
            &["Deployment is not ready: default/web. 1 out of 3 expected pods are ready".to_string()]
        );

        // Repeated evaluation keeps a single entry
        assert!(!deployment_ready(&deployment(3, 1, false), &mut diags));
        assert_eq!(diags.len(), 1);

        assert!(deployment_ready(&deployment(3, 3, false), &mut diags));
        assert!(diags.is_empty());

        assert!(deployment_ready(&deployment(3, 0, true), &mut diags));
    }

    #[test]
    fn test_daemon_set_max_unavailable() {
        let strategy = json!({"type": "RollingUpdate", "rollingUpdate": {"maxUnavailable": 1}});
        let mut diags = Diagnostics::new();
        assert!(daemon_set_ready(&daemon_set(strategy.clone(), 4, 4, 3), &mut diags));
        assert!(!daemon_set_ready(&daemon_set(strategy, 4, 4, 2), &mut diags));

        // 25% of 4 rounds up to 1
        let percent = json!({"type": "RollingUpdate", "rollingUpdate": {"maxUnavailable": "25%"}});
        assert!(daemon_set_ready(&daemon_set(percent, 4, 4, 3), &mut diags));
    }

    #[test]
    fn test_daemon_set_unscheduled_and_on_delete() {
        let strategy = json!({"type": "RollingUpdate", "rollingUpdate": {"maxUnavailable": 1}});
        let mut diags = Diagnostics::new();
        assert!(!daemon_set_ready(&daemon_set(strategy, 4, 2, 4), &mut diags));
        assert!(diags.entries()[0].contains("2 out of 4 expected pods have been scheduled"));

        let on_delete = json!({"type": "OnDelete"});
        assert!(daemon_set_ready(&daemon_set(on_delete, 4, 0, 0), &mut diags));
    }

    #[test]
    fn test_daemon_set_without_max_unavailable() {
        // Defaults to the whole desired count
        let strategy = json!({"type": "RollingUpdate"});
        assert!(daemon_set_ready(&daemon_set(strategy, 3, 3, 0), &mut Diagnostics::new()));
    }

    #[test]
    fn test_service_rules() {
        let mut diags = Diagnostics::new();
        assert!(service_ready(
            &service(json!({"type": "ExternalName", "externalName": "x"}), json!({})),
            &mut diags
        ));
        assert!(service_ready(
            &service(json!({"clusterIP": "None"}), json!({})),
            &mut diags
        ));
        assert!(!service_ready(&service(json!({}), json!({})), &mut diags));

        let lb = json!({"type": "LoadBalancer", "clusterIP": "10.0.0.1"});
        assert!(!service_ready(&service(lb.clone(), json!({"loadBalancer": {}})), &mut diags));
        assert!(service_ready(
            &service(lb, json!({"loadBalancer": {"ingress": [{"hostname": "elb"}]}})),
            &mut diags
        ));
        assert!(service_ready(
            &service(
                json!({"type": "LoadBalancer", "clusterIP": "10.0.0.1", "externalIPs": ["1.2.3.4"]}),
                json!({})
            ),
            &mut diags
        ));
        assert!(diags.is_empty());
    }

    #[test]
    fn test_volume_and_ingress() {
        let pvc: PersistentVolumeClaim = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {"name": "data", "namespace": "default"},
            "status": {"phase": "Pending"}
        }))
        .unwrap();
        let mut diags = Diagnostics::new();
        assert!(!volume_ready(&pvc, &mut diags));
        assert_eq!(diags.entries()[0], "PersistentVolumeClaim is not bound: default/data");

        let ing: Ingress = serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": "web", "namespace": "default"},
            "status": {"loadBalancer": {"ingress": [{"ip": "1.2.3.4"}]}}
        }))
        .unwrap();
        assert!(ingress_ready(&ing, &mut diags));

        let ing: Ingress = serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": "web", "namespace": "default"},
            "status": {"loadBalancer": {}}
        }))
        .unwrap();
        assert!(!ingress_ready(&ing, &mut diags));
    }

    #[test]
    fn test_crd_conditions() {
        let crd = |conditions: serde_json::Value| -> CrdObject {
            serde_json::from_value(json!({
                "metadata": {"name": "widgets.example.com"},
                "status": {"conditions": conditions}
            }))
            .unwrap()
        };
        let mut diags = Diagnostics::new();

        assert!(crd_ready(&crd(json!([{"type": "Established", "status": "True"}])), &mut diags));
        assert!(crd_ready(&crd(json!([{"type": "NamesAccepted", "status": "False"}])), &mut diags));
        assert!(!crd_ready(&crd(json!([{"type": "Established", "status": "False"}])), &mut diags));
        assert_eq!(diags.entries()[0], "CRD is not ready /widgets.example.com.");
    }

    #[test]
    fn test_tracked_object_from_dynamic() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "svc", "namespace": "default"},
            "spec": {"clusterIP": "10.0.0.2"}
        }))
        .unwrap();
        let tracked = TrackedObject::from_dynamic(&obj).unwrap().unwrap();
        assert!(tracked.is_ready(&mut Diagnostics::new()));

        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"}
        }))
        .unwrap();
        assert!(TrackedObject::from_dynamic(&obj).unwrap().is_none());
    }

    #[test]
    fn test_legacy_ingress_version() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "extensions/v1beta1",
            "kind": "Ingress",
            "metadata": {"name": "old", "namespace": "default"},
            "status": {"loadBalancer": {"ingress": [{"hostname": "lb"}]}}
        }))
        .unwrap();
        let tracked = TrackedObject::from_dynamic(&obj).unwrap().unwrap();
        assert!(matches!(tracked, TrackedObject::Ingress(_)));
        assert!(tracked.is_ready(&mut Diagnostics::new()));
    }
}

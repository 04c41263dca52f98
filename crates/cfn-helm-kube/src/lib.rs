//! cfn-helm Kube - Kubernetes and Helm integration for the Helm release provider
//!
//! This crate provides:
//! - **Readiness Evaluation**: per-kind rules deciding whether a live object has converged
//! - **Diagnostics**: the deduplicated list of reasons a release is still pending
//! - **Manifest Resolution**: rendered manifest parsing and live object lookup
//! - **Resource Inspection**: the pending check and resource summaries of a release
//! - **Cluster Access**: kubeconfig rendering from a cluster, a secret or inline bytes
//! - **Release Management**: Helm operations behind the `ReleaseManager` trait

pub mod diagnostics;
pub mod error;
pub mod helm;
pub mod inspector;
pub mod kubeconfig;
pub mod manifest;
pub mod readiness;
pub mod summary;

pub use diagnostics::Diagnostics;
pub use error::{KubeError, Result};
pub use helm::{
    ChartFetcher, HelmCli, HelmPaths, MockReleaseManager, ReleaseManager, ReleaseState,
    classify_release,
};
pub use helm::{download_s3, ecr_registry, parse_s3_url};
pub use inspector::{ManifestInspector, ResourceInspector};
pub use kubeconfig::{
    KubeconfigSource, client_from_file, render_cluster_kubeconfig, resolve_kubeconfig,
    write_kubeconfig,
};
pub use manifest::{
    KubeFetcher, LazyKubeFetcher, ManifestObject, MockObjectFetcher, ObjectFetcher, parse_manifest,
};
pub use readiness::{CrdObject, TrackedObject};
pub use summary::{ResourceSummary, group_summaries};

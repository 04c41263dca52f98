//! Release resource inspection: pending check and resource summaries

use async_trait::async_trait;
use cfn_helm_core::ReleaseData;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::diagnostics::Diagnostics;
use crate::error::{KubeError, Result};
use crate::manifest::{ObjectFetcher, parse_manifest};
use crate::readiness::TrackedObject;
use crate::summary::{ResourceSummary, group_summaries};

/// Queries about the live objects of a release
#[async_trait]
pub trait ResourceInspector: Send + Sync {
    /// Whether any object of the release has not converged yet
    async fn pending(&self, release: &ReleaseData, diags: &mut Diagnostics) -> Result<bool>;

    /// Summaries of the release objects, grouped by kind and name
    async fn resources(&self, release: &ReleaseData) -> Result<BTreeMap<String, Value>>;
}

/// Inspects the objects listed in a release manifest
pub struct ManifestInspector {
    fetcher: Arc<dyn ObjectFetcher>,
    /// Failed lookups tolerated before giving up, halved
    retry_count: usize,
    output_limit: usize,
}

impl ManifestInspector {
    pub fn new(fetcher: Arc<dyn ObjectFetcher>, retry_count: usize, output_limit: usize) -> Self {
        Self {
            fetcher,
            retry_count,
            output_limit,
        }
    }
}

fn require_manifest(release: &ReleaseData) -> Result<()> {
    if release.manifest.trim().is_empty() {
        return Err(KubeError::InvalidManifest(
            "manifest not provided in the request".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl ResourceInspector for ManifestInspector {
    async fn pending(&self, release: &ReleaseData, diags: &mut Diagnostics) -> Result<bool> {
        tracing::info!(release = %release.name, "checking pending resources");
        require_manifest(release)?;

        let objects = parse_manifest(&release.manifest)?;
        let mut pending = false;
        let mut errors = 0usize;

        for object in &objects {
            if errors >= self.retry_count * 2 {
                return Err(KubeError::ResourceLookup);
            }

            let live = match self.fetcher.fetch(object, &release.namespace).await {
                Ok(live) => live,
                // Objects can lag behind the release record
                Err(e) if e.is_not_found() => {
                    tracing::info!(object = %object, "resource not found yet");
                    return Ok(true);
                }
                Err(e) => {
                    tracing::warn!(object = %object, error = %e, "failed to get resource");
                    errors += 1;
                    continue;
                }
            };

            match TrackedObject::from_dynamic(&live) {
                Ok(Some(tracked)) => {
                    if !tracked.is_ready(diags) {
                        pending = true;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(object = %object, error = %e, "failed to read resource status");
                    errors += 1;
                }
            }
        }

        Ok(pending || errors > 0)
    }

    async fn resources(&self, release: &ReleaseData) -> Result<BTreeMap<String, Value>> {
        tracing::info!(release = %release.name, "getting resources");
        require_manifest(release)?;

        let mut summaries = Vec::new();
        for object in parse_manifest(&release.manifest)? {
            let live = self.fetcher.fetch(&object, &release.namespace).await?;
            if let Some(summary) = ResourceSummary::from_object(&live, &release.namespace) {
                summaries.push(summary);
            }
        }

        Ok(group_summaries(&summaries, self.output_limit))
    }
}

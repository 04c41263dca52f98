//! `cfn-helm connector`
//!
//! Inside the connector function, where `AWS_LAMBDA_RUNTIME_API` is set, the
//! command serves invocations from the runtime API until it fails. The
//! function's `bootstrap` is this binary run as `cfn-helm connector`.
//!
//! Anywhere else it runs one event in-process. A failed action prints the
//! error payload instead of a response and exits with `REMOTE_ERROR`.

use cfn_helm_core::Event;
use cfn_helm_provider::{ConnectorEntry, ConnectorRuntime, HelmBackend};
use std::sync::Arc;

use super::{Context, aws_services, write};
use crate::error::{CliError, Result};

pub async fn run(ctx: &Context, runtime_api: Option<&str>) -> Result<()> {
    let settings = ctx.settings()?;
    if let Some(api) = runtime_api {
        let aws = aws_services(&settings, None);
        let entry = ConnectorEntry::new(Arc::new(HelmBackend::new(settings, aws)));
        return Ok(ConnectorRuntime::new(api, entry)?.run().await?);
    }

    let event: Event = ctx.read()?;
    let region = event.id.as_ref().map(|id| id.region.clone());
    let aws = aws_services(&settings, region.as_deref());
    let entry = ConnectorEntry::new(Arc::new(HelmBackend::new(settings, aws)));

    match entry.handle(event).await {
        Ok(response) => write(&response),
        Err(err) => {
            write(&err)?;
            Err(CliError::Remote(err))
        }
    }
}

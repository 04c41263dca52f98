//! `cfn-helm helm-release <operation>`

use cfn_helm_core::HelmReleaseModel;
use cfn_helm_provider::{HandlerRequest, HelmReleaseProvider, ProgressEvent};

use super::{Context, Operation, aws_services, write};
use crate::error::Result;

pub async fn run(ctx: &Context, operation: Operation) -> Result<()> {
    let settings = ctx.settings()?;
    let request: HandlerRequest<HelmReleaseModel> = ctx.read()?;
    let aws = aws_services(&settings, request.region.as_deref());
    let provider = HelmReleaseProvider::with_helm(settings, aws);

    tracing::info!(?operation, "handling helm release request");
    let event = match operation {
        Operation::Create => provider.create(&request).await,
        Operation::Read => provider.read(&request).await,
        Operation::Update => provider.update(&request).await,
        Operation::Delete => provider.delete(&request).await,
        Operation::List => provider
            .list(&request)
            .await
            .unwrap_or_else(|e| ProgressEvent::failed(&e, None)),
    };
    write(&event)
}

//! `cfn-helm eks-cluster <operation>`

use cfn_helm_core::EksClusterModel;
use cfn_helm_provider::{EksClusterProvider, HandlerRequest};

use super::{Context, Operation, aws_services, write};
use crate::error::Result;

pub async fn run(ctx: &Context, operation: Operation) -> Result<()> {
    let settings = ctx.settings()?;
    let request: HandlerRequest<EksClusterModel> = ctx.read()?;
    let aws = aws_services(&settings, request.region.as_deref());
    let provider = EksClusterProvider::new(settings, aws.clusters);

    tracing::info!(?operation, "handling eks cluster request");
    let event = match operation {
        Operation::Create => provider.create(&request).await,
        Operation::Read => provider.read(&request).await,
        Operation::Update => provider.update(&request).await,
        Operation::Delete => provider.delete(&request).await,
        Operation::List => provider.list(&request).await,
    };
    write(&event)
}

//! cfn-helm - CloudFormation resource handlers for Helm releases and EKS clusters

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod error;
mod exit_codes;

use commands::{Context, Operation};

#[derive(Parser)]
#[command(name = "cfn-helm")]
#[command(version)]
#[command(about = "CloudFormation resource handlers for Helm releases and EKS clusters", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to $CFN_HELM_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Read the request from a file instead of stdin
    #[arg(short, long, global = true)]
    input: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle an AWSQS::Kubernetes::Helm request
    HelmRelease {
        #[arg(value_enum)]
        operation: Operation,
    },

    /// Handle an AWSQS::EKS::Cluster request
    EksCluster {
        #[arg(value_enum)]
        operation: Operation,
    },

    /// Run VPC connector events
    Connector {
        /// Lambda runtime API to serve invocations from
        #[arg(long, env = "AWS_LAMBDA_RUNTIME_API")]
        runtime_api: Option<String>,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> error::Result<()> {
    let ctx = Context {
        config: cli.config,
        input: cli.input,
    };

    match cli.command {
        Commands::HelmRelease { operation } => commands::helm_release::run(&ctx, operation).await,
        Commands::EksCluster { operation } => commands::eks_cluster::run(&ctx, operation).await,
        Commands::Connector { runtime_api } => commands::connector::run(&ctx, runtime_api.as_deref()).await,
    }
}

#[tokio::main]
async fn main() {
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_tracing(cli.debug);

    let code = match run(cli).await {
        Ok(()) => exit_codes::SUCCESS,
        Err(err) => {
            let code = err.exit_code();
            eprintln!("{:?}", miette::Report::new(err));
            code
        }
    };
    std::process::exit(code);
}

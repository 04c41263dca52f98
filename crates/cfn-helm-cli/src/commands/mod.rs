//! Subcommand implementations
//!
//! Each handler command reads one JSON document from stdin (or `--input`)
//! and prints one JSON document to stdout. Logs go to stderr.

pub mod connector;
pub mod eks_cluster;
pub mod helm_release;

use cfn_helm_aws::{AwsCli, AwsServices};
use cfn_helm_provider::{ProviderSettings, resolve_region};
use clap::ValueEnum;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{CliError, Result};

/// Handler operation invoked by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    List,
}

/// Options shared by every subcommand
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Settings file overriding `CFN_HELM_CONFIG`
    pub config: Option<PathBuf>,
    /// Read the request from this file instead of stdin
    pub input: Option<PathBuf>,
}

impl Context {
    pub fn settings(&self) -> Result<Arc<ProviderSettings>> {
        let settings = match &self.config {
            Some(path) => {
                let mut settings = ProviderSettings::load_from(path)?;
                settings.apply_overrides(|key| std::env::var(key).ok())?;
                settings
            }
            None => ProviderSettings::load()?,
        };
        Ok(Arc::new(settings))
    }

    pub fn read<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = match &self.input {
            Some(path) => read_file(path)?,
            None => {
                let mut raw = String::new();
                std::io::stdin().read_to_string(&mut raw)?;
                raw
            }
        };
        serde_json::from_str(&raw).map_err(|e| {
            CliError::input_with_help(e, "the request must be a single JSON document")
        })
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| CliError::Io {
        message: format!("failed to read {}: {}", path.display(), e),
    })
}

/// AWS capabilities served by the `aws` executable
pub fn aws_services(settings: &ProviderSettings, region: Option<&str>) -> AwsServices {
    AwsServices::from_backend(AwsCli::new(settings.aws_binary.clone(), resolve_region(region)))
}

pub fn write<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, value).map_err(|e| CliError::Io {
        message: e.to_string(),
    })?;
    writeln!(stdout)?;
    Ok(())
}

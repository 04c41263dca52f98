//! CLI error types with exit code handling

use cfn_helm_core::RemoteError;
use cfn_helm_provider::ProviderError;
use miette::Diagnostic;
use thiserror::Error;

use crate::exit_codes;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// The request could not be parsed
    #[error("Invalid request: {message}")]
    #[diagnostic(code(cfn_helm::cli::input))]
    Input {
        message: String,
        #[help]
        help: Option<String>,
    },

    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(cfn_helm::cli::config),
        help("check the file named by CFN_HELM_CONFIG and the CFN_HELM_* variables")
    )]
    Config { message: String },

    /// A connector action failed
    #[error("Connector action failed: {0}")]
    #[diagnostic(code(cfn_helm::cli::remote))]
    Remote(RemoteError),

    /// The Lambda runtime API failed
    #[error("Connector runtime error: {message}")]
    #[diagnostic(code(cfn_helm::cli::runtime))]
    Runtime { message: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(cfn_helm::cli::io))]
    Io { message: String },
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Input { .. } => exit_codes::INPUT_ERROR,
            CliError::Config { .. } => exit_codes::CONFIG_ERROR,
            CliError::Remote(_) => exit_codes::REMOTE_ERROR,
            CliError::Runtime { .. } | CliError::Io { .. } => exit_codes::IO_ERROR,
        }
    }

    pub fn input_with_help(err: impl std::fmt::Display, help: impl Into<String>) -> Self {
        Self::Input {
            message: err.to_string(),
            help: Some(help.into()),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

impl From<ProviderError> for CliError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Config { message } => CliError::Config { message },
            ProviderError::Connector(message) => CliError::Runtime { message },
            other => CliError::Config {
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

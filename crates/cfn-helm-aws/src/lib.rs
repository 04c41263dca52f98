//! cfn-helm AWS - capability interfaces for the AWS services the providers use
//!
//! The providers never talk to AWS directly. They depend on the traits in
//! [`api`], which are served in production by [`AwsCli`] and in tests by
//! [`MockAws`].

pub mod api;
pub mod cli;
pub mod error;
pub mod mock;
pub mod types;

pub use api::{
    AwsServices, ClusterApi, FunctionApi, IdentityApi, NetworkApi, ObjectStoreApi, RegistryApi,
    SecretsApi,
};
pub use cli::AwsCli;
pub use error::{AwsError, Result, UPDATE_IN_PROGRESS};
pub use mock::{MockAws, OperationCounts, code_sha256};
pub use types::*;

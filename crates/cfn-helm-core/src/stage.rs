//! Re-invocation protocol state
//!
//! A handler invocation never blocks until an external operation converges.
//! It returns an in-progress event carrying a [`CallbackContext`], and the
//! caller replays that context on the next invocation. The context is the
//! only state that survives between invocations.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage of a reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    ReleaseStabilize,
    UninstallRelease,
    ConnectorStabilize,
    /// Waiting for a cluster operation to settle
    ClusterStabilize,
    Complete,
    /// A stage name this version does not know about
    Unknown(String),
}

impl Stage {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Init" => Self::Init,
            "ReleaseStabilize" => Self::ReleaseStabilize,
            "UninstallRelease" => Self::UninstallRelease,
            // Older connectors persisted this spelling
            "ConnectorStabilize" | "LambdaStabilize" => Self::ConnectorStabilize,
            "ClusterStabilize" => Self::ClusterStabilize,
            "Complete" => Self::Complete,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Init => "Init",
            Self::ReleaseStabilize => "ReleaseStabilize",
            Self::UninstallRelease => "UninstallRelease",
            Self::ConnectorStabilize => "ConnectorStabilize",
            Self::ClusterStabilize => "ClusterStabilize",
            Self::Complete => "Complete",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload replayed by CloudFormation across invocations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CallbackContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// RFC 3339 time the logical operation started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    /// Release name chosen on the first invocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CallbackContext {
    pub fn new(stage: &str, started_at: DateTime<Utc>, name: Option<String>) -> Self {
        Self {
            stage: Some(stage.to_string()),
            start_time: Some(started_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            name,
        }
    }

    /// Current stage, `Init` when the context carries none
    pub fn stage(&self) -> Stage {
        self.stage.as_deref().map(Stage::parse).unwrap_or(Stage::Init)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.start_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Resolve the stage and operation start time of an invocation
    ///
    /// Without a context this is the first invocation of the operation, so
    /// the stage is `Init` and the operation starts `now`. A replayed start
    /// time always wins over `now`.
    pub fn resolve(context: Option<&CallbackContext>, now: DateTime<Utc>) -> (Stage, DateTime<Utc>) {
        match context {
            None => (Stage::Init, now),
            Some(ctx) => (ctx.stage(), ctx.started_at().unwrap_or(now)),
        }
    }
}

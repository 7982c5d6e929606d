//! Engine factory: build an execution engine from configuration.
//!
//! The engine kind comes from an explicit class name when one is given,
//! otherwise from the connection string's scheme.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sluice_core::{BatchError, Result};
use tracing::info;

use crate::config::EngineSettings;
use crate::s3::S3Config;
use crate::{BallistaEngine, DataFusionEngine, ExecutionEngine, PostgresEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    DataFusion,
    Ballista,
    Postgres,
}

impl EngineKind {
    pub fn class_name(&self) -> &'static str {
        match self {
            EngineKind::DataFusion => "DataFusionExecutionEngine",
            EngineKind::Ballista => "BallistaExecutionEngine",
            EngineKind::Postgres => "PostgresExecutionEngine",
        }
    }

    /// Infer the kind from a connection string scheme.
    pub fn from_connection_string(uri: &str) -> Option<Self> {
        if uri.starts_with("postgres://") || uri.starts_with("postgresql://") {
            Some(EngineKind::Postgres)
        } else if uri.starts_with("df://") {
            Some(EngineKind::Ballista)
        } else {
            None
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

impl FromStr for EngineKind {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "datafusionexecutionengine" | "datafusion" | "in_memory" => Ok(EngineKind::DataFusion),
            "ballistaexecutionengine" | "ballista" | "distributed" => Ok(EngineKind::Ballista),
            "postgresexecutionengine" | "postgres" | "postgresql" | "relational" => {
                Ok(EngineKind::Postgres)
            }
            _ => Err(BatchError::InvalidConfig(format!(
                "unknown execution engine class '{}'",
                s
            ))),
        }
    }
}

/// Execution engine section of a datasource config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub class_name: Option<String>,
    /// `postgres://...` for relational engines.
    #[serde(default)]
    pub connection_string: Option<String>,
    /// `df://host:port` of a Ballista scheduler.
    #[serde(default)]
    pub scheduler_url: Option<String>,
    /// Run Ballista in-process instead of connecting to a scheduler.
    #[serde(default)]
    pub standalone: bool,
    #[serde(default)]
    pub settings: EngineSettings,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl EngineConfig {
    pub fn kind(&self) -> Result<EngineKind> {
        if let Some(class_name) = &self.class_name {
            return class_name.parse();
        }
        let inferred = self
            .connection_string
            .as_deref()
            .or(self.scheduler_url.as_deref())
            .and_then(EngineKind::from_connection_string);
        Ok(inferred.unwrap_or(EngineKind::DataFusion))
    }
}

pub async fn build_engine(name: &str, config: &EngineConfig) -> Result<Arc<dyn ExecutionEngine>> {
    let kind = config.kind()?;
    info!(engine = %name, kind = %kind, "Building execution engine");
    let settings = config.settings.clone();
    match kind {
        EngineKind::DataFusion => Ok(Arc::new(DataFusionEngine::with_settings(
            name,
            settings,
            config.s3.clone(),
        ))),
        EngineKind::Ballista => {
            let engine = if config.standalone {
                BallistaEngine::standalone(name, settings, config.s3.clone()).await?
            } else {
                let url = config
                    .scheduler_url
                    .as_deref()
                    .or(config.connection_string.as_deref())
                    .ok_or_else(|| {
                        BatchError::InvalidConfig(format!(
                            "engine '{}' needs a scheduler_url or standalone: true",
                            name
                        ))
                    })?;
                BallistaEngine::remote(name, url, settings, config.s3.clone()).await?
            };
            Ok(Arc::new(engine))
        }
        EngineKind::Postgres => {
            let conn = config.connection_string.as_deref().ok_or_else(|| {
                BatchError::InvalidConfig(format!("engine '{}' needs a connection_string", name))
            })?;
            Ok(Arc::new(PostgresEngine::connect(name, conn, settings).await?))
        }
    }
}

//! Package resolution and the connector catalog.
//!
//! Storing and downloading packages is the job of an external artifact
//! service; the orchestrator only needs to turn a package reference into
//! the archive location instances are started with, and to list the
//! connector types the cluster offers.

use async_trait::async_trait;
use thiserror::Error;

use sourcegrid_state::ConnectorType;

use crate::validate::SUPPORTED_SCHEMES;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArtifactError {
    #[error("package not found: {0}")]
    NotFound(String),

    #[error("unsupported package reference: {0}")]
    Unsupported(String),
}

/// A package reference resolved for instance startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    /// Archive location handed to workers.
    pub archive: String,
    /// Source class declared by the package, if it declares one.
    pub source_class: Option<String>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn resolve(&self, package_ref: &str) -> Result<ResolvedPackage, ArtifactError>;

    /// Every connector type known to the catalog.
    fn connector_types(&self) -> Vec<ConnectorType>;
}

/// Fixed catalog of built-in connectors. Other package references are
/// passed through unchanged.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    types: Vec<ConnectorType>,
}

impl StaticCatalog {
    pub fn new(types: Vec<ConnectorType>) -> Self {
        Self { types }
    }

    fn builtin(&self, name: &str) -> Option<&ConnectorType> {
        self.types.iter().find(|t| t.name == name)
    }
}

#[async_trait]
impl ArtifactStore for StaticCatalog {
    async fn resolve(&self, package_ref: &str) -> Result<ResolvedPackage, ArtifactError> {
        if let Some(name) = package_ref.strip_prefix("builtin://") {
            let ty = self
                .builtin(name)
                .ok_or_else(|| ArtifactError::NotFound(format!("built-in connector '{name}'")))?;
            return Ok(ResolvedPackage {
                archive: ty.archive.clone().unwrap_or_else(|| package_ref.to_string()),
                source_class: ty.source_class.clone(),
            });
        }
        if SUPPORTED_SCHEMES.iter().any(|s| package_ref.starts_with(s)) {
            return Ok(ResolvedPackage {
                archive: package_ref.to_string(),
                source_class: None,
            });
        }
        Err(ArtifactError::Unsupported(package_ref.to_string()))
    }

    fn connector_types(&self) -> Vec<ConnectorType> {
        self.types.clone()
    }
}

use crate::release::{ChartRef, Release, Values};
use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by the release engine. When the engine got far enough
/// to persist a partial release, it hands it back so the caller can roll
/// the store back.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ActionError {
    pub message: String,
    pub partial: Option<Release>,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial: None,
        }
    }

    pub fn with_partial(release: Release, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            partial: Some(release),
        }
    }

    /// The engine reports a missing release in-band.
    pub fn is_not_found(&self) -> bool {
        self.message.contains("not found")
    }
}

/// Rendering and release engine boundary. Implementations own chart
/// resolution, templating and the store writes for their own operations.
#[async_trait]
pub trait ReleaseActions: Send + Sync {
    /// Render and deploy the first revision of a release.
    async fn install(
        &self,
        name: &str,
        namespace: &str,
        chart: &ChartRef,
        values: &Values,
    ) -> Result<Release, ActionError>;

    /// Render and deploy the next revision on top of the deployed one.
    async fn upgrade(
        &self,
        name: &str,
        namespace: &str,
        chart: &ChartRef,
        values: &Values,
        force: bool,
    ) -> Result<Release, ActionError>;

    /// Roll back to the previously deployed revision.
    async fn rollback(&self, name: &str) -> Result<(), ActionError>;

    /// Remove the deployed release and its cluster resources.
    async fn uninstall(&self, name: &str) -> Result<Release, ActionError>;
}

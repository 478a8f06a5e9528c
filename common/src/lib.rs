use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("K8s error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Release storage error: {0}")]
    StoreError(#[from] store::StoreError),

    #[error("release: not found")]
    ReleaseNotFound,

    #[error("release: not synced")]
    NotSynced,

    #[error("no chart reference for instance")]
    MissingChart,

    #[error("failed to install release: {0}")]
    InstallFailed(String),

    #[error("failed to upgrade release: {0}")]
    UpgradeFailed(String),

    #[error("failed to uninstall release: {0}")]
    UninstallFailed(String),

    #[error("failed {operation} ({original}) and failed rollback: {rollback}")]
    FailedRollback {
        operation: &'static str,
        original: String,
        rollback: String,
    },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("timed out waiting for instance deletion")]
    DeletionTimeout,

    #[error("Error: {0}")]
    Other(String),
}
impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }

    /// True for a 404 from the api-server.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// True for a 409 from the api-server.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod actions;
pub mod lifecycle;
pub mod manifest;
pub mod patch;
pub mod release;
pub mod resources;
pub mod retry;
pub mod store;

pub use actions::{ActionError, ReleaseActions};
pub use lifecycle::ReleaseManager;
pub use release::{ChartRef, Release, ReleaseStatus, Values};
pub use store::ReleaseStore;

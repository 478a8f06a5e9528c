use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Top-level override values resolved for an instance.
pub type Values = serde_json::Map<String, serde_json::Value>;

/// Identity of the chart a release was rendered from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartRef {
    /// Chart name
    pub name: String,
    /// Chart version
    pub version: String,
    /// Repository the chart was resolved from
    pub repository: Option<String>,
}

/// Lifecycle state of a stored release version.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Pending,
    Deployed,
    Superseded,
    Failed,
    Uninstalled,
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReleaseStatus::Pending => "pending",
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::Uninstalled => "uninstalled",
        };
        f.write_str(s)
    }
}

/// One versioned, rendered deployment of a chart for an instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Release name, derived from the owning instance name
    pub name: String,
    /// Namespace of the owning instance
    pub namespace: String,
    /// Revision number, starting at 1
    pub version: u32,
    /// Chart identity this release was rendered from
    pub chart: ChartRef,
    /// Values the chart was rendered with
    pub values: Values,
    /// Rendered multi-document manifest
    pub manifest: String,
    /// Post-render notes, if the chart produced any
    pub notes: Option<String>,
    /// Lifecycle status of this revision
    pub status: ReleaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Release {
    /// First revision of a fresh install.
    pub fn for_install(name: &str, namespace: &str, chart: ChartRef, values: Values) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            version: 1,
            chart,
            values,
            manifest: String::new(),
            notes: None,
            status: ReleaseStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Next revision on top of an existing release.
    pub fn for_upgrade(previous: &Release, chart: ChartRef, values: Values) -> Self {
        let now = Utc::now();
        Self {
            name: previous.name.clone(),
            namespace: previous.namespace.clone(),
            version: previous.version + 1,
            chart,
            values,
            manifest: String::new(),
            notes: None,
            status: ReleaseStatus::Pending,
            created_at: previous.created_at,
            updated_at: now,
        }
    }

    pub fn is_deployed(&self) -> bool {
        self.status == ReleaseStatus::Deployed
    }

    pub fn mark(&mut self, status: ReleaseStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

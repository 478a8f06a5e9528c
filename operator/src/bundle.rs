use chrono::{DateTime, Utc};
use common::{ChartRef, Values};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer gating instance deletion on release uninstall.
pub const UNINSTALL_FINALIZER: &str = "bundles.caravel.io/uninstall-release";
/// Finalizer token written by older operator versions, still honored on
/// removal.
pub const UNINSTALL_FINALIZER_LEGACY: &str = "uninstall-bundle-release";
/// Marker annotation forcing the next upgrade.
pub const FORCE_UPGRADE_ANNOTATION: &str = "caravel.io/upgrade-force";
/// Marker annotation delaying finalizer removal until every dependent
/// resource is gone.
pub const UNINSTALL_WAIT_ANNOTATION: &str = "caravel.io/uninstall-wait";
/// Back-reference annotation stamped on dependents that cannot carry an
/// owner reference.
pub const OWNER_ANNOTATION: &str = "caravel.io/owner";

/// Desired state: which chart to deploy and with which override values.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "Bundle",
    group = "caravel.io",
    version = "v1",
    namespaced,
    status = "BundleStatus",
    shortname = "bdl",
    printcolumn = r#"{"name":"chart", "type":"string", "description":"Chart name", "jsonPath":".spec.chart.name"}"#,
    printcolumn = r#"{"name":"version", "type":"string", "description":"Chart version", "jsonPath":".spec.chart.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    /// Chart to deploy. May be omitted when the operator was configured
    /// with a default chart.
    pub chart: Option<ChartRef>,
    /// Override values handed to the render engine
    pub values: Option<Values>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    /// Set once the operator has seen the instance
    Initialized,
    /// Tracks whether a release is currently deployed
    Deployed,
    /// A release operation failed
    ReleaseFailed,
    /// Drift repair failed
    Irreconcilable,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionReason {
    InstallSuccessful,
    UpgradeSuccessful,
    UninstallSuccessful,
    InstallError,
    UpgradeError,
    UninstallError,
    ReconcileError,
    PreconditionError,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleCondition {
    /// Type of the condition
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: Option<ConditionReason>,
    /// Human readable message
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    /// Observed instance generation when the condition was recorded
    pub generation: Option<i64>,
}

impl BundleCondition {
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: Option<ConditionReason>,
        message: impl Into<String>,
        generation: Option<i64>,
    ) -> Self {
        Self {
            condition_type,
            status,
            reason,
            message: message.into(),
            last_transition_time: Utc::now(),
            generation,
        }
    }
}

/// Snapshot of the deployed release kept on status so deletion can clean up
/// after the store entry is gone.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployedRelease {
    pub name: String,
    pub manifest: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default)]
    pub conditions: Vec<BundleCondition>,
    pub deployed_release: Option<DeployedRelease>,
    /// Kind-policy supplied status details
    pub info: Option<Values>,
}

impl BundleStatus {
    pub fn set_condition(&mut self, condition: BundleCondition) {
        self.conditions
            .retain(|c| c.condition_type != condition.condition_type);
        self.conditions.push(condition);
    }

    pub fn remove_condition(&mut self, condition_type: ConditionType) {
        self.conditions.retain(|c| c.condition_type != condition_type);
    }

    pub fn condition(&self, condition_type: ConditionType) -> Option<&BundleCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

impl Bundle {
    /// Release name for this instance.
    pub fn release_name(&self) -> String {
        self.name_any()
    }

    pub fn values(&self) -> Values {
        self.spec.values.clone().unwrap_or_default()
    }

    /// Boolean marker annotations: case-insensitive `true` or `1` mean
    /// true, anything else (or absence) means false.
    fn bool_annotation(&self, key: &str) -> bool {
        match self.annotations().get(key) {
            Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1"),
            None => false,
        }
    }

    pub fn force_upgrade(&self) -> bool {
        self.bool_annotation(FORCE_UPGRADE_ANNOTATION)
    }

    pub fn uninstall_wait(&self) -> bool {
        self.bool_annotation(UNINSTALL_WAIT_ANNOTATION)
    }

    pub fn has_uninstall_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|f| f == UNINSTALL_FINALIZER || f == UNINSTALL_FINALIZER_LEGACY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn bundle_with_annotations(annotations: &[(&str, &str)]) -> Bundle {
        let mut bundle = Bundle::new(
            "cache",
            BundleSpec {
                chart: None,
                values: None,
            },
        );
        bundle.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        bundle
    }

    #[test]
    fn bool_annotations_parse_loosely() {
        assert!(bundle_with_annotations(&[(FORCE_UPGRADE_ANNOTATION, "True")]).force_upgrade());
        assert!(bundle_with_annotations(&[(FORCE_UPGRADE_ANNOTATION, "1")]).force_upgrade());
        assert!(!bundle_with_annotations(&[(FORCE_UPGRADE_ANNOTATION, "0")]).force_upgrade());
        assert!(!bundle_with_annotations(&[(FORCE_UPGRADE_ANNOTATION, "nope")]).force_upgrade());
        assert!(!bundle_with_annotations(&[]).uninstall_wait());
        assert!(bundle_with_annotations(&[(UNINSTALL_WAIT_ANNOTATION, "tRuE")]).uninstall_wait());
    }

    #[test]
    fn conditions_replace_by_type() {
        let mut status = BundleStatus::default();
        status.set_condition(BundleCondition::new(
            ConditionType::Deployed,
            ConditionStatus::True,
            Some(ConditionReason::InstallSuccessful),
            "installed",
            Some(1),
        ));
        status.set_condition(BundleCondition::new(
            ConditionType::Deployed,
            ConditionStatus::True,
            Some(ConditionReason::UpgradeSuccessful),
            "upgraded",
            Some(2),
        ));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(
            status.condition(ConditionType::Deployed).unwrap().reason,
            Some(ConditionReason::UpgradeSuccessful)
        );
        status.remove_condition(ConditionType::Deployed);
        assert!(status.condition(ConditionType::Deployed).is_none());
    }

    #[test]
    fn legacy_finalizer_is_recognized() {
        let mut bundle = bundle_with_annotations(&[]);
        bundle.metadata.finalizers = Some(vec![UNINSTALL_FINALIZER_LEGACY.to_string()]);
        assert!(bundle.has_uninstall_finalizer());
    }
}

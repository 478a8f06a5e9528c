use crate::{Error, Result};
use kube::core::GroupVersionKind;
use serde::Deserialize;
use serde_json::Value;

/// Resource policy annotation honored during cleanup. A resource annotated
/// with the value `keep` survives release deletion.
pub const RESOURCE_POLICY_ANNOTATION: &str = "caravel.io/resource-policy";
/// Helm compatible variant of [`RESOURCE_POLICY_ANNOTATION`].
pub const HELM_RESOURCE_POLICY_ANNOTATION: &str = "helm.sh/resource-policy";
pub const KEEP_POLICY: &str = "keep";

/// Kind install ordering, dependency-safe. Uninstall walks it backwards.
const INSTALL_ORDER: &[&str] = &[
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicaSet",
    "Deployment",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "Ingress",
    "APIService",
];

/// One document of a rendered manifest with its resolved type.
#[derive(Clone, Debug)]
pub struct ResourceDoc {
    pub gvk: GroupVersionKind,
    pub name: String,
    pub namespace: Option<String>,
    pub object: Value,
}

impl ResourceDoc {
    /// Resolve a parsed document into a typed resource. Documents without an
    /// `apiVersion`/`kind` pair cannot be resolved and yield `None`.
    pub fn from_value(object: Value) -> Option<ResourceDoc> {
        let api_version = object.get("apiVersion").and_then(Value::as_str)?;
        let kind = object.get("kind").and_then(Value::as_str)?;
        if api_version.is_empty() || kind.is_empty() {
            return None;
        }
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let name = object
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let namespace = object
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .map(str::to_string);
        Some(ResourceDoc {
            gvk,
            name,
            namespace,
            object,
        })
    }

    /// The core `v1/List` aggregate pseudo-type.
    pub fn is_list(&self) -> bool {
        self.gvk.group.is_empty() && self.gvk.version == "v1" && self.gvk.kind == "List"
    }

    /// Items of a `v1/List` document.
    pub fn list_items(&self) -> Vec<Value> {
        self.object
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.object
            .pointer("/metadata/annotations")
            .and_then(Value::as_object)
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
    }

    /// True when the resource is annotated to survive release deletion.
    pub fn is_kept(&self) -> bool {
        [RESOURCE_POLICY_ANNOTATION, HELM_RESOURCE_POLICY_ANNOTATION]
            .iter()
            .any(|k| self.annotation(k).map(str::trim) == Some(KEEP_POLICY))
    }

    pub fn display_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{} {}", ns, self.name, self.gvk.kind),
            None => format!("{} {}", self.name, self.gvk.kind),
        }
    }
}

/// Split a multi-document YAML manifest into its raw documents, dropping
/// empty ones.
pub fn split_documents(manifest: &str) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(manifest) {
        let value = Value::deserialize(doc).map_err(Error::YamlError)?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Parse a manifest into resolved resource documents, preserving document
/// order and skipping documents without a resolvable type.
pub fn parse_manifest(manifest: &str) -> Result<Vec<ResourceDoc>> {
    Ok(split_documents(manifest)?
        .into_iter()
        .filter_map(ResourceDoc::from_value)
        .collect())
}

fn install_weight(kind: &str) -> usize {
    INSTALL_ORDER
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(INSTALL_ORDER.len())
}

/// Order documents for uninstall: reverse of the install ordering, stable
/// within a kind.
pub fn sort_for_uninstall(docs: &mut [ResourceDoc]) {
    docs.sort_by_key(|d| std::cmp::Reverse(install_weight(&d.gvk.kind)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: cache
  namespace: default
---
# a comment only document
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: cache
  namespace: default
  annotations:
    caravel.io/resource-policy: keep
---
apiVersion: v1
kind: Service
metadata:
  name: cache
  namespace: default
"#;

    #[test]
    fn parses_documents_in_order() {
        let docs = parse_manifest(MANIFEST).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].gvk.kind, "ServiceAccount");
        assert_eq!(docs[1].gvk.kind, "Deployment");
        assert_eq!(docs[1].gvk.group, "apps");
        assert_eq!(docs[2].gvk.kind, "Service");
        assert_eq!(docs[0].namespace.as_deref(), Some("default"));
    }

    #[test]
    fn skips_unresolvable_documents() {
        let docs = parse_manifest("---\nfoo: bar\n---\nkind: Pod\n").unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn keep_policy_detection() {
        let docs = parse_manifest(MANIFEST).unwrap();
        assert!(!docs[0].is_kept());
        assert!(docs[1].is_kept());
    }

    #[test]
    fn uninstall_order_reverses_install_order() {
        let mut docs = parse_manifest(MANIFEST).unwrap();
        sort_for_uninstall(&mut docs);
        let kinds: Vec<&str> = docs.iter().map(|d| d.gvk.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Deployment", "Service", "ServiceAccount"]);
    }

    #[test]
    fn list_items_are_exposed() {
        let value = serde_json::json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}},
            ],
        });
        let doc = ResourceDoc::from_value(value).unwrap();
        assert!(doc.is_list());
        assert_eq!(doc.list_items().len(), 1);
    }
}

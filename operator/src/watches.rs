use crate::bundle::{Bundle, OWNER_ANNOTATION};
use async_trait::async_trait;
use common::{
    manifest::{split_documents, ResourceDoc},
    Release, Result,
};
use futures::{channel::mpsc::UnboundedSender, future::BoxFuture, pin_mut, StreamExt};
use kube::{
    core::{DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    runtime::{reflector::ObjectRef, watcher, WatchStreamExt},
    Api, Client,
};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// How dependent events map back to their owning instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchMode {
    /// Via the owner reference the release engine stamps on dependents
    OwnerReference,
    /// Via the owner annotation, for dependents that cannot reference a
    /// namespaced owner
    Annotation,
}

#[async_trait]
pub trait WatchRegistrar: Send + Sync {
    async fn register(&self, gvk: &GroupVersionKind, mode: WatchMode) -> Result<()>;
}

#[async_trait]
pub trait OwnershipProbe: Send + Sync {
    /// Whether a dependent of this type can carry an owner reference to the
    /// namespaced owner. Cluster-scoped dependents cannot.
    async fn supports_owner_reference(&self, gvk: &GroupVersionKind) -> Result<bool>;
}

/// Concurrent registry of dependent resource types under watch. Each GVK is
/// registered at most once for the lifetime of the operator.
pub struct DependentWatches {
    watched: RwLock<HashSet<String>>,
    probe: Arc<dyn OwnershipProbe>,
    registrar: Arc<dyn WatchRegistrar>,
}

impl DependentWatches {
    pub fn new(probe: Arc<dyn OwnershipProbe>, registrar: Arc<dyn WatchRegistrar>) -> Self {
        Self {
            watched: RwLock::new(HashSet::new()),
            probe,
            registrar,
        }
    }

    fn key(gvk: &GroupVersionKind) -> String {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }

    /// Walk a release manifest and ensure every dependent type is watched.
    /// Documents without a resolvable type are skipped; `v1/List` documents
    /// contribute their items but are never watched themselves.
    pub async fn observe_release(&self, release: &Release) -> Result<()> {
        for value in split_documents(&release.manifest)? {
            self.observe_value(value).await?;
        }
        Ok(())
    }

    fn observe_value(&self, value: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(doc) = ResourceDoc::from_value(value) else {
                return Ok(());
            };
            if doc.is_list() {
                for item in doc.list_items() {
                    self.observe_value(item).await?;
                }
                return Ok(());
            }
            self.watch_kind(&doc.gvk).await
        })
    }

    async fn watch_kind(&self, gvk: &GroupVersionKind) -> Result<()> {
        let key = Self::key(gvk);
        // reserve the key up front so concurrent observers of the same GVK
        // never register it twice; a failed registration releases it again
        if !self.watched.write().await.insert(key.clone()) {
            return Ok(());
        }
        let result = async {
            let mode = if self.probe.supports_owner_reference(gvk).await? {
                WatchMode::OwnerReference
            } else {
                WatchMode::Annotation
            };
            self.registrar.register(gvk, mode).await?;
            Ok(mode)
        }
        .await;
        match result {
            Ok(mode) => {
                info!("watching dependent {} ({mode:?})", gvk.kind);
                Ok(())
            }
            Err(e) => {
                self.watched.write().await.remove(&key);
                Err(e)
            }
        }
    }

    pub async fn watched_count(&self) -> usize {
        self.watched.read().await.len()
    }
}

/// Discovery-backed probe: a namespaced dependent can reference the owner,
/// a cluster-scoped one cannot.
pub struct KubeOwnershipProbe {
    client: Client,
}

impl KubeOwnershipProbe {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OwnershipProbe for KubeOwnershipProbe {
    async fn supports_owner_reference(&self, gvk: &GroupVersionKind) -> Result<bool> {
        let (_, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        Ok(caps.scope == Scope::Namespaced)
    }
}

/// Spawns one dynamic watcher task per registered GVK, funneling dependent
/// events into the controller trigger stream as owner references.
pub struct KubeWatchRegistrar {
    client: Client,
    trigger: UnboundedSender<ObjectRef<Bundle>>,
}

impl KubeWatchRegistrar {
    pub fn new(client: Client, trigger: UnboundedSender<ObjectRef<Bundle>>) -> Self {
        Self { client, trigger }
    }
}

/// Per-object update filter over a dynamic watch stream: pass objects seen
/// for the first time or whose `metadata.generation` moved, swallow the
/// rest. Status-only churn on dependents never retriggers the owner.
fn generation_changed(seen: &mut HashMap<String, Option<i64>>, obj: &DynamicObject) -> bool {
    let key = format!(
        "{}/{}",
        obj.metadata.namespace.as_deref().unwrap_or(""),
        obj.metadata.name.as_deref().unwrap_or("")
    );
    let generation = obj.metadata.generation;
    match seen.insert(key, generation) {
        Some(previous) => previous != generation,
        None => true,
    }
}

fn owner_of(obj: &DynamicObject, mode: WatchMode) -> Option<ObjectRef<Bundle>> {
    match mode {
        WatchMode::OwnerReference => {
            let ns = obj.metadata.namespace.clone()?;
            obj.metadata
                .owner_references
                .as_ref()?
                .iter()
                .find(|r| r.kind == "Bundle" && r.api_version == "caravel.io/v1")
                .map(|r| ObjectRef::new(&r.name).within(&ns))
        }
        WatchMode::Annotation => {
            let owner = obj.metadata.annotations.as_ref()?.get(OWNER_ANNOTATION)?;
            let (ns, name) = owner.split_once('/')?;
            Some(ObjectRef::new(name).within(ns))
        }
    }
}

#[async_trait]
impl WatchRegistrar for KubeWatchRegistrar {
    async fn register(&self, gvk: &GroupVersionKind, mode: WatchMode) -> Result<()> {
        let (ar, _) = discovery::pinned_kind(&self.client, gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let tx = self.trigger.clone();
        let kind = gvk.kind.clone();
        tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default().any_semantic())
                .default_backoff()
                .applied_objects();
            pin_mut!(stream);
            let mut seen = HashMap::new();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(obj) => {
                        if !generation_changed(&mut seen, &obj) {
                            continue;
                        }
                        if let Some(owner) = owner_of(&obj, mode) {
                            if tx.unbounded_send(owner).is_err() {
                                // controller is gone, stop watching
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("dependent watch for {kind} failed: {e}"),
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ChartRef, ReleaseStatus, Values};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRegistrar {
        calls: Mutex<Vec<(String, WatchMode)>>,
    }

    #[async_trait]
    impl WatchRegistrar for RecordingRegistrar {
        async fn register(&self, gvk: &GroupVersionKind, mode: WatchMode) -> Result<()> {
            self.calls.lock().unwrap().push((gvk.kind.clone(), mode));
            Ok(())
        }
    }

    struct StaticProbe {
        cluster_scoped: Vec<&'static str>,
    }

    #[async_trait]
    impl OwnershipProbe for StaticProbe {
        async fn supports_owner_reference(&self, gvk: &GroupVersionKind) -> Result<bool> {
            Ok(!self.cluster_scoped.contains(&gvk.kind.as_str()))
        }
    }

    const MANIFEST: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: cache
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: cache-replica
---
apiVersion: v1
kind: Service
metadata:
  name: cache
---
# no resolvable type here
data:
  key: value
---
apiVersion: v1
kind: List
items:
  - apiVersion: rbac.authorization.k8s.io/v1
    kind: ClusterRole
    metadata:
      name: cache-role
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: cache-config
"#;

    fn release() -> Release {
        let mut rel = Release::for_install(
            "cache",
            "default",
            ChartRef {
                name: "memcached".to_string(),
                version: "1.2.3".to_string(),
                repository: None,
            },
            Values::new(),
        );
        rel.manifest = MANIFEST.to_string();
        rel.status = ReleaseStatus::Deployed;
        rel
    }

    fn watches() -> (DependentWatches, Arc<RecordingRegistrar>) {
        let registrar = Arc::new(RecordingRegistrar::default());
        let probe = Arc::new(StaticProbe {
            cluster_scoped: vec!["ClusterRole"],
        });
        (DependentWatches::new(probe, registrar.clone()), registrar)
    }

    #[tokio::test]
    async fn each_kind_is_registered_exactly_once() {
        let (watches, registrar) = watches();
        watches.observe_release(&release()).await.unwrap();

        let calls = registrar.calls.lock().unwrap().clone();
        let kinds: Vec<&str> = calls.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["Deployment", "Service", "ClusterRole", "ConfigMap"]
        );
        assert_eq!(watches.watched_count().await, 4);
    }

    #[tokio::test]
    async fn the_list_pseudo_type_is_never_watched() {
        let (watches, registrar) = watches();
        watches.observe_release(&release()).await.unwrap();
        assert!(!registrar
            .calls
            .lock()
            .unwrap()
            .iter()
            .any(|(k, _)| k == "List"));
    }

    #[tokio::test]
    async fn cluster_scoped_dependents_use_annotation_mode() {
        let (watches, registrar) = watches();
        watches.observe_release(&release()).await.unwrap();
        let calls = registrar.calls.lock().unwrap().clone();
        let mode_of = |kind: &str| calls.iter().find(|(k, _)| k == kind).unwrap().1;
        assert_eq!(mode_of("ClusterRole"), WatchMode::Annotation);
        assert_eq!(mode_of("ConfigMap"), WatchMode::OwnerReference);
    }

    #[tokio::test]
    async fn repeated_observations_add_nothing() {
        let (watches, registrar) = watches();
        watches.observe_release(&release()).await.unwrap();
        watches.observe_release(&release()).await.unwrap();
        assert_eq!(registrar.calls.lock().unwrap().len(), 4);
        assert_eq!(watches.watched_count().await, 4);
    }

    struct FlakyRegistrar {
        fail_first: std::sync::atomic::AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WatchRegistrar for FlakyRegistrar {
        async fn register(&self, gvk: &GroupVersionKind, _mode: WatchMode) -> Result<()> {
            if self
                .fail_first
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(common::Error::Other("api-server hiccup".to_string()));
            }
            self.calls.lock().unwrap().push(gvk.kind.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_registrations_release_the_reservation() {
        let registrar = Arc::new(FlakyRegistrar {
            fail_first: std::sync::atomic::AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        });
        let probe = Arc::new(StaticProbe {
            cluster_scoped: vec![],
        });
        let watches = DependentWatches::new(probe, registrar.clone());

        assert!(watches.observe_release(&release()).await.is_err());
        // the failed GVK must not stay reserved, the retry picks it up
        watches.observe_release(&release()).await.unwrap();
        let calls = registrar.calls.lock().unwrap().clone();
        assert_eq!(calls.iter().filter(|k| *k == "Deployment").count(), 1);
        assert_eq!(watches.watched_count().await, 4);
    }

    #[test]
    fn generation_filter_passes_new_and_changed_objects() {
        let mut seen = HashMap::new();
        let mut obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "cache", "namespace": "default", "generation": 1},
        }))
        .unwrap();
        assert!(generation_changed(&mut seen, &obj));
        // a status-only update keeps the generation and is swallowed
        assert!(!generation_changed(&mut seen, &obj));
        obj.metadata.generation = Some(2);
        assert!(generation_changed(&mut seen, &obj));
        assert!(!generation_changed(&mut seen, &obj));

        // kinds without a generation still pass exactly once
        let plain: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cache-config", "namespace": "default"},
        }))
        .unwrap();
        assert!(generation_changed(&mut seen, &plain));
        assert!(!generation_changed(&mut seen, &plain));
    }

    #[test]
    fn owner_resolution_from_annotation() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {
                "name": "cache-role",
                "annotations": {OWNER_ANNOTATION: "default/cache"},
            },
        }))
        .unwrap();
        let owner = owner_of(&obj, WatchMode::Annotation).unwrap();
        assert_eq!(owner.name, "cache");
        assert_eq!(owner.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn owner_resolution_from_owner_reference() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cache-config",
                "namespace": "default",
                "ownerReferences": [{
                    "apiVersion": "caravel.io/v1",
                    "kind": "Bundle",
                    "name": "cache",
                    "uid": "0000",
                }],
            },
        }))
        .unwrap();
        let owner = owner_of(&obj, WatchMode::OwnerReference).unwrap();
        assert_eq!(owner.name, "cache");
        assert!(owner_of(&obj, WatchMode::Annotation).is_none());
    }
}

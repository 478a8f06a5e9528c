use crate::{
    bundle::{
        Bundle, BundleCondition, BundleStatus, ConditionReason, ConditionStatus, ConditionType,
        DeployedRelease, UNINSTALL_FINALIZER, UNINSTALL_FINALIZER_LEGACY,
    },
    manager::Context,
    telemetry,
};
use chrono::Utc;
use common::{Error, Result};
use kube::{runtime::controller::Action, Resource, ResourceExt};
use std::{sync::Arc, time::Duration};
use tracing::{field, info, instrument, warn, Span};

/// How long to poll for the instance to disappear once its finalizers are
/// gone.
const DELETION_TIMEOUT: Duration = Duration::from_secs(5);

fn condition(
    inst: &Bundle,
    condition_type: ConditionType,
    status: ConditionStatus,
    reason: Option<ConditionReason>,
    message: impl Into<String>,
) -> BundleCondition {
    BundleCondition::new(condition_type, status, reason, message, inst.metadata.generation)
}

#[instrument(skip(ctx, inst), fields(trace_id))]
pub async fn reconcile(inst: Arc<Bundle>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let namespace = inst.namespace().unwrap_or_default();
    let name = inst.name_any();
    // refetch, the controller cache can lag behind our own status writes
    let Some(inst) = ctx.instances.get(&namespace, &name).await? else {
        info!("instance {namespace}/{name} is gone");
        return Ok(Action::await_change());
    };
    if inst.metadata.deletion_timestamp.is_some() {
        delete(&inst, &ctx).await
    } else {
        apply(&inst, &ctx).await
    }
}

pub fn error_policy(inst: Arc<Bundle>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed for {}: {:?}", inst.name_any(), error);
    ctx.metrics.reconcile.reconcile_failure(&inst, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

async fn apply(inst: &Bundle, ctx: &Context) -> Result<Action> {
    let namespace = inst.namespace().unwrap_or_default();
    let name = inst.name_any();
    let policy = ctx.policies.for_kind(Bundle::kind(&()).as_ref());
    let mut mgr = ctx.release_manager(inst)?;

    let init = condition(inst, ConditionType::Initialized, ConditionStatus::True, None, "");
    ctx.instances
        .update_status(&namespace, &name, &move |st| st.set_condition(init.clone()))
        .await?;

    if let Err(e) = mgr.sync().await {
        let cond = condition(
            inst,
            ConditionType::Irreconcilable,
            ConditionStatus::True,
            Some(ConditionReason::ReconcileError),
            e.to_string(),
        );
        ctx.instances
            .update_status(&namespace, &name, &move |st| st.set_condition(cond.clone()))
            .await?;
        return Err(e);
    }
    ctx.instances
        .update_status(&namespace, &name, &|st| {
            st.remove_condition(ConditionType::Irreconcilable)
        })
        .await?;

    if !mgr.is_installed() {
        // fresh install
        if let Err(e) = policy.validate(inst).await {
            let cond = condition(
                inst,
                ConditionType::ReleaseFailed,
                ConditionStatus::True,
                Some(ConditionReason::PreconditionError),
                e.to_string(),
            );
            ctx.instances
                .update_status(&namespace, &name, &move |st| st.set_condition(cond.clone()))
                .await?;
            return Err(e);
        }
        let installed = match mgr.install().await {
            Ok(rel) => rel,
            Err(e) => {
                let cond = condition(
                    inst,
                    ConditionType::ReleaseFailed,
                    ConditionStatus::True,
                    Some(ConditionReason::InstallError),
                    e.to_string(),
                );
                ctx.instances
                    .update_status(&namespace, &name, &move |st| st.set_condition(cond.clone()))
                    .await?;
                return Err(e);
            }
        };
        ensure_finalizer(ctx, &namespace, &name).await?;
        ctx.watches.observe_release(&installed).await?;
        let info = policy.status_info(inst).await;
        let cond = condition(
            inst,
            ConditionType::Deployed,
            ConditionStatus::True,
            Some(ConditionReason::InstallSuccessful),
            installed.notes.clone().unwrap_or_default(),
        );
        let snapshot = DeployedRelease {
            name: installed.name.clone(),
            manifest: installed.manifest.clone(),
        };
        ctx.instances
            .update_status(&namespace, &name, &move |st| {
                st.remove_condition(ConditionType::ReleaseFailed);
                st.set_condition(cond.clone());
                st.deployed_release = Some(snapshot.clone());
                st.info = info.clone();
            })
            .await?;
        info!("installed release {} for {namespace}/{name}", installed.name);
        return Ok(Action::requeue(
            policy.requeue_after(inst).unwrap_or(ctx.reconcile_interval),
        ));
    }

    ensure_finalizer(ctx, &namespace, &name).await?;

    if mgr.is_upgrade_required() {
        if let Err(e) = policy.validate(inst).await {
            let cond = condition(
                inst,
                ConditionType::ReleaseFailed,
                ConditionStatus::True,
                Some(ConditionReason::PreconditionError),
                e.to_string(),
            );
            ctx.instances
                .update_status(&namespace, &name, &move |st| st.set_condition(cond.clone()))
                .await?;
            return Err(e);
        }
        let force = inst.force_upgrade();
        let (previous, upgraded) = match mgr.upgrade(force).await {
            Ok(pair) => pair,
            Err(e) => {
                let cond = condition(
                    inst,
                    ConditionType::ReleaseFailed,
                    ConditionStatus::True,
                    Some(ConditionReason::UpgradeError),
                    e.to_string(),
                );
                ctx.instances
                    .update_status(&namespace, &name, &move |st| st.set_condition(cond.clone()))
                    .await?;
                return Err(e);
            }
        };
        ctx.watches.observe_release(&upgraded).await?;
        let info = policy.status_info(inst).await;
        let cond = condition(
            inst,
            ConditionType::Deployed,
            ConditionStatus::True,
            Some(ConditionReason::UpgradeSuccessful),
            upgraded.notes.clone().unwrap_or_default(),
        );
        let snapshot = DeployedRelease {
            name: upgraded.name.clone(),
            manifest: upgraded.manifest.clone(),
        };
        ctx.instances
            .update_status(&namespace, &name, &move |st| {
                st.remove_condition(ConditionType::ReleaseFailed);
                st.set_condition(cond.clone());
                st.deployed_release = Some(snapshot.clone());
                st.info = info.clone();
            })
            .await?;
        info!(
            "upgraded release {} from v{} to v{} for {namespace}/{name}",
            upgraded.name, previous.version, upgraded.version
        );
        return Ok(Action::requeue(
            policy.requeue_after(inst).unwrap_or(ctx.reconcile_interval),
        ));
    }

    // installed and up to date: a stale failure from an earlier pass clears
    // before the checks rerun
    ctx.instances
        .update_status(&namespace, &name, &|st| {
            st.remove_condition(ConditionType::ReleaseFailed)
        })
        .await?;
    if let Err(e) = policy.validate(inst).await {
        let cond = condition(
            inst,
            ConditionType::ReleaseFailed,
            ConditionStatus::True,
            Some(ConditionReason::PreconditionError),
            e.to_string(),
        );
        ctx.instances
            .update_status(&namespace, &name, &move |st| st.set_condition(cond.clone()))
            .await?;
        return Err(e);
    }
    let deployed = match mgr.reconcile().await {
        Ok(rel) => rel,
        Err(e) => {
            let cond = condition(
                inst,
                ConditionType::Irreconcilable,
                ConditionStatus::True,
                Some(ConditionReason::ReconcileError),
                e.to_string(),
            );
            ctx.instances
                .update_status(&namespace, &name, &move |st| st.set_condition(cond.clone()))
                .await?;
            return Err(e);
        }
    };
    ctx.watches.observe_release(&deployed).await?;
    let info = policy.status_info(inst).await;
    let reason = if deployed.version == 1 {
        ConditionReason::InstallSuccessful
    } else {
        ConditionReason::UpgradeSuccessful
    };
    let cond = condition(
        inst,
        ConditionType::Deployed,
        ConditionStatus::True,
        Some(reason),
        deployed.notes.clone().unwrap_or_default(),
    );
    let snapshot = DeployedRelease {
        name: deployed.name.clone(),
        manifest: deployed.manifest.clone(),
    };
    ctx.instances
        .update_status(&namespace, &name, &move |st| {
            st.remove_condition(ConditionType::Irreconcilable);
            st.set_condition(cond.clone());
            st.deployed_release = Some(snapshot.clone());
            st.info = info.clone();
        })
        .await?;
    Ok(match policy.requeue_after(inst) {
        Some(interval) => Action::requeue(interval),
        None => Action::await_change(),
    })
}

async fn delete(inst: &Bundle, ctx: &Context) -> Result<Action> {
    let namespace = inst.namespace().unwrap_or_default();
    let name = inst.name_any();
    if !inst.has_uninstall_finalizer() {
        info!("instance {namespace}/{name} is terminated, nothing to do");
        return Ok(Action::await_change());
    }
    let mgr = ctx.release_manager(inst)?;
    let uninstalled = match mgr.uninstall().await {
        Ok(rel) => Some(rel),
        Err(Error::ReleaseNotFound) => None,
        Err(e) => {
            let cond = condition(
                inst,
                ConditionType::ReleaseFailed,
                ConditionStatus::True,
                Some(ConditionReason::UninstallError),
                e.to_string(),
            );
            ctx.instances
                .update_status(&namespace, &name, &move |st| st.set_condition(cond.clone()))
                .await?;
            return Err(e);
        }
    };

    if inst.uninstall_wait() {
        let waiting = condition(
            inst,
            ConditionType::Deployed,
            ConditionStatus::True,
            Some(ConditionReason::UninstallSuccessful),
            "waiting until all release resources are deleted",
        );
        ctx.instances
            .update_status(&namespace, &name, &move |st| {
                st.remove_condition(ConditionType::ReleaseFailed);
                st.set_condition(waiting.clone());
            })
            .await?;
        let manifest = inst
            .status
            .as_ref()
            .and_then(|s| s.deployed_release.as_ref())
            .map(|r| r.manifest.clone())
            .or_else(|| uninstalled.as_ref().map(|r| r.manifest.clone()));
        if let Some(manifest) = manifest {
            match mgr.cleanup(&manifest).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("dependents of {namespace}/{name} still present, waiting");
                    return Ok(Action::requeue(ctx.reconcile_interval));
                }
                Err(e) => {
                    let cond = condition(
                        inst,
                        ConditionType::ReleaseFailed,
                        ConditionStatus::True,
                        Some(ConditionReason::UninstallError),
                        e.to_string(),
                    );
                    ctx.instances
                        .update_status(&namespace, &name, &move |st| {
                            st.set_condition(cond.clone())
                        })
                        .await?;
                    return Err(e);
                }
            }
        }
    }

    let done = condition(
        inst,
        ConditionType::Deployed,
        ConditionStatus::False,
        Some(ConditionReason::UninstallSuccessful),
        "release uninstalled",
    );
    ctx.instances
        .update_status(&namespace, &name, &move |st: &mut BundleStatus| {
            st.remove_condition(ConditionType::ReleaseFailed);
            st.set_condition(done.clone());
            st.deployed_release = None;
        })
        .await?;
    ctx.instances
        .update_meta(&namespace, &name, &|meta| {
            if let Some(finalizers) = meta.finalizers.as_mut() {
                finalizers
                    .retain(|t| t != UNINSTALL_FINALIZER && t != UNINSTALL_FINALIZER_LEGACY);
            }
        })
        .await?;
    ctx.instances
        .wait_deleted(&namespace, &name, DELETION_TIMEOUT)
        .await?;
    info!("uninstalled release for {namespace}/{name}");
    Ok(Action::await_change())
}

async fn ensure_finalizer(ctx: &Context, namespace: &str, name: &str) -> Result<()> {
    ctx.instances
        .update_meta(namespace, name, &|meta| {
            let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
            if !finalizers
                .iter()
                .any(|t| t == UNINSTALL_FINALIZER || t == UNINSTALL_FINALIZER_LEGACY)
            {
                finalizers.push(UNINSTALL_FINALIZER.to_string());
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bundle::{BundleSpec, UNINSTALL_WAIT_ANNOTATION},
        instances::{BundleInstances, MemoryInstances},
        metrics::Metrics,
        policy::{KindPolicy, PolicySet},
        watches::{DependentWatches, OwnershipProbe, WatchMode, WatchRegistrar},
    };
    use crate::manager::Diagnostics;
    use async_trait::async_trait;
    use common::{
        actions::{ActionError, ReleaseActions},
        manifest::parse_manifest,
        release::{ChartRef, Release, ReleaseStatus, Values},
        resources::MemoryResourceApi,
        store::MemoryStore,
    };
    use kube::core::GroupVersionKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::RwLock;

    const MANIFEST: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: cache-config
  namespace: default
data:
  hit: "miss"
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: cache
  namespace: default
spec:
  replicas: 2
"#;

    fn chart() -> ChartRef {
        ChartRef {
            name: "memcached".to_string(),
            version: "1.2.3".to_string(),
            repository: None,
        }
    }

    fn deployed_release(version: u32, values: Values) -> Release {
        let mut rel = Release::for_install("cache", "default", chart(), values);
        rel.version = version;
        rel.manifest = MANIFEST.to_string();
        rel.status = ReleaseStatus::Deployed;
        rel
    }

    #[derive(Default)]
    struct FakeActions {
        fail_install: bool,
        fail_uninstall: bool,
        installs: AtomicU32,
        upgrades: AtomicU32,
        uninstalls: AtomicU32,
    }

    #[async_trait]
    impl ReleaseActions for FakeActions {
        async fn install(
            &self,
            name: &str,
            namespace: &str,
            chart: &ChartRef,
            values: &Values,
        ) -> Result<Release, ActionError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            if self.fail_install {
                return Err(ActionError::new("render exploded"));
            }
            let mut rel = Release::for_install(name, namespace, chart.clone(), values.clone());
            rel.manifest = MANIFEST.to_string();
            rel.notes = Some("enjoy your cache".to_string());
            rel.status = ReleaseStatus::Deployed;
            Ok(rel)
        }

        async fn upgrade(
            &self,
            name: &str,
            namespace: &str,
            chart: &ChartRef,
            values: &Values,
            _force: bool,
        ) -> Result<Release, ActionError> {
            self.upgrades.fetch_add(1, Ordering::SeqCst);
            let previous = Release::for_install(name, namespace, chart.clone(), values.clone());
            let mut rel = Release::for_upgrade(&previous, chart.clone(), values.clone());
            rel.manifest = MANIFEST.to_string();
            rel.status = ReleaseStatus::Deployed;
            Ok(rel)
        }

        async fn rollback(&self, _name: &str) -> Result<(), ActionError> {
            Ok(())
        }

        async fn uninstall(&self, name: &str) -> Result<Release, ActionError> {
            self.uninstalls.fetch_add(1, Ordering::SeqCst);
            if self.fail_uninstall {
                return Err(ActionError::new(format!("release {name} not found")));
            }
            Ok(deployed_release(1, Values::new()))
        }
    }

    #[derive(Default)]
    struct RecordingRegistrar {
        kinds: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WatchRegistrar for RecordingRegistrar {
        async fn register(&self, gvk: &GroupVersionKind, _mode: WatchMode) -> Result<()> {
            self.kinds.lock().unwrap().push(gvk.kind.clone());
            Ok(())
        }
    }

    struct NamespacedProbe;

    #[async_trait]
    impl OwnershipProbe for NamespacedProbe {
        async fn supports_owner_reference(&self, _gvk: &GroupVersionKind) -> Result<bool> {
            Ok(true)
        }
    }

    struct Fixture {
        ctx: Arc<Context>,
        instances: Arc<MemoryInstances>,
        store: Arc<MemoryStore>,
        actions: Arc<FakeActions>,
        resources: Arc<MemoryResourceApi>,
        registrar: Arc<RecordingRegistrar>,
    }

    impl Fixture {
        fn new(actions: FakeActions, policies: PolicySet) -> Self {
            let instances = Arc::new(MemoryInstances::new());
            let store = Arc::new(MemoryStore::new());
            let actions = Arc::new(actions);
            let resources = Arc::new(MemoryResourceApi::new());
            let registrar = Arc::new(RecordingRegistrar::default());
            let watches = Arc::new(DependentWatches::new(
                Arc::new(NamespacedProbe),
                registrar.clone(),
            ));
            let ctx = Arc::new(Context {
                instances: instances.clone(),
                store: store.clone(),
                actions: actions.clone(),
                resources: resources.clone(),
                watches,
                policies,
                default_chart: Some(chart()),
                reconcile_interval: Duration::from_secs(60),
                diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
                metrics: Metrics::default(),
            });
            Self {
                ctx,
                instances,
                store,
                actions,
                resources,
                registrar,
            }
        }

        fn seed_bundle(&self, annotations: &[(&str, &str)], finalizer: bool) -> Arc<Bundle> {
            let mut bundle = Bundle::new(
                "cache",
                BundleSpec {
                    chart: None,
                    values: None,
                },
            );
            bundle.metadata.namespace = Some("default".to_string());
            bundle.metadata.generation = Some(1);
            if !annotations.is_empty() {
                bundle.metadata.annotations = Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                );
            }
            if finalizer {
                bundle.metadata.finalizers = Some(vec![UNINSTALL_FINALIZER.to_string()]);
            }
            self.instances.put("default", bundle.clone());
            Arc::new(bundle)
        }

        async fn status(&self) -> BundleStatus {
            self.instances
                .get("default", "cache")
                .await
                .unwrap()
                .unwrap()
                .status
                .unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn fresh_install_deploys_and_snapshots() {
        let fx = Fixture::new(FakeActions::default(), PolicySet::new());
        let bundle = fx.seed_bundle(&[], false);

        let action = reconcile(bundle, fx.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        assert_eq!(fx.actions.installs.load(Ordering::SeqCst), 1);

        let status = fx.status().await;
        assert!(status.condition(ConditionType::Initialized).is_some());
        let deployed = status.condition(ConditionType::Deployed).unwrap();
        assert_eq!(deployed.status, ConditionStatus::True);
        assert_eq!(deployed.reason, Some(ConditionReason::InstallSuccessful));
        assert_eq!(deployed.message, "enjoy your cache");
        assert!(status.deployed_release.is_some());

        let stored = fx.instances.get("default", "cache").await.unwrap().unwrap();
        assert!(stored.has_uninstall_finalizer());
        assert_eq!(fx.registrar.kinds.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn install_failure_records_the_condition() {
        let fx = Fixture::new(
            FakeActions {
                fail_install: true,
                ..FakeActions::default()
            },
            PolicySet::new(),
        );
        let bundle = fx.seed_bundle(&[], false);

        assert!(reconcile(bundle, fx.ctx.clone()).await.is_err());
        let status = fx.status().await;
        let failed = status.condition(ConditionType::ReleaseFailed).unwrap();
        assert_eq!(failed.reason, Some(ConditionReason::InstallError));
        assert!(failed.message.contains("render exploded"));
    }

    #[tokio::test]
    async fn failing_preconditions_block_a_fresh_install() {
        struct Gated;
        #[async_trait]
        impl KindPolicy for Gated {
            async fn validate(&self, _instance: &Bundle) -> Result<()> {
                Err(Error::PreconditionFailed("quota exceeded".to_string()))
            }
        }
        let fx = Fixture::new(
            FakeActions::default(),
            PolicySet::new().with_policy("Bundle", Arc::new(Gated)),
        );
        let bundle = fx.seed_bundle(&[], false);

        assert!(reconcile(bundle, fx.ctx.clone()).await.is_err());
        assert_eq!(fx.actions.installs.load(Ordering::SeqCst), 0);
        let status = fx.status().await;
        let failed = status.condition(ConditionType::ReleaseFailed).unwrap();
        assert_eq!(failed.reason, Some(ConditionReason::PreconditionError));
        assert!(failed.message.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn changed_values_trigger_an_upgrade() {
        let fx = Fixture::new(FakeActions::default(), PolicySet::new());
        let mut stored_values = Values::new();
        stored_values.insert("size".to_string(), json!(1));
        fx.store.seed(deployed_release(1, stored_values));
        let bundle = fx.seed_bundle(&[], true);

        let action = reconcile(bundle, fx.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        assert_eq!(fx.actions.upgrades.load(Ordering::SeqCst), 1);
        let status = fx.status().await;
        assert_eq!(
            status.condition(ConditionType::Deployed).unwrap().reason,
            Some(ConditionReason::UpgradeSuccessful)
        );
    }

    #[tokio::test]
    async fn up_to_date_instance_repairs_drift_without_requeue() {
        let fx = Fixture::new(FakeActions::default(), PolicySet::new());
        fx.store.seed(deployed_release(2, Values::new()));
        // ConfigMap absent, Deployment in sync
        let docs = parse_manifest(MANIFEST).unwrap();
        fx.resources.seed(&docs[1], docs[1].object.clone());
        let bundle = fx.seed_bundle(&[], true);

        let action = reconcile(bundle, fx.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(fx.actions.installs.load(Ordering::SeqCst), 0);
        assert_eq!(fx.actions.upgrades.load(Ordering::SeqCst), 0);
        assert_eq!(fx.resources.created.lock().unwrap().len(), 1);
        let status = fx.status().await;
        assert_eq!(
            status.condition(ConditionType::Deployed).unwrap().reason,
            Some(ConditionReason::UpgradeSuccessful)
        );
    }

    #[tokio::test]
    async fn stale_release_failed_clears_before_the_checks_rerun() {
        struct Gated;
        #[async_trait]
        impl KindPolicy for Gated {
            async fn validate(&self, _instance: &Bundle) -> Result<()> {
                Err(Error::PreconditionFailed("quota exceeded".to_string()))
            }
        }
        // a stale InstallError sits on status from an earlier pass
        async fn seed_stale(fx: &Fixture) {
            fx.ctx
                .instances
                .update_status("default", "cache", &|st| {
                    st.set_condition(BundleCondition::new(
                        ConditionType::ReleaseFailed,
                        ConditionStatus::True,
                        Some(ConditionReason::InstallError),
                        "old failure",
                        Some(1),
                    ))
                })
                .await
                .unwrap();
        }

        // failing validation replaces the stale condition with its own
        let fx = Fixture::new(
            FakeActions::default(),
            PolicySet::new().with_policy("Bundle", Arc::new(Gated)),
        );
        fx.store.seed(deployed_release(1, Values::new()));
        let bundle = fx.seed_bundle(&[], true);
        seed_stale(&fx).await;
        assert!(reconcile(bundle, fx.ctx.clone()).await.is_err());
        let failed = fx.status().await;
        let failed = failed.condition(ConditionType::ReleaseFailed).unwrap();
        assert_eq!(failed.reason, Some(ConditionReason::PreconditionError));

        // passing validation leaves no failure behind
        let fx = Fixture::new(FakeActions::default(), PolicySet::new());
        fx.store.seed(deployed_release(1, Values::new()));
        for doc in parse_manifest(MANIFEST).unwrap() {
            fx.resources.seed(&doc, doc.object.clone());
        }
        let bundle = fx.seed_bundle(&[], true);
        seed_stale(&fx).await;
        reconcile(bundle, fx.ctx.clone()).await.unwrap();
        assert!(fx
            .status()
            .await
            .condition(ConditionType::ReleaseFailed)
            .is_none());
    }

    #[tokio::test]
    async fn version_one_reconcile_reports_install_successful() {
        let fx = Fixture::new(FakeActions::default(), PolicySet::new());
        fx.store.seed(deployed_release(1, Values::new()));
        for doc in parse_manifest(MANIFEST).unwrap() {
            fx.resources.seed(&doc, doc.object.clone());
        }
        let bundle = fx.seed_bundle(&[], true);
        reconcile(bundle, fx.ctx.clone()).await.unwrap();
        assert_eq!(
            fx.status().await.condition(ConditionType::Deployed).unwrap().reason,
            Some(ConditionReason::InstallSuccessful)
        );
    }

    #[tokio::test]
    async fn deletion_uninstalls_and_releases_the_instance() {
        let fx = Fixture::new(FakeActions::default(), PolicySet::new());
        let _ = fx.seed_bundle(&[], true);
        fx.instances.mark_deleted("default", "cache");
        let bundle = Arc::new(
            fx.instances
                .get("default", "cache")
                .await
                .unwrap()
                .unwrap(),
        );

        let action = reconcile(bundle, fx.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(fx.actions.uninstalls.load(Ordering::SeqCst), 1);
        assert!(fx.instances.get("default", "cache").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deletion_with_missing_release_is_benign() {
        let fx = Fixture::new(
            FakeActions {
                fail_uninstall: true,
                ..FakeActions::default()
            },
            PolicySet::new(),
        );
        let _ = fx.seed_bundle(&[], true);
        fx.instances.mark_deleted("default", "cache");
        let bundle = Arc::new(
            fx.instances
                .get("default", "cache")
                .await
                .unwrap()
                .unwrap(),
        );
        reconcile(bundle, fx.ctx.clone()).await.unwrap();
        assert!(fx.instances.get("default", "cache").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deletion_without_finalizer_is_terminal() {
        let fx = Fixture::new(FakeActions::default(), PolicySet::new());
        let _ = fx.seed_bundle(&[], false);
        fx.instances.mark_deleted("default", "cache");
        let bundle = Arc::new(
            fx.instances
                .get("default", "cache")
                .await
                .unwrap()
                .unwrap(),
        );
        let action = reconcile(bundle, fx.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(fx.actions.uninstalls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn uninstall_wait_requeues_until_dependents_are_gone() {
        let fx = Fixture::new(FakeActions::default(), PolicySet::new());
        let _ = fx.seed_bundle(&[(UNINSTALL_WAIT_ANNOTATION, "true")], true);
        // leftover dependents from the last deployed manifest
        let docs = parse_manifest(MANIFEST).unwrap();
        fx.resources.seed(&docs[0], docs[0].object.clone());
        fx.ctx
            .instances
            .update_status("default", "cache", &|st| {
                st.deployed_release = Some(DeployedRelease {
                    name: "cache".to_string(),
                    manifest: MANIFEST.to_string(),
                });
            })
            .await
            .unwrap();
        fx.instances.mark_deleted("default", "cache");
        let bundle = Arc::new(
            fx.instances
                .get("default", "cache")
                .await
                .unwrap()
                .unwrap(),
        );

        // first pass: dependents remain, deletes issued, instance survives
        let action = reconcile(bundle, fx.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
        let survivor = fx.instances.get("default", "cache").await.unwrap().unwrap();
        let deployed = survivor
            .status
            .as_ref()
            .unwrap()
            .condition(ConditionType::Deployed)
            .unwrap();
        assert_eq!(deployed.status, ConditionStatus::True);
        assert!(deployed.message.contains("waiting"));

        // second pass: everything is gone, the finalizer releases
        let bundle = Arc::new(survivor);
        let action = reconcile(bundle, fx.ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(fx.instances.get("default", "cache").await.unwrap().is_none());
    }
}

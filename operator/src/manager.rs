use crate::{
    bundle::Bundle,
    instances::{BundleInstances, KubeInstances},
    metrics::Metrics,
    policy::PolicySet,
    reconciler,
    watches::{DependentWatches, KubeOwnershipProbe, KubeWatchRegistrar},
};
use chrono::{DateTime, Utc};
use common::{
    actions::ReleaseActions,
    lifecycle::ReleaseManager,
    release::ChartRef,
    resources::{KubeResourceApi, ResourceApi},
    store::{ReleaseStore, SecretStore},
    Error, Result,
};
use futures::{channel::mpsc, future::BoxFuture, FutureExt, StreamExt};
use kube::{
    api::ListParams,
    runtime::{controller::Controller, events::Reporter, watcher},
    Api, Client, ResourceExt,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::error;

/// Diagnostics to be exposed by the embedding web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "caravel-operator".into(),
        }
    }
}

/// State shared across reconcile passes. Every collaborator sits behind a
/// trait object so the state machine runs against in-memory boundaries in
/// tests.
pub struct Context {
    pub instances: Arc<dyn BundleInstances>,
    pub store: Arc<dyn ReleaseStore>,
    pub actions: Arc<dyn ReleaseActions>,
    pub resources: Arc<dyn ResourceApi>,
    pub watches: Arc<DependentWatches>,
    pub policies: PolicySet,
    pub default_chart: Option<ChartRef>,
    pub reconcile_interval: Duration,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Metrics,
}

impl Context {
    /// Build the lifecycle manager for an instance from its desired state.
    pub fn release_manager(&self, inst: &Bundle) -> Result<ReleaseManager> {
        let chart = inst
            .spec
            .chart
            .clone()
            .or_else(|| self.default_chart.clone())
            .ok_or(Error::MissingChart)?;
        let namespace = inst.namespace().unwrap_or_default();
        Ok(ReleaseManager::new(
            self.store.clone(),
            self.actions.clone(),
            self.resources.clone(),
            &inst.release_name(),
            &namespace,
            chart,
            inst.values(),
        ))
    }
}

/// Embedder-supplied configuration. The release engine is external; the
/// operator only drives it.
pub struct ManagerOptions {
    pub actions: Arc<dyn ReleaseActions>,
    pub policies: PolicySet,
    pub default_chart: Option<ChartRef>,
    pub reconcile_interval: Duration,
}

/// Operator state exposed to the embedding server
#[derive(Clone)]
pub struct Manager {
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Metrics,
}

impl Manager {
    /// Wire the controller against the cluster and return it as a future to
    /// drive. Fails when the CRD is not installed.
    pub async fn new(options: ManagerOptions) -> Result<(Self, BoxFuture<'static, ()>)> {
        let client = Client::try_default().await?;
        let namespace = client.default_namespace().to_string();
        let store: Arc<dyn ReleaseStore> = Arc::new(SecretStore::new(client.clone(), &namespace));
        let resources: Arc<dyn ResourceApi> = Arc::new(KubeResourceApi::new(client.clone()));
        let instances: Arc<dyn BundleInstances> = Arc::new(KubeInstances::new(client.clone()));
        let (trigger_tx, trigger_rx) = mpsc::unbounded();
        let watches = Arc::new(DependentWatches::new(
            Arc::new(KubeOwnershipProbe::new(client.clone())),
            Arc::new(KubeWatchRegistrar::new(client.clone(), trigger_tx)),
        ));
        let diagnostics = Arc::new(RwLock::new(Diagnostics::default()));
        let metrics = Metrics::default();
        let context = Arc::new(Context {
            instances,
            store,
            actions: options.actions,
            resources,
            watches,
            policies: options.policies,
            default_chart: options.default_chart,
            reconcile_interval: options.reconcile_interval,
            diagnostics: diagnostics.clone(),
            metrics: metrics.clone(),
        });

        let bundles = Api::<Bundle>::all(client);
        if let Err(e) = bundles.list(&ListParams::default().limit(1)).await {
            error!("CRD is not queryable; {e:?}. Is the CRD installed?");
            return Err(Error::KubeError(e));
        }
        let controller = Controller::new(bundles, watcher::Config::default().any_semantic())
            .reconcile_on(trigger_rx)
            .run(reconciler::reconcile, reconciler::error_policy, context)
            .filter_map(|x| async move { x.ok() })
            .for_each(|_| futures::future::ready(()))
            .boxed();
        Ok((
            Self {
                diagnostics,
                metrics,
            },
            controller,
        ))
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Metrics getter
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        let _ = prometheus_client::encoding::text::encode(&mut buffer, &self.metrics.registry);
        buffer
    }
}

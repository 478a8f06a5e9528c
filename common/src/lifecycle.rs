use crate::{
    actions::ReleaseActions,
    manifest::{parse_manifest, sort_for_uninstall},
    patch::compute_patch,
    release::{ChartRef, Release, Values},
    resources::ResourceApi,
    store::{ReleaseStore, StoreError},
    Error, Result,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Drives the lifecycle of one release, rebuilt from the owning instance's
/// desired state on every reconcile pass. `sync` must run before the
/// state-dependent operations.
pub struct ReleaseManager {
    store: Arc<dyn ReleaseStore>,
    actions: Arc<dyn ReleaseActions>,
    resources: Arc<dyn ResourceApi>,
    name: String,
    namespace: String,
    chart: ChartRef,
    values: Values,
    installed: bool,
    upgrade_required: bool,
    deployed: Option<Release>,
}

impl ReleaseManager {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        actions: Arc<dyn ReleaseActions>,
        resources: Arc<dyn ResourceApi>,
        name: &str,
        namespace: &str,
        chart: ChartRef,
        values: Values,
    ) -> Self {
        Self {
            store,
            actions,
            resources,
            name: name.to_string(),
            namespace: namespace.to_string(),
            chart,
            values,
            installed: false,
            upgrade_required: false,
            deployed: None,
        }
    }

    pub fn release_name(&self) -> &str {
        &self.name
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn is_upgrade_required(&self) -> bool {
        self.upgrade_required
    }

    pub fn deployed(&self) -> Option<&Release> {
        self.deployed.as_ref()
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Override one top-level desired value before `sync`. Only values that
    /// already exist as strings are replaced.
    pub fn set_value(&mut self, key: &str, value: Value) -> bool {
        match self.values.get(key) {
            Some(Value::String(_)) => {
                self.values.insert(key.to_string(), value);
                true
            }
            _ => false,
        }
    }

    /// Reconcile the store with reality: prune versions that never reached
    /// the deployed state, then load the deployed release and decide whether
    /// the desired state diverged from it.
    pub async fn sync(&mut self) -> Result<()> {
        match self.store.history(&self.name).await {
            Ok(history) => {
                for rel in history.iter().filter(|r| !r.is_deployed()) {
                    debug!("pruning stale release {} v{}", rel.name, rel.version);
                    match self.store.delete(&self.name, rel.version).await {
                        Ok(_) | Err(StoreError::NotFound) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        match self.store.deployed(&self.name).await {
            Ok(rel) => {
                self.upgrade_required = self.differs(&rel)?;
                self.installed = true;
                self.deployed = Some(rel);
            }
            Err(StoreError::NoDeployed | StoreError::NotFound) => {
                self.installed = false;
                self.upgrade_required = false;
                self.deployed = None;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Byte comparison of the normalized desired identity against the
    /// deployed release. Maps serialize with sorted keys, so key order on
    /// the way in does not matter.
    fn differs(&self, deployed: &Release) -> Result<bool> {
        if deployed.name != self.name || deployed.namespace != self.namespace {
            return Ok(true);
        }
        let desired = serde_json::to_vec(&(&self.chart, &self.values))?;
        let current = serde_json::to_vec(&(&deployed.chart, &deployed.values))?;
        Ok(desired != current)
    }

    pub async fn install(&self) -> Result<Release> {
        match self
            .actions
            .install(&self.name, &self.namespace, &self.chart, &self.values)
            .await
        {
            Ok(rel) => {
                info!("installed release {} v{}", rel.name, rel.version);
                Ok(rel)
            }
            Err(e) => {
                if e.partial.is_some() {
                    if let Err(re) = self.actions.uninstall(&self.name).await {
                        if !re.is_not_found() {
                            return Err(Error::FailedRollback {
                                operation: "install",
                                original: e.message,
                                rollback: re.message,
                            });
                        }
                    }
                }
                Err(Error::InstallFailed(e.message))
            }
        }
    }

    /// Returns the superseded release alongside the new one. A failure that
    /// left a partial new version behind triggers a forced rollback to the
    /// previous one.
    pub async fn upgrade(&self, force: bool) -> Result<(Release, Release)> {
        let previous = self.deployed.clone().ok_or(Error::NotSynced)?;
        match self
            .actions
            .upgrade(&self.name, &self.namespace, &self.chart, &self.values, force)
            .await
        {
            Ok(rel) => {
                info!("upgraded release {} to v{}", rel.name, rel.version);
                Ok((previous, rel))
            }
            Err(e) => {
                if e.partial.is_some() {
                    if let Err(re) = self.actions.rollback(&self.name).await {
                        return Err(Error::FailedRollback {
                            operation: "upgrade",
                            original: e.message,
                            rollback: re.message,
                        });
                    }
                }
                Err(Error::UpgradeFailed(e.message))
            }
        }
    }

    /// Repair drift: replay the deployed manifest against the cluster in
    /// document order, recreating absent resources and patching divergent
    /// ones.
    pub async fn reconcile(&self) -> Result<Release> {
        let deployed = self.deployed.clone().ok_or(Error::NotSynced)?;
        for doc in parse_manifest(&deployed.manifest)? {
            match self.resources.get(&doc).await? {
                None => {
                    info!("recreating missing {}", doc.display_name());
                    self.resources.create(&doc).await?;
                }
                Some(existing) => {
                    if let Some(patch) = compute_patch(&existing, &doc.object, &doc.gvk) {
                        info!("repairing drift on {}", doc.display_name());
                        self.resources.apply(&doc, &patch).await?;
                    }
                }
            }
        }
        Ok(deployed)
    }

    /// A release the engine no longer knows about maps to
    /// [`Error::ReleaseNotFound`] so deletion paths can treat it as benign.
    pub async fn uninstall(&self) -> Result<Release> {
        match self.actions.uninstall(&self.name).await {
            Ok(rel) => {
                info!("uninstalled release {}", rel.name);
                Ok(rel)
            }
            Err(e) if e.is_not_found() => Err(Error::ReleaseNotFound),
            Err(e) => Err(Error::UninstallFailed(e.message)),
        }
    }

    /// Post-uninstall sweep over the last deployed manifest. Reports `true`
    /// once every non-kept resource is gone; otherwise issues deletes for
    /// all of them and reports `false` so the caller polls again.
    pub async fn cleanup(&self, manifest: &str) -> Result<bool> {
        let mut docs = parse_manifest(manifest)?;
        sort_for_uninstall(&mut docs);
        docs.retain(|d| !d.is_kept());
        if docs.is_empty() {
            return Ok(true);
        }
        let mut remaining = false;
        for doc in &docs {
            if self.resources.get(doc).await?.is_some() {
                remaining = true;
            }
        }
        if !remaining {
            return Ok(true);
        }
        for doc in &docs {
            self.resources.delete(doc).await?;
        }
        Ok(false)
    }
}

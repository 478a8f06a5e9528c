use crate::bundle::{Bundle, BundleStatus};
use async_trait::async_trait;
use common::{
    retry::{retry_on_conflict, Backoff},
    Error, Result,
};
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client,
};
use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

pub type StatusMutation<'a> = &'a (dyn Fn(&mut BundleStatus) + Send + Sync);
pub type MetaMutation<'a> = &'a (dyn Fn(&mut ObjectMeta) + Send + Sync);

/// Persistence boundary for `Bundle` instances. Mutations are expressed as
/// closures over the latest object and re-applied under conflict retry, so
/// callers never hand-roll read-modify-write loops.
#[async_trait]
pub trait BundleInstances: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Bundle>>;
    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        mutate: StatusMutation<'_>,
    ) -> Result<()>;
    async fn update_meta(
        &self,
        namespace: &str,
        name: &str,
        mutate: MetaMutation<'_>,
    ) -> Result<()>;
    /// Poll until the instance is gone from the api-server.
    async fn wait_deleted(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()>;
}

pub struct KubeInstances {
    client: Client,
    backoff: Backoff,
}

impl KubeInstances {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            backoff: Backoff::default(),
        }
    }

    fn api(&self, namespace: &str) -> Api<Bundle> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl BundleInstances for KubeInstances {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Bundle>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        mutate: StatusMutation<'_>,
    ) -> Result<()> {
        let api = self.api(namespace);
        retry_on_conflict(&self.backoff, || async {
            let mut latest = api.get(name).await?;
            let mut status = latest.status.clone().unwrap_or_default();
            mutate(&mut status);
            latest.status = Some(status);
            latest.metadata.managed_fields = None;
            api.replace_status(name, &PostParams::default(), serde_json::to_vec(&latest)?)
                .await?;
            Ok(())
        })
        .await
    }

    async fn update_meta(
        &self,
        namespace: &str,
        name: &str,
        mutate: MetaMutation<'_>,
    ) -> Result<()> {
        let api = self.api(namespace);
        retry_on_conflict(&self.backoff, || async {
            let mut latest = api.get(name).await?;
            mutate(&mut latest.metadata);
            latest.metadata.managed_fields = None;
            api.replace(name, &PostParams::default(), &latest).await?;
            Ok(())
        })
        .await
    }

    async fn wait_deleted(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
        let api = self.api(namespace);
        let poll = async {
            loop {
                if api.get_opt(name).await?.is_none() {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(res) => res,
            Err(_) => Err(Error::DeletionTimeout),
        }
    }
}

/// In-memory boundary mimicking api-server deletion semantics: an instance
/// with a deletion timestamp disappears once its finalizers empty out.
#[derive(Default)]
pub struct MemoryInstances {
    objects: Mutex<HashMap<String, Bundle>>,
}

impl MemoryInstances {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    pub fn put(&self, namespace: &str, bundle: Bundle) {
        self.objects
            .lock()
            .unwrap()
            .insert(Self::key(namespace, &bundle.metadata.name.clone().unwrap_or_default()), bundle);
    }

    /// Stamp a deletion timestamp, as the api-server does on delete.
    pub fn mark_deleted(&self, namespace: &str, name: &str) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(bundle) = objects.get_mut(&Self::key(namespace, name)) {
            bundle.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
            );
        }
    }

    fn drop_if_released(bundle: &Bundle) -> bool {
        bundle.metadata.deletion_timestamp.is_some()
            && bundle
                .metadata
                .finalizers
                .as_ref()
                .map(Vec::is_empty)
                .unwrap_or(true)
    }
}

#[async_trait]
impl BundleInstances for MemoryInstances {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Bundle>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned())
    }

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        mutate: StatusMutation<'_>,
    ) -> Result<()> {
        let mut objects = self.objects.lock().unwrap();
        let bundle = objects
            .get_mut(&Self::key(namespace, name))
            .ok_or_else(|| Error::Other(format!("instance {namespace}/{name} not found")))?;
        let mut status = bundle.status.clone().unwrap_or_default();
        mutate(&mut status);
        bundle.status = Some(status);
        Ok(())
    }

    async fn update_meta(
        &self,
        namespace: &str,
        name: &str,
        mutate: MetaMutation<'_>,
    ) -> Result<()> {
        let key = Self::key(namespace, name);
        let mut objects = self.objects.lock().unwrap();
        let bundle = objects
            .get_mut(&key)
            .ok_or_else(|| Error::Other(format!("instance {namespace}/{name} not found")))?;
        mutate(&mut bundle.metadata);
        if Self::drop_if_released(bundle) {
            objects.remove(&key);
        }
        Ok(())
    }

    async fn wait_deleted(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
        let key = Self::key(namespace, name);
        let poll = async {
            loop {
                if !self.objects.lock().unwrap().contains_key(&key) {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(res) => res,
            Err(_) => Err(Error::DeletionTimeout),
        }
    }
}

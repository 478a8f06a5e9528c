use crate::{manifest::ResourceDoc, patch::ComputedPatch, Error, Result};
use async_trait::async_trait;
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{self, ApiCapabilities, Scope},
    Api, Client,
};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Dynamic, discovery-driven access to arbitrary cluster resources.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Fetch the live object for a manifest document, `None` when absent.
    async fn get(&self, doc: &ResourceDoc) -> Result<Option<Value>>;
    async fn create(&self, doc: &ResourceDoc) -> Result<()>;
    async fn apply(&self, doc: &ResourceDoc, patch: &ComputedPatch) -> Result<()>;
    /// Delete the live object; an already-absent object is not an error.
    async fn delete(&self, doc: &ResourceDoc) -> Result<()>;
}

/// Api-server backed implementation with a per-GVK discovery cache.
pub struct KubeResourceApi {
    client: Client,
    default_namespace: String,
    cache: RwLock<HashMap<String, (ApiResource, ApiCapabilities)>>,
}

impl KubeResourceApi {
    pub fn new(client: Client) -> Self {
        let default_namespace = client.default_namespace().to_string();
        Self {
            client,
            default_namespace,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn api_for(&self, doc: &ResourceDoc) -> Result<Api<DynamicObject>> {
        let key = format!("{}/{}/{}", doc.gvk.group, doc.gvk.version, doc.gvk.kind);
        let cached = self.cache.read().await.get(&key).cloned();
        let (ar, caps) = match cached {
            Some(found) => found,
            None => {
                let found = discovery::pinned_kind(&self.client, &doc.gvk).await?;
                self.cache.write().await.insert(key, found.clone());
                found
            }
        };
        Ok(if caps.scope == Scope::Namespaced {
            let ns = doc.namespace.as_deref().unwrap_or(&self.default_namespace);
            Api::namespaced_with(self.client.clone(), ns, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

#[async_trait]
impl ResourceApi for KubeResourceApi {
    async fn get(&self, doc: &ResourceDoc) -> Result<Option<Value>> {
        let api = self.api_for(doc).await?;
        match api.get_opt(&doc.name).await? {
            Some(obj) => Ok(Some(serde_json::to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, doc: &ResourceDoc) -> Result<()> {
        let api = self.api_for(doc).await?;
        let obj: DynamicObject = serde_json::from_value(doc.object.clone())?;
        api.create(&PostParams::default(), &obj).await?;
        debug!("created {}", doc.display_name());
        Ok(())
    }

    async fn apply(&self, doc: &ResourceDoc, patch: &ComputedPatch) -> Result<()> {
        let api = self.api_for(doc).await?;
        let params = PatchParams::default();
        match patch {
            ComputedPatch::Json(ops) => {
                let patch: Patch<Value> = Patch::Json(ops.clone());
                api.patch(&doc.name, &params, &patch).await?;
            }
            ComputedPatch::Strategic(delta) => {
                api.patch(&doc.name, &params, &Patch::Strategic(delta)).await?;
            }
        }
        debug!("patched {}", doc.display_name());
        Ok(())
    }

    async fn delete(&self, doc: &ResourceDoc) -> Result<()> {
        let api = self.api_for(doc).await?;
        match api.delete(&doc.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

/// In-memory implementation tracking every call, for lifecycle and
/// reconciler tests.
#[derive(Default)]
pub struct MemoryResourceApi {
    objects: std::sync::Mutex<HashMap<String, Value>>,
    pub created: std::sync::Mutex<Vec<String>>,
    pub patched: std::sync::Mutex<Vec<String>>,
    pub deleted: std::sync::Mutex<Vec<String>>,
}

impl MemoryResourceApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(doc: &ResourceDoc) -> String {
        format!(
            "{}:{}/{}",
            doc.gvk.kind,
            doc.namespace.as_deref().unwrap_or(""),
            doc.name
        )
    }

    /// Seed a live object, as if it had been created earlier.
    pub fn seed(&self, doc: &ResourceDoc, live: Value) {
        self.objects.lock().unwrap().insert(Self::key(doc), live);
    }

    pub fn contains(&self, doc: &ResourceDoc) -> bool {
        self.objects.lock().unwrap().contains_key(&Self::key(doc))
    }
}

#[async_trait]
impl ResourceApi for MemoryResourceApi {
    async fn get(&self, doc: &ResourceDoc) -> Result<Option<Value>> {
        Ok(self.objects.lock().unwrap().get(&Self::key(doc)).cloned())
    }

    async fn create(&self, doc: &ResourceDoc) -> Result<()> {
        let key = Self::key(doc);
        self.objects
            .lock()
            .unwrap()
            .insert(key.clone(), doc.object.clone());
        self.created.lock().unwrap().push(key);
        Ok(())
    }

    async fn apply(&self, doc: &ResourceDoc, _patch: &ComputedPatch) -> Result<()> {
        let key = Self::key(doc);
        self.objects
            .lock()
            .unwrap()
            .insert(key.clone(), doc.object.clone());
        self.patched.lock().unwrap().push(key);
        Ok(())
    }

    async fn delete(&self, doc: &ResourceDoc) -> Result<()> {
        let key = Self::key(doc);
        self.objects.lock().unwrap().remove(&key);
        self.deleted.lock().unwrap().push(key);
        Ok(())
    }
}

use crate::release::Release;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::{
    api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    Api, Client,
};
use std::{
    collections::{BTreeMap, HashMap},
    io::{Read, Write},
    sync::RwLock,
};
use thiserror::Error;

/// Secret type marking release payloads.
pub const SECRET_TYPE: &str = "caravel.io/release.v1";
const OWNER_LABEL: &str = "caravel";
const DATA_KEY: &str = "release";

#[derive(Error, Debug)]
pub enum StoreError {
    /// No stored history for the release at all
    #[error("release: not found")]
    NotFound,
    /// History exists but no version is in the deployed state
    #[error("release: has no deployed releases")]
    NoDeployed,
    /// The backing driver failed
    #[error("storage driver failed: {0}")]
    Driver(String),
}

/// Versioned release persistence.
///
/// `history` returns every stored version in ascending version order and
/// fails with [`StoreError::NotFound`] when nothing is stored under the
/// name. `deployed` resolves the single deployed version or fails with
/// [`StoreError::NoDeployed`].
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn history(&self, name: &str) -> Result<Vec<Release>, StoreError>;
    async fn deployed(&self, name: &str) -> Result<Release, StoreError>;
    async fn create(&self, release: &Release) -> Result<(), StoreError>;
    async fn update(&self, release: &Release) -> Result<(), StoreError>;
    async fn delete(&self, name: &str, version: u32) -> Result<Release, StoreError>;
}

/// Secret-backed driver: one Secret per release version, payload gzip'd
/// JSON wrapped in base64 under the `release` data key.
pub struct SecretStore {
    api: Api<Secret>,
}

impl SecretStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn key(name: &str, version: u32) -> String {
        format!("caravel.release.v1.{name}.v{version}")
    }

    fn labels(release: &Release) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("owner".to_string(), OWNER_LABEL.to_string()),
            ("name".to_string(), release.name.clone()),
            ("version".to_string(), release.version.to_string()),
            ("status".to_string(), release.status.to_string()),
        ])
    }

    fn encode(release: &Release) -> Result<ByteString, StoreError> {
        let raw = serde_json::to_vec(release).map_err(|e| StoreError::Driver(e.to_string()))?;
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&raw)
            .and_then(|()| gz.finish())
            .map(|compressed| ByteString(STANDARD.encode(compressed).into_bytes()))
            .map_err(|e| StoreError::Driver(e.to_string()))
    }

    fn decode(secret: &Secret) -> Result<Release, StoreError> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DATA_KEY))
            .ok_or_else(|| StoreError::Driver("secret has no release payload".to_string()))?;
        let compressed = STANDARD
            .decode(&data.0)
            .map_err(|e| StoreError::Driver(e.to_string()))?;
        let mut raw = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut raw)
            .map_err(|e| StoreError::Driver(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::Driver(e.to_string()))
    }

    fn secret_for(release: &Release) -> Result<Secret, StoreError> {
        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(Self::key(&release.name, release.version)),
                labels: Some(Self::labels(release)),
                ..ObjectMeta::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                DATA_KEY.to_string(),
                Self::encode(release)?,
            )])),
            ..Secret::default()
        })
    }

    async fn list(&self, selector: &str) -> Result<Vec<Release>, StoreError> {
        let secrets = self
            .api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| StoreError::Driver(e.to_string()))?;
        let mut releases = secrets
            .items
            .iter()
            .map(Self::decode)
            .collect::<Result<Vec<_>, _>>()?;
        releases.sort_by_key(|r| r.version);
        Ok(releases)
    }
}

#[async_trait]
impl ReleaseStore for SecretStore {
    async fn history(&self, name: &str) -> Result<Vec<Release>, StoreError> {
        let releases = self.list(&format!("owner={OWNER_LABEL},name={name}")).await?;
        if releases.is_empty() {
            return Err(StoreError::NotFound);
        }
        Ok(releases)
    }

    async fn deployed(&self, name: &str) -> Result<Release, StoreError> {
        self.list(&format!("owner={OWNER_LABEL},name={name},status=deployed"))
            .await?
            .pop()
            .ok_or(StoreError::NoDeployed)
    }

    async fn create(&self, release: &Release) -> Result<(), StoreError> {
        let secret = Self::secret_for(release)?;
        self.api
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| StoreError::Driver(e.to_string()))?;
        Ok(())
    }

    async fn update(&self, release: &Release) -> Result<(), StoreError> {
        let patch = serde_json::json!({
            "metadata": {"labels": Self::labels(release)},
            "data": {DATA_KEY: Self::encode(release)?},
        });
        self.api
            .patch(
                &Self::key(&release.name, release.version),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| StoreError::Driver(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, name: &str, version: u32) -> Result<Release, StoreError> {
        let key = Self::key(name, version);
        let secret = self
            .api
            .get_opt(&key)
            .await
            .map_err(|e| StoreError::Driver(e.to_string()))?
            .ok_or(StoreError::NotFound)?;
        let release = Self::decode(&secret)?;
        self.api
            .delete(&key, &DeleteParams::default())
            .await
            .map_err(|e| StoreError::Driver(e.to_string()))?;
        Ok(release)
    }
}

/// In-memory driver with the same semantics, for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    releases: RwLock<HashMap<String, Vec<Release>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a release, replacing any stored version with the same number.
    pub fn seed(&self, release: Release) {
        let mut map = self.releases.write().unwrap();
        let history = map.entry(release.name.clone()).or_default();
        history.retain(|r| r.version != release.version);
        history.push(release);
        history.sort_by_key(|r| r.version);
    }
}

#[async_trait]
impl ReleaseStore for MemoryStore {
    async fn history(&self, name: &str) -> Result<Vec<Release>, StoreError> {
        let map = self.releases.read().unwrap();
        match map.get(name) {
            Some(history) if !history.is_empty() => Ok(history.clone()),
            _ => Err(StoreError::NotFound),
        }
    }

    async fn deployed(&self, name: &str) -> Result<Release, StoreError> {
        let map = self.releases.read().unwrap();
        map.get(name)
            .and_then(|h| h.iter().filter(|r| r.is_deployed()).last().cloned())
            .ok_or(StoreError::NoDeployed)
    }

    async fn create(&self, release: &Release) -> Result<(), StoreError> {
        let mut map = self.releases.write().unwrap();
        let history = map.entry(release.name.clone()).or_default();
        if history.iter().any(|r| r.version == release.version) {
            return Err(StoreError::Driver(format!(
                "release {} version {} already exists",
                release.name, release.version
            )));
        }
        history.push(release.clone());
        history.sort_by_key(|r| r.version);
        Ok(())
    }

    async fn update(&self, release: &Release) -> Result<(), StoreError> {
        let mut map = self.releases.write().unwrap();
        let stored = map
            .get_mut(&release.name)
            .and_then(|h| h.iter_mut().find(|r| r.version == release.version))
            .ok_or(StoreError::NotFound)?;
        *stored = release.clone();
        Ok(())
    }

    async fn delete(&self, name: &str, version: u32) -> Result<Release, StoreError> {
        let mut map = self.releases.write().unwrap();
        let history = map.get_mut(name).ok_or(StoreError::NotFound)?;
        let pos = history
            .iter()
            .position(|r| r.version == version)
            .ok_or(StoreError::NotFound)?;
        Ok(history.remove(pos))
    }
}

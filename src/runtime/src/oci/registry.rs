//! Registry pull source.
//!
//! Pulls a base image's layer blobs with `oci-distribution` and registers
//! them in the layer store as a parent chain. Nothing is left behind when a
//! pull fails halfway.

use std::sync::Arc;

use async_trait::async_trait;
use distbuild_core::error::{BuildError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::ImageIndexEntry;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use super::reference::ImageReference;
use crate::layer::sha256_bytes;
use crate::pull::PullSource;
use crate::store::LayerStore;

/// Layer media types the store can hold as-is.
const GZIP_LAYER_MEDIA_TYPES: [&str; 2] = [
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
];

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, falling back to
    /// anonymous unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(u), Some(p)) => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// One fetched layer blob.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    pub digest: String,
    pub data: Vec<u8>,
}

/// Pulls base images from container registries into a layer store.
pub struct RegistryPullSource {
    client: Client,
    auth: RegistryAuth,
    store: Arc<dyn LayerStore>,
}

impl RegistryPullSource {
    pub fn new(store: Arc<dyn LayerStore>, auth: RegistryAuth) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth,
            store,
        }
    }

    /// Fetch the manifest and every layer blob, bottom layer first.
    async fn fetch_layers(&self, reference: &ImageReference) -> Result<Vec<LayerBlob>> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        let registry_error = |message: String| BuildError::Registry {
            registry: reference.registry.clone(),
            message,
        };

        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| registry_error(format!("Failed to pull manifest: {}", e)))?;

        tracing::debug!(
            reference = %reference,
            digest = %manifest_digest,
            layers = manifest.layers.len(),
            "Pulled manifest"
        );

        let mut blobs = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            if !GZIP_LAYER_MEDIA_TYPES.contains(&layer.media_type.as_str()) {
                return Err(registry_error(format!(
                    "Unsupported layer media type {} for {}",
                    layer.media_type, layer.digest
                )));
            }

            let mut data: Vec<u8> = Vec::new();
            self.client
                .pull_blob(&oci_ref, layer, &mut data)
                .await
                .map_err(|e| registry_error(format!("Failed to pull layer {}: {}", layer.digest, e)))?;

            let expected = layer.digest.strip_prefix("sha256:").unwrap_or(&layer.digest);
            let actual = sha256_bytes(&data);
            if expected != actual {
                return Err(registry_error(format!(
                    "Digest mismatch for layer {}: got sha256:{}",
                    layer.digest, actual
                )));
            }

            tracing::debug!(digest = %layer.digest, size = data.len(), "Pulled layer");
            blobs.push(LayerBlob {
                digest: layer.digest.clone(),
                data,
            });
        }

        Ok(blobs)
    }
}

#[async_trait]
impl PullSource for RegistryPullSource {
    async fn pull(&self, reference: &str) -> Result<String> {
        let parsed = ImageReference::parse(reference)?;
        let full_ref = parsed.full_reference();

        tracing::info!(
            reference = %full_ref,
            authenticated = !self.auth.is_anonymous(),
            "Pulling image from registry"
        );

        let blobs = self.fetch_layers(&parsed).await?;
        let image = register_chain(&self.store, &full_ref, &blobs).await?;

        tracing::info!(reference = %full_ref, image = %image, "Image pulled successfully");
        Ok(full_ref)
    }
}

/// Store `blobs` as a layer chain and register an image named `name` on
/// top. On failure every layer this call created is deleted again, also
/// when the returned future is dropped before it completes.
pub async fn register_chain(
    store: &Arc<dyn LayerStore>,
    name: &str,
    blobs: &[LayerBlob],
) -> Result<String> {
    let mut rollback = ChainRollback::new(store.clone());

    let result = async {
        let mut parent: Option<String> = None;
        for blob in blobs {
            let put = store
                .put_layer(parent.as_deref(), &blob.data)
                .await
                .map_err(|e| BuildError::Store(format!("layer {}: {}", blob.digest, e)))?;
            if put.created {
                rollback.created.push(put.layer.id.clone());
            }
            parent = Some(put.layer.id);
        }

        let top = match parent {
            Some(top) => top,
            // An image with no layers still needs a root.
            None => {
                let put = store.put_layer(None, &[]).await?;
                if put.created {
                    rollback.created.push(put.layer.id.clone());
                }
                put.layer.id
            }
        };
        let image = store.create_image(&[name.to_string()], &top).await?;
        Ok::<_, BuildError>(image.id)
    }
    .await;

    match result {
        Ok(id) => {
            rollback.disarm();
            Ok(id)
        }
        Err(e) => {
            rollback.run().await;
            Err(e)
        }
    }
}

/// Layers created by an unfinished chain registration.
///
/// Dropped while still armed, it deletes them on the current tokio runtime.
struct ChainRollback {
    store: Arc<dyn LayerStore>,
    created: Vec<String>,
}

impl ChainRollback {
    fn new(store: Arc<dyn LayerStore>) -> Self {
        Self {
            store,
            created: Vec::new(),
        }
    }

    fn disarm(&mut self) {
        self.created.clear();
    }

    async fn run(&mut self) {
        let created = std::mem::take(&mut self.created);
        delete_layers(self.store.as_ref(), &created).await;
    }
}

impl Drop for ChainRollback {
    fn drop(&mut self) {
        if self.created.is_empty() {
            return;
        }
        let created = std::mem::take(&mut self.created);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = self.store.clone();
                runtime.spawn(async move {
                    delete_layers(store.as_ref(), &created).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    layers = created.len(),
                    "Pull abandoned outside a runtime; layers left in store"
                );
            }
        }
    }
}

/// Newest first, so children go before their parents.
async fn delete_layers(store: &dyn LayerStore, ids: &[String]) {
    for id in ids.iter().rev() {
        if let Err(e) = store.delete_layer(id).await {
            tracing::warn!(layer = %id, error = %e, "Failed to roll back pulled layer");
        }
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}/{}@{}", reference.registry, reference.repository, digest),
        (None, Some(tag)) => format!("{}/{}:{}", reference.registry, reference.repository, tag),
        (None, None) => format!("{}/{}:latest", reference.registry, reference.repository),
    };

    ref_str.parse::<Reference>().map_err(|e| {
        BuildError::InvalidReference(format!("'{}': {}", ref_str, e))
    })
}

/// Pick the linux manifest matching the host architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::diff_from_files;
    use crate::store::DiskLayerStore;
    use tempfile::TempDir;

    fn blob(files: &[(&str, &[u8])]) -> LayerBlob {
        let data = diff_from_files(files).unwrap();
        LayerBlob {
            digest: format!("sha256:{}", sha256_bytes(&data)),
            data,
        }
    }

    #[test]
    fn test_registry_auth_basic() {
        let auth = RegistryAuth::basic("user", "pass");
        assert!(!auth.is_anonymous());
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Basic(u, p) if u == "user" && p == "pass"));
    }

    #[test]
    fn test_registry_auth_anonymous() {
        let auth = RegistryAuth::anonymous();
        assert!(auth.is_anonymous());
        assert!(matches!(auth.to_oci_auth(), OciRegistryAuth::Anonymous));
    }

    #[test]
    fn test_to_oci_reference_prefers_digest() {
        let r = ImageReference::parse("ghcr.io/org/img:v1@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef")
            .unwrap();
        let oci = to_oci_reference(&r).unwrap();
        assert_eq!(oci.registry(), "ghcr.io");
        assert_eq!(oci.repository(), "org/img");
        assert!(oci.digest().is_some());
    }

    fn disk_store(tmp: &TempDir) -> (Arc<DiskLayerStore>, Arc<dyn LayerStore>) {
        let disk = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let store: Arc<dyn LayerStore> = disk.clone();
        (disk, store)
    }

    #[tokio::test]
    async fn test_register_chain() {
        let tmp = TempDir::new().unwrap();
        let (disk, store) = disk_store(&tmp);
        let blobs = vec![blob(&[("bin/sh", b"sh")]), blob(&[("etc/motd", b"hi")])];

        let image_id = register_chain(&store, "docker.io/library/alpine:latest", &blobs)
            .await
            .unwrap();

        let image = store.lookup("docker.io/library/alpine:latest").await.unwrap();
        assert_eq!(image.id, image_id);
        let top = store.layer(&image.top_layer).await.unwrap();
        assert!(top.parent.is_some());
        assert_eq!(disk.layer_count().await, 2);
    }

    #[tokio::test]
    async fn test_register_chain_rolls_back_on_corrupt_blob() {
        let tmp = TempDir::new().unwrap();
        let (disk, store) = disk_store(&tmp);
        let blobs = vec![
            blob(&[("bin/sh", b"sh")]),
            LayerBlob {
                digest: "sha256:bad".to_string(),
                data: b"not a layer".to_vec(),
            },
        ];

        let err = register_chain(&store, "alpine", &blobs).await.unwrap_err();
        assert!(err.to_string().contains("sha256:bad"));
        assert_eq!(disk.layer_count().await, 0);
        assert!(store.lookup("alpine").await.is_none());
    }

    #[tokio::test]
    async fn test_register_chain_keeps_preexisting_layers() {
        let tmp = TempDir::new().unwrap();
        let (disk, store) = disk_store(&tmp);
        let shared = blob(&[("bin/sh", b"sh")]);
        register_chain(&store, "base", &[shared.clone()]).await.unwrap();

        let blobs = vec![
            shared,
            LayerBlob {
                digest: "sha256:bad".to_string(),
                data: b"junk".to_vec(),
            },
        ];
        assert!(register_chain(&store, "derived", &blobs).await.is_err());
        assert_eq!(disk.layer_count().await, 1);
        assert!(store.lookup("base").await.is_some());
    }

    /// Stores the first layer, then never finishes the second.
    struct StallsOnSecondLayer {
        inner: Arc<DiskLayerStore>,
        puts: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LayerStore for StallsOnSecondLayer {
        async fn lookup(&self, reference: &str) -> Option<crate::store::StoredImage> {
            self.inner.lookup(reference).await
        }
        async fn layer(&self, id: &str) -> Option<crate::store::Layer> {
            self.inner.layer(id).await
        }
        async fn put_layer(&self, parent: Option<&str>, diff: &[u8]) -> Result<crate::store::PutLayer> {
            if self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 1 {
                std::future::pending::<()>().await;
            }
            self.inner.put_layer(parent, diff).await
        }
        async fn create_image(&self, names: &[String], layer_id: &str) -> Result<crate::store::StoredImage> {
            self.inner.create_image(names, layer_id).await
        }
        async fn read_diff(&self, layer_id: &str) -> Result<Vec<u8>> {
            self.inner.read_diff(layer_id).await
        }
        async fn delete_layer(&self, id: &str) -> Result<()> {
            self.inner.delete_layer(id).await
        }
        async fn materialize(&self, layer_id: &str, target_dir: &std::path::Path) -> Result<()> {
            self.inner.materialize(layer_id, target_dir).await
        }
    }

    #[tokio::test]
    async fn test_abandoned_register_chain_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let disk = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let store: Arc<dyn LayerStore> = Arc::new(StallsOnSecondLayer {
            inner: disk.clone(),
            puts: std::sync::atomic::AtomicUsize::new(0),
        });
        let blobs = vec![blob(&[("bin/sh", b"sh")]), blob(&[("etc/motd", b"hi")])];

        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            register_chain(&store, "alpine", &blobs),
        )
        .await;
        assert!(outcome.is_err());

        for _ in 0..50 {
            if disk.layer_count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(disk.layer_count().await, 0);
        assert!(disk.lookup("alpine").await.is_none());
    }

    struct ChainPuller {
        store: Arc<dyn LayerStore>,
        blobs: Vec<LayerBlob>,
    }

    #[async_trait]
    impl PullSource for ChainPuller {
        async fn pull(&self, reference: &str) -> Result<String> {
            register_chain(&self.store, reference, &self.blobs).await?;
            Ok(reference.to_string())
        }
    }

    #[tokio::test]
    async fn test_cancelled_resolve_leaves_no_layers() {
        use crate::resolve::ImageResolver;
        use distbuild_core::log::LogConfig;
        use tokio_util::sync::CancellationToken;

        let tmp = TempDir::new().unwrap();
        let disk = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let store: Arc<dyn LayerStore> = Arc::new(StallsOnSecondLayer {
            inner: disk.clone(),
            puts: std::sync::atomic::AtomicUsize::new(0),
        });
        let puller = Arc::new(ChainPuller {
            store: store.clone(),
            blobs: vec![blob(&[("bin/sh", b"sh")]), blob(&[("etc/motd", b"hi")])],
        });
        let resolver = ImageResolver::new(store, puller, LogConfig::default());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = resolver
            .resolve("docker.io/library/alpine:latest", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cancelled while resolving");

        for _ in 0..50 {
            if disk.layer_count().await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(disk.layer_count().await, 0);
    }

    #[tokio::test]
    #[ignore] // requires network access
    async fn test_pull_alpine_from_docker_hub() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn LayerStore> = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let source = RegistryPullSource::new(store.clone(), RegistryAuth::anonymous());

        let name = source.pull("alpine:3.19").await.unwrap();
        assert_eq!(name, "docker.io/library/alpine:3.19");
        assert!(store.lookup(&name).await.is_some());
    }
}

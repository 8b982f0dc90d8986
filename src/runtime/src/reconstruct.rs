//! Layer reconstruction.
//!
//! Re-creates on this worker the image state a previous worker left behind:
//! the transported diff becomes a new layer on top of the resolved base,
//! and a deterministically named image is registered for it.

use std::sync::Arc;

use distbuild_core::error::{BuildError, Result};
use distbuild_core::log::LogConfig;
use distbuild_core::unit::BuildUnit;

use crate::layer::sha256_bytes;
use crate::store::{LayerStore, StoredImage};

/// Applies transported diffs onto resolved images.
pub struct LayerReconstructor {
    store: Arc<dyn LayerStore>,
    log: LogConfig,
}

/// Name of the image produced by applying `diff` on `base_ref`:
/// `<sanitized base>-<diff length>-<first 12 hex of sha256(diff)>`.
pub fn reconstruction_name(base_ref: &str, diff: &[u8]) -> String {
    let sanitized: String = base_ref
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let digest = sha256_bytes(diff);
    format!("{}-{}-{}", sanitized, diff.len(), &digest[..12])
}

impl LayerReconstructor {
    pub fn new(store: Arc<dyn LayerStore>, log: LogConfig) -> Self {
        Self { store, log }
    }

    /// Put `diff` as a layer on `parent` and register an image for it.
    ///
    /// An empty diff reuses `parent` without touching the store.
    pub async fn apply_diff(
        &self,
        parent: &StoredImage,
        base_ref: &str,
        diff: &[u8],
    ) -> Result<StoredImage> {
        if diff.is_empty() {
            if self.log.verbose() {
                tracing::debug!(image = %parent.id, "Empty diff, reusing parent image");
            }
            return Ok(parent.clone());
        }

        let put = self
            .store
            .put_layer(Some(&parent.top_layer), diff)
            .await
            .map_err(|e| BuildError::Reconstruction(e.to_string()))?;

        let name = reconstruction_name(base_ref, diff);
        match self
            .store
            .create_image(std::slice::from_ref(&name), &put.layer.id)
            .await
        {
            Ok(image) => {
                if self.log.verbose() {
                    tracing::debug!(
                        name = %name,
                        image = %image.id,
                        layer = %put.layer.id,
                        reused = !put.created,
                        "Applied diff"
                    );
                }
                Ok(image)
            }
            Err(e) => {
                if put.created {
                    if let Err(cleanup) = self.store.delete_layer(&put.layer.id).await {
                        tracing::warn!(
                            layer = %put.layer.id,
                            error = %cleanup,
                            "Failed to remove layer after image registration failed"
                        );
                    }
                }
                Err(BuildError::Reconstruction(e.to_string()))
            }
        }
    }

    /// Apply the unit's accumulated diff and point the unit at the result.
    ///
    /// The diff is taken out of the unit in the same step that replaces
    /// `base_image_ref`. On failure the unit is left unchanged.
    pub async fn reconstruct(&self, unit: &mut BuildUnit, parent: &StoredImage) -> Result<StoredImage> {
        let image = self
            .apply_diff(parent, &unit.base_image_ref, &unit.accumulated_diff)
            .await?;
        unit.take_diff();
        unit.base_image_ref = image.id.clone();
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::diff_from_files;
    use crate::store::{DiskLayerStore, Layer, PutLayer};
    use async_trait::async_trait;
    use distbuild_core::instruction::Instruction;
    use std::path::Path;
    use tempfile::TempDir;

    async fn base_image(store: &dyn LayerStore) -> StoredImage {
        let put = store
            .put_layer(None, &diff_from_files(&[("etc/alpine-release", b"3.19")]).unwrap())
            .await
            .unwrap();
        store
            .create_image(&["docker.io/library/alpine:latest".to_string()], &put.layer.id)
            .await
            .unwrap()
    }

    #[test]
    fn test_reconstruction_name() {
        let diff = b"abc";
        let name = reconstruction_name("docker.io/library/alpine:latest", diff);
        assert_eq!(name, "docker.io-library-alpine-latest-3-ba7816bf8f01");
    }

    #[tokio::test]
    async fn test_apply_diff_creates_child_image() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn LayerStore> = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let parent = base_image(store.as_ref()).await;
        let reconstructor = LayerReconstructor::new(store.clone(), LogConfig::default());

        let diff = diff_from_files(&[("app/main.py", b"print(1)")]).unwrap();
        let image = reconstructor.apply_diff(&parent, "alpine", &diff).await.unwrap();

        assert_ne!(image.id, parent.id);
        let layer = store.layer(&image.top_layer).await.unwrap();
        assert_eq!(layer.parent.as_deref(), Some(parent.top_layer.as_str()));
        assert_eq!(image.names, vec![reconstruction_name("alpine", &diff)]);
    }

    #[tokio::test]
    async fn test_apply_diff_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn LayerStore> = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let parent = base_image(store.as_ref()).await;
        let reconstructor = LayerReconstructor::new(store.clone(), LogConfig::default());
        let diff = diff_from_files(&[("x", b"x")]).unwrap();

        let a = reconstructor.apply_diff(&parent, "alpine", &diff).await.unwrap();
        let b = reconstructor.apply_diff(&parent, "alpine", &diff).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.top_layer, b.top_layer);

        let out_a = tmp.path().join("a");
        let out_b = tmp.path().join("b");
        store.materialize(&a.top_layer, &out_a).await.unwrap();
        store.materialize(&b.top_layer, &out_b).await.unwrap();
        assert_eq!(
            std::fs::read(out_a.join("x")).unwrap(),
            std::fs::read(out_b.join("x")).unwrap()
        );
    }

    #[tokio::test]
    async fn test_empty_diff_reuses_parent() {
        let tmp = TempDir::new().unwrap();
        let disk = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let store: Arc<dyn LayerStore> = disk.clone();
        let parent = base_image(store.as_ref()).await;
        let reconstructor = LayerReconstructor::new(store, LogConfig::default());

        let image = reconstructor.apply_diff(&parent, "alpine", &[]).await.unwrap();
        assert_eq!(image, parent);
        assert_eq!(disk.layer_count().await, 1);
        assert_eq!(disk.images().await.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_diff_fails() {
        let tmp = TempDir::new().unwrap();
        let disk = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let store: Arc<dyn LayerStore> = disk.clone();
        let parent = base_image(store.as_ref()).await;
        let reconstructor = LayerReconstructor::new(store, LogConfig::default());

        let err = reconstructor
            .apply_diff(&parent, "alpine", b"\x1f\x8bgarbage")
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Reconstruction(_)));
        assert!(err.to_string().starts_with("could not apply diff"));
        assert_eq!(disk.layer_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_parent_fails() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn LayerStore> = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let reconstructor = LayerReconstructor::new(store, LogConfig::default());
        let ghost = StoredImage {
            id: "ghost".to_string(),
            top_layer: "no-such-layer".to_string(),
            names: vec![],
            created: chrono::Utc::now(),
        };

        let err = reconstructor
            .apply_diff(&ghost, "ghost", &diff_from_files(&[("a", b"a")]).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Reconstruction(_)));
    }

    /// Delegates to a disk store but refuses to register images.
    struct RejectImages(DiskLayerStore);

    #[async_trait]
    impl LayerStore for RejectImages {
        async fn lookup(&self, reference: &str) -> Option<StoredImage> {
            self.0.lookup(reference).await
        }
        async fn layer(&self, id: &str) -> Option<Layer> {
            self.0.layer(id).await
        }
        async fn put_layer(&self, parent: Option<&str>, diff: &[u8]) -> Result<PutLayer> {
            self.0.put_layer(parent, diff).await
        }
        async fn create_image(&self, _names: &[String], _layer_id: &str) -> Result<StoredImage> {
            Err(BuildError::Store("index is read-only".to_string()))
        }
        async fn read_diff(&self, layer_id: &str) -> Result<Vec<u8>> {
            self.0.read_diff(layer_id).await
        }
        async fn delete_layer(&self, id: &str) -> Result<()> {
            self.0.delete_layer(id).await
        }
        async fn materialize(&self, layer_id: &str, target_dir: &Path) -> Result<()> {
            self.0.materialize(layer_id, target_dir).await
        }
    }

    #[tokio::test]
    async fn test_failed_registration_removes_new_layer() {
        let tmp = TempDir::new().unwrap();
        let disk = DiskLayerStore::new(tmp.path()).unwrap();
        let parent = base_image(&disk).await;
        let store = Arc::new(RejectImages(disk));
        let reconstructor = LayerReconstructor::new(store.clone(), LogConfig::default());

        let diff = diff_from_files(&[("orphan", b"o")]).unwrap();
        let err = reconstructor.apply_diff(&parent, "alpine", &diff).await.unwrap_err();

        assert!(err.to_string().contains("index is read-only"));
        assert_eq!(store.0.layer_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_index_write_removes_new_layer() {
        let tmp = TempDir::new().unwrap();
        let disk = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let store: Arc<dyn LayerStore> = disk.clone();
        let parent = base_image(store.as_ref()).await;
        let reconstructor = LayerReconstructor::new(store.clone(), LogConfig::default());

        let index = tmp.path().join("images.json");
        std::fs::remove_file(&index).unwrap();
        std::fs::create_dir_all(index.join("blocker")).unwrap();

        let diff = diff_from_files(&[("orphan", b"o")]).unwrap();
        let err = reconstructor.apply_diff(&parent, "alpine", &diff).await.unwrap_err();

        assert!(matches!(err, BuildError::Reconstruction(_)));
        assert!(store
            .lookup(&reconstruction_name("alpine", &diff))
            .await
            .is_none());
        assert_eq!(disk.layer_count().await, 1);
    }

    #[tokio::test]
    async fn test_reconstruct_updates_unit() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn LayerStore> = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let parent = base_image(store.as_ref()).await;
        let reconstructor = LayerReconstructor::new(store, LogConfig::default());

        let diff = diff_from_files(&[("step1", b"1")]).unwrap();
        let mut unit = BuildUnit::new(
            "alpine",
            Instruction::Run {
                command: "true".to_string(),
            },
        )
        .with_diff(diff);

        let image = reconstructor.reconstruct(&mut unit, &parent).await.unwrap();
        assert!(unit.accumulated_diff.is_empty());
        assert_eq!(unit.base_image_ref, image.id);
    }

    #[tokio::test]
    async fn test_reconstruct_failure_leaves_unit() {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn LayerStore> = Arc::new(DiskLayerStore::new(tmp.path()).unwrap());
        let parent = base_image(store.as_ref()).await;
        let reconstructor = LayerReconstructor::new(store, LogConfig::default());

        let mut unit = BuildUnit::new(
            "alpine",
            Instruction::Run {
                command: "true".to_string(),
            },
        )
        .with_diff(b"corrupt".to_vec());

        assert!(reconstructor.reconstruct(&mut unit, &parent).await.is_err());
        assert_eq!(unit.base_image_ref, "alpine");
        assert_eq!(unit.accumulated_diff, b"corrupt".to_vec());
    }
}

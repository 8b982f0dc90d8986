//! Disk-backed layer store.
//!
//! Layout under the store root:
//!
//! ```text
//! layers/<id>/diff.tar.gz   diff against the parent layer
//! layers/<id>/layer.json    layer metadata
//! images.json               image index
//! ```
//!
//! A layer directory is written under a temporary name and renamed into
//! place, so a half-written layer is never visible.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use distbuild_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{image_id, layer_id, Layer, LayerStore, PutLayer, StoredImage};
use crate::layer::{apply_diff, sha256_bytes, validate_diff};

const DIFF_FILE: &str = "diff.tar.gz";
const LAYER_META_FILE: &str = "layer.json";
const IMAGE_INDEX_FILE: &str = "images.json";

/// Persistent image index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ImageIndex {
    images: Vec<StoredImage>,
}

/// Layer store on the local filesystem.
pub struct DiskLayerStore {
    root: PathBuf,
    /// layer id → layer
    layers: Arc<RwLock<HashMap<String, Layer>>>,
    /// image id → image
    images: Arc<RwLock<HashMap<String, StoredImage>>>,
}

impl DiskLayerStore {
    /// Open (or create) a store rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        let layers_dir = root.join("layers");
        std::fs::create_dir_all(&layers_dir).map_err(|e| {
            BuildError::Store(format!(
                "Failed to create layer store directory {}: {}",
                layers_dir.display(),
                e
            ))
        })?;

        let mut store = Self {
            root: root.to_path_buf(),
            layers: Arc::new(RwLock::new(HashMap::new())),
            images: Arc::new(RwLock::new(HashMap::new())),
        };
        store.load()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All registered images.
    pub async fn images(&self) -> Vec<StoredImage> {
        self.images.read().await.values().cloned().collect()
    }

    /// Number of stored layers.
    pub async fn layer_count(&self) -> usize {
        self.layers.read().await.len()
    }

    fn layer_dir(&self, id: &str) -> PathBuf {
        self.root.join("layers").join(id)
    }

    /// Load layers and the image index from disk.
    fn load(&mut self) -> Result<()> {
        let layers_dir = self.root.join("layers");
        let mut layers = HashMap::new();

        let read_dir = std::fs::read_dir(&layers_dir).map_err(|e| {
            BuildError::Store(format!(
                "Failed to read layer directory {}: {}",
                layers_dir.display(),
                e
            ))
        })?;
        for entry in read_dir.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                // Leftover from an interrupted write
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove leftover layer directory");
                }
                continue;
            }
            let meta_path = entry.path().join(LAYER_META_FILE);
            let layer: Layer = match std::fs::read_to_string(&meta_path)
                .ok()
                .and_then(|data| serde_json::from_str(&data).ok())
            {
                Some(layer) => layer,
                None => {
                    tracing::warn!(path = %meta_path.display(), "Skipping unreadable layer");
                    continue;
                }
            };
            layers.insert(layer.id.clone(), layer);
        }

        let index_path = self.root.join(IMAGE_INDEX_FILE);
        let mut images = HashMap::new();
        if index_path.exists() {
            let data = std::fs::read_to_string(&index_path).map_err(|e| {
                BuildError::Store(format!(
                    "Failed to read image index {}: {}",
                    index_path.display(),
                    e
                ))
            })?;
            let index: ImageIndex = serde_json::from_str(&data).map_err(|e| {
                BuildError::Store(format!("Failed to parse image index: {}", e))
            })?;
            for image in index.images {
                // Only keep images whose top layer survived
                if layers.contains_key(&image.top_layer) {
                    images.insert(image.id.clone(), image);
                }
            }
        }

        tracing::debug!(
            root = %self.root.display(),
            layers = layers.len(),
            images = images.len(),
            "Opened layer store"
        );

        self.layers = Arc::new(RwLock::new(layers));
        self.images = Arc::new(RwLock::new(images));
        Ok(())
    }

    async fn discard_tmp(&self, tmp_dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(tmp_dir).await {
            tracing::warn!(path = %tmp_dir.display(), error = %e, "Failed to remove temporary layer directory");
        }
    }

    /// Write the image index to disk.
    async fn save_index(&self, images: &HashMap<String, StoredImage>) -> Result<()> {
        let mut list: Vec<StoredImage> = images.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        let data = serde_json::to_string_pretty(&ImageIndex { images: list })?;

        let index_path = self.root.join(IMAGE_INDEX_FILE);
        let tmp_path = self.root.join(format!(".{}.tmp", IMAGE_INDEX_FILE));
        tokio::fs::write(&tmp_path, data).await.map_err(|e| {
            BuildError::Store(format!(
                "Failed to write image index {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp_path, &index_path).await.map_err(|e| {
            BuildError::Store(format!(
                "Failed to replace image index {}: {}",
                index_path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

#[async_trait]
impl LayerStore for DiskLayerStore {
    async fn lookup(&self, reference: &str) -> Option<StoredImage> {
        let images = self.images.read().await;
        let id = reference.strip_prefix("sha256:").unwrap_or(reference);
        if let Some(image) = images.get(id) {
            return Some(image.clone());
        }
        images
            .values()
            .find(|img| img.names.iter().any(|n| n == reference))
            .cloned()
    }

    async fn layer(&self, id: &str) -> Option<Layer> {
        self.layers.read().await.get(id).cloned()
    }

    async fn put_layer(&self, parent: Option<&str>, diff: &[u8]) -> Result<PutLayer> {
        let diff_digest = sha256_bytes(diff);
        let id = layer_id(parent, &diff_digest);

        {
            let layers = self.layers.read().await;
            if let Some(existing) = layers.get(&id) {
                return Ok(PutLayer {
                    layer: existing.clone(),
                    created: false,
                });
            }
            if let Some(parent_id) = parent {
                if !layers.contains_key(parent_id) {
                    return Err(BuildError::Store(format!(
                        "Parent layer not found: {}",
                        parent_id
                    )));
                }
            }
        }

        let owned = diff.to_vec();
        let (stats, owned) = tokio::task::spawn_blocking(move || {
            validate_diff(&owned).map(|stats| (stats, owned))
        })
        .await
        .map_err(|e| BuildError::Store(format!("Diff validation task failed: {}", e)))??;

        let layer = Layer {
            id: id.clone(),
            parent: parent.map(str::to_string),
            diff_digest,
            diff_size: owned.len() as u64,
            created: Utc::now(),
        };

        let tmp_dir = self
            .root
            .join("layers")
            .join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let write = async {
            tokio::fs::create_dir_all(&tmp_dir).await?;
            tokio::fs::write(tmp_dir.join(DIFF_FILE), &owned).await?;
            let meta = serde_json::to_vec_pretty(&layer).map_err(std::io::Error::other)?;
            tokio::fs::write(tmp_dir.join(LAYER_META_FILE), meta).await
        };
        if let Err(e) = write.await {
            self.discard_tmp(&tmp_dir).await;
            return Err(BuildError::Store(format!(
                "Failed to write layer {}: {}",
                id, e
            )));
        }

        // Only the publish step runs under the lock.
        let mut layers = self.layers.write().await;
        if let Some(existing) = layers.get(&id) {
            let existing = existing.clone();
            drop(layers);
            self.discard_tmp(&tmp_dir).await;
            return Ok(PutLayer {
                layer: existing,
                created: false,
            });
        }
        if let Some(parent_id) = parent {
            if !layers.contains_key(parent_id) {
                drop(layers);
                self.discard_tmp(&tmp_dir).await;
                return Err(BuildError::Store(format!(
                    "Parent layer removed while storing: {}",
                    parent_id
                )));
            }
        }
        if let Err(e) = tokio::fs::rename(&tmp_dir, self.layer_dir(&id)).await {
            drop(layers);
            self.discard_tmp(&tmp_dir).await;
            return Err(BuildError::Store(format!(
                "Failed to publish layer {}: {}",
                id, e
            )));
        }
        layers.insert(id.clone(), layer.clone());
        drop(layers);

        tracing::debug!(
            layer = %id,
            parent = ?parent,
            size = layer.diff_size,
            entries = stats.entries,
            whiteouts = stats.whiteouts,
            "Stored layer"
        );

        Ok(PutLayer {
            layer,
            created: true,
        })
    }

    async fn create_image(&self, names: &[String], layer_id: &str) -> Result<StoredImage> {
        if !self.layers.read().await.contains_key(layer_id) {
            return Err(BuildError::Store(format!(
                "Cannot create image: layer not found: {}",
                layer_id
            )));
        }

        let id = image_id(layer_id);
        let mut images = self.images.write().await;

        // The index only changes once the new version is on disk.
        let mut next = images.clone();
        for other in next.values_mut() {
            if other.id != id {
                other.names.retain(|n| !names.contains(n));
            }
        }

        let image = next.entry(id.clone()).or_insert_with(|| StoredImage {
            id: id.clone(),
            top_layer: layer_id.to_string(),
            names: Vec::new(),
            created: Utc::now(),
        });
        for name in names {
            if !image.names.contains(name) {
                image.names.push(name.clone());
            }
        }
        let image = image.clone();

        self.save_index(&next).await?;
        *images = next;

        tracing::debug!(image = %id, names = ?image.names, "Registered image");
        Ok(image)
    }

    async fn read_diff(&self, layer_id: &str) -> Result<Vec<u8>> {
        if !self.layers.read().await.contains_key(layer_id) {
            return Err(BuildError::Store(format!("Layer not found: {}", layer_id)));
        }
        let path = self.layer_dir(layer_id).join(DIFF_FILE);
        tokio::fs::read(&path).await.map_err(|e| {
            BuildError::Store(format!("Failed to read diff {}: {}", path.display(), e))
        })
    }

    async fn delete_layer(&self, id: &str) -> Result<()> {
        let mut layers = self.layers.write().await;
        if !layers.contains_key(id) {
            return Err(BuildError::Store(format!("Layer not found: {}", id)));
        }
        if layers.values().any(|l| l.parent.as_deref() == Some(id)) {
            return Err(BuildError::Store(format!("Layer {} has child layers", id)));
        }
        if self
            .images
            .read()
            .await
            .values()
            .any(|img| img.top_layer == id)
        {
            return Err(BuildError::Store(format!("Layer {} is used by an image", id)));
        }

        let dir = self.layer_dir(id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
                BuildError::Store(format!(
                    "Failed to remove layer directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        layers.remove(id);

        tracing::debug!(layer = %id, "Deleted layer");
        Ok(())
    }

    async fn materialize(&self, layer_id: &str, target_dir: &Path) -> Result<()> {
        // Walk to the base, then apply bottom-up.
        let chain = {
            let layers = self.layers.read().await;
            let mut chain = Vec::new();
            let mut next = Some(layer_id.to_string());
            while let Some(id) = next {
                let layer = layers
                    .get(&id)
                    .ok_or_else(|| BuildError::Store(format!("Layer not found: {}", id)))?;
                next = layer.parent.clone();
                chain.push(layer.id.clone());
            }
            chain.reverse();
            chain
        };

        for id in &chain {
            let diff = self.read_diff(id).await?;
            let target = target_dir.to_path_buf();
            tokio::task::spawn_blocking(move || apply_diff(&diff, &target))
                .await
                .map_err(|e| BuildError::Store(format!("Layer extraction task failed: {}", e)))??;
        }

        tracing::debug!(
            layer = %layer_id,
            depth = chain.len(),
            target = %target_dir.display(),
            "Materialized layer chain"
        );
        Ok(())
    }
}

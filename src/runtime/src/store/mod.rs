//! Layer store abstraction.
//!
//! A store holds immutable, content-addressed layers and the images that
//! name a top layer. Every component of a worker shares one
//! `Arc<dyn LayerStore>`.

mod disk;

pub use disk::DiskLayerStore;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use distbuild_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::layer::sha256_bytes;

/// An image registered in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredImage {
    pub id: String,
    /// Topmost layer; the image content is this layer's chain
    pub top_layer: String,
    /// Tag names, unique across the store
    pub names: Vec<String>,
    pub created: DateTime<Utc>,
}

/// An immutable filesystem layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    pub parent: Option<String>,
    /// SHA256 of the diff payload (hex)
    pub diff_digest: String,
    pub diff_size: u64,
    pub created: DateTime<Utc>,
}

/// Outcome of [`LayerStore::put_layer`].
#[derive(Debug, Clone)]
pub struct PutLayer {
    pub layer: Layer,
    /// False when an identical layer already existed
    pub created: bool,
}

/// Content address of a layer: the same diff on the same parent always
/// yields the same id.
pub fn layer_id(parent: Option<&str>, diff_digest: &str) -> String {
    sha256_bytes(format!("{}\n{}", parent.unwrap_or(""), diff_digest).as_bytes())
}

/// Id of the image whose top layer is `layer_id`.
pub fn image_id(layer_id: &str) -> String {
    sha256_bytes(format!("image\n{}", layer_id).as_bytes())
}

/// Storage for layers and images.
#[async_trait]
pub trait LayerStore: Send + Sync {
    /// Find an image by id (with or without a `sha256:` prefix) or by name.
    async fn lookup(&self, reference: &str) -> Option<StoredImage>;

    async fn layer(&self, id: &str) -> Option<Layer>;

    /// Store `diff` as a new layer on top of `parent`.
    ///
    /// The payload is fully validated before anything becomes visible.
    async fn put_layer(&self, parent: Option<&str>, diff: &[u8]) -> Result<PutLayer>;

    /// Register an image whose top layer is `layer_id`, taking over `names`
    /// from any image that held them.
    async fn create_image(&self, names: &[String], layer_id: &str) -> Result<StoredImage>;

    /// The diff of `layer_id` against its immediate parent.
    async fn read_diff(&self, layer_id: &str) -> Result<Vec<u8>>;

    /// Remove a layer no image or child layer refers to.
    async fn delete_layer(&self, id: &str) -> Result<()>;

    /// Extract the full chain ending at `layer_id` into `target_dir`.
    async fn materialize(&self, layer_id: &str, target_dir: &Path) -> Result<()>;
}

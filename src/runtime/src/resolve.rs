//! Base image resolution.
//!
//! Cache-first: an image already in the layer store is used as is, and the
//! pull source is consulted only on a miss.

use std::sync::Arc;

use distbuild_core::error::{BuildError, Result};
use distbuild_core::log::LogConfig;
use tokio_util::sync::CancellationToken;

use crate::oci::ImageReference;
use crate::pull::PullSource;
use crate::store::{LayerStore, StoredImage};

/// Resolves image references against the store, pulling on a miss.
pub struct ImageResolver {
    store: Arc<dyn LayerStore>,
    puller: Arc<dyn PullSource>,
    log: LogConfig,
}

impl ImageResolver {
    pub fn new(store: Arc<dyn LayerStore>, puller: Arc<dyn PullSource>, log: LogConfig) -> Self {
        Self { store, puller, log }
    }

    /// Find `reference` locally by id or name, including its normalized
    /// registry form (`alpine` → `docker.io/library/alpine:latest`).
    pub async fn lookup_local(&self, reference: &str) -> Option<StoredImage> {
        if let Some(image) = self.store.lookup(reference).await {
            return Some(image);
        }
        let normalized = ImageReference::parse(reference).ok()?.full_reference();
        if normalized == reference {
            return None;
        }
        self.store.lookup(&normalized).await
    }

    /// Resolve `reference`, pulling it at most once.
    pub async fn resolve(&self, reference: &str, cancel: &CancellationToken) -> Result<StoredImage> {
        if let Some(image) = self.lookup_local(reference).await {
            if self.log.verbose() {
                tracing::debug!(reference, image = %image.id, "Using local image");
            }
            return Ok(image);
        }

        // Ids only name local images; there is nothing to pull.
        if ImageReference::is_image_id(reference) {
            return Err(BuildError::Resolution {
                reference: reference.to_string(),
                source: Box::new(BuildError::Store(format!(
                    "image {} is not in the local store",
                    reference
                ))),
            });
        }

        if self.log.verbose() {
            tracing::debug!(reference, "Image not found locally, pulling");
        }

        let pulled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BuildError::cancelled("resolving")),
            result = self.puller.pull(reference) => result,
        };

        let stored_ref = pulled.map_err(|e| BuildError::Resolution {
            reference: reference.to_string(),
            source: Box::new(e),
        })?;

        self.store
            .lookup(&stored_ref)
            .await
            .ok_or_else(|| BuildError::Resolution {
                reference: reference.to_string(),
                source: Box::new(BuildError::Store(format!(
                    "pulled image {} is not in the store",
                    stored_ref
                ))),
            })
    }
}

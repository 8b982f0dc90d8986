//! Pull source abstraction.

use async_trait::async_trait;
use distbuild_core::error::Result;

/// Something that can make a missing image available in the layer store.
#[async_trait]
pub trait PullSource: Send + Sync {
    /// Pull `reference` into the store and return the reference under which
    /// the image is now registered.
    ///
    /// On failure no partially registered image may remain.
    async fn pull(&self, reference: &str) -> Result<String>;
}

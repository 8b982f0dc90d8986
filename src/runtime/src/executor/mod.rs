//! Step executor abstraction.
//!
//! An executor prepares a working filesystem for one instruction and hands
//! back a [`StepHandle`]. The handle runs the instruction, commits the
//! result as a new image, and is released afterwards no matter how the
//! step ended. [`HandleGuard`] enforces the release.

mod chroot;

pub use chroot::{ChrootConfig, ChrootExecutor};

use std::collections::BTreeSet;

use async_trait::async_trait;
use distbuild_core::error::{BuildError, Result};
use distbuild_core::instruction::Instruction;
use distbuild_core::options::BuildOptions;
use distbuild_core::unit::ReportSink;

use crate::store::StoredImage;

/// Everything an executor needs to run one instruction.
#[derive(Clone)]
pub struct StepRequest {
    /// Image the instruction runs against
    pub image: StoredImage,
    pub instruction: Instruction,
    pub options: BuildOptions,
    pub allowed_build_args: BTreeSet<String>,
    pub report_sink: Option<ReportSink>,
}

impl std::fmt::Debug for StepRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRequest")
            .field("image", &self.image.id)
            .field("instruction", &self.instruction)
            .finish_non_exhaustive()
    }
}

impl StepRequest {
    /// Write one progress line to the report sink, if any.
    pub fn report(&self, line: &str) {
        if let Some(sink) = &self.report_sink {
            use std::io::Write;
            let mut w = sink.lock();
            if let Err(e) = writeln!(w, "{}", line) {
                tracing::warn!(error = %e, "Failed to write step report");
            }
        }
    }
}

/// Prepares step handles.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn prepare(&self, request: StepRequest) -> Result<Box<dyn StepHandle>>;
}

/// A prepared step.
#[async_trait]
pub trait StepHandle: Send {
    /// Run the instruction.
    async fn execute(&mut self) -> Result<()>;

    /// Turn the result into an image whose top layer holds exactly the
    /// changes made by `execute`.
    async fn commit(&mut self) -> Result<StoredImage>;

    /// Free everything `prepare` acquired. Must be safe to call once after
    /// any outcome of `execute` or `commit`.
    async fn release(&mut self) -> Result<()>;
}

/// Owns a prepared handle and releases it exactly once.
///
/// Call [`HandleGuard::release`] on every path. A guard dropped while still
/// holding its handle (future cancelled, panic unwinding) spawns the release
/// on the current tokio runtime.
pub struct HandleGuard {
    handle: Option<Box<dyn StepHandle>>,
}

impl HandleGuard {
    pub fn new(handle: Box<dyn StepHandle>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    fn handle_mut(&mut self) -> Result<&mut Box<dyn StepHandle>> {
        self.handle
            .as_mut()
            .ok_or_else(|| BuildError::Store("step handle already released".to_string()))
    }

    pub async fn execute(&mut self) -> Result<()> {
        self.handle_mut()?.execute().await
    }

    pub async fn commit(&mut self) -> Result<StoredImage> {
        self.handle_mut()?.commit().await
    }

    /// Release the handle now.
    pub async fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(mut handle) => handle.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = handle.release().await {
                        tracing::warn!(error = %e, "Deferred step release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!("Step handle dropped outside a runtime; resources leaked");
            }
        }
    }
}

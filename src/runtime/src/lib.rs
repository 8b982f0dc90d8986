//! distbuild runtime - layer storage, image resolution and step execution.
//!
//! This crate turns a decoded build unit into a committed layer: it finds
//! or pulls the base image, re-applies the transported diff, runs one
//! instruction through a step executor and reads back the new diff.

#![allow(clippy::result_large_err)]

pub mod executor;
pub mod layer;
pub mod oci;
pub mod orchestrate;
pub mod pull;
pub mod reconstruct;
pub mod resolve;
pub mod store;

// Re-export common types
pub use executor::{ChrootConfig, ChrootExecutor, HandleGuard, StepExecutor, StepHandle, StepRequest};
pub use oci::{ImageReference, RegistryAuth, RegistryPullSource};
pub use orchestrate::{StepOrchestrator, StepPhase, StepReport};
pub use pull::PullSource;
pub use reconstruct::{reconstruction_name, LayerReconstructor};
pub use resolve::ImageResolver;
pub use store::{DiskLayerStore, Layer, LayerStore, PutLayer, StoredImage};

/// distbuild runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

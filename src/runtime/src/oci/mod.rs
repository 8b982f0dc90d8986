//! Registry access: image references and the registry pull source.

pub mod reference;
pub mod registry;

pub use reference::ImageReference;
pub use registry::{register_chain, LayerBlob, RegistryAuth, RegistryPullSource};

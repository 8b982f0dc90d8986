//! Wiring of the concrete collaborators.

use std::sync::Arc;

use distbuild_core::config::WorkerConfig;
use distbuild_core::error::Result;
use distbuild_runtime::{
    ChrootConfig, ChrootExecutor, DiskLayerStore, LayerStore, RegistryAuth, RegistryPullSource,
    StepOrchestrator,
};

/// Scratch roots live next to the layer store so they share a filesystem.
pub fn work_dir(config: &WorkerConfig) -> std::path::PathBuf {
    config.store_dir.join("work")
}

/// Open the disk store and build one orchestrator shared by all requests.
pub fn build_orchestrator(config: &WorkerConfig) -> Result<StepOrchestrator> {
    let store: Arc<dyn LayerStore> = Arc::new(DiskLayerStore::new(&config.store_dir)?);

    let auth = RegistryAuth::from_env();
    if !auth.is_anonymous() {
        tracing::debug!("Using registry credentials from environment");
    }
    let puller = Arc::new(RegistryPullSource::new(store.clone(), auth));

    let executor = Arc::new(ChrootExecutor::new(
        store.clone(),
        ChrootConfig {
            work_dir: work_dir(config),
            context_dir: config.context_dir.clone(),
        },
    ));

    tracing::info!(
        store = %config.store_dir.display(),
        context = %config.context_dir.display(),
        "Layer store opened"
    );

    Ok(StepOrchestrator::new(
        store,
        puller,
        executor,
        config.log.clone(),
    ))
}

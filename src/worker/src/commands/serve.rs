//! `distbuild-worker serve` command.

use std::sync::Arc;

use clap::Args;
use distbuild_core::config::{parse_size, WorkerConfig};

use super::PathArgs;

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "DISTBUILD_LISTEN")]
    pub listen: Option<String>,

    #[command(flatten)]
    pub paths: PathArgs,

    /// Per-request deadline in seconds (0 disables it)
    #[arg(long, env = "DISTBUILD_REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    /// Largest accepted build unit (e.g., "512m", "1g")
    #[arg(long, value_parser = parse_size)]
    pub max_body_size: Option<u64>,
}

impl ServeArgs {
    pub(crate) fn apply(&self, config: &mut WorkerConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        self.paths.apply(config);
        if let Some(secs) = self.request_timeout {
            config.request_timeout_secs = secs;
        }
        if let Some(bytes) = self.max_body_size {
            config.max_body_bytes = bytes;
        }
    }
}

pub async fn execute(
    args: ServeArgs,
    mut config: WorkerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    args.apply(&mut config);

    let orchestrator = Arc::new(crate::setup::build_orchestrator(&config)?);
    crate::server::serve(orchestrator, &config).await?;
    Ok(())
}

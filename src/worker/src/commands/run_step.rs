//! `distbuild-worker run-step` command.
//!
//! Runs one encoded build unit through the same orchestrator the HTTP
//! listener uses and prints the step response. Executor progress goes to
//! stderr.

use std::path::{Path, PathBuf};

use clap::Args;
use distbuild_core::config::WorkerConfig;
use distbuild_core::response::StepResponse;
use distbuild_core::unit::{report_sink, BuildUnit};
use tokio_util::sync::CancellationToken;

use super::PathArgs;

#[derive(Args)]
pub struct RunStepArgs {
    /// Encoded build unit (JSON); "-" reads stdin
    pub unit: PathBuf,

    #[command(flatten)]
    pub paths: PathArgs,

    /// Write the response here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

fn read_unit(path: &Path) -> std::io::Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        use std::io::Read;
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read(path)
    }
}

pub async fn execute(
    args: RunStepArgs,
    mut config: WorkerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    args.paths.apply(&mut config);

    let bytes = read_unit(&args.unit)
        .map_err(|e| format!("Failed to read {}: {}", args.unit.display(), e))?;

    let response = match BuildUnit::decode(&bytes) {
        Ok(unit) => {
            let orchestrator = crate::setup::build_orchestrator(&config)?;
            let unit = unit.with_report_sink(report_sink(std::io::stderr()));

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            let watcher = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            let report = orchestrator.run(unit, &cancel).await;
            watcher.abort();
            report.to_response()
        }
        Err(e) => StepResponse::failed(&e),
    };

    let json = serde_json::to_string_pretty(&response)?;
    match &args.output {
        Some(path) => std::fs::write(path, format!("{}\n", json))
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?,
        None => println!("{}", json),
    }

    if response.success {
        Ok(())
    } else {
        Err(response
            .error
            .unwrap_or_else(|| "step failed".to_string())
            .into())
    }
}

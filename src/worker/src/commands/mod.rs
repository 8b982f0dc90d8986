//! CLI command definitions and dispatch.

mod run_step;
mod serve;
mod version;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use distbuild_core::config::WorkerConfig;
use distbuild_core::error::Result;
use distbuild_core::log::{LogFormat, LogLevel};

/// distbuild worker: runs single build steps for a build coordinator.
#[derive(Parser)]
#[command(name = "distbuild-worker", version, about)]
pub struct Cli {
    /// Worker configuration file (YAML, or JSON by extension)
    #[arg(long, global = true, env = "DISTBUILD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, global = true, env = "DISTBUILD_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Log format: text or json
    #[arg(long, global = true, env = "DISTBUILD_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Serve build steps over HTTP
    Serve(serve::ServeArgs),
    /// Run one encoded build unit locally and print the response
    RunStep(run_step::RunStepArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Store and context overrides shared by the step-running commands.
#[derive(Args, Debug, Clone, Default)]
pub struct PathArgs {
    /// Layer store directory
    #[arg(long, env = "DISTBUILD_STORE")]
    pub store: Option<PathBuf>,

    /// Build context directory for COPY and ADD
    #[arg(long, env = "DISTBUILD_CONTEXT")]
    pub context: Option<PathBuf>,
}

impl PathArgs {
    pub(crate) fn apply(&self, config: &mut WorkerConfig) {
        if let Some(store) = &self.store {
            config.store_dir = store.clone();
        }
        if let Some(context) = &self.context {
            config.context_dir = context.clone();
        }
    }
}

impl Cli {
    /// Configuration file (or defaults) with the global flags applied.
    pub fn load_config(&self) -> Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::load(path)?,
            None => WorkerConfig::default(),
        };
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(format) = self.log_format {
            config.log.format = format;
        }
        Ok(config)
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: WorkerConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Serve(args) => serve::execute(args, config).await,
        Command::RunStep(args) => run_step::execute(args, config).await,
        Command::Version(args) => version::execute(args).await,
    }
}

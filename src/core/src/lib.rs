//! distbuild core - foundational types for build workers
//!
//! Build units and their wire codec, instructions, build options, the step
//! response, errors and worker configuration.

pub mod config;
pub mod error;
pub mod instruction;
pub mod log;
pub mod options;
pub mod response;
pub mod unit;

// Re-export commonly used types
pub use config::WorkerConfig;
pub use error::{BuildError, ErrorKind, Result};
pub use instruction::Instruction;
pub use log::{LogConfig, LogFormat, LogLevel};
pub use options::{default_allowed_build_args, BuildOptions, ResourceLimits};
pub use response::StepResponse;
pub use unit::{report_sink, BuildUnit, ReportSink, WireUnit};

/// distbuild version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

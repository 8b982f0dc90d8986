//! Build options carried by a build unit.
//!
//! The worker only interprets `args`, `contextDirectory` and the resource
//! limits; everything else is forwarded to the step executor. Keys this
//! version does not know about are kept in `extra` and written back out
//! unchanged.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Proxy variables every build may forward without declaring an `ARG`.
pub const DEFAULT_ALLOWED_BUILD_ARGS: [&str; 8] = [
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "FTP_PROXY",
    "ftp_proxy",
    "NO_PROXY",
    "no_proxy",
];

/// Default set of allowed build argument names.
pub fn default_allowed_build_args() -> BTreeSet<String> {
    DEFAULT_ALLOWED_BUILD_ARGS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Resource limits applied to RUN steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Memory limit in bytes (0 = unlimited)
    #[serde(default)]
    pub memory: u64,
    /// Relative CPU weight (0 = runtime default)
    #[serde(default)]
    pub cpu_shares: u64,
    /// Size of /dev/shm, e.g. "64m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_size: Option<String>,
}

/// Option bag forwarded to the step executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    /// Build-time argument values (`--build-arg`)
    #[serde(default)]
    pub args: BTreeMap<String, String>,

    /// Directory COPY/ADD sources are resolved against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_directory: Option<String>,

    /// Final image name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    /// Manifest media type of the final image
    #[serde(default = "default_output_format")]
    pub output_format: String,

    #[serde(default)]
    pub additional_tags: Vec<String>,

    /// Whether the coordinator fans steps out to several workers
    #[serde(default)]
    pub parallel: bool,

    /// Workers the coordinator may dispatch to
    #[serde(default)]
    pub workers: Vec<String>,

    /// Registry used for pushes and unqualified pulls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,

    /// OCI runtime name
    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default)]
    pub runtime_args: Vec<String>,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub quiet: bool,

    /// Keys not modelled above, preserved verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_output_format() -> String {
    "application/vnd.oci.image.manifest.v1+json".to_string()
}

fn default_runtime() -> String {
    "runc".to_string()
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            args: BTreeMap::new(),
            context_directory: None,
            output: None,
            output_format: default_output_format(),
            additional_tags: Vec::new(),
            parallel: false,
            workers: Vec::new(),
            registry: None,
            runtime: default_runtime(),
            runtime_args: Vec::new(),
            resources: ResourceLimits::default(),
            quiet: false,
            extra: BTreeMap::new(),
        }
    }
}

impl BuildOptions {
    /// Build args that may be exported to a RUN step.
    ///
    /// A value is passed through when its name is in `allowed` or when the
    /// options declare it explicitly under `declaredArgs`.
    pub fn permitted_args(&self, allowed: &BTreeSet<String>) -> BTreeMap<String, String> {
        let declared: BTreeSet<&str> = self
            .extra
            .get("declaredArgs")
            .and_then(|v| v.as_array())
            .map(|names| names.iter().filter_map(|n| n.as_str()).collect())
            .unwrap_or_default();

        self.args
            .iter()
            .filter(|(name, _)| allowed.contains(*name) || declared.contains(name.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

use crate::error::{BuildError, Result};
use crate::log::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the HTTP listener binds to
    pub listen: String,

    /// Layer store root (layers/ and images.json live here)
    pub store_dir: PathBuf,

    /// Directory COPY/ADD sources are read from when the unit names none
    pub context_dir: PathBuf,

    /// Per-request deadline in seconds (0 = no deadline)
    pub request_timeout_secs: u64,

    /// Largest accepted request body
    pub max_body_bytes: u64,

    /// Logging
    pub log: LogConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            store_dir: default_store_dir(),
            context_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            request_timeout_secs: 3600, // 1 hour
            max_body_bytes: 512 * 1024 * 1024,
            log: LogConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from a YAML or JSON file (chosen by extension, YAML otherwise).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(serde_yaml::from_str(&content)?)
        }
    }

    /// Request deadline, if any.
    pub fn request_timeout(&self) -> Option<std::time::Duration> {
        (self.request_timeout_secs > 0)
            .then(|| std::time::Duration::from_secs(self.request_timeout_secs))
    }
}

/// `~/.distbuild/store`, or `.distbuild/store` when no home directory exists.
pub fn default_store_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".distbuild"))
        .unwrap_or_else(|| PathBuf::from(".distbuild"))
        .join("store")
}

/// Parse a human-readable size string (e.g., "512m", "1g", "4096") into bytes.
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().to_lowercase();
    if let Ok(n) = s.parse::<u64>() {
        return Ok(n);
    }
    let (num, mult) = if s.ends_with("gb") || s.ends_with('g') {
        (s.trim_end_matches("gb").trim_end_matches('g'), 1024u64 * 1024 * 1024)
    } else if s.ends_with("mb") || s.ends_with('m') {
        (s.trim_end_matches("mb").trim_end_matches('m'), 1024u64 * 1024)
    } else if s.ends_with("kb") || s.ends_with('k') {
        (s.trim_end_matches("kb").trim_end_matches('k'), 1024u64)
    } else if s.ends_with('b') {
        (s.trim_end_matches('b'), 1u64)
    } else {
        return Err(format!("unrecognized size format: {s}"));
    };
    let n: u64 = num.parse().map_err(|_| format!("invalid number: {num}"))?;
    Ok(n * mult)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogFormat, LogLevel};
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert!(config.store_dir.ends_with(".distbuild/store"));
        assert_eq!(config.max_body_bytes, 512 * 1024 * 1024);
        assert_eq!(
            config.request_timeout(),
            Some(std::time::Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let config = WorkerConfig {
            request_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.request_timeout().is_none());
    }

    #[test]
    fn test_load_yaml_partial() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("worker.yaml");
        std::fs::write(
            &path,
            "listen: 127.0.0.1:9000\nstore_dir: /var/lib/distbuild\nlog:\n  level: debug\n  format: json\n",
        )
        .unwrap();

        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/distbuild"));
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.max_body_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn test_load_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("worker.json");
        std::fs::write(&path, r#"{"request_timeout_secs": 30}"#).unwrap();

        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_load_missing_file() {
        let err = WorkerConfig::load(Path::new("/nonexistent/worker.yaml")).unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("worker.yaml");
        std::fs::write(&path, "listen: [unclosed").unwrap();
        assert!(matches!(
            WorkerConfig::load(&path).unwrap_err(),
            BuildError::Serialization(_)
        ));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert!(parse_size("abc").is_err());
    }
}

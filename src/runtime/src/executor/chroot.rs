//! Chroot step executor.
//!
//! Materializes the base image into a scratch rootfs, snapshots it, runs the
//! instruction, and commits the snapshot difference as a new layer. RUN
//! uses `chroot <rootfs> /bin/sh -c`, so it needs a Linux host and enough
//! privileges to chroot.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use distbuild_core::error::{BuildError, Result};
use distbuild_core::instruction::Instruction;
use tempfile::TempDir;

use super::{StepExecutor, StepHandle, StepRequest};
use crate::layer::{encode_diff, resolve_in_root, DirSnapshot};
use crate::store::{LayerStore, StoredImage};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Where the chroot executor keeps scratch roots and reads build context.
#[derive(Debug, Clone)]
pub struct ChrootConfig {
    /// Parent directory of per-step scratch roots
    pub work_dir: PathBuf,
    /// Build context used when the unit does not name one
    pub context_dir: PathBuf,
}

/// Runs instructions in a chroot over a materialized image.
pub struct ChrootExecutor {
    store: Arc<dyn LayerStore>,
    config: ChrootConfig,
}

impl ChrootExecutor {
    pub fn new(store: Arc<dyn LayerStore>, config: ChrootConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl StepExecutor for ChrootExecutor {
    async fn prepare(&self, request: StepRequest) -> Result<Box<dyn StepHandle>> {
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .map_err(|e| {
                BuildError::Prepare(format!(
                    "Failed to create work directory {}: {}",
                    self.config.work_dir.display(),
                    e
                ))
            })?;

        let workspace = tempfile::Builder::new()
            .prefix("step-")
            .tempdir_in(&self.config.work_dir)
            .map_err(|e| BuildError::Prepare(format!("Failed to create scratch root: {}", e)))?;
        let rootfs = workspace.path().join("rootfs");

        self.store
            .materialize(&request.image.top_layer, &rootfs)
            .await
            .map_err(|e| BuildError::Prepare(e.to_string()))?;

        let before = snapshot(rootfs.clone())
            .await
            .map_err(|e| BuildError::Prepare(e.to_string()))?;

        let context_dir = request
            .options
            .context_directory
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.context_dir.clone());

        tracing::debug!(
            image = %request.image.id,
            rootfs = %rootfs.display(),
            entries = before.entries.len(),
            "Prepared scratch root"
        );

        Ok(Box::new(ChrootHandle {
            store: self.store.clone(),
            request,
            workspace: Some(workspace),
            rootfs,
            context_dir,
            before,
        }))
    }
}

struct ChrootHandle {
    store: Arc<dyn LayerStore>,
    request: StepRequest,
    workspace: Option<TempDir>,
    rootfs: PathBuf,
    context_dir: PathBuf,
    before: DirSnapshot,
}

impl ChrootHandle {
    /// Working directory for relative paths, from the `workingDir` option.
    fn workdir(&self) -> String {
        self.request
            .options
            .extra
            .get("workingDir")
            .and_then(|v| v.as_str())
            .unwrap_or("/")
            .to_string()
    }

    async fn run(&self, command: &str) -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(BuildError::Execute(
                "RUN requires a Linux host".to_string(),
            ));
        }

        let workdir = self.workdir();
        let script = format!("cd {} && {}", shell_quote(&workdir), command);

        let mut cmd = tokio::process::Command::new("chroot");
        cmd.arg(&self.rootfs).arg("/bin/sh").arg("-c").arg(&script);
        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", "/root");
        for (key, value) in self
            .request
            .options
            .permitted_args(&self.request.allowed_build_args)
        {
            cmd.env(key, value);
        }
        cmd.kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| BuildError::Execute(format!("Failed to start RUN command: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            self.request.report(line);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildError::Execute(format!(
                "RUN command failed (exit {}): {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Host path for an image path, with symlinks resolved inside the rootfs.
    fn in_rootfs(&self, path: &str) -> Result<PathBuf> {
        let relative = rootfs_relative(&resolve_path(&self.workdir(), path))?;
        resolve_in_root(&self.rootfs, &relative, true).map_err(|e| BuildError::Execute(e.to_string()))
    }

    async fn copy(&self, src: &[String], dst: &str) -> Result<()> {
        let context = self.context_dir.clone();
        let dst_in_rootfs = self.in_rootfs(dst)?;
        let into_dir = dst.ends_with('/') || src.len() > 1;
        let sources = src
            .iter()
            .map(|s| -> Result<PathBuf> { Ok(context.join(context_relative(s)?)) })
            .collect::<Result<Vec<PathBuf>>>()?;

        tokio::task::spawn_blocking(move || copy_sources(&sources, &dst_in_rootfs, into_dir))
            .await
            .map_err(|e| BuildError::Execute(format!("Copy task failed: {}", e)))?
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        let dir = self.in_rootfs(path)?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            BuildError::Execute(format!("Failed to create {}: {}", dir.display(), e))
        })
    }
}

#[async_trait]
impl StepHandle for ChrootHandle {
    async fn execute(&mut self) -> Result<()> {
        let instruction = self.request.instruction.clone();
        self.request.report(&format!("STEP: {}", instruction));

        match &instruction {
            Instruction::Run { command } => self.run(command).await,
            Instruction::Copy { from: Some(stage), .. } => Err(BuildError::Execute(format!(
                "COPY --from={} needs a multi-stage context this worker does not have",
                stage
            ))),
            Instruction::Copy { src, dst, from: None } => self.copy(src, dst).await,
            Instruction::Add { src, dst } => {
                if let Some(url) = src
                    .iter()
                    .find(|s| s.starts_with("http://") || s.starts_with("https://"))
                {
                    return Err(BuildError::Execute(format!(
                        "ADD from a URL is not supported: {}",
                        url
                    )));
                }
                self.copy(src, dst).await
            }
            Instruction::Workdir { path } | Instruction::Volume { path } => {
                self.make_dir(path).await
            }
            // Metadata only; the committed layer is empty.
            _ => Ok(()),
        }
    }

    async fn commit(&mut self) -> Result<StoredImage> {
        let after = snapshot(self.rootfs.clone())
            .await
            .map_err(|e| BuildError::Commit(e.to_string()))?;
        let changes = self.before.changes(&after);

        let rootfs = self.rootfs.clone();
        let diff = tokio::task::spawn_blocking(move || encode_diff(&rootfs, &changes))
            .await
            .map_err(|e| BuildError::Commit(format!("Diff task failed: {}", e)))?
            .map_err(|e| BuildError::Commit(e.to_string()))?;

        let put = self
            .store
            .put_layer(Some(&self.request.image.top_layer), &diff)
            .await
            .map_err(|e| BuildError::Commit(e.to_string()))?;

        match self.store.create_image(&[], &put.layer.id).await {
            Ok(image) => {
                tracing::debug!(
                    image = %image.id,
                    layer = %put.layer.id,
                    diff_size = diff.len(),
                    "Committed step"
                );
                Ok(image)
            }
            Err(e) => {
                if put.created {
                    if let Err(cleanup) = self.store.delete_layer(&put.layer.id).await {
                        tracing::warn!(
                            layer = %put.layer.id,
                            error = %cleanup,
                            "Failed to remove uncommitted step layer"
                        );
                    }
                }
                Err(BuildError::Commit(e.to_string()))
            }
        }
    }

    async fn release(&mut self) -> Result<()> {
        if let Some(workspace) = self.workspace.take() {
            let path = workspace.path().to_path_buf();
            tokio::task::spawn_blocking(move || workspace.close())
                .await
                .map_err(|e| BuildError::Store(format!("Release task failed: {}", e)))?
                .map_err(|e| {
                    BuildError::Store(format!(
                        "Failed to remove scratch root {}: {}",
                        path.display(),
                        e
                    ))
                })?;
        }
        Ok(())
    }
}

async fn snapshot(rootfs: PathBuf) -> Result<DirSnapshot> {
    tokio::task::spawn_blocking(move || DirSnapshot::capture(&rootfs))
        .await
        .map_err(|e| BuildError::Store(format!("Snapshot task failed: {}", e)))?
}

fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

/// Path inside the rootfs for an absolute image path. `..` is refused.
fn rootfs_relative(path: &str) -> Result<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(BuildError::Execute(format!(
            "Path escapes the image root: {}",
            path
        )));
    }
    Ok(relative.to_path_buf())
}

/// Path inside the build context. Absolute paths and `..` are refused.
fn context_relative(path: &str) -> Result<PathBuf> {
    let p = Path::new(path);
    if p.is_absolute() || p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(BuildError::Execute(format!(
            "Source escapes the build context: {}",
            path
        )));
    }
    Ok(p.to_path_buf())
}

fn copy_sources(sources: &[PathBuf], dst: &Path, into_dir: bool) -> Result<()> {
    let create_err = |e: std::io::Error| {
        BuildError::Execute(format!("Failed to create COPY destination {}: {}", dst.display(), e))
    };
    if into_dir {
        std::fs::create_dir_all(dst).map_err(create_err)?;
    } else if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(create_err)?;
    }

    for src in sources {
        if !src.exists() {
            return Err(BuildError::Execute(format!(
                "COPY source not found: {}",
                src.display()
            )));
        }
        if src.is_dir() {
            copy_dir_recursive(src, dst)?;
        } else {
            let target = match src.file_name() {
                Some(name) if dst.is_dir() => dst.join(name),
                _ => dst.to_path_buf(),
            };
            unlink_symlink(&target)?;
            std::fs::copy(src, &target).map_err(|e| {
                BuildError::Execute(format!(
                    "Failed to copy {} to {}: {}",
                    src.display(),
                    target.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| {
        BuildError::Execute(format!("Failed to create directory {}: {}", dst.display(), e))
    })?;
    let entries = std::fs::read_dir(src).map_err(|e| {
        BuildError::Execute(format!("Failed to read directory {}: {}", src.display(), e))
    })?;
    for entry in entries {
        let entry =
            entry.map_err(|e| BuildError::Execute(format!("Failed to read entry: {}", e)))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        unlink_symlink(&dst_path)?;
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path).map_err(|e| {
                BuildError::Execute(format!(
                    "Failed to copy {} to {}: {}",
                    src_path.display(),
                    dst_path.display(),
                    e
                ))
            })?;
        }
    }
    Ok(())
}

/// Copied content replaces a symlink instead of writing through it.
fn unlink_symlink(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::remove_file(path).map_err(|e| {
            BuildError::Execute(format!("Failed to replace symlink {}: {}", path.display(), e))
        }),
        _ => Ok(()),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

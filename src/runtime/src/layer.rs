//! Filesystem diff utilities.
//!
//! Snapshots a directory tree, computes what changed between two snapshots,
//! packs the change set into a gzip-compressed tar and applies such an
//! archive back onto a directory. Deletions are encoded as OCI whiteout
//! entries (`.wh.<name>`), and `.wh..wh..opq` marks a directory whose
//! previous contents are hidden.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use distbuild_core::error::{BuildError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

/// Prefix of a whiteout entry's file name.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// File name of an opaque-directory marker.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Metadata for a single path in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Relative path from the snapshot root
    pub path: PathBuf,
    pub size: u64,
    /// Modification time in nanoseconds since the epoch
    pub mtime: u128,
    pub mode: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// A snapshot of a directory's file state.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    pub entries: HashMap<PathBuf, FileEntry>,
}

/// Paths that differ between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Added or modified, sorted
    pub changed: Vec<PathBuf>,
    /// Removed, sorted, with descendants of removed directories collapsed
    pub deleted: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

impl DirSnapshot {
    /// Record every path under `root`. Symlinks are not followed.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        walk_dir(root, root, &mut entries)?;
        Ok(DirSnapshot { entries })
    }

    /// Compute what changed from this snapshot (before) to `after`.
    pub fn changes(&self, after: &DirSnapshot) -> ChangeSet {
        let mut changed: Vec<PathBuf> = after
            .entries
            .iter()
            .filter(|(path, entry)| match self.entries.get(*path) {
                None => true,
                Some(before) => {
                    before.size != entry.size
                        || before.mtime != entry.mtime
                        || before.mode != entry.mode
                        || before.is_dir != entry.is_dir
                        || before.is_symlink != entry.is_symlink
                }
            })
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();

        let mut removed: Vec<&PathBuf> = self
            .entries
            .keys()
            .filter(|path| !after.entries.contains_key(*path))
            .collect();
        removed.sort();

        // A removed directory's whiteout covers everything below it.
        let mut deleted: Vec<PathBuf> = Vec::new();
        for path in removed {
            if deleted.last().map_or(false, |d| path.starts_with(d)) {
                continue;
            }
            deleted.push(path.clone());
        }

        ChangeSet { changed, deleted }
    }
}

fn walk_dir(root: &Path, current: &Path, entries: &mut HashMap<PathBuf, FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        BuildError::Store(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| BuildError::Store(format!("Failed to read directory entry: {}", e)))?;

        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| {
                BuildError::Store(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_path_buf();

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            BuildError::Store(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;

        let mtime = metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos()
            })
            .unwrap_or(0);

        let is_dir = metadata.is_dir();
        entries.insert(
            relative.clone(),
            FileEntry {
                path: relative,
                size: metadata.len(),
                mtime,
                mode: file_mode(&metadata),
                is_dir,
                is_symlink: metadata.file_type().is_symlink(),
            },
        );

        if is_dir {
            walk_dir(root, &path, entries)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Pack a change set of `rootfs` into a gzip-compressed tar.
///
/// Whiteouts come first so that applying the archive in order removes old
/// paths before new content is written.
pub fn encode_diff(rootfs: &Path, changes: &ChangeSet) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for deleted in &changes.deleted {
        let name = deleted
            .file_name()
            .ok_or_else(|| {
                BuildError::Store(format!("Cannot whiteout path {}", deleted.display()))
            })?
            .to_string_lossy();
        let whiteout = match deleted.parent() {
            Some(parent) => parent.join(format!("{}{}", WHITEOUT_PREFIX, name)),
            None => PathBuf::from(format!("{}{}", WHITEOUT_PREFIX, name)),
        };

        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, &whiteout, std::io::empty())
            .map_err(|e| {
                BuildError::Store(format!(
                    "Failed to add whiteout {} to diff: {}",
                    whiteout.display(),
                    e
                ))
            })?;
    }

    for relative_path in &changes.changed {
        let full_path = rootfs.join(relative_path);
        let metadata = match std::fs::symlink_metadata(&full_path) {
            Ok(m) => m,
            Err(_) => continue,
        };

        let appended = if metadata.is_dir() {
            builder.append_dir(relative_path, &full_path)
        } else {
            builder.append_path_with_name(&full_path, relative_path)
        };
        appended.map_err(|e| {
            BuildError::Store(format!(
                "Failed to add {} to diff: {}",
                relative_path.display(),
                e
            ))
        })?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| BuildError::Store(format!("Failed to finalize diff: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| BuildError::Store(format!("Failed to compress diff: {}", e)))
}

/// Counts gathered while validating a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub entries: usize,
    pub whiteouts: usize,
    /// Uncompressed payload bytes
    pub content_bytes: u64,
}

/// Read a diff end to end without writing anything.
///
/// An empty byte slice is an empty diff.
pub fn validate_diff(diff: &[u8]) -> Result<DiffStats> {
    let mut stats = DiffStats::default();
    if diff.is_empty() {
        return Ok(stats);
    }

    let mut archive = tar::Archive::new(GzDecoder::new(diff));
    let entries = archive
        .entries()
        .map_err(|e| BuildError::Store(format!("Corrupt diff: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| BuildError::Store(format!("Corrupt diff: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| BuildError::Store(format!("Corrupt diff entry path: {}", e)))?
            .into_owned();
        check_entry_path(&path)?;

        if is_whiteout(&path) {
            stats.whiteouts += 1;
        }
        stats.entries += 1;
        stats.content_bytes += std::io::copy(&mut entry, &mut std::io::sink())
            .map_err(|e| BuildError::Store(format!("Corrupt diff entry {}: {}", path.display(), e)))?;
    }

    Ok(stats)
}

/// Apply a diff onto `target_dir`, honouring whiteouts.
pub fn apply_diff(diff: &[u8], target_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(target_dir).map_err(|e| {
        BuildError::Store(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;
    if diff.is_empty() {
        return Ok(());
    }

    let mut archive = tar::Archive::new(GzDecoder::new(diff));
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    let entries = archive
        .entries()
        .map_err(|e| BuildError::Store(format!("Failed to read diff: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| BuildError::Store(format!("Failed to read diff: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| BuildError::Store(format!("Invalid diff entry path: {}", e)))?
            .into_owned();
        check_entry_path(&path)?;

        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name == OPAQUE_WHITEOUT {
                clear_dir(&resolve_in_root(target_dir, parent, true)?)?;
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                let victim = resolve_in_root(target_dir, parent, true)?.join(hidden);
                remove_path(&victim)?;
                continue;
            }
        }

        // A directory may replace a file and vice versa.
        let dest = match path.file_name() {
            Some(name) => resolve_in_root(target_dir, parent, true)?.join(name),
            None => target_dir.to_path_buf(),
        };
        if let Ok(existing) = std::fs::symlink_metadata(&dest) {
            let incoming_dir = entry.header().entry_type().is_dir();
            if existing.is_dir() != incoming_dir {
                remove_path(&dest)?;
            }
        }

        entry.unpack_in(target_dir).map_err(|e| {
            BuildError::Store(format!(
                "Failed to extract {} to {}: {}",
                path.display(),
                target_dir.display(),
                e
            ))
        })?;
    }

    tracing::debug!(target = %target_dir.display(), "Applied diff");
    Ok(())
}

/// Whether a diff entry path is a whiteout marker.
pub fn is_whiteout(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.starts_with(WHITEOUT_PREFIX))
}

const MAX_SYMLINK_HOPS: usize = 40;

enum PathPart {
    Root,
    Parent,
    Name(OsString),
}

fn path_parts(path: &Path) -> VecDeque<PathPart> {
    path.components()
        .filter_map(|component| match component {
            Component::Prefix(_) | Component::RootDir => Some(PathPart::Root),
            Component::CurDir => None,
            Component::ParentDir => Some(PathPart::Parent),
            Component::Normal(name) => Some(PathPart::Name(name.to_os_string())),
        })
        .collect()
}

/// Resolve `path` as if `root` were `/`.
///
/// Symlinks met along the way are followed with `root` as their root, so an
/// absolute target or a run of `..` never leaves `root`. The last component
/// is followed only when `follow_final` is set. Missing components are kept
/// as they are.
pub fn resolve_in_root(root: &Path, path: &Path, follow_final: bool) -> Result<PathBuf> {
    let mut pending = path_parts(path);
    let mut resolved: Vec<OsString> = Vec::new();
    let mut hops = 0;

    while let Some(part) = pending.pop_front() {
        let name = match part {
            PathPart::Root => {
                resolved.clear();
                continue;
            }
            PathPart::Parent => {
                resolved.pop();
                continue;
            }
            PathPart::Name(name) => name,
        };

        let mut candidate = root.to_path_buf();
        candidate.extend(&resolved);
        candidate.push(&name);

        let follow = follow_final || !pending.is_empty();
        let is_link = follow
            && std::fs::symlink_metadata(&candidate)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
        if !is_link {
            resolved.push(name);
            continue;
        }

        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(BuildError::Store(format!(
                "Too many symlinks resolving {} under {}",
                path.display(),
                root.display()
            )));
        }
        let target = std::fs::read_link(&candidate).map_err(|e| {
            BuildError::Store(format!("Failed to read symlink {}: {}", candidate.display(), e))
        })?;
        let mut expanded = path_parts(&target);
        expanded.extend(pending.drain(..));
        pending = expanded;
    }

    let mut out = root.to_path_buf();
    out.extend(&resolved);
    Ok(out)
}

fn check_entry_path(path: &Path) -> Result<()> {
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(BuildError::Store(format!(
            "Diff entry escapes the layer root: {}",
            path.display()
        )));
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(_) => return Ok(()),
    };
    result.map_err(|e| BuildError::Store(format!("Failed to remove {}: {}", path.display(), e)))
}

fn clear_dir(dir: &Path) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        remove_path(&entry.path())?;
    }
    Ok(())
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// List the paths in a diff, whiteouts included, in archive order.
pub fn list_entries(diff: &[u8]) -> Result<Vec<PathBuf>> {
    if diff.is_empty() {
        return Ok(Vec::new());
    }
    let mut archive = tar::Archive::new(GzDecoder::new(diff));
    let mut paths = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| BuildError::Store(format!("Failed to read diff: {}", e)))?
    {
        let entry = entry.map_err(|e| BuildError::Store(format!("Failed to read diff: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| BuildError::Store(format!("Invalid diff entry path: {}", e)))?;
        paths.push(path.into_owned());
    }
    Ok(paths)
}

/// Read one file's contents out of a diff.
pub fn read_entry(diff: &[u8], wanted: &Path) -> Result<Option<Vec<u8>>> {
    if diff.is_empty() {
        return Ok(None);
    }
    let mut archive = tar::Archive::new(GzDecoder::new(diff));
    for entry in archive
        .entries()
        .map_err(|e| BuildError::Store(format!("Failed to read diff: {}", e)))?
    {
        let mut entry = entry.map_err(|e| BuildError::Store(format!("Failed to read diff: {}", e)))?;
        let matches = entry.path().map(|p| p.as_ref() == wanted).unwrap_or(false);
        if matches {
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| BuildError::Store(format!("Failed to read diff entry: {}", e)))?;
            return Ok(Some(buf));
        }
    }
    Ok(None)
}

/// Build a diff from in-memory files. Paths ending in `/` become directories.
pub fn diff_from_files(files: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        if let Some(dir) = name.strip_suffix('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, dir, std::io::empty())
                .map_err(|e| BuildError::Store(format!("Failed to add {}: {}", name, e)))?;
        } else {
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, *content)
                .map_err(|e| BuildError::Store(format!("Failed to add {}: {}", name, e)))?;
        }
    }

    builder
        .into_inner()
        .map_err(|e| BuildError::Store(format!("Failed to finalize diff: {}", e)))?
        .finish()
        .map_err(|e| BuildError::Store(format!("Failed to compress diff: {}", e)))
}

//! Directory Differ (§4.E): streams two filesystem trees (or one, in
//! "scratch" mode) with bounded task parallelism and produces the ordered,
//! deduplicated [`Diff`] sequence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::attributes::{AttributeInspector, InspectError, InspectorOptions, NodeType, NormalizedFileAttributes};
use crate::content_diff::ContentHasher;
use crate::diff::{canonicalize, ChangePayload, Diff, DiffNodeKind};
use crate::file_diff::{diff_file, FileVerdict};
use crate::path::BinaryPath;

/// Errors that abort the whole directory diff (§4.E "Failure").
#[derive(thiserror::Error, Debug)]
pub enum DirectoryDiffError {
    #[error("cannot enumerate directory {0}: {1}")]
    CannotEnumerateDirectory(PathBuf, std::io::Error),
    #[error("attribute inspection failed: {0}")]
    Inspect(#[from] InspectError),
    #[error("content comparison failed: {0}")]
    Content(#[from] std::io::Error),
    #[error("diff task panicked or was cancelled")]
    TaskJoin,
}

/// Bounded task-group size: `max(4, 2 * logical_cpus)` (§4.E, §5).
fn max_in_flight() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    (2 * cpus).max(4)
}

pub struct DirectoryDiffer {
    inspector: Arc<dyn AttributeInspector>,
    hasher: Arc<dyn ContentHasher>,
    options: InspectorOptions,
}

impl DirectoryDiffer {
    pub fn new(inspector: Arc<dyn AttributeInspector>, hasher: Arc<dyn ContentHasher>, options: InspectorOptions) -> Self {
        Self { inspector, hasher, options }
    }

    /// Diff `target` against an optional `base`. `base = None` is scratch
    /// mode: every non-device node in `target` is `Added`.
    pub async fn diff(&self, base: Option<&Path>, target: &Path) -> Result<Vec<Diff>, DirectoryDiffError> {
        let target_entries = enumerate(target)?;

        let base_entries = match base {
            Some(base) => enumerate(base)?,
            None => HashMap::new(),
        };

        let semaphore = Arc::new(Semaphore::new(max_in_flight()));
        let mut tasks: JoinSet<Result<Option<Diff>, DirectoryDiffError>> = JoinSet::new();

        // Pass 1: walk target, classify each entry against base (or scratch).
        for (rel_path, target_full_path) in target_entries.clone() {
            let base_full_path = base_entries.get(&rel_path).cloned();
            let inspector = self.inspector.clone();
            let hasher = self.hasher.clone();
            let options = self.options.clone();
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");

            tasks.spawn_blocking(move || {
                let _permit = permit;
                diff_one_target_entry(&*inspector, &*hasher, &options, &rel_path, &target_full_path, base_full_path.as_deref())
            });
        }

        let mut diffs = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(Some(diff))) => diffs.push(diff),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    tasks.abort_all();
                    return Err(err);
                }
                Err(_) => {
                    tasks.abort_all();
                    return Err(DirectoryDiffError::TaskJoin);
                }
            }
        }

        // Pass 2: anything in base missing from target is Deleted, unless it
        // was itself a device node (excluded, §4.E).
        if base.is_some() {
            let mut pass2: JoinSet<Result<Option<Diff>, DirectoryDiffError>> = JoinSet::new();
            for (rel_path, base_full_path) in base_entries {
                if target_entries.contains_key(&rel_path) {
                    continue;
                }
                let inspector = self.inspector.clone();
                let options = self.options.clone();
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                pass2.spawn_blocking(move || {
                    let _permit = permit;
                    let attrs = inspector.inspect(&base_full_path, &options)?;
                    if attrs.node_type.map(NodeType::is_device).unwrap_or(false) {
                        Ok(None)
                    } else {
                        Ok(Some(Diff::Deleted { path: rel_path }))
                    }
                });
            }
            while let Some(result) = pass2.join_next().await {
                match result {
                    Ok(Ok(Some(diff))) => diffs.push(diff),
                    Ok(Ok(None)) => {}
                    Ok(Err(err)) => {
                        pass2.abort_all();
                        return Err(err);
                    }
                    Err(_) => {
                        pass2.abort_all();
                        return Err(DirectoryDiffError::TaskJoin);
                    }
                }
            }
        }

        Ok(canonicalize(diffs))
    }
}

fn diff_one_target_entry(
    inspector: &dyn AttributeInspector,
    hasher: &dyn ContentHasher,
    options: &InspectorOptions,
    rel_path: &BinaryPath,
    target_full_path: &Path,
    base_full_path: Option<&Path>,
) -> Result<Option<Diff>, DirectoryDiffError> {
    let new_attrs = inspector.inspect(target_full_path, options)?;
    let new_is_device = new_attrs.node_type.map(NodeType::is_device).unwrap_or(false);

    let base_full_path = match base_full_path {
        Some(p) => p,
        None => {
            // Scratch mode, or not present in base.
            return Ok(if new_is_device {
                None
            } else {
                Some(Diff::Added {
                    path: rel_path.clone(),
                    node: to_diff_node(new_attrs.node_type),
                    payload: to_payload(&new_attrs),
                })
            });
        }
    };

    let old_attrs = inspector.inspect(base_full_path, options)?;
    let old_is_device = old_attrs.node_type.map(NodeType::is_device).unwrap_or(false);

    match (old_is_device, new_is_device) {
        (true, true) => Ok(None),
        (true, false) => Ok(Some(Diff::Added {
            path: rel_path.clone(),
            node: to_diff_node(new_attrs.node_type),
            payload: to_payload(&new_attrs),
        })),
        (false, true) => Ok(Some(Diff::Deleted { path: rel_path.clone() })),
        (false, false) => {
            let verdict = diff_file(hasher, &old_attrs, &new_attrs, base_full_path, target_full_path)?;
            Ok(match verdict {
                FileVerdict::NoChange => None,
                FileVerdict::Modified(kind) => Some(Diff::Modified {
                    path: rel_path.clone(),
                    kind,
                    node: to_diff_node(new_attrs.node_type),
                    payload: to_payload(&new_attrs),
                }),
            })
        }
    }
}

fn to_diff_node(node_type: Option<NodeType>) -> DiffNodeKind {
    match node_type {
        Some(NodeType::Regular) => DiffNodeKind::Regular,
        Some(NodeType::Directory) => DiffNodeKind::Directory,
        Some(NodeType::Symlink) => DiffNodeKind::Symlink,
        Some(NodeType::CharacterDevice) | Some(NodeType::BlockDevice) => DiffNodeKind::Device,
        Some(NodeType::Fifo) => DiffNodeKind::Fifo,
        Some(NodeType::Socket) => DiffNodeKind::Socket,
        None => DiffNodeKind::Regular,
    }
}

fn to_payload(attrs: &NormalizedFileAttributes) -> ChangePayload {
    ChangePayload {
        permissions: attrs.mode,
        size: attrs.size,
        mtime_ns: attrs.mtime_ns,
        link_target: attrs.symlink_target.clone(),
        uid: attrs.uid,
        gid: attrs.gid,
        xattrs: if attrs.xattrs.is_empty() { None } else { Some(attrs.xattrs.clone()) },
        dev_major: attrs.dev_major,
        dev_minor: attrs.dev_minor,
        nlink: attrs.nlink,
    }
}

/// Walk `root` and return every descendant's path relative to `root`,
/// preserving raw bytes.
fn enumerate(root: &Path) -> Result<HashMap<BinaryPath, PathBuf>, DirectoryDiffError> {
    let mut out = HashMap::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|err| {
            DirectoryDiffError::CannotEnumerateDirectory(root.to_path_buf(), std::io::Error::new(std::io::ErrorKind::Other, err))
        })?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir entries are always under root");
        let rel_path = path_to_binary_path(relative).map_err(|err| {
            DirectoryDiffError::CannotEnumerateDirectory(root.to_path_buf(), std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })?;
        out.insert(rel_path, entry.path().to_path_buf());
    }
    Ok(out)
}

fn path_to_binary_path(path: &Path) -> Result<BinaryPath, crate::path::BinaryPathError> {
    use std::os::unix::ffi::OsStrExt;
    BinaryPath::new(path.as_os_str().as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::PosixAttributeInspector;
    use crate::content_diff::Sha256ContentHasher;
    use std::fs;

    fn unique_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("container-layer-differ-dirdiff-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn differ() -> DirectoryDiffer {
        DirectoryDiffer::new(
            Arc::new(PosixAttributeInspector),
            Arc::new(Sha256ContentHasher),
            InspectorOptions::default(),
        )
    }

    #[tokio::test]
    async fn scratch_mode_emits_only_added() {
        let root = unique_dir("scratch");
        fs::write(root.join("a.txt"), b"A").unwrap();
        fs::create_dir(root.join("dir")).unwrap();
        fs::write(root.join("dir/b.txt"), b"B").unwrap();

        let diffs = differ().diff(None, &root).await.unwrap();
        assert_eq!(diffs.len(), 3);
        assert!(diffs.iter().all(|d| matches!(d, Diff::Added { .. })));

        let paths: Vec<_> = diffs.iter().map(|d| d.path().string_value().unwrap().to_string()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);

        fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn identical_trees_produce_empty_diff() {
        let base = unique_dir("identical-base");
        let target = unique_dir("identical-target");
        fs::write(base.join("f.txt"), b"same").unwrap();
        fs::write(target.join("f.txt"), b"same").unwrap();

        let diffs = differ().diff(Some(&base), &target).await.unwrap();
        assert!(diffs.is_empty());

        fs::remove_dir_all(&base).unwrap();
        fs::remove_dir_all(&target).unwrap();
    }

    #[tokio::test]
    async fn add_modify_delete_distinct_paths() {
        let base = unique_dir("amd-base");
        let target = unique_dir("amd-target");
        fs::write(base.join("keep.txt"), b"keep").unwrap();
        fs::write(base.join("mod.txt"), b"before").unwrap();
        fs::write(base.join("gone.txt"), b"gone").unwrap();

        fs::write(target.join("keep.txt"), b"keep").unwrap();
        fs::write(target.join("mod.txt"), b"after").unwrap();
        fs::write(target.join("new.txt"), b"new").unwrap();

        let diffs = differ().diff(Some(&base), &target).await.unwrap();
        let mut by_path: HashMap<String, &Diff> = HashMap::new();
        for d in &diffs {
            by_path.insert(d.path().string_value().unwrap().to_string(), d);
        }
        assert!(matches!(by_path["new.txt"], Diff::Added { .. }));
        assert!(matches!(by_path["mod.txt"], Diff::Modified { .. }));
        assert!(matches!(by_path["gone.txt"], Diff::Deleted { .. }));
        assert!(!by_path.contains_key("keep.txt"));

        fs::remove_dir_all(&base).unwrap();
        fs::remove_dir_all(&target).unwrap();
    }
}

//! Tar Archive Snapshotter (§4.I): the snapshot lifecycle actor. Modelled on
//! this codebase's `BackupGroup`/`BackupDir` split between a lightweight
//! handle and the state it points at — here a `SnapshotId` table owned by
//! the snapshotter, with parents linked by `Arc<Snapshot>` so the lineage
//! DAG never needs unchecked back-references.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::attributes::{AttributeInspector, InspectorOptions};
use crate::content_diff::ContentHasher;
use crate::content_store::ContentStore;
use crate::directory_diff::DirectoryDiffer;
use crate::tar_differ::{DiffBase, DiffTarget, LayerFormat, TarArchiveDiffer, TarDifferError};

/// Unique snapshot identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    pub fn generate() -> Self {
        Self(proxmox_uuid::Uuid::generate().to_string())
    }
}

/// Snapshot lifecycle state (§3.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SnapshotState {
    Prepared { mountpoint: PathBuf },
    InProgress { operation_id: String },
    Committed {
        layer_digest: String,
        layer_size: i64,
        layer_media_type: String,
        diff_id: Option<String>,
        diff_key: Option<String>,
    },
}

impl SnapshotState {
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    pub fn can_execute(&self) -> bool {
        matches!(self, Self::Prepared { .. })
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::InProgress { .. })
    }
}

/// A lifecycle record (§3.4). Parents are shared references into the
/// snapshotter's own table, never raw ids resolved ad hoc.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub digest: Option<String>,
    pub size: Option<i64>,
    #[serde(skip)]
    pub parent: Option<Arc<Snapshot>>,
    pub parent_id: Option<SnapshotId>,
    pub created_at: String,
    pub state: SnapshotState,
}

impl Snapshot {
    pub fn new_prepared(id: SnapshotId, mountpoint: PathBuf, parent: Option<Arc<Snapshot>>) -> Result<Self, SnapshotError> {
        Ok(Self {
            parent_id: parent.as_ref().map(|p| p.id.clone()),
            id,
            digest: None,
            size: None,
            parent,
            created_at: proxmox_time::epoch_to_rfc3339_utc(proxmox_time::epoch_i64())?,
            state: SnapshotState::Prepared { mountpoint },
        })
    }

    /// Encode the persisted record (§6.4): `parent` is reconstructed by the
    /// caller from `parent_id` by looking the snapshotter's own table, the
    /// same way the teacher's task-state file round-trips through
    /// `serde_json` rather than keeping live references on disk.
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(data)?)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot {0:?} is not in the prepared state")]
    InvalidSnapshotState(String),
    /// §4.G "Fails with `snapshotNotPrepared(id)` if either input is not
    /// prepared" — raised for a `commit` target or explicit base that isn't
    /// in `Prepared` state, as distinct from other lifecycle misuse.
    #[error("snapshot {0:?} is not prepared")]
    SnapshotNotPrepared(SnapshotId),
    #[error("committed snapshot {0:?} has no layer digest")]
    MissingLayerDigest(String),
    #[error("tar differ failure: {0}")]
    TarDiffer(#[from] TarDifferError),
    #[error("directory diff failure: {0}")]
    DirectoryDiff(#[from] crate::directory_diff::DirectoryDiffError),
    #[error("content store failure: {0}")]
    ContentStore(#[from] crate::content_store::ContentStoreError),
    #[error("diff key failure: {0}")]
    DiffKey(#[from] crate::diff_key::DiffKeyError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timestamp formatting failed: {0}")]
    Timestamp(#[from] anyhow::Error),
    #[error("snapshot persistence failed: {0}")]
    Persistence(#[from] serde_json::Error),
}

/// Resource caps (§5, §9 "Global state"). `max_in_flight_bytes` is reserved
/// for a back-pressure facility; nothing in this crate enforces it yet.
#[derive(Clone, Debug)]
pub struct ResourceLimits {
    pub max_in_flight_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { max_in_flight_bytes: 64 * 1024 * 1024 }
    }
}

#[derive(Clone, Debug)]
pub struct TarArchiveSnapshotterConfiguration {
    pub working_root: PathBuf,
    pub inspector_options: InspectorOptions,
    pub resource_limits: ResourceLimits,
}

impl TarArchiveSnapshotterConfiguration {
    pub fn new(working_root: PathBuf) -> Self {
        Self {
            working_root,
            inspector_options: InspectorOptions::default(),
            resource_limits: ResourceLimits::default(),
        }
    }
}

/// Serialised single-actor entity: every method takes `&self` but mutates
/// state only through the internal mutex, matching §4.I's "serialised
/// actor" concurrency contract.
pub struct TarArchiveSnapshotter {
    config: TarArchiveSnapshotterConfiguration,
    tar_differ: TarArchiveDiffer,
    inner: Mutex<Inner>,
}

struct Inner {
    materialized_bases: HashMap<String, PathBuf>,
}

impl TarArchiveSnapshotter {
    pub fn new(
        config: TarArchiveSnapshotterConfiguration,
        inspector: Arc<dyn AttributeInspector>,
        hasher: Arc<dyn ContentHasher>,
        content_store: Arc<dyn ContentStore>,
    ) -> Self {
        let differ = DirectoryDiffer::new(inspector, hasher, config.inspector_options.clone());
        Self {
            config,
            tar_differ: TarArchiveDiffer::new(differ, content_store),
            inner: Mutex::new(Inner { materialized_bases: HashMap::new() }),
        }
    }

    /// §4.I `prepare(snap)`.
    pub async fn prepare(&self, snap: Snapshot) -> Result<Snapshot, SnapshotError> {
        let mountpoint = match &snap.state {
            SnapshotState::Prepared { mountpoint } => mountpoint.clone(),
            _ => return Err(SnapshotError::InvalidSnapshotState(snap.id.0.clone())),
        };
        tokio::fs::create_dir_all(&mountpoint).await?;

        if let Some(parent) = &snap.parent {
            match &parent.state {
                SnapshotState::Prepared { mountpoint: parent_mount } => {
                    let cache_key = layer_digest_or_string(parent);
                    self.inner.lock().await.materialized_bases.insert(cache_key, parent_mount.clone());
                }
                SnapshotState::Committed { .. } => {
                    // Best-effort: materialisation failure never aborts prepare (§4.I).
                    if let Err(err) = self.materialize(parent.clone()).await {
                        log::warn!("prepare({}): best-effort materialisation of parent failed: {err}", snap.id.0);
                    }
                }
                SnapshotState::InProgress { .. } => {}
            }
        }

        log::info!("prepare({}): ready at {}", snap.id.0, mountpoint.display());
        Ok(snap)
    }

    /// §4.I `commit(snap)` / `commit(snap, base)`.
    ///
    /// Both `snap` and an explicitly-supplied `base` must be `Prepared`
    /// (§4.G): neither is silently treated as absent when it exists but
    /// isn't ready to diff from.
    pub async fn commit(&self, snap: Snapshot, base: Option<Arc<Snapshot>>) -> Result<Snapshot, SnapshotError> {
        let target_mount = match &snap.state {
            SnapshotState::Prepared { mountpoint } => mountpoint.clone(),
            _ => return Err(SnapshotError::SnapshotNotPrepared(snap.id.clone())),
        };

        let base_for_differ = match &base {
            Some(explicit_base) => match &explicit_base.state {
                SnapshotState::Prepared { mountpoint } => Some((mountpoint.clone(), explicit_base.digest.clone())),
                _ => return Err(SnapshotError::SnapshotNotPrepared(explicit_base.id.clone())),
            },
            None => match &snap.parent {
                Some(parent) => match &parent.state {
                    SnapshotState::Prepared { mountpoint } => Some((mountpoint.clone(), parent.digest.clone())),
                    SnapshotState::Committed { .. } => {
                        let materialized = self.materialize(parent.clone()).await?;
                        Some((materialized, parent.digest.clone()))
                    }
                    SnapshotState::InProgress { .. } => None,
                },
                None => None,
            },
        };

        let base_digest = base.as_ref().and_then(|b| b.digest.clone()).or_else(|| base_for_differ.as_ref().and_then(|(_, d)| d.clone()));

        let diff_base = base_for_differ
            .as_ref()
            .map(|(mount, digest)| DiffBase { mount: mount.as_path(), digest: digest.clone() });
        let diff_target = DiffTarget { mount: &target_mount, identifier: snap.id.0.clone() };

        let descriptor = self
            .tar_differ
            .diff(diff_base.as_ref(), &diff_target, LayerFormat::Gzip, HashMap::new())
            .await?;

        let changes = self
            .directory_differ()
            .diff(base_for_differ.as_ref().map(|(mount, _)| mount.as_path()), &target_mount)
            .await?;
        let hasher = crate::content_diff::Sha256ContentHasher;
        let diff_key = crate::diff_key::compute_diff_key(base_digest.as_deref(), &target_mount, &changes, &hasher);

        let diff_id = descriptor
            .annotations
            .get("com.apple.container-build.layer.diff_id")
            .cloned();

        log::info!("commit({}): layer {} ({} bytes)", snap.id.0, descriptor.digest, descriptor.size);

        Ok(Snapshot {
            digest: Some(descriptor.digest.clone()),
            size: Some(descriptor.size),
            state: SnapshotState::Committed {
                layer_digest: descriptor.digest,
                layer_size: descriptor.size,
                layer_media_type: descriptor.media_type,
                diff_id,
                diff_key: Some(diff_key.to_string()),
            },
            ..snap
        })
    }

    /// §4.I `remove(snap)`.
    pub async fn remove(&self, snap: &Snapshot) -> Result<(), SnapshotError> {
        if let SnapshotState::Prepared { mountpoint } = &snap.state {
            if let Err(err) = tokio::fs::remove_dir_all(mountpoint).await {
                log::warn!("remove({}): best-effort mountpoint removal failed: {err}", snap.id.0);
            } else {
                log::info!("remove({}): mountpoint removed", snap.id.0);
            }
        }
        Ok(())
    }

    /// §4.I "Materialisation algorithm": rehydrate a committed lineage into a
    /// real directory, recursing through parents and caching by digest.
    pub async fn materialize(&self, snap: Arc<Snapshot>) -> Result<PathBuf, SnapshotError> {
        let (layer_digest, layer_media_type) = match &snap.state {
            SnapshotState::Committed { layer_digest, layer_media_type, .. } => (layer_digest.clone(), layer_media_type.clone()),
            _ => return Err(SnapshotError::MissingLayerDigest(snap.id.0.clone())),
        };

        if let Some(cached) = self.inner.lock().await.materialized_bases.get(&layer_digest).cloned() {
            return Ok(cached);
        }

        let sanitized = layer_digest.replace(':', "_");
        let destination = self.config.working_root.join("materialized").join(&sanitized);
        if destination.exists() {
            self.inner.lock().await.materialized_bases.insert(layer_digest, destination.clone());
            return Ok(destination);
        }

        if let Some(parent) = snap.parent.clone() {
            let parent_tree = match &parent.state {
                SnapshotState::Committed { .. } => Box::pin(self.materialize(parent)).await?,
                SnapshotState::Prepared { mountpoint } => mountpoint.clone(),
                SnapshotState::InProgress { .. } => return Err(SnapshotError::InvalidSnapshotState(parent.id.0.clone())),
            };
            copy_tree(&parent_tree, &destination).await?;
        } else {
            tokio::fs::create_dir_all(&destination).await?;
        }

        let content = self.tar_differ_content_store_get(&layer_digest).await?;
        let temp_layer = self.config.working_root.join("materialized").join(format!("{sanitized}.layer"));
        tokio::fs::write(&temp_layer, content).await?;

        self.tar_differ
            .apply_chain(&destination, &[(temp_layer.clone(), Some(layer_media_type))])
            .await?;
        let _ = tokio::fs::remove_file(&temp_layer).await;

        self.inner.lock().await.materialized_bases.insert(layer_digest, destination.clone());
        Ok(destination)
    }

    async fn tar_differ_content_store_get(&self, digest: &str) -> Result<Vec<u8>, SnapshotError> {
        let mut reader = self.content_store().get(&digest.to_string()).await?;
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await?;
        Ok(buf)
    }

    fn content_store(&self) -> &dyn ContentStore {
        self.tar_differ.content_store()
    }

    fn directory_differ(&self) -> &DirectoryDiffer {
        self.tar_differ.directory_differ()
    }
}

fn layer_digest_or_string(snap: &Snapshot) -> String {
    match &snap.state {
        SnapshotState::Committed { layer_digest, .. } => layer_digest.clone(),
        _ => snap.digest.clone().unwrap_or_else(|| snap.id.0.clone()),
    }
}

async fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dest).await?;
    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        let dest_path = dest.join(entry.file_name());
        if file_type.is_dir() {
            Box::pin(copy_tree(&entry.path(), &dest_path)).await?;
        } else if file_type.is_symlink() {
            let target = tokio::fs::read_link(&entry.path()).await?;
            let _ = tokio::fs::remove_file(&dest_path).await;
            tokio::fs::symlink(target, &dest_path).await?;
        } else {
            tokio::fs::copy(&entry.path(), &dest_path).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::PosixAttributeInspector;
    use crate::content_diff::Sha256ContentHasher;
    use crate::content_store::InMemoryContentStore;
    use std::fs;

    fn unique_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("container-layer-differ-snapshotter-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn snapshotter(working_root: PathBuf) -> TarArchiveSnapshotter {
        TarArchiveSnapshotter::new(
            TarArchiveSnapshotterConfiguration::new(working_root),
            Arc::new(PosixAttributeInspector),
            Arc::new(Sha256ContentHasher),
            Arc::new(InMemoryContentStore::new()),
        )
    }

    #[tokio::test]
    async fn prepare_requires_prepared_state() {
        let working_root = unique_dir("prepare-invalid");
        let snapshotter = snapshotter(working_root.clone());
        let snap = Snapshot {
            id: SnapshotId::generate(),
            digest: None,
            size: None,
            parent: None,
            parent_id: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            state: SnapshotState::InProgress { operation_id: "op-1".to_string() },
        };
        let err = snapshotter.prepare(snap).await.unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidSnapshotState(_)));
        let _ = fs::remove_dir_all(&working_root);
    }

    #[tokio::test]
    async fn prepare_creates_scratch_mountpoint() {
        let working_root = unique_dir("prepare-scratch");
        let snapshotter = snapshotter(working_root.clone());
        let mountpoint = working_root.join("mnt");
        let snap = Snapshot::new_prepared(SnapshotId::generate(), mountpoint.clone(), None).unwrap();

        let prepared = snapshotter.prepare(snap).await.unwrap();
        assert!(mountpoint.exists());
        assert!(prepared.state.can_execute());
        let _ = fs::remove_dir_all(&working_root);
    }

    #[tokio::test]
    async fn commit_scratch_snapshot_produces_layer_and_diff_key() {
        let working_root = unique_dir("commit-scratch");
        let snapshotter = snapshotter(working_root.clone());
        let mountpoint = working_root.join("mnt");
        fs::create_dir_all(&mountpoint).unwrap();
        fs::write(mountpoint.join("a.txt"), b"hello").unwrap();

        let snap = Snapshot::new_prepared(SnapshotId::generate(), mountpoint, None).unwrap();
        let committed = snapshotter.commit(snap, None).await.unwrap();
        assert!(committed.state.is_finalized());
        if let SnapshotState::Committed { diff_key, layer_digest, .. } = &committed.state {
            assert!(diff_key.is_some());
            assert!(layer_digest.starts_with("sha256:"));
        } else {
            panic!("expected committed state");
        }
        let _ = fs::remove_dir_all(&working_root);
    }

    #[tokio::test]
    async fn commit_requires_prepared_target_snapshot() {
        let working_root = unique_dir("commit-unprepared-target");
        let snapshotter = snapshotter(working_root.clone());
        let snap = Snapshot {
            id: SnapshotId::generate(),
            digest: None,
            size: None,
            parent: None,
            parent_id: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            state: SnapshotState::InProgress { operation_id: "op-1".to_string() },
        };
        let err = snapshotter.commit(snap, None).await.unwrap_err();
        assert!(matches!(err, SnapshotError::SnapshotNotPrepared(_)));
        let _ = fs::remove_dir_all(&working_root);
    }

    #[tokio::test]
    async fn commit_rejects_explicit_base_that_is_not_prepared() {
        let working_root = unique_dir("commit-unprepared-base");
        let snapshotter = snapshotter(working_root.clone());
        let mountpoint = working_root.join("mnt");
        fs::create_dir_all(&mountpoint).unwrap();

        let snap = Snapshot::new_prepared(SnapshotId::generate(), mountpoint, None).unwrap();
        let base = Arc::new(Snapshot {
            id: SnapshotId::generate(),
            digest: None,
            size: None,
            parent: None,
            parent_id: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            state: SnapshotState::InProgress { operation_id: "op-2".to_string() },
        });

        let err = snapshotter.commit(snap, Some(base.clone())).await.unwrap_err();
        assert!(matches!(err, SnapshotError::SnapshotNotPrepared(id) if id == base.id));
        let _ = fs::remove_dir_all(&working_root);
    }

    #[test]
    fn to_json_from_json_round_trips_committed_state() {
        let snap = Snapshot {
            id: SnapshotId::generate(),
            digest: Some("sha256:abc".to_string()),
            size: Some(42),
            parent: None,
            parent_id: Some(SnapshotId::generate()),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            state: SnapshotState::Committed {
                layer_digest: "sha256:abc".to_string(),
                layer_size: 42,
                layer_media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                diff_id: Some("sha256:def".to_string()),
                diff_key: Some("deadbeef".to_string()),
            },
        };

        let json = snap.to_json().unwrap();
        let restored = Snapshot::from_json(&json).unwrap();
        assert_eq!(restored.id, snap.id);
        assert_eq!(restored.parent_id, snap.parent_id);
        assert!(restored.parent.is_none());
        assert!(matches!(restored.state, SnapshotState::Committed { layer_digest, .. } if layer_digest == "sha256:abc"));
    }

    #[test]
    fn from_json_rejects_malformed_input() {
        let err = Snapshot::from_json("not json").unwrap_err();
        assert!(matches!(err, SnapshotError::Persistence(_)));
    }

    #[tokio::test]
    async fn remove_deletes_prepared_mountpoint() {
        let working_root = unique_dir("remove");
        let snapshotter = snapshotter(working_root.clone());
        let mountpoint = working_root.join("mnt");
        let snap = Snapshot::new_prepared(SnapshotId::generate(), mountpoint.clone(), None).unwrap();
        snapshotter.prepare(snap.clone()).await.unwrap();
        assert!(mountpoint.exists());

        snapshotter.remove(&snap).await.unwrap();
        assert!(!mountpoint.exists());
        let _ = fs::remove_dir_all(&working_root);
    }
}

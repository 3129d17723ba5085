//! Tar Archive Differ (§4.G): turns a directory diff into an OCI-compatible
//! tar layer, and applies a chain of such layers onto a root. Header and
//! entry construction follows the `tar::Header`/`tar::Builder` patterns this
//! codebase already uses for `pxar`-to-tar conversion in its backup-client
//! extraction path; whiteout handling follows the OCI/overlayfs convention.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::content_store::{ContentStore, ContentStoreError};
use crate::diff::{ChangePayload, Diff, DiffNodeKind};
use crate::directory_diff::{DirectoryDiffError, DirectoryDiffer};
use crate::path::BinaryPath;
use crate::xattr_codec::{self, XAttrEntry};

/// One of the four layer media types this crate knows about (§4.G).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerFormat {
    Uncompressed,
    Gzip,
    Zstd,
    EStarGz,
}

impl LayerFormat {
    pub fn media_type(self) -> &'static str {
        match self {
            Self::Uncompressed => "application/vnd.oci.image.layer.v1.tar",
            Self::Gzip | Self::Zstd | Self::EStarGz => "application/vnd.oci.image.layer.v1.tar+gzip",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Uncompressed => ".tar",
            _ => ".tar.gz",
        }
    }

    fn ensure_implemented(self) -> Result<(), TarDifferError> {
        match self {
            Self::Uncompressed | Self::Gzip => Ok(()),
            Self::Zstd => Err(TarDifferError::NotImplemented("zstd".to_string())),
            Self::EStarGz => Err(TarDifferError::NotImplemented("estargz".to_string())),
        }
    }
}

/// A blob description returned by `diff` (§3.6).
#[derive(Clone, Debug)]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    pub annotations: HashMap<String, String>,
}

/// The base side of a diff, if any: a prepared mountpoint plus the digest
/// used for DiffKey/annotation binding.
pub struct DiffBase<'a> {
    pub mount: &'a Path,
    pub digest: Option<String>,
}

/// The target side of a diff: always present.
pub struct DiffTarget<'a> {
    pub mount: &'a Path,
    pub identifier: String,
}

#[derive(thiserror::Error, Debug)]
pub enum TarDifferError {
    #[error("directory diff failed: {0}")]
    DirectoryDiff(#[from] DirectoryDiffError),
    #[error("content store error: {0}")]
    ContentStore(#[from] ContentStoreError),
    #[error("{0} is a reserved media type and is not implemented")]
    NotImplemented(String),
    #[error("compression failed for format {0}")]
    CompressionFailed(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("timestamp formatting failed: {0}")]
    Timestamp(#[from] anyhow::Error),
}

pub struct TarArchiveDiffer {
    differ: DirectoryDiffer,
    content_store: std::sync::Arc<dyn ContentStore>,
}

impl TarArchiveDiffer {
    pub fn new(differ: DirectoryDiffer, content_store: std::sync::Arc<dyn ContentStore>) -> Self {
        Self { differ, content_store }
    }

    pub(crate) fn content_store(&self) -> &dyn ContentStore {
        self.content_store.as_ref()
    }

    pub(crate) fn directory_differ(&self) -> &DirectoryDiffer {
        &self.differ
    }

    /// Produce an OCI-compatible tar layer for `target` against `base`
    /// (§4.G "Diff method contract").
    pub async fn diff(
        &self,
        base: Option<&DiffBase<'_>>,
        target: &DiffTarget<'_>,
        format: LayerFormat,
        mut annotations: HashMap<String, String>,
    ) -> Result<Descriptor, TarDifferError> {
        format.ensure_implemented()?;

        let diffs = self
            .differ
            .diff(base.map(|b| b.mount), target.mount)
            .await?;

        let (session, ingest_dir) = self.content_store.new_ingest_session().await?;
        let archive_path = match write_layer(&diffs, target.mount, &ingest_dir, format).await {
            Ok(path) => path,
            Err(err) => {
                let _ = self.content_store.cancel_ingest_session(session).await;
                return Err(err);
            }
        };
        let size = std::fs::metadata(&archive_path).map(|m| m.len() as i64).unwrap_or(0);
        let digest = self
            .content_store
            .complete_ingest_session(session)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TarDifferError::Io(io::Error::new(io::ErrorKind::Other, "ingest session completed with no digest")))?;

        annotations.insert("com.apple.container-build.diff.format".to_string(), format_label(format));
        annotations.insert(
            "com.apple.container-build.diff.created".to_string(),
            proxmox_time::epoch_to_rfc3339_utc(proxmox_time::epoch_i64())?,
        );
        annotations.insert(
            "com.apple.container-build.diff.base".to_string(),
            base.and_then(|b| b.digest.clone()).unwrap_or_else(|| "scratch".to_string()),
        );
        annotations.insert("com.apple.container-build.diff.target".to_string(), target.identifier.clone());

        Ok(Descriptor {
            media_type: format.media_type().to_string(),
            digest,
            size,
            annotations,
        })
    }

    /// Apply an ordered base→top layer chain onto `root` (§4.G "Apply method
    /// contract"). Returns decoded sidecar xattrs per path, collected but
    /// intentionally not applied (§9 open question).
    pub async fn apply_chain(
        &self,
        root: &Path,
        layers: &[(PathBuf, Option<String>)],
    ) -> Result<HashMap<BinaryPath, Vec<XAttrEntry>>, TarDifferError> {
        std::fs::create_dir_all(root)?;
        let root = root.to_path_buf();
        let layers = layers.to_vec();
        tokio::task::spawn_blocking(move || apply_chain_blocking(&root, &layers))
            .await
            .map_err(|_| TarDifferError::Io(io::Error::new(io::ErrorKind::Other, "apply_chain task panicked")))?
    }
}

fn format_label(format: LayerFormat) -> String {
    match format {
        LayerFormat::Uncompressed => "uncompressed",
        LayerFormat::Gzip => "gzip",
        LayerFormat::Zstd => "zstd",
        LayerFormat::EStarGz => "estargz",
    }
    .to_string()
}

async fn write_layer(diffs: &[Diff], target_mount: &Path, ingest_dir: &Path, format: LayerFormat) -> Result<PathBuf, TarDifferError> {
    let archive_path = ingest_dir.join(format!("layer{}", format.extension()));
    let diffs = diffs.to_vec();
    let target_mount = target_mount.to_path_buf();
    let archive_path_for_task = archive_path.clone();
    tokio::task::spawn_blocking(move || write_layer_blocking(&diffs, &target_mount, &archive_path_for_task, format))
        .await
        .map_err(|_| TarDifferError::Io(io::Error::new(io::ErrorKind::Other, "tar writer task panicked")))??;
    Ok(archive_path)
}

fn write_layer_blocking(diffs: &[Diff], target_mount: &Path, archive_path: &Path, format: LayerFormat) -> Result<(), TarDifferError> {
    let file = std::fs::File::create(archive_path)?;
    if matches!(format, LayerFormat::Gzip | LayerFormat::Zstd | LayerFormat::EStarGz) {
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        write_entries(&mut builder, diffs, target_mount)?;
        builder
            .into_inner()
            .map_err(|e| TarDifferError::CompressionFailed(e.to_string()))?
            .finish()
            .map_err(|e| TarDifferError::CompressionFailed(e.to_string()))?;
    } else {
        let mut builder = tar::Builder::new(file);
        write_entries(&mut builder, diffs, target_mount)?;
        builder.into_inner()?;
    }
    Ok(())
}

fn write_entries<W: Write>(builder: &mut tar::Builder<W>, diffs: &[Diff], target_mount: &Path) -> Result<(), TarDifferError> {
    for diff in diffs {
        match diff {
            Diff::Deleted { path } => append_whiteout(builder, path)?,
            Diff::Added { path, node, payload } => append_node(builder, path, *node, payload, target_mount)?,
            Diff::Modified { path, node, payload, .. } => append_node(builder, path, *node, payload, target_mount)?,
        }
    }
    Ok(())
}

fn append_node<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &BinaryPath,
    node: DiffNodeKind,
    payload: &ChangePayload,
    target_mount: &Path,
) -> Result<(), TarDifferError> {
    let Some(path_str) = path.string_value() else {
        log::warn!("skipping non-utf8 archive path during tar write: {path:?}");
        return Ok(());
    };

    match node {
        DiffNodeKind::Directory => append_directory(builder, path_str, payload)?,
        DiffNodeKind::Symlink => append_symlink(builder, path_str, payload)?,
        DiffNodeKind::Regular => append_regular(builder, path_str, payload, &target_mount.join(path_str))?,
        DiffNodeKind::Device | DiffNodeKind::Fifo | DiffNodeKind::Socket => {
            log::debug!("skipping non-materialisable special node {path_str} in layer write");
        }
    }

    if let Some(xattrs) = &payload.xattrs {
        if !xattrs.is_empty() {
            append_xattr_sidecar(builder, path_str, xattrs)?;
        }
    }
    Ok(())
}

fn base_header(payload: &ChangePayload, entry_type: tar::EntryType) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(payload.permissions.unwrap_or(0o644));
    header.set_uid(payload.uid.unwrap_or(0) as u64);
    header.set_gid(payload.gid.unwrap_or(0) as u64);
    let mtime_secs = payload.mtime_ns.unwrap_or(0) / 1_000_000_000;
    header.set_mtime(mtime_secs.max(0) as u64);
    header
}

fn append_directory<W: Write>(builder: &mut tar::Builder<W>, path_str: &str, payload: &ChangePayload) -> io::Result<()> {
    let mut header = base_header(payload, tar::EntryType::Directory);
    header.set_size(0);
    header.set_cksum();
    builder.append_data(&mut header, path_str, io::empty())
}

fn append_symlink<W: Write>(builder: &mut tar::Builder<W>, path_str: &str, payload: &ChangePayload) -> io::Result<()> {
    let mut header = base_header(payload, tar::EntryType::Symlink);
    header.set_size(0);
    let target = payload.link_target.clone().unwrap_or_default();
    header.set_link_name(Path::new(OsStr::from_bytes(&target)))?;
    header.set_cksum();
    builder.append_data(&mut header, path_str, io::empty())
}

fn append_regular<W: Write>(builder: &mut tar::Builder<W>, path_str: &str, payload: &ChangePayload, host_path: &Path) -> io::Result<()> {
    let mut file = std::fs::File::open(host_path)?;
    let len = file.metadata()?.len();
    let mut header = base_header(payload, tar::EntryType::Regular);
    header.set_size(len);
    header.set_cksum();
    builder.append_data(&mut header, path_str, &mut file)
}

fn append_whiteout<W: Write>(builder: &mut tar::Builder<W>, path: &BinaryPath) -> Result<(), TarDifferError> {
    let Some(path_str) = path.string_value() else {
        log::warn!("skipping non-utf8 path for whiteout entry: {path:?}");
        return Ok(());
    };
    let basename = String::from_utf8_lossy(path.last_path_component()).into_owned();
    let whiteout_path = match path.deleting_last_path_component() {
        Some(dir) => format!("{}/.wh.{basename}", dir.string_value().unwrap_or(path_str)),
        None => format!(".wh.{basename}"),
    };

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(0);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, whiteout_path, io::empty())?;
    Ok(())
}

fn append_xattr_sidecar<W: Write>(builder: &mut tar::Builder<W>, path_str: &str, xattrs: &[XAttrEntry]) -> Result<(), TarDifferError> {
    let mut sorted = xattrs.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let data = xattr_codec::encode(&sorted);

    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    header.set_cksum();
    builder.append_data(&mut header, format!(".container/xattrs/{path_str}.bin"), io::Cursor::new(data))?;
    Ok(())
}

fn apply_chain_blocking(root: &Path, layers: &[(PathBuf, Option<String>)]) -> Result<HashMap<BinaryPath, Vec<XAttrEntry>>, TarDifferError> {
    let mut sidecars: HashMap<BinaryPath, Vec<XAttrEntry>> = HashMap::new();
    for (layer_path, media_type) in layers {
        let is_gzip = media_type.as_deref().map(|m| m.contains("+gzip")).unwrap_or(true);
        let file = std::fs::File::open(layer_path)?;
        if is_gzip {
            apply_one_layer(root, tar::Archive::new(GzDecoder::new(file)), &mut sidecars)?;
        } else {
            apply_one_layer(root, tar::Archive::new(file), &mut sidecars)?;
        }
    }
    Ok(sidecars)
}

fn apply_one_layer<R: io::Read>(
    root: &Path,
    mut archive: tar::Archive<R>,
    sidecars: &mut HashMap<BinaryPath, Vec<XAttrEntry>>,
) -> Result<(), TarDifferError> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let normalized = match normalize_entry_path(&raw_path) {
            Some(p) => p,
            None => {
                return Err(TarDifferError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsafe entry path in layer: {}", raw_path.display()),
                )))
            }
        };

        let name = normalized.last_path_component();
        if name == b".wh..wh..opq" {
            let dir_abs = join_binary_path(root, &normalized.deleting_last_path_component());
            clear_directory_contents(&dir_abs)?;
            continue;
        }
        if let Some(victim_name) = name.strip_prefix(b".wh.") {
            let victim = match normalized.deleting_last_path_component() {
                Some(dir) => dir.appending(victim_name).ok(),
                None => BinaryPath::new(victim_name.to_vec()).ok(),
            };
            if let Some(victim) = victim {
                let victim_abs = join_binary_path(root, &Some(victim));
                remove_recursively(&victim_abs)?;
            }
            continue;
        }
        if let Some(target) = sidecar_target_path(&normalized) {
            let mut data = Vec::new();
            io::Read::read_to_end(&mut entry, &mut data)?;
            sidecars.insert(target, xattr_codec::decode(&data));
            continue;
        }

        let dest = join_binary_path(root, &Some(normalized));
        materialize_entry(&mut entry, &dest)?;
    }
    Ok(())
}

/// Strip a leading `./`, reject absolute paths and `..` components (§4.G).
fn normalize_entry_path(raw: &Path) -> Option<BinaryPath> {
    let bytes = raw.as_os_str().as_bytes();
    let bytes = bytes.strip_prefix(b"./").unwrap_or(bytes);
    if bytes.is_empty() {
        return None;
    }
    BinaryPath::new(bytes.to_vec()).ok()
}

fn join_binary_path(root: &Path, path: &Option<BinaryPath>) -> PathBuf {
    match path {
        Some(path) => root.join(OsStr::from_bytes(path.as_bytes())),
        None => root.to_path_buf(),
    }
}

fn sidecar_target_path(path: &BinaryPath) -> Option<BinaryPath> {
    let s = path.string_value()?;
    let inner = s.strip_prefix(".container/xattrs/")?.strip_suffix(".bin")?;
    BinaryPath::try_from(inner).ok()
}

fn clear_directory_contents(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn remove_recursively(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn materialize_entry<R: io::Read>(entry: &mut tar::Entry<'_, R>, dest: &Path) -> Result<(), TarDifferError> {
    let header = entry.header().clone();
    match header.entry_type() {
        tar::EntryType::Directory => {
            remove_recursively_if_not_dir(dest)?;
            std::fs::create_dir_all(dest)?;
            apply_mode(dest, header.mode()?)?;
            apply_times(dest, &header, false)?;
        }
        tar::EntryType::Symlink => {
            let target = entry
                .link_name_bytes()
                .map(|t| t.into_owned())
                .unwrap_or_default();
            remove_recursively(dest)?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(OsStr::from_bytes(&target), dest)?;
        }
        tar::EntryType::Regular | tar::EntryType::Continuous => {
            remove_recursively(dest)?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(dest)?;
            io::copy(entry, &mut out)?;
            apply_mode(dest, header.mode()?)?;
            apply_times(dest, &header, false)?;
        }
        tar::EntryType::Block | tar::EntryType::Char | tar::EntryType::Fifo => {
            log::debug!("skipping device/fifo node on apply: {}", dest.display());
        }
        other => {
            log::debug!("skipping unsupported entry type {other:?} on apply: {}", dest.display());
        }
    }
    Ok(())
}

fn remove_recursively_if_not_dir(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => std::fs::remove_file(path),
        _ => Ok(()),
    }
}

fn apply_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    allow_notsupp(std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)))
}

fn apply_times(path: &Path, header: &tar::Header, is_symlink: bool) -> io::Result<()> {
    let mtime = header.mtime().unwrap_or(0) as i64;
    let spec = nix::sys::time::TimeSpec::new(mtime, 0);
    let flag = if is_symlink {
        nix::sys::stat::UtimensatFlags::NoFollowSymlink
    } else {
        nix::sys::stat::UtimensatFlags::FollowSymlink
    };
    let result = nix::sys::stat::utimensat(None, path, &spec, &spec, flag);
    allow_notsupp(result.map_err(|e| io::Error::from_raw_os_error(e as i32)))
}

fn allow_notsupp(result: io::Result<()>) -> io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if matches!(err.raw_os_error(), Some(code) if code == libc::EOPNOTSUPP || code == libc::ENOTSUP) => Ok(()),
        Err(err) => Err(err),
    }
}

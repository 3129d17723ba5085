//! Attribute Inspector (§4.A): captures and normalises per-node POSIX
//! metadata, including extended attributes, into a [`NormalizedFileAttributes`]
//! record suitable for byte-exact comparison.

use std::collections::HashSet;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::{lstat, stat, FileStat};

use crate::xattr_codec::{canonical_xattr_key, XAttrEntry};

/// Node classification shared across attributes, diffs and the tar writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    Regular,
    Directory,
    Symlink,
    CharacterDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl NodeType {
    fn from_mode(mode: u32) -> Option<Self> {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Some(Self::Regular),
            libc::S_IFDIR => Some(Self::Directory),
            libc::S_IFLNK => Some(Self::Symlink),
            libc::S_IFCHR => Some(Self::CharacterDevice),
            libc::S_IFBLK => Some(Self::BlockDevice),
            libc::S_IFIFO => Some(Self::Fifo),
            libc::S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, Self::CharacterDevice | Self::BlockDevice)
    }
}

/// Canonical, comparable record for one filesystem node (§3.2).
#[derive(Clone, Debug, Default)]
pub struct NormalizedFileAttributes {
    pub node_type: Option<NodeType>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<i64>,
    pub mtime_ns: Option<i64>,
    pub ctime_ns: Option<i64>,
    pub device: Option<u64>,
    pub inode: Option<u64>,
    pub symlink_target: Option<Vec<u8>>,
    pub xattrs: Vec<XAttrEntry>,
    pub dev_major: Option<u32>,
    pub dev_minor: Option<u32>,
    pub nlink: Option<u64>,
}

/// Caller-supplied inspection policy (§3.7). Defaults match the spec exactly.
#[derive(Clone, Debug)]
pub struct InspectorOptions {
    pub enable_xattrs_capture: bool,
    pub xattr_ignore_list: HashSet<String>,
    pub xattr_max_bytes: usize,
    pub follow_symlinks: bool,
    pub timestamp_granularity_ns: i64,
}

impl Default for InspectorOptions {
    fn default() -> Self {
        Self {
            enable_xattrs_capture: false,
            xattr_ignore_list: HashSet::new(),
            xattr_max_bytes: 262_144,
            follow_symlinks: false,
            timestamp_granularity_ns: 1_000_000,
        }
    }
}

/// Errors raised while inspecting a single filesystem node (§7 `PathIO` /
/// `AttributeLimit`).
#[derive(thiserror::Error, Debug)]
pub enum InspectError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("io error during {op}: {source}")]
    Io { op: &'static str, source: Errno },
    #[error("xattrs for {path} exceed cap of {cap} bytes")]
    XAttrTooLarge { path: String, cap: usize },
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl InspectError {
    fn from_errno(op: &'static str, path: &Path, err: Errno) -> Self {
        match err {
            Errno::ENOENT => Self::NotFound(path.display().to_string()),
            Errno::EACCES | Errno::EPERM => Self::PermissionDenied(path.display().to_string()),
            other => Self::Io { op, source: other },
        }
    }
}

/// Capability trait for reading a node's canonical attributes, allowing a
/// test double to stand in for the real POSIX-backed implementation (§9
/// "Polymorphism").
pub trait AttributeInspector: Send + Sync {
    fn inspect(&self, path: &Path, options: &InspectorOptions) -> Result<NormalizedFileAttributes, InspectError>;
}

/// Default, `lstat`/`stat`-backed implementation.
#[derive(Default)]
pub struct PosixAttributeInspector;

impl AttributeInspector for PosixAttributeInspector {
    fn inspect(&self, path: &Path, options: &InspectorOptions) -> Result<NormalizedFileAttributes, InspectError> {
        let st = self.stat(path, options)?;
        let node_type = NodeType::from_mode(st.st_mode as u32);

        let mut attrs = NormalizedFileAttributes {
            node_type,
            mode: Some((st.st_mode as u32) & 0o7777),
            uid: Some(st.st_uid),
            gid: Some(st.st_gid),
            size: match node_type {
                Some(NodeType::Regular) | Some(NodeType::Symlink) => Some(st.st_size),
                _ => None,
            },
            mtime_ns: Some(floor_to_granularity(
                nanos(st.st_mtime, st.st_mtime_nsec),
                options.timestamp_granularity_ns,
            )),
            ctime_ns: Some(floor_to_granularity(
                nanos(st.st_ctime, st.st_ctime_nsec),
                options.timestamp_granularity_ns,
            )),
            device: Some(st.st_dev),
            inode: Some(st.st_ino),
            nlink: Some(st.st_nlink as u64),
            ..Default::default()
        };

        if node_type == Some(NodeType::Symlink) && !options.follow_symlinks {
            attrs.symlink_target = Some(std::fs::read_link(path).map_err(|e| {
                InspectError::from_errno("readlink", path, Errno::from_i32(e.raw_os_error().unwrap_or(0)))
            })?.as_os_str().as_bytes().to_vec());
        }

        if node_type.map(NodeType::is_device).unwrap_or(false) {
            let device = pxar::format::Device::from_dev_t(st.st_rdev);
            attrs.dev_major = Some(device.major as u32);
            attrs.dev_minor = Some(device.minor as u32);
        }

        if options.enable_xattrs_capture {
            attrs.xattrs = self.read_xattrs(path, options)?;
        }

        Ok(attrs)
    }
}

impl PosixAttributeInspector {
    fn stat(&self, path: &Path, options: &InspectorOptions) -> Result<FileStat, InspectError> {
        let result = if options.follow_symlinks {
            stat(path)
        } else {
            lstat(path)
        };
        result.map_err(|err| InspectError::from_errno("stat", path, err))
    }

    fn read_xattrs(&self, path: &Path, options: &InspectorOptions) -> Result<Vec<XAttrEntry>, InspectError> {
        let names = match xattr::list(path) {
            Ok(names) => names,
            Err(err) if is_unsupported(&err) => {
                log::debug!("xattrs unsupported for {}", path.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(InspectError::Unsupported(err.to_string())),
        };

        let mut total_bytes = 0usize;
        let mut entries = Vec::new();
        for name in names {
            let name_str = name.to_string_lossy().into_owned();
            let canonical = canonical_xattr_key(&name_str);
            if options.xattr_ignore_list.contains(&canonical) {
                continue;
            }
            let value = match xattr::get(path, &name) {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(err) if is_unsupported(&err) => continue,
                Err(err) => return Err(InspectError::Unsupported(err.to_string())),
            };
            total_bytes += value.len();
            if total_bytes > options.xattr_max_bytes {
                return Err(InspectError::XAttrTooLarge {
                    path: path.display().to_string(),
                    cap: options.xattr_max_bytes,
                });
            }
            entries.push((canonical, value));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

fn is_unsupported(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_i32),
        Some(Errno::EOPNOTSUPP) | Some(Errno::ENOTSUP)
    )
}

fn nanos(secs: i64, nsecs: i64) -> i64 {
    secs.saturating_mul(1_000_000_000).saturating_add(nsecs)
}

fn floor_to_granularity(nanos: i64, granularity: i64) -> i64 {
    if granularity <= 1 {
        return nanos;
    }
    nanos - nanos.rem_euclid(granularity)
}

/// Allow constructing a syscall-free `CString` for `/proc/self/fd/<fd>`-style
/// paths used by the apply path; kept here so both `attributes` and
/// `tar_differ` share one helper instead of re-deriving it.
pub(crate) fn proc_fd_path(fd: std::os::unix::io::RawFd) -> CString {
    CString::new(format!("/proc/self/fd/{fd}")).expect("fd-derived path never contains NUL")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn unique_dir(name: &str) -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("container-layer-differ-attrs-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn inspects_regular_file_mode_and_size() {
        let dir = unique_dir("regular");
        let file = dir.join("f.txt");
        fs::write(&file, b"hello").unwrap();
        let mut perms = fs::metadata(&file).unwrap().permissions();
        perms.set_mode(0o640);
        fs::set_permissions(&file, perms).unwrap();

        let inspector = PosixAttributeInspector;
        let attrs = inspector.inspect(&file, &InspectorOptions::default()).unwrap();
        assert_eq!(attrs.node_type, Some(NodeType::Regular));
        assert_eq!(attrs.mode, Some(0o640));
        assert_eq!(attrs.size, Some(5));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn symlink_target_captured_when_not_following() {
        let dir = unique_dir("symlink");
        let target = dir.join("target.txt");
        fs::write(&target, b"x").unwrap();
        let link = dir.join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let inspector = PosixAttributeInspector;
        let attrs = inspector.inspect(&link, &InspectorOptions::default()).unwrap();
        assert_eq!(attrs.node_type, Some(NodeType::Symlink));
        assert_eq!(attrs.symlink_target.as_deref(), Some(target.as_os_str().as_bytes()));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_path_is_not_found() {
        let inspector = PosixAttributeInspector;
        let err = inspector
            .inspect(Path::new("/nonexistent/path/should/not/exist"), &InspectorOptions::default())
            .unwrap_err();
        assert!(matches!(err, InspectError::NotFound(_)));
    }

    #[test]
    fn timestamp_is_floored_to_granularity() {
        assert_eq!(floor_to_granularity(1_500_999, 1_000_000), 1_000_000);
        assert_eq!(floor_to_granularity(999, 1_000_000), 0);
        assert_eq!(floor_to_granularity(42, 1), 42);
    }
}

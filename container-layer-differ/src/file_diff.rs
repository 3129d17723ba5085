//! File Differ (§4.D): orchestrates the metadata and content differs for a
//! single path pair into one verdict.

use std::path::Path;

use crate::attributes::NodeType;
use crate::content_diff::{content_changed, ContentHasher};
use crate::diff::ModifiedKind;
use crate::metadata_diff::{diff_metadata, MetadataVerdict};
use crate::attributes::NormalizedFileAttributes;

/// Final per-file verdict after combining metadata and (when applicable)
/// content comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileVerdict {
    NoChange,
    Modified(ModifiedKind),
}

/// Run the full per-file comparison (§4.D).
pub fn diff_file(
    hasher: &dyn ContentHasher,
    old_attrs: &NormalizedFileAttributes,
    new_attrs: &NormalizedFileAttributes,
    old_path: &Path,
    new_path: &Path,
) -> std::io::Result<FileVerdict> {
    match diff_metadata(old_attrs, new_attrs) {
        MetadataVerdict::TypeChanged => return Ok(FileVerdict::Modified(ModifiedKind::TypeChanged)),
        MetadataVerdict::SymlinkTargetChanged => {
            return Ok(FileVerdict::Modified(ModifiedKind::SymlinkTargetChanged))
        }
        metadata_verdict => {
            if old_attrs.node_type == Some(NodeType::Regular) && new_attrs.node_type == Some(NodeType::Regular) {
                if old_attrs.size != new_attrs.size {
                    return Ok(FileVerdict::Modified(ModifiedKind::ContentChanged));
                }
                if content_changed(hasher, old_path, new_path)? {
                    return Ok(FileVerdict::Modified(ModifiedKind::ContentChanged));
                }
            }
            Ok(match metadata_verdict.into_modified_kind() {
                Some(kind) => FileVerdict::Modified(kind),
                None => FileVerdict::NoChange,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_diff::Sha256ContentHasher;
    use std::fs;

    fn unique_dir(name: &str) -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("container-layer-differ-filediff-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn regular(size: i64) -> NormalizedFileAttributes {
        NormalizedFileAttributes {
            node_type: Some(NodeType::Regular),
            mode: Some(0o644),
            uid: Some(0),
            gid: Some(0),
            mtime_ns: Some(0),
            ctime_ns: Some(0),
            size: Some(size),
            ..Default::default()
        }
    }

    #[test]
    fn size_mismatch_short_circuits_hashing() {
        let dir = unique_dir("size-mismatch");
        let a = dir.join("a");
        let b = dir.join("b");
        fs::write(&a, b"short").unwrap();
        fs::write(&b, b"much much longer content").unwrap();

        let verdict = diff_file(&Sha256ContentHasher, &regular(5), &regular(24), &a, &b).unwrap();
        assert_eq!(verdict, FileVerdict::Modified(ModifiedKind::ContentChanged));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn same_size_same_bytes_propagates_metadata_verdict() {
        let dir = unique_dir("same-bytes");
        let a = dir.join("a");
        let b = dir.join("b");
        fs::write(&a, b"hello").unwrap();
        fs::write(&b, b"hello").unwrap();

        let verdict = diff_file(&Sha256ContentHasher, &regular(5), &regular(5), &a, &b).unwrap();
        assert_eq!(verdict, FileVerdict::NoChange);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn same_size_different_bytes_is_content_changed() {
        let dir = unique_dir("diff-bytes");
        let a = dir.join("a");
        let b = dir.join("b");
        fs::write(&a, b"aaaaa").unwrap();
        fs::write(&b, b"bbbbb").unwrap();

        let verdict = diff_file(&Sha256ContentHasher, &regular(5), &regular(5), &a, &b).unwrap();
        assert_eq!(verdict, FileVerdict::Modified(ModifiedKind::ContentChanged));
        fs::remove_dir_all(&dir).unwrap();
    }
}

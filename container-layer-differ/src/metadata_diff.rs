//! File Metadata Differ (§4.B): a pure function classifying the kind of
//! metadata change between two canonical attribute records.

use crate::attributes::{NodeType, NormalizedFileAttributes};
use crate::diff::ModifiedKind;
use crate::xattr_codec::encode_for_hashing;

/// Result of comparing two records' metadata, before any content hashing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataVerdict {
    NoChange,
    MetadataOnly,
    TypeChanged,
    SymlinkTargetChanged,
}

impl MetadataVerdict {
    pub fn into_modified_kind(self) -> Option<ModifiedKind> {
        match self {
            Self::NoChange => None,
            Self::MetadataOnly => Some(ModifiedKind::MetadataOnly),
            Self::TypeChanged => Some(ModifiedKind::TypeChanged),
            Self::SymlinkTargetChanged => Some(ModifiedKind::SymlinkTargetChanged),
        }
    }
}

/// Compare two attribute records and classify the change (§4.B).
pub fn diff_metadata(old: &NormalizedFileAttributes, new: &NormalizedFileAttributes) -> MetadataVerdict {
    if old.node_type != new.node_type {
        return MetadataVerdict::TypeChanged;
    }

    if old.node_type == Some(NodeType::Symlink) && old.symlink_target != new.symlink_target {
        return MetadataVerdict::SymlinkTargetChanged;
    }

    let is_regular = old.node_type == Some(NodeType::Regular);
    let size_is_metadata_relevant = !is_regular && old.size != new.size;

    if old.mode != new.mode
        || old.uid != new.uid
        || old.gid != new.gid
        || old.mtime_ns != new.mtime_ns
        || old.ctime_ns != new.ctime_ns
        || xattrs_digest(old) != xattrs_digest(new)
        || size_is_metadata_relevant
    {
        return MetadataVerdict::MetadataOnly;
    }

    MetadataVerdict::NoChange
}

fn xattrs_digest(attrs: &NormalizedFileAttributes) -> Vec<u8> {
    encode_for_hashing(&attrs.xattrs)
}

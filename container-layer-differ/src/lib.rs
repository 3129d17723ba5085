//! Snapshot differ and OCI layer builder for a native container build engine.
//!
//! Modules mirror the pipeline a build step drives end to end: attribute
//! normalisation ([`attributes`]), per-file and per-directory comparison
//! ([`metadata_diff`], [`content_diff`], [`file_diff`], [`directory_diff`]),
//! the resulting change set ([`diff`]), tar layer construction and
//! application ([`tar_differ`]), blob storage ([`content_store`]), cache-key
//! derivation ([`diff_key`]), and the snapshot lifecycle actor that ties them
//! together ([`snapshotter`]).

pub mod attributes;
pub mod content_diff;
pub mod content_store;
pub mod diff;
pub mod diff_key;
pub mod directory_diff;
pub mod file_diff;
pub mod metadata_diff;
pub mod path;
pub mod snapshotter;
pub mod tar_differ;
pub mod xattr_codec;

pub use attributes::{AttributeInspector, InspectError, InspectorOptions, NodeType, NormalizedFileAttributes, PosixAttributeInspector};
pub use content_diff::{ContentHasher, Sha256ContentHasher};
pub use content_store::{ContentDigest, ContentStore, ContentStoreError, IngestSessionId, InMemoryContentStore};
pub use diff::{ChangePayload, Diff, DiffNodeKind, ModifiedKind};
pub use diff_key::{DiffKey, DiffKeyError};
pub use directory_diff::{DirectoryDiffError, DirectoryDiffer};
pub use path::{BinaryPath, BinaryPathError};
pub use snapshotter::{
    ResourceLimits, Snapshot, SnapshotError, SnapshotId, SnapshotState, TarArchiveSnapshotter, TarArchiveSnapshotterConfiguration,
};
pub use tar_differ::{DiffBase, DiffTarget, Descriptor, LayerFormat, TarArchiveDiffer, TarDifferError};

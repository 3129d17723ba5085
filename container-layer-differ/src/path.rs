//! Relative, byte-preserving archive paths.
//!
//! Filesystem paths are not guaranteed to be valid UTF-8, but the diff and tar
//! pipelines need a path type that orders, compares and concatenates without
//! ever lossily reinterpreting bytes. [`BinaryPath`] wraps the raw bytes of a
//! POSIX relative path and forbids the `..`/`.`/leading-`/` forms that would
//! make later staging and whiteout logic ambiguous.

use std::cmp::Ordering;
use std::fmt;

/// A relative, POSIX-style path stored as raw bytes.
///
/// Invariants (enforced in [`BinaryPath::new`]): never starts with `/`, never
/// contains a `..` component, and is never exactly `.`.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct BinaryPath(Vec<u8>);

/// A path failed the relative/no-dotdot invariant.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BinaryPathError {
    #[error("path must not be empty")]
    Empty,
    #[error("path must not start with '/'")]
    Absolute,
    #[error("path must not be '.'")]
    CurrentDir,
    #[error("path must not contain '..' components")]
    ParentDir,
}

impl BinaryPath {
    /// Validate and wrap raw path bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, BinaryPathError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(BinaryPathError::Empty);
        }
        if bytes[0] == b'/' {
            return Err(BinaryPathError::Absolute);
        }
        if bytes == b"." {
            return Err(BinaryPathError::CurrentDir);
        }
        for component in bytes.split(|&b| b == b'/') {
            if component == b".." {
                return Err(BinaryPathError::ParentDir);
            }
        }
        Ok(Self(bytes))
    }

    /// Construct without validation; only for callers that already hold a
    /// path known to satisfy the invariant (e.g. one derived by appending to
    /// an already-valid `BinaryPath`).
    fn new_unchecked(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// UTF-8 rendering of the path, if it happens to be valid UTF-8.
    pub fn string_value(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// The final path component (the whole path if it has no `/`).
    pub fn last_path_component(&self) -> &[u8] {
        match self.0.iter().rposition(|&b| b == b'/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// The path with its last component removed, or `None` at the root.
    pub fn deleting_last_path_component(&self) -> Option<Self> {
        match self.0.iter().rposition(|&b| b == b'/') {
            Some(0) => None,
            Some(idx) => Some(Self::new_unchecked(self.0[..idx].to_vec())),
            None => None,
        }
    }

    /// Append a single path component.
    pub fn appending(&self, component: &[u8]) -> Result<Self, BinaryPathError> {
        if component.is_empty() || component == b".." || component == b"." {
            return Err(BinaryPathError::ParentDir);
        }
        let mut bytes = self.0.clone();
        bytes.push(b'/');
        bytes.extend_from_slice(component);
        Ok(Self::new_unchecked(bytes))
    }

    /// The path relative to `base`, if `self` is nested under `base`.
    pub fn relative_path(&self, from: &BinaryPath) -> Option<Self> {
        let base = &from.0;
        if self.0.len() == base.len() && self.0 == *base {
            return None;
        }
        if self.0.starts_with(base.as_slice()) && self.0.get(base.len()) == Some(&b'/') {
            Some(Self::new_unchecked(self.0[base.len() + 1..].to_vec()))
        } else {
            None
        }
    }
}

impl Ord for BinaryPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for BinaryPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for BinaryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.string_value() {
            Some(s) => write!(f, "BinaryPath({s:?})"),
            None => write!(f, "BinaryPath({:?})", self.0),
        }
    }
}

impl fmt::Display for BinaryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.string_value() {
            Some(s) => f.write_str(s),
            None => write!(f, "{}", String::from_utf8_lossy(&self.0)),
        }
    }
}

impl TryFrom<&str> for BinaryPath {
    type Error = BinaryPathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.as_bytes().to_vec())
    }
}

impl TryFrom<String> for BinaryPath {
    type Error = BinaryPathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value.into_bytes())
    }
}

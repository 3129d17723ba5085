//! Diff Key Computer (§4.H): turns an ordered [`Diff`] sequence into a
//! cache-addressable `DiffKey` via a canonical line encoding and a binary
//! Merkle tree, the same layered-hashing shape `pbs-datastore`'s index
//! formats use to make large change sets content-addressable.

use std::path::Path;

use openssl::sha::Sha256;

use crate::content_diff::ContentHasher;
use crate::diff::{ChangePayload, Diff, ModifiedKind};
use crate::xattr_codec::encode_for_hashing;

/// A canonical `sha256:<hex>` diff key (§3.5, §6.3).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DiffKey(String);

#[derive(thiserror::Error, Debug)]
pub enum DiffKeyError {
    #[error("diff key {0:?} is not of the form sha256:<64 hex chars>")]
    MalformedDiffKey(String),
}

impl DiffKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse and validate a canonical `sha256:<hex>` string. Uppercase,
    /// wrong length, non-hex or other prefixes are rejected (§6.3).
    pub fn parse(raw: &str) -> Result<Self, DiffKeyError> {
        let hex_part = raw
            .strip_prefix("sha256:")
            .ok_or_else(|| DiffKeyError::MalformedDiffKey(raw.to_string()))?;
        if hex_part.len() != 64 || !hex_part.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(DiffKeyError::MalformedDiffKey(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }
}

impl std::fmt::Display for DiffKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finish()
}

fn field_or_dash<T: std::fmt::Display>(value: Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "-".to_string(),
    }
}

fn link_target_field(payload: &ChangePayload) -> String {
    match &payload.link_target {
        Some(target) => hex::encode(target),
        None => "-".to_string(),
    }
}

fn xattrs_hash_field(payload: &ChangePayload) -> String {
    match &payload.xattrs {
        Some(xattrs) if !xattrs.is_empty() => {
            let mut sorted = xattrs.clone();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            format!("xh:{}", hex::encode(sha256(&encode_for_hashing(&sorted))))
        }
        _ => "xh:-".to_string(),
    }
}

/// Content hash field: only computed for regular files on `Added` or
/// `Modified{contentChanged}`, read from the target mount; absent (`-`) in
/// every other case, including a target file that's vanished since the diff
/// was taken (§4.H).
fn content_hash_field(
    is_regular: bool,
    needs_content_hash: bool,
    rel_path: &crate::path::BinaryPath,
    target_mount: &Path,
    hasher: &dyn ContentHasher,
) -> String {
    if !is_regular || !needs_content_hash {
        return "ch:-".to_string();
    }
    let full_path = target_mount.join(rel_path.string_value().unwrap_or_default());
    match hasher.hash_file(&full_path) {
        Ok(digest) => format!("ch:{}", hex::encode(digest)),
        Err(err) => {
            log::debug!("diff key: content hash unavailable for {rel_path}: {err}");
            "ch:-".to_string()
        }
    }
}

/// Render one `Diff` entry into its canonical comparison line (§4.H).
fn canonical_line(diff: &Diff, target_mount: &Path, hasher: &dyn ContentHasher) -> String {
    match diff {
        Diff::Added { path, node, payload } => {
            let is_regular = node.as_str() == "reg";
            format!(
                "A|{path}|{}|{}|{}|{}|{}|{}|{}",
                node.as_str(),
                field_or_dash(payload.permissions.or(Some(0))),
                field_or_dash(payload.uid),
                field_or_dash(payload.gid),
                link_target_field(payload),
                xattrs_hash_field(payload),
                content_hash_field(is_regular, true, path, target_mount, hasher),
            )
        }
        Diff::Modified { path, kind, node, payload } => {
            let is_regular = node.as_str() == "reg";
            let needs_content_hash = matches!(kind, ModifiedKind::ContentChanged);
            format!(
                "M|{path}|{}|{}|{}|{}|{}|{}|{}|{}",
                kind.as_str(),
                node.as_str(),
                field_or_dash(payload.permissions.or(Some(0))),
                field_or_dash(payload.uid),
                field_or_dash(payload.gid),
                link_target_field(payload),
                xattrs_hash_field(payload),
                content_hash_field(is_regular, needs_content_hash, path, target_mount, hasher),
            )
        }
        Diff::Deleted { path } => format!("D|{path}"),
    }
}

/// Combine two node hashes into their parent (§4.H "Merkle root" step 3).
fn parent_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(left);
    buf.extend_from_slice(right);
    sha256(&buf)
}

/// Fold ordered canonical lines into a single Merkle root. Odd levels
/// duplicate their last leaf; the empty set is the SHA-256 of the literal
/// `"empty"` (§4.H).
fn merkle_root(lines: &[String]) -> [u8; 32] {
    if lines.is_empty() {
        return sha256(b"empty");
    }
    let mut level: Vec<[u8; 32]> = lines.iter().map(|line| sha256(line.as_bytes())).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(parent_hash(left, right));
        }
        level = next;
    }
    level[0]
}

/// Compute the diff key for an ordered, deduplicated change set (§4.H).
/// `base_digest` is the base snapshot's canonical digest string, or `None`
/// for a scratch diff (folded in as the literal `"scratch"`).
pub fn compute_diff_key(
    base_digest: Option<&str>,
    target_mount: &Path,
    diffs: &[Diff],
    hasher: &dyn ContentHasher,
) -> DiffKey {
    let mut lines: Vec<String> = diffs
        .iter()
        .map(|d| canonical_line(d, target_mount, hasher))
        .collect();
    // Sort by the path slice (field position 2), ties by full-line order;
    // diffs are already path-sorted by `canonicalize`, but we re-sort here
    // since the key must be independent of traversal/insertion order.
    lines.sort_by(|a, b| path_field(a).cmp(path_field(b)).then_with(|| a.cmp(b)));

    let root = merkle_root(&lines);
    let base_tag = base_digest.unwrap_or("scratch");
    let domain_separated = format!("diffkey:v1|{base_tag}|{}", hex::encode(root));
    let digest = sha256(domain_separated.as_bytes());
    DiffKey(format!("sha256:{}", hex::encode(digest)))
}

fn path_field(line: &str) -> &str {
    line.splitn(3, '|').nth(1).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_diff::Sha256ContentHasher;
    use crate::diff::DiffNodeKind;
    use crate::path::BinaryPath;

    fn added(path: &str) -> Diff {
        Diff::Added {
            path: BinaryPath::try_from(path).unwrap(),
            node: DiffNodeKind::Regular,
            payload: ChangePayload::default(),
        }
    }

    fn empty_mount() -> std::path::PathBuf {
        std::env::temp_dir()
    }

    #[test]
    fn parses_well_formed_keys() {
        let key = DiffKey::parse(&format!("sha256:{}", "a".repeat(64))).unwrap();
        assert_eq!(key.as_str(), format!("sha256:{}", "a".repeat(64)));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(DiffKey::parse("sha256:short").is_err());
        assert!(DiffKey::parse("md5:deadbeef").is_err());
        assert!(DiffKey::parse(&format!("sha256:{}", "A".repeat(64))).is_err());
    }

    #[test]
    fn same_diffs_and_base_tag_produce_same_key() {
        let diffs = vec![added("a.txt"), added("b.txt")];
        let hasher = Sha256ContentHasher;
        let mount = empty_mount();
        let k1 = compute_diff_key(Some("sha256:aaaa"), &mount, &diffs, &hasher);
        let k2 = compute_diff_key(Some("sha256:aaaa"), &mount, &diffs, &hasher);
        assert_eq!(k1, k2);
    }

    #[test]
    fn different_base_tag_changes_the_key() {
        let diffs = vec![added("a.txt")];
        let hasher = Sha256ContentHasher;
        let mount = empty_mount();
        let k1 = compute_diff_key(Some("sha256:aaaa"), &mount, &diffs, &hasher);
        let k2 = compute_diff_key(Some("sha256:bbbb"), &mount, &diffs, &hasher);
        assert_ne!(k1, k2);
    }

    #[test]
    fn different_diffs_change_the_key() {
        let hasher = Sha256ContentHasher;
        let mount = empty_mount();
        let k1 = compute_diff_key(None, &mount, &[added("a.txt")], &hasher);
        let k2 = compute_diff_key(None, &mount, &[added("b.txt")], &hasher);
        assert_ne!(k1, k2);
    }

    #[test]
    fn empty_diff_set_is_deterministic() {
        let hasher = Sha256ContentHasher;
        let mount = empty_mount();
        let k1 = compute_diff_key(Some("base"), &mount, &[], &hasher);
        let k2 = compute_diff_key(Some("base"), &mount, &[], &hasher);
        assert_eq!(k1, k2);
    }

    #[test]
    fn order_independence_across_insertion_order() {
        let hasher = Sha256ContentHasher;
        let mount = empty_mount();
        let forward = vec![added("a.txt"), added("b.txt")];
        let backward = vec![added("b.txt"), added("a.txt")];
        assert_eq!(
            compute_diff_key(None, &mount, &forward, &hasher),
            compute_diff_key(None, &mount, &backward, &hasher)
        );
    }
}

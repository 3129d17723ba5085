//! Canonical encoding of extended-attribute entries.
//!
//! The same sorted `(key, value)` list is serialised two different, both
//! byte-stable ways: a length-prefixed binary form used for sidecar blobs in
//! layers, and a newline/base64 form used as the input to the per-path xattr
//! hash that feeds the diff key (see `diff_key.rs`).

use base64::Engine;

/// One canonicalised extended attribute: key already lowercased to
/// `namespace:name`, value as raw bytes.
pub type XAttrEntry = (String, Vec<u8>);

/// Lowercase `namespace:name`, replacing the first ASCII `.` with `:`.
pub fn canonical_xattr_key(raw_name: &str) -> String {
    let lower = raw_name.to_ascii_lowercase();
    match lower.find('.') {
        Some(idx) => {
            let mut out = String::with_capacity(lower.len());
            out.push_str(&lower[..idx]);
            out.push(':');
            out.push_str(&lower[idx + 1..]);
            out
        }
        None => lower,
    }
}

/// Encode entries (assumed already sorted by canonical key) into the stable
/// binary sidecar format: repeated `u32_be keyLen | key | u32_be valueLen | value`.
pub fn encode(entries: &[XAttrEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in entries {
        let key_bytes = key.as_bytes();
        out.extend_from_slice(&(key_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(key_bytes);
        out.extend_from_slice(&(value.len() as u32).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}

/// Decode the binary sidecar format. Tolerant: malformed input yields an
/// empty list rather than an error, matching the spec's "decode returns []
/// on malformed input" contract.
pub fn decode(mut data: &[u8]) -> Vec<XAttrEntry> {
    let mut entries = Vec::new();
    loop {
        match decode_one(&mut data) {
            Some(entry) => entries.push(entry),
            None => break,
        }
    }
    entries
}

fn decode_one(data: &mut &[u8]) -> Option<XAttrEntry> {
    let key_len = read_u32(data)? as usize;
    let key_bytes = read_exact(data, key_len)?;
    let key = String::from_utf8(key_bytes).ok()?;
    let value_len = read_u32(data)? as usize;
    let value = read_exact(data, value_len)?;
    Some((key, value))
}

fn read_u32(data: &mut &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[..4]);
    *data = &data[4..];
    Some(u32::from_be_bytes(buf))
}

fn read_exact(data: &mut &[u8], len: usize) -> Option<Vec<u8>> {
    if data.len() < len {
        return None;
    }
    let out = data[..len].to_vec();
    *data = &data[len..];
    Some(out)
}

/// The alternate "key\nbase64(value)\n" serialisation used as input to the
/// per-path xattrs SHA-256 hash in the diff key (§4.F/§4.H).
pub fn encode_for_hashing(entries: &[XAttrEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in entries {
        out.extend_from_slice(key.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(base64::engine::general_purpose::STANDARD.encode(value).as_bytes());
        out.push(b'\n');
    }
    out
}

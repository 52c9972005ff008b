use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len().saturating_mul(2));
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Content hash used for incremental-sync deduplication.
pub fn content_hash(content: &str) -> String {
    sha256_hex(content.as_bytes())
}

/// Deterministic record id derived from logical key parts.
///
/// The same parts always map to the same id, which is what makes re-sync an
/// upsert instead of an insert. Truncated to 32 hex chars to keep record ids
/// readable in queries.
pub fn record_id(parts: &[&str]) -> String {
    let joined = parts.join("\u{1f}");
    let mut id = sha256_hex(joined.as_bytes());
    id.truncate(32);
    id
}

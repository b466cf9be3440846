//! ST-006: BLAKE3 hashing of generated definitions.
//!
//! The API family embeds a digest of its generated definitions in the
//! deployment's logical id, so any shape change produces a new deployment.

use super::types::ResourceDefinition;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Digest over definitions sorted by logical id. Returns bare hex.
pub fn definitions_digest(definitions: &[ResourceDefinition]) -> String {
    let mut sorted: Vec<&ResourceDefinition> = definitions.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut hasher = blake3::Hasher::new();
    for def in sorted {
        hasher.update(def.id.as_bytes());
        hasher.update(b"\0");
        hasher.update(def.to_node().to_string().as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

/// Id-safe suffix: the first `len` hex chars of [`definitions_digest`].
pub fn deployment_suffix(definitions: &[ResourceDefinition], len: usize) -> String {
    let digest = definitions_digest(definitions);
    digest[..len.clamp(4, digest.len())].to_string()
}

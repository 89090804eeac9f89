use sha2::{Digest, Sha256};

/// Normalize a prompt for deduplication: lowercase, whitespace runs collapsed
/// to one space, trimmed.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex-encoded SHA-256 of the normalized prompt.
pub fn prompt_hash(prompt: &str) -> String {
    hex::encode(Sha256::digest(normalize_prompt(prompt).as_bytes()))
}

use sha2::{Digest, Sha256};

/// Masks an API key for logs and admin listings. Keys of 8 characters or
/// fewer are fully masked; longer keys keep 4 leading and 4 trailing
/// characters.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

/// SHA-256 of a client token, lowercase hex. This is the only form a token
/// is ever stored or looked up in.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

//! Cryptographically random identifiers and access tokens.
//!
//! All ids produced here match `^[A-Za-z0-9_-]+$` so they survive the
//! handoff sanitizer unchanged and are safe to embed in file names.

use ring::rand::{SecureRandom, SystemRandom};

/// Errors that can occur while generating identifiers.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("failed to generate random bytes")]
    RandomGeneration,
}

/// Fill `n` bytes from system entropy and hex-encode them.
fn random_hex(n: usize) -> Result<String, IdError> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; n];
    rng.fill(&mut bytes).map_err(|_| IdError::RandomGeneration)?;
    Ok(hex::encode(bytes))
}

/// A fresh handoff packet id, e.g. `ho_3f9c…` (16 random bytes).
pub fn packet_id() -> Result<String, IdError> {
    Ok(format!("ho_{}", random_hex(16)?))
}

/// An unforgeable access token (32 random bytes, hex-encoded).
pub fn access_token() -> Result<String, IdError> {
    random_hex(32)
}

/// A short session id (12 hex chars).
pub fn session_id() -> Result<String, IdError> {
    let full = random_hex(8)?;
    Ok(full[..12].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ids_are_unique_and_prefixed() {
        let a = packet_id().unwrap();
        let b = packet_id().unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("ho_"));
        assert_eq!(a.len(), 3 + 32);
    }

    #[test]
    fn tokens_are_identifier_safe() {
        let token = access_token().unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_ids_are_short() {
        assert_eq!(session_id().unwrap().len(), 12);
    }
}

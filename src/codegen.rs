use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

pub const CODE_LEN: usize = 6;

/// Encodes `seed` into `len` characters of the alphabet.
pub fn make_code(mut seed: u64, len: usize) -> String {
    let base = ALPHABET.len() as u64;

    let mut buf = vec![0u8; len];

    for b in &mut buf {
        *b = ALPHABET[(seed % base) as usize];

        seed /= base;
    }

    String::from_utf8(buf).unwrap_or_default()
}

/// Anonymous username for a connection that has not introduced itself.
/// The same peer and session id always produce the same alias.
pub fn anonymous_alias(peer: SocketAddr, session_id: u64) -> String {
    let mut hasher = DefaultHasher::new();

    peer.hash(&mut hasher);
    session_id.hash(&mut hasher);

    format!("Anon_{}", make_code(hasher.finish(), CODE_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_is_deterministic_per_identity() {
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        assert_eq!(anonymous_alias(peer, 7), anonymous_alias(peer, 7));
        assert_ne!(anonymous_alias(peer, 7), anonymous_alias(peer, 8));
    }

    #[test]
    fn alias_uses_code_alphabet() {
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        let alias = anonymous_alias(peer, 1);

        let code = alias.strip_prefix("Anon_").unwrap();
        assert_eq!(code.len(), CODE_LEN);
        assert!(code.bytes().all(|b| ALPHABET.contains(&b)));
    }
}

use sha2::{Digest, Sha256};
use std::path::Path;

/// Reduce a peer-supplied file name to a safe final path component.
///
/// Returns None for names that are empty, contain separators or parent
/// references, or would not survive the wire's frame limit.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    if name.is_empty() || name.len() > crate::net::MAXBUF {
        return None;
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return None;
    }
    let candidate = Path::new(name).file_name()?.to_str()?;
    if candidate.is_empty() {
        return None;
    }
    Some(candidate.to_string())
}

/// Short hex fingerprint of a public key blob, for logs and the console.
pub fn key_fingerprint(der: &[u8]) -> String {
    if der.is_empty() {
        return "-".to_string();
    }
    let digest = Sha256::digest(der);
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert_eq!(sanitize_file_name("report.txt").as_deref(), Some("report.txt"));
    }

    #[test]
    fn rejects_traversal_and_separators() {
        assert!(sanitize_file_name("../etc/passwd").is_none());
        assert!(sanitize_file_name("a/b.txt").is_none());
        assert!(sanitize_file_name("a\\b.txt").is_none());
        assert!(sanitize_file_name("").is_none());
    }

    #[test]
    fn fingerprint_is_stable() {
        let a = key_fingerprint(b"abc");
        let b = key_fingerprint(b"abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_eq!(key_fingerprint(b""), "-");
    }
}

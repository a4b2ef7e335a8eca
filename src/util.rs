//! Shared utility functions for the bookwright crate.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// Hex-encoded SHA-256 of a file's contents, streamed in 64 KiB blocks so
/// multi-gigabyte audio artifacts do not get pulled into memory.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Derive a stable file identifier from source content.
///
/// The first 16 hex characters of the content hash; long enough to be
/// collision-free across a library, short enough for directory names.
pub fn derive_file_id(content_hash: &str) -> String {
    content_hash.chars().take(16).collect()
}

/// Classify a source file into a coarse MIME class by extension.
pub fn mime_class(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("epub") => "application/epub+zip",
        Some("pdf") => "application/pdf",
        Some("txt") | Some("md") => "text/plain",
        Some("html") | Some("htm") | Some("xhtml") => "text/html",
        _ => "application/octet-stream",
    }
}

/// Truncate a string to a maximum number of characters, appending an
/// ellipsis when truncation happened.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("input.txt");
        fs::write(&path, b"chapter one").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_hex(b"chapter one"));
    }

    #[test]
    fn test_derive_file_id_is_prefix() {
        let hash = sha256_hex(b"abc");
        let id = derive_file_id(&hash);
        assert_eq!(id.len(), 16);
        assert!(hash.starts_with(&id));
    }

    #[test]
    fn test_mime_class() {
        assert_eq!(mime_class(Path::new("book.epub")), "application/epub+zip");
        assert_eq!(mime_class(Path::new("book.PDF")), "application/pdf");
        assert_eq!(mime_class(Path::new("notes.txt")), "text/plain");
        assert_eq!(mime_class(Path::new("mystery")), "application/octet-stream");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a very long string", 10), "a very ...");
    }

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"stderr noise {"status": "failed"} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"status": "failed"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }
}

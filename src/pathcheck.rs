//! Validation of client-supplied device paths.
//!
//! Every filesystem operation the HTTP surface performs on behalf of a
//! client goes through [`is_valid_path`] before the storage layer sees the
//! string. The rules are deliberately blunt: absolute device paths only, a
//! small character set, no parent references, bounded length.

pub const MAX_PATH_LEN: usize = 128;

/// Returns true when `path` is safe to hand to the storage layer.
pub fn is_valid_path(path: &str) -> bool {
    if path.is_empty() || !path.starts_with('/') {
        return false;
    }
    if path.len() > MAX_PATH_LEN {
        return false;
    }
    if path.contains("..") || path.contains('\\') {
        return false;
    }
    path.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | ' '))
}

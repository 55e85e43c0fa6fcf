use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

/// Normalize a user-supplied relative path to the canonical on-wire form:
/// forward slashes, no empty segments, no `..`, no `~` prefix, no Windows
/// drive form. A single standalone `.` is allowed and preserved. Interior
/// `.` segments are dropped. Returns the reason on rejection so callers can
/// attach their own error category.
pub fn normalize_relative(raw: &str) -> std::result::Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("path is empty".to_string());
    }
    let unified = trimmed.replace('\\', "/");
    if unified == "." {
        return Ok(unified);
    }
    if unified.starts_with('/') {
        return Err(format!("absolute paths are not allowed: {trimmed}"));
    }
    if unified.starts_with('~') {
        return Err(format!("home-relative paths are not allowed: {trimmed}"));
    }
    if is_windows_drive(&unified) {
        return Err(format!("drive-qualified paths are not allowed: {trimmed}"));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(format!("parent traversal is not allowed: {trimmed}"));
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Err(format!("path has no usable segments: {trimmed}"));
    }
    Ok(segments.join("/"))
}

fn is_windows_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Exactly 64 lowercase hex characters, the canonical SHA-256 text form.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Anchor a candidate path below the project root. The candidate must pass
/// the [`normalize_relative`] grammar, which is what keeps traversal,
/// absolute, and drive-qualified forms out; the root itself is resolved to
/// its real location so later filesystem access happens inside the project
/// tree.
pub fn resolve_under_root(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let relative = normalize_relative(&candidate.to_string_lossy()).map_err(|reason| {
        anyhow!(
            "refusing to anchor '{}' under {}: {reason}",
            candidate.display(),
            root.display()
        )
    })?;
    let root = root
        .canonicalize()
        .map_err(|err| anyhow!("project root {} is unreadable: {err}", root.display()))?;
    if relative == "." {
        Ok(root)
    } else {
        Ok(root.join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_backslashes_and_dot_segments() {
        assert_eq!(
            normalize_relative("db\\./migrations").unwrap(),
            "db/migrations"
        );
        assert_eq!(normalize_relative("./a/./b").unwrap(), "a/b");
    }

    #[test]
    fn standalone_dot_is_preserved() {
        assert_eq!(normalize_relative(".").unwrap(), ".");
    }

    #[test]
    fn rejects_escapes_and_absolutes() {
        assert!(normalize_relative("../up").is_err());
        assert!(normalize_relative("/etc/passwd").is_err());
        assert!(normalize_relative("~/secrets").is_err());
        assert!(normalize_relative("C:/Users/app").is_err());
    }

    #[test]
    fn anchoring_goes_through_the_relative_grammar() {
        let root = tempfile::tempdir().unwrap();
        let anchored = resolve_under_root(root.path(), Path::new("a/b")).unwrap();
        assert!(anchored.ends_with("a/b"));
        assert_eq!(
            resolve_under_root(root.path(), Path::new(".")).unwrap(),
            root.path().canonicalize().unwrap()
        );
        assert!(resolve_under_root(root.path(), Path::new("../out")).is_err());
        assert!(resolve_under_root(root.path(), Path::new("/etc")).is_err());
    }

    #[test]
    fn sha256_hex_is_strict() {
        assert!(is_sha256_hex(&"a".repeat(64)));
        assert!(!is_sha256_hex(&"A".repeat(64)));
        assert!(!is_sha256_hex(&"a".repeat(63)));
        assert!(!is_sha256_hex(&"g".repeat(64)));
    }
}

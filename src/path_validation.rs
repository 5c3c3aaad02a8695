use std::path::Path;

/// Maximum allowed path length for security
const MAX_PATH_LENGTH: usize = 4096;

/// Maximum length of a single file name fragment (label, device id, ...)
const MAX_COMPONENT_LENGTH: usize = 64;

/// Validate that a path is safe and doesn't contain suspicious patterns
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(format!("Path too long (max {MAX_PATH_LENGTH} bytes)"));
    }

    if path.bytes().any(|b| b == 0) {
        return Err("Path contains null bytes".to_string());
    }

    let path_str = Path::new(path).to_string_lossy();
    if path_str.contains("../") || path_str.contains("..\\") {
        return Err("Path traversal detected (../)".to_string());
    }

    if path_str.contains('$') || path_str.contains('`') {
        return Err("Path contains suspicious characters".to_string());
    }

    Ok(())
}

/// Validate that a path exists and is accessible
pub fn verify_path_exists(path: &Path) -> Result<(), String> {
    if !path.exists() {
        return Err(format!("Path does not exist: {}", path.display()));
    }

    Ok(())
}

/// Reduce a value to a file-name-safe fragment.
///
/// Whitespace is removed, anything outside `[A-Za-z0-9._-]` is dropped and
/// leading dots are stripped so the result can never name a hidden file or a
/// parent directory.
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    trimmed.chars().take(MAX_COMPONENT_LENGTH).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path_rejects_traversal() {
        assert!(validate_path("../etc/passwd").is_err());
        assert!(validate_path("..\\windows\\system32").is_err());
    }

    #[test]
    fn test_validate_path_rejects_null_bytes() {
        assert!(validate_path("test\0file").is_err());
    }

    #[test]
    fn test_validate_path_accepts_valid() {
        assert!(validate_path("/Volumes/GARMIN").is_ok());
        assert!(validate_path("E:\\").is_ok());
    }

    #[test]
    fn test_verify_path_exists() {
        let temp = tempfile::tempdir().unwrap();
        assert!(verify_path_exists(temp.path()).is_ok());
        assert!(verify_path_exists(&temp.path().join("missing")).is_err());
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("Ana Maria"), "AnaMaria");
        assert_eq!(sanitize_component("../../etc"), "etc");
        assert_eq!(sanitize_component("W-21/b"), "W-21b");
        assert_eq!(sanitize_component("3999999999"), "3999999999");
        assert_eq!(sanitize_component(&"x".repeat(100)).len(), 64);
    }
}

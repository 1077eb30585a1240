//! File name sanitization for the final object namespace.

/// Maximum accepted length of a sanitized file name, in bytes.
const MAX_FILE_NAME_LEN: usize = 255;

/// Sanitize a client-supplied file name.
///
/// Strips any path components (both separator styles) and rejects control
/// characters and names that come out empty. The result is a single plain
/// component, safe to join under the final storage namespace.
pub fn sanitize(name: &str) -> crate::Result<String> {
    // Keep only the last path component, whichever separator the client used.
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    if base.is_empty() || base == "." || base == ".." {
        return Err(crate::Error::InvalidFileName(format!(
            "empty after sanitization: {name:?}"
        )));
    }

    if base.chars().any(|c| c.is_control() || c == '\0') {
        return Err(crate::Error::InvalidFileName(format!(
            "control characters in {name:?}"
        )));
    }

    if base.len() > MAX_FILE_NAME_LEN {
        return Err(crate::Error::InvalidFileName(format!(
            "name too long: {} bytes (max {})",
            base.len(),
            MAX_FILE_NAME_LEN
        )));
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(sanitize("a.jpg").unwrap(), "a.jpg");
        assert_eq!(sanitize("holiday video.mp4").unwrap(), "holiday video.mp4");
        // Interior dot-dot is an ordinary substring once separators are gone.
        assert_eq!(
            sanitize("My Report..Final.pdf").unwrap(),
            "My Report..Final.pdf"
        );
        assert_eq!(sanitize("a..b.jpg").unwrap(), "a..b.jpg");
    }

    #[test]
    fn path_components_stripped() {
        assert_eq!(sanitize("/etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize("dir/sub/photo.png").unwrap(), "photo.png");
        assert_eq!(sanitize("C:\\Users\\x\\cat.gif").unwrap(), "cat.gif");
    }

    #[test]
    fn empty_and_dot_names_rejected() {
        assert!(sanitize("").is_err());
        assert!(sanitize("   ").is_err());
        assert!(sanitize(".").is_err());
        assert!(sanitize("..").is_err());
        assert!(sanitize("dir/").is_err());
    }

    #[test]
    fn control_characters_rejected() {
        assert!(sanitize("bad\u{0}name").is_err());
        assert!(sanitize("bad\nname").is_err());
    }

    #[test]
    fn overlong_rejected() {
        assert!(sanitize(&"x".repeat(300)).is_err());
    }
}

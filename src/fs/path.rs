use core::cmp::min;

use crate::error::FsError;
use crate::param::DIRSIZ;

/// A single path segment, fit for a directory entry.
#[derive(PartialEq, Debug)]
#[repr(transparent)]
pub struct FileName {
    // Invariant:
    // - Non-empty ASCII with no '/' and no NUL.
    // - Not longer than DIRSIZ bytes.
    inner: str,
}

impl FileName {
    /// Validates `name` as a directory entry name.
    pub fn new(name: &str) -> Result<&Self, FsError> {
        if name.is_empty() {
            return Err(FsError::NotFound);
        }
        if name.len() > DIRSIZ {
            return Err(FsError::NameTooLong);
        }
        if !name.is_ascii() || name.bytes().any(|b| b == b'/' || b == 0) {
            return Err(FsError::NotFound);
        }
        // SAFETY: `&FileName` is layout-compatible with `str` because
        // of its attribute `#[repr(transparent)]`, and the checks above
        // establish the invariant.
        Ok(unsafe { &*(name as *const str as *const Self) })
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }
}

/// A borrowed path string. Tokenization never mutates or copies the
/// underlying buffer.
#[repr(transparent)]
pub struct Path {
    inner: str,
}

impl Path {
    pub fn new(path: &str) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `str` because of
        // its attribute `#[repr(transparent)]`.
        unsafe { &*(path as *const str as *const Self) }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Returns `Some((path, name))` where,
    ///  - `name` is the next path element from `self`, and
    ///  - `path` is the remaining path, trailing slashes included.
    ///
    /// A remainder consisting only of slashes still yields `None` on
    /// the next call, which is how a trailing slash resolves to an
    /// empty final segment.
    ///
    /// ```
    /// use sectorfs::fs::Path;
    ///
    /// let (rest, name) = Path::new("a/bb/c").skipelem().unwrap();
    /// assert_eq!((rest.as_str(), name), ("bb/c", "a"));
    ///
    /// let (rest, name) = Path::new("///a//bb").skipelem().unwrap();
    /// assert_eq!((rest.as_str(), name), ("//bb", "a"));
    ///
    /// let (rest, name) = Path::new("a/").skipelem().unwrap();
    /// assert_eq!((rest.as_str(), name), ("/", "a"));
    ///
    /// assert!(Path::new("").skipelem().is_none());
    /// assert!(Path::new("////").skipelem().is_none());
    /// ```
    pub fn skipelem(&self) -> Option<(&Self, &str)> {
        let bytes = self.inner.as_bytes();

        let start = bytes.iter().position(|b| *b != b'/')?;
        let len = bytes[start..]
            .iter()
            .position(|b| *b == b'/')
            .unwrap_or(bytes.len() - start);

        let name = &self.inner[start..start + len];
        let rest = Self::new(&self.inner[min(start + len, self.inner.len())..]);
        Some((rest, name))
    }

    /// Returns `true` if the path begins with `'/'`.
    pub fn is_absolute(&self) -> bool {
        self.inner.starts_with('/')
    }

    pub fn is_empty_string(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(path: &str) -> Option<(&str, &str)> {
        Path::new(path)
            .skipelem()
            .map(|(rest, name)| (rest.as_str(), name))
    }

    #[test]
    fn skipelem_walks_segments() {
        assert_eq!(split("a/bb/c"), Some(("bb/c", "a")));
        assert_eq!(split("///a//bb"), Some(("//bb", "a")));
        assert_eq!(split("a"), Some(("", "a")));
        assert_eq!(split("a/"), Some(("/", "a")));
        assert_eq!(split(""), None);
        assert_eq!(split("////"), None);
    }

    #[test]
    fn skipelem_keeps_dot_segments() {
        assert_eq!(split("./x"), Some(("x", ".")));
        assert_eq!(split("../x"), Some(("x", "..")));
    }

    #[test]
    fn absolute_and_empty() {
        assert!(Path::new("/a").is_absolute());
        assert!(!Path::new("a/b").is_absolute());
        assert!(Path::new("").is_empty_string());
    }

    #[test]
    fn file_name_bounds() {
        assert!(FileName::new("ok").is_ok());
        assert!(FileName::new("12345678901234").is_ok());
        assert_eq!(
            FileName::new("123456789012345").unwrap_err(),
            FsError::NameTooLong
        );
        assert!(FileName::new("").is_err());
        assert!(FileName::new("a/b").is_err());
        assert!(FileName::new("héllo").is_err());
    }
}

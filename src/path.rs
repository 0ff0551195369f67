//! Virtual path handling
//!
//! Virtual paths are absolute, `/`-separated, and carry no trailing
//! separator; the root is `/`. Paths local to a mount are relative with no
//! leading separator; the mount's own root is the empty string.

/// Standardize an absolute path
///
/// Backslashes count as separators. `.` components vanish, `..` pops one
/// component and stops at the root.
pub fn standardize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Resolve `path` against `cwd` when relative, then standardize
pub fn resolve(path: &str, cwd: &str) -> String {
    if path.starts_with('/') || path.starts_with('\\') {
        standardize(path)
    } else {
        standardize(&format!("{}/{}", cwd, path))
    }
}

/// Join a child name onto a standardized directory path
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Parent of a standardized path; the root is its own parent
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

/// Last component of a standardized path; empty for the root
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Path below `mount_point`, if `path` lies inside it
///
/// Both arguments must be standardized. Returns `""` for the mount point
/// itself. A prefix only matches at a component boundary, so `/ab` is not
/// inside `/a`.
pub fn strip_mount_point<'a>(path: &'a str, mount_point: &str) -> Option<&'a str> {
    if mount_point == "/" {
        return Some(path.trim_start_matches('/'));
    }
    let rest = path.strip_prefix(mount_point)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('/')
    }
}

/// Name of the child of `dir` on the way down to `descendant`, if any
///
/// Used to surface mount points as entries of their ancestor directories.
pub fn child_toward<'a>(dir: &str, descendant: &'a str) -> Option<&'a str> {
    let rest = strip_mount_point(descendant, dir)?;
    if rest.is_empty() {
        return None;
    }
    rest.split('/').next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standardize() {
        assert_eq!(standardize("/a//b/./c/"), "/a/b/c");
        assert_eq!(standardize("/a/b/../c"), "/a/c");
        assert_eq!(standardize("/../.."), "/");
        assert_eq!(standardize("\\models\\box.egg"), "/models/box.egg");
        assert_eq!(standardize(""), "/");
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("c/d", "/a/b"), "/a/b/c/d");
        assert_eq!(resolve("../d", "/a/b"), "/a/d");
        assert_eq!(resolve("/x", "/a/b"), "/x");
    }

    #[test]
    fn test_strip_mount_point() {
        assert_eq!(strip_mount_point("/a/b/c", "/a"), Some("b/c"));
        assert_eq!(strip_mount_point("/a", "/a"), Some(""));
        assert_eq!(strip_mount_point("/ab", "/a"), None);
        assert_eq!(strip_mount_point("/a/b", "/"), Some("a/b"));
        assert_eq!(strip_mount_point("/", "/"), Some(""));
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(parent("/a/b"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(file_name("/"), "");
        assert_eq!(join("/", "x"), "/x");
        assert_eq!(join("/a", "x"), "/a/x");
    }

    #[test]
    fn test_child_toward() {
        assert_eq!(child_toward("/", "/mnt/data"), Some("mnt"));
        assert_eq!(child_toward("/mnt", "/mnt/data"), Some("data"));
        assert_eq!(child_toward("/mnt/data", "/mnt/data"), None);
        assert_eq!(child_toward("/other", "/mnt/data"), None);
    }
}

//! Relative-path normalization and the long-path escape boundary transform.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Threshold (in characters) above which an absolute path is escaped on platforms
/// that impose a conventional maximum path length.
const LONG_PATH_THRESHOLD: usize = 240;

/// Normalizes a path (relative or absolute-looking) into the canonical relative-path
/// form used as a metadata key: forward slashes, no leading slash, no trailing slash.
pub fn normalize_rel(raw: &str) -> String {
    let replaced = raw.replace('\\', "/");
    let trimmed = replaced.trim_matches('/');
    trimmed.to_string()
}

/// Strips `base` from `abs` and normalizes the remainder into a relative path key.
pub fn relativize(base: &Path, abs: &Path) -> String {
    let rel = abs.strip_prefix(base).unwrap_or(abs);
    normalize_rel(&rel.to_string_lossy())
}

/// Depth of a normalized relative path, counted in directory separators.
pub fn depth(rel: &str) -> usize {
    rel.matches('/').count()
}

/// Escapes an absolute path for filesystem calls if it exceeds the long-path
/// threshold. This is a pure boundary transform: callers only ever pass the
/// result to a syscall, never back into a relative path or a metadata key.
#[cfg(windows)]
pub fn escape_long_path(abs: &Path) -> PathBuf {
    let s = abs.to_string_lossy();
    if s.len() <= LONG_PATH_THRESHOLD || s.starts_with(r"\\?\") {
        return abs.to_path_buf();
    }
    PathBuf::from(format!(r"\\?\{s}"))
}

#[cfg(not(windows))]
pub fn escape_long_path(abs: &Path) -> PathBuf {
    let _ = LONG_PATH_THRESHOLD;
    abs.to_path_buf()
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(c)) if c == OsStr::new("~") => {
            let mut out = home_dir();
            for c in components {
                out.push(c.as_os_str());
            }
            out
        }
        _ => path.to_path_buf(),
    }
}

fn clean_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => {
                if !pop_normal_component(&mut out) && !out.as_os_str().is_empty() {
                    out.push("..");
                }
            }
            Component::Normal(p) => out.push(p),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn pop_normal_component(path: &mut PathBuf) -> bool {
    let mut comps = path.components().collect::<Vec<_>>();
    match comps.pop() {
        Some(Component::Normal(_)) => {
            *path = rebuild_components(&comps);
            true
        }
        Some(Component::Prefix(_)) | Some(Component::RootDir) | None => false,
        Some(Component::CurDir) | Some(Component::ParentDir) => {
            *path = rebuild_components(&comps);
            false
        }
    }
}

fn rebuild_components(components: &[Component<'_>]) -> PathBuf {
    let mut out = PathBuf::new();
    for c in components {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => out.push(".."),
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

/// Resolves `path` to an absolute, lexically-cleaned form, expanding a leading `~`.
/// Does not require the path to exist.
pub fn absolutize(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    let abs = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    };
    clean_lexical(&abs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rel_converts_backslashes_and_trims_slashes() {
        assert_eq!(normalize_rel(r"a\b\c.md"), "a/b/c.md");
        assert_eq!(normalize_rel("/a/b/"), "a/b");
        assert_eq!(normalize_rel("a/b"), "a/b");
    }

    #[test]
    fn depth_counts_separators() {
        assert_eq!(depth("a.md"), 0);
        assert_eq!(depth("a/b.md"), 1);
        assert_eq!(depth("a/b/c.md"), 2);
    }

    #[test]
    fn absolutize_is_idempotent() {
        let once = absolutize(Path::new("some/rel/dir"));
        let twice = absolutize(&once);
        assert_eq!(once, twice);
    }

    #[cfg(not(windows))]
    #[test]
    fn escape_long_path_is_identity_on_unix() {
        let p = Path::new("/tmp/short");
        assert_eq!(escape_long_path(p), p.to_path_buf());
    }
}

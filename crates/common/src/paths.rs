//! Slash-separated path helpers shared by the exporter and the worker.
//!
//! Wire paths are absolute within their export root: a leading `/`, no
//! trailing `/`, the root itself is `/`. Filesystem-side paths are the same
//! without the leading slash, the root being the empty string.

/// Normalize to the wire form.
pub fn normalize(path: &str) -> String {
    let path = path.trim();
    let mut out = String::with_capacity(path.len() + 1);
    for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
        out.push('/');
        out.push_str(component);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Strip the leading slash: `/a/b` becomes `a/b`, `/` becomes ``.
pub fn relative(path: &str) -> &str {
    path.trim_start_matches('/').trim_end_matches('/')
}

/// Whether `path` equals `prefix` or lies below it, comparing whole components.
pub fn has_dir_prefix(path: &str, prefix: &str) -> bool {
    let path = relative(path);
    let prefix = relative(prefix);
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Parent in wire form.
pub fn parent(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => normalized[..pos].to_string(),
    }
}

/// Final component, empty for the root.
pub fn file_name(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Join a child name onto a directory, in wire form.
pub fn join(dir: &str, name: &str) -> String {
    let dir = normalize(dir);
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Join for filesystem-side (relative) paths.
pub fn join_relative(dir: &str, name: &str) -> String {
    let dir = relative(dir);
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

//! Pure path normalisation for the virtual filesystem.
//!
//! All paths handed to [`crate::MemFs`] go through [`normalize_path`] first,
//! so the tree only ever sees canonical absolute paths.

/// Normalise a path: collapse `//` and `.`, resolve `..` without ever
/// escaping the root, strip any trailing `/`, and prepend `/` if missing.
///
/// Idempotent: `normalize_path(normalize_path(p)) == normalize_path(p)`.
pub fn normalize_path(path: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {},
            // `..` at the root stays at the root.
            ".." => {
                stack.pop();
            },
            segment => stack.push(segment),
        }
    }
    if stack.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", stack.join("/"))
    }
}

/// Split an already-normalised path into its segments. The root has none.
pub fn path_segments(normalized: &str) -> Vec<&str> {
    normalized.split('/').filter(|s| !s.is_empty()).collect()
}

/// Parent directory and final component of a normalised path.
/// Returns `None` for the root.
pub fn split_parent(normalized: &str) -> Option<(String, String)> {
    let segments = path_segments(normalized);
    let name = segments.last()?.to_string();
    let parent = if segments.len() == 1 {
        "/".to_string()
    } else {
        format!("/{}", segments[..segments.len() - 1].join("/"))
    };
    Some((parent, name))
}

/// Resolve `relative` against the directory `base_dir`.
pub fn join_path(base_dir: &str, relative: &str) -> String {
    normalize_path(&format!("{base_dir}/{relative}"))
}

//! POSIX-style path normalization for the sandbox filesystem.
//!
//! Every path crossing the engine boundary is canonical: absolute, no `.` or
//! `..` components, no trailing slash (except the root itself). The sandbox
//! has no notion of a host filesystem, so these helpers are pure string
//! transforms.

/// Normalize a path against a working directory.
///
/// Relative paths are joined onto `cwd`; `.` components are dropped and `..`
/// pops the previous component, clamping at the root. Backslashes are treated
/// as separators so Windows-style input cannot smuggle components past the
/// resolver.
pub fn normalize(path: &str, cwd: &str) -> String {
    let input = path.replace('\\', "/");
    let base = if input.starts_with('/') {
        input
    } else if cwd == "/" || cwd.is_empty() {
        format!("/{input}")
    } else {
        format!("{cwd}/{input}")
    };

    let mut out: Vec<&str> = Vec::new();
    for part in base.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            _ => out.push(part),
        }
    }

    if out.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", out.join("/"))
    }
}

/// First path component as `/name`, or `/` for the root itself.
///
/// Used to derive the bounded set of roots walked when collecting files back
/// out of an auxiliary runtime.
pub fn top_root(path: &str) -> String {
    let normalized = normalize(path, "/");
    match normalized.split('/').find(|part| !part.is_empty()) {
        Some(first) => format!("/{first}"),
        None => "/".to_string(),
    }
}

/// Direct children of `dir` among `paths`, deduplicated and sorted.
///
/// A path nested more than one level deep contributes only its first
/// component below `dir`.
pub fn list_children<'a>(paths: impl IntoIterator<Item = &'a str>, dir: &str) -> Vec<String> {
    let prefix = if dir == "/" {
        "/".to_string()
    } else {
        format!("{dir}/")
    };

    let mut names: Vec<String> = Vec::new();
    for path in paths {
        let Some(rest) = path.strip_prefix(&prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        let name = match rest.find('/') {
            Some(slash) => &rest[..slash],
            None => rest,
        };
        if !name.is_empty() && !names.iter().any(|existing| existing == name) {
            names.push(name.to_string());
        }
    }
    names.sort();
    names
}

//! Volume path construction and safety checks
//!
//! A volume path must be absolute and at least two levels deep, so a helper
//! pod only ever mounts the parent directory of a volume and never `/`.

use crate::error::{Error, Result};

/// Join `base_path` and `volume_id` into a validated volume path
pub fn build_path(base_path: &str, volume_id: &str) -> Result<String> {
    let candidate = format!("{}/{}", base_path, volume_id);
    let segments = segments(&candidate)?;
    check_depth(&candidate, &segments)?;
    Ok(format!("/{}", segments.join("/")))
}

/// Split a volume path into the directory mounted into a helper pod and the
/// sub directory the helper operates on.
pub fn split_for_mount(path: &str) -> Result<(String, String)> {
    let segments = segments(path)?;
    check_depth(path, &segments)?;

    let (leaf, parent) = segments
        .split_last()
        .ok_or_else(|| unsafe_path(path, "path has no leaf directory"))?;

    if !is_safe_segment(leaf) {
        return Err(unsafe_path(path, "volume directory contains unsupported characters"));
    }

    Ok((format!("/{}", parent.join("/")), leaf.to_string()))
}

/// Directory names allowed inside helper commands
pub(crate) fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn segments(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(unsafe_path(path, "path is not absolute"));
    }

    let mut out = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(unsafe_path(path, "path must not contain '..'")),
            s => out.push(s),
        }
    }
    Ok(out)
}

fn check_depth(path: &str, segments: &[&str]) -> Result<()> {
    match segments.len() {
        0 => Err(unsafe_path(path, "path should not be a root directory")),
        1 => Err(unsafe_path(path, "volume directory should not be under root directory")),
        _ => Ok(()),
    }
}

fn unsafe_path(path: &str, reason: &str) -> Error {
    Error::UnsafePath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

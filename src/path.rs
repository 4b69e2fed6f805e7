//! Platform path resolution.
//!
//! Clients name objects as `Share.dir.leaf` with `.` as the separator. The
//! resolver maps that onto a host path rooted at the share's directory. The
//! path bytes arrive from the network, so components may carry hostile host
//! separators or `..`; the traversal guard runs on the relative tail alone,
//! never on the combined absolute path.

use crate::config::{Config, ShareConfig};
use crate::riscos;
use std::fs;
use std::path::{Path, PathBuf};

/// Resolved host paths longer than this fail, mirroring the fixed-size
/// buffers the protocol was designed around.
pub const MAX_HOST_PATH: usize = 512;

/// Resolves a platform path to `(share, host_path)`.
///
/// Returns `None` when the share is unknown, the tail trips the traversal
/// guard, or the result would exceed [`MAX_HOST_PATH`].
pub fn resolve<'a>(config: &'a Config, platform_path: &str) -> Option<(&'a ShareConfig, PathBuf)> {
    let (share_name, rest) = match platform_path.split_once('.') {
        Some((share, rest)) => (share, rest),
        None => (platform_path, ""),
    };
    let share = config.find_share(share_name)?;

    let mut host = share.path.clone();
    let mut components = 0usize;
    for component in rest.split('.') {
        if component.is_empty() {
            continue;
        }
        if !tail_component_is_safe(component) {
            return None;
        }
        host.push(component);
        components += 1;
    }
    // A tail made only of separators names nothing.
    if !rest.is_empty() && components == 0 {
        return None;
    }
    if host.as_os_str().len() > MAX_HOST_PATH {
        return None;
    }
    Some((share, host))
}

/// Rejects absolute components and any `..` on either host separator.
fn tail_component_is_safe(component: &str) -> bool {
    if component.starts_with('/') || component.starts_with('\\') {
        return false;
    }
    component.split(['/', '\\']).all(|part| part != "..")
}

/// Makes `,xxx` filetype suffixes transparent: when `host` does not exist,
/// scans its parent for `base,HHH` where `HHH` parses as a filetype, and
/// substitutes the first match.
pub fn find_with_suffix(host: &Path) -> Option<PathBuf> {
    if fs::symlink_metadata(host).is_ok() {
        return Some(host.to_path_buf());
    }
    let parent = host.parent()?;
    let base = host.file_name()?.to_str()?;
    for entry in fs::read_dir(parent).ok()?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.len() == base.len() + 4
            && name[..base.len()].eq_ignore_ascii_case(base)
            && name.as_bytes()[base.len()] == b','
            && riscos::filetype_from_suffix(name).is_some()
        {
            return Some(parent.join(name));
        }
    }
    None
}

//! Capability shims for the platform-specific corners of keyword evaluation:
//! user/group name lookup, extended attributes, BSD file flags. Platforms
//! without a capability get a quiet no-op so manifests stay portable.

use std::collections::BTreeMap;
use std::path::Path;

// ── User and group names ──────────────────────────────────────────────────────

/// Resolve a uid to a login name. `None` when the uid has no passwd entry.
#[cfg(unix)]
pub fn username(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
}

#[cfg(not(unix))]
pub fn username(_uid: u32) -> Option<String> {
    None
}

/// Resolve a gid to a group name.
#[cfg(unix)]
pub fn groupname(gid: u32) -> Option<String> {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
}

#[cfg(not(unix))]
pub fn groupname(_gid: u32) -> Option<String> {
    None
}

/// Login name of the invoking user, for the `# user:` metadata comment.
pub fn current_username() -> Option<String> {
    #[cfg(unix)]
    {
        if let Some(name) = username(nix::unistd::getuid().as_raw()) {
            return Some(name);
        }
    }
    std::env::var("USER").ok()
}

/// Hostname, for the `# machine:` metadata comment.
pub fn hostname() -> Option<String> {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.into_string().ok();
        }
    }
    None
}

// ── Extended attributes ───────────────────────────────────────────────────────

/// List extended attributes of `path` without following symlinks.
///
/// Sorted by name so downstream serialization is deterministic. On platforms
/// without xattr support this returns an empty map and never errors.
#[cfg(target_os = "linux")]
pub fn list_xattrs(path: &Path) -> std::io::Result<BTreeMap<String, Vec<u8>>> {
    let mut out = BTreeMap::new();
    for name in xattr::list(path)? {
        let Some(name) = name.to_str().map(str::to_string) else {
            continue;
        };
        if let Some(value) = xattr::get(path, &name)? {
            out.insert(name, value);
        }
    }
    Ok(out)
}

#[cfg(not(target_os = "linux"))]
pub fn list_xattrs(_path: &Path) -> std::io::Result<BTreeMap<String, Vec<u8>>> {
    Ok(BTreeMap::new())
}

/// Whether this build can read extended attributes at all.
pub fn has_xattr_support() -> bool {
    cfg!(target_os = "linux")
}

// ── BSD file flags ────────────────────────────────────────────────────────────

/// File flags in chflags(2) notation. Linux has no chflags, so everything
/// reports `none`, which matches what the factored `/set` lines assume.
pub fn file_flags(_path: &Path) -> Option<String> {
    Some("none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn root_uid_resolves() {
        // uid 0 exists on any sane unix.
        assert_eq!(username(0).as_deref(), Some("root"));
        assert!(groupname(0).is_some());
    }

    #[test]
    fn unknown_uid_is_none() {
        assert_eq!(username(u32::MAX - 7), None);
    }

    #[test]
    fn flags_default_to_none() {
        assert_eq!(
            file_flags(Path::new(".")).as_deref(),
            Some("none"),
        );
    }
}

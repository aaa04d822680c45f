use std::io::{Read, Seek};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

pub mod asm;
pub mod compare;
pub mod disasm;
pub mod entry;
pub mod hierarchy;
pub mod keywords;
pub mod parse;
pub mod pipe;
pub mod platform;
pub mod storage;
pub mod tar;
pub mod vis;
pub mod walk;

pub use compare::{check, compare, DeltaType, InodeDelta, KeyDelta};
pub use entry::{Entry, EntryType};
pub use hierarchy::DirectoryHierarchy;
pub use keywords::{KeyVal, Keyword, Stat};
pub use parse::parse_spec;
pub use walk::{walk, ExcludeFn};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Everything that can structurally go wrong. Validation mismatches are not
/// errors; they come back as [`InodeDelta`]s from the comparator.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("parse error at line {line}, offset {offset}: {msg}")]
    Parse {
        line: usize,
        offset: usize,
        msg: String,
    },

    #[error("unknown keyword {name:?} for {path:?}")]
    UnknownKeyword { name: String, path: String },

    #[error("unbalanced hierarchy: `..` without a matching step-in")]
    UnbalancedHierarchy,

    #[error("malformed vis escape in {input:?} at offset {offset}")]
    MalformedEscape { input: String, offset: usize },

    #[error("{0} is not supported on this platform")]
    UnsupportedPlatform(&'static str),

    #[error("tar format: {0}")]
    TarFormat(String),

    #[error("keywords `time` and `tar_time` are mutually exclusive")]
    MutualExclusion,
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Shared plumbing ───────────────────────────────────────────────────────────

/// Content keywords hash a staged payload more than once, so the reader has
/// to be rewindable, not just readable.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Lexically normalize a path: drop `.` components and a leading `./`.
/// An empty result collapses to `.`, mirroring `filepath.Clean`.
pub fn clean_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            c => out.push(c.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_drops_dot_components() {
        assert_eq!(clean_path(Path::new("./a/./b")), PathBuf::from("a/b"));
        assert_eq!(clean_path(Path::new(".")), PathBuf::from("."));
        assert_eq!(clean_path(Path::new("a")), PathBuf::from("a"));
        assert_eq!(clean_path(Path::new("")), PathBuf::from("."));
    }
}

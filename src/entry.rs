//! One manifest line, plus the tree wiring that turns a flat list of lines
//! into a directory hierarchy. Links are indices into the hierarchy's entry
//! vector rather than references, so the structure is cycle-free and cheap
//! to move around.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::keywords::KeyVal;
use crate::{clean_path, vis};

/// Index of an entry inside its [`crate::DirectoryHierarchy`].
pub type EntryId = usize;

/// The kinds of lines found in a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// First line of the file, `#mtree v2.0`.
    Signature,
    /// Whitespace-only line; separates directory blocks.
    Blank,
    /// Any other line starting with `#`.
    Comment,
    /// `/set` or `/unset`.
    Special,
    /// A name without `/`, resolved against the enclosing directory.
    Relative,
    /// `..`, stepping out of the current directory.
    DotDot,
    /// A name containing `/`, resolved against the root.
    Full,
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub etype: EntryType,
    /// Decoded name (or directive name for `Special`). Arbitrary bytes.
    pub name: OsString,
    /// The vis-encoded form as it appears on disk.
    pub raw_name: String,
    pub keywords: Vec<KeyVal>,
    /// Order in the flattened manifest.
    pub pos: usize,
    /// Original line text for lossless rewriting of parsed input.
    pub raw_line: Option<String>,
    pub parent: Option<EntryId>,
    pub children: Vec<EntryId>,
    pub prev: Option<EntryId>,
    pub next: Option<EntryId>,
    /// The `/set` entry in effect when this entry was read or produced.
    pub set: Option<EntryId>,
}

impl Entry {
    pub fn new(etype: EntryType) -> Entry {
        Entry {
            etype,
            name: OsString::new(),
            raw_name: String::new(),
            keywords: Vec::new(),
            pos: 0,
            raw_line: None,
            parent: None,
            children: Vec::new(),
            prev: None,
            next: None,
            set: None,
        }
    }

    /// Construct a named entry, vis-encoding the name.
    pub fn named(etype: EntryType, name: &std::ffi::OsStr) -> crate::Result<Entry> {
        let raw_name = vis::vis(os_bytes(name), vis::DEFAULT_VIS_FLAGS)?;
        let mut e = Entry::new(etype);
        e.name = name.to_os_string();
        e.raw_name = raw_name;
        Ok(e)
    }

    pub fn is_dir(&self) -> bool {
        self.keywords.iter().any(|kv| kv.as_str() == "type=dir")
    }

    /// Does this line describe a filesystem object (as opposed to a
    /// directive, comment, or separator)?
    pub fn is_path(&self) -> bool {
        matches!(self.etype, EntryType::Relative | EntryType::Full)
    }
}

#[cfg(unix)]
pub(crate) fn os_bytes(s: &std::ffi::OsStr) -> &[u8] {
    use std::os::unix::ffi::OsStrExt;
    s.as_bytes()
}

#[cfg(not(unix))]
pub(crate) fn os_bytes(s: &std::ffi::OsStr) -> &[u8] {
    s.to_str().map(str::as_bytes).unwrap_or(b"")
}

#[cfg(unix)]
pub(crate) fn bytes_to_os(b: Vec<u8>) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(b)
}

#[cfg(not(unix))]
pub(crate) fn bytes_to_os(b: Vec<u8>) -> OsString {
    OsString::from(String::from_utf8_lossy(&b).into_owned())
}

/// Resolve the absolute (root-relative) path of `id` by climbing parents.
pub(crate) fn path_of(entries: &[Entry], id: EntryId) -> PathBuf {
    let e = &entries[id];
    if e.etype == EntryType::Full || e.parent.is_none() {
        return clean_path(&PathBuf::from(&e.name));
    }
    let mut parts: Vec<&OsString> = vec![&e.name];
    let mut cur = e.parent;
    while let Some(pid) = cur {
        let p = &entries[pid];
        parts.push(&p.name);
        cur = p.parent;
    }
    let mut path = PathBuf::new();
    for part in parts.iter().rev() {
        path.push(part);
    }
    clean_path(&path)
}

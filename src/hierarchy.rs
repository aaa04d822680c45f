//! The ordered collection of manifest entries, and the canonical writer.

use std::io::Write;
use std::path::PathBuf;

use crate::entry::{path_of, Entry, EntryId, EntryType};
use crate::keywords::Keyword;

/// A parsed, walked, or ingested manifest: entries in `pos` order plus the
/// flag that records where they came from.
#[derive(Debug, Default)]
pub struct DirectoryHierarchy {
    pub(crate) entries: Vec<Entry>,
    /// Set when the hierarchy was built from a tar stream. Tar headers do not
    /// reliably carry directory sizes, and carry second-precision times, so
    /// the comparator special-cases this. An explicit flag, because sniffing
    /// it back out of the entry list is guesswork.
    pub tar_derived: bool,
}

impl DirectoryHierarchy {
    pub fn new() -> DirectoryHierarchy {
        DirectoryHierarchy::default()
    }

    /// Append an entry, assigning its position. Returns its id.
    pub(crate) fn push(&mut self, mut e: Entry) -> EntryId {
        let id = self.entries.len();
        e.pos = id;
        if id > 0 {
            e.prev = Some(id - 1);
            self.entries[id - 1].next = Some(id);
        }
        self.entries.push(e);
        id
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Root-relative path of an entry.
    pub fn path(&self, id: EntryId) -> PathBuf {
        path_of(&self.entries, id)
    }

    /// Distinct keywords appearing on `/set` lines and path entries, in
    /// first-encounter order.
    pub fn used_keywords(&self) -> Vec<Keyword> {
        let mut seen: Vec<Keyword> = Vec::new();
        for e in &self.entries {
            if !matches!(e.etype, EntryType::Special | EntryType::Relative | EntryType::Full) {
                continue;
            }
            if e.etype == EntryType::Special && e.name != "/set" {
                continue;
            }
            for kv in &e.keywords {
                let k = kv.keyword();
                if !seen.contains(&k) {
                    seen.push(k);
                }
            }
        }
        seen
    }

    /// Render one entry as its manifest line, without the trailing newline.
    pub fn format_entry(&self, id: EntryId) -> String {
        let e = &self.entries[id];
        if let Some(raw) = &e.raw_line {
            return raw.clone();
        }
        match e.etype {
            EntryType::Blank => String::new(),
            EntryType::DotDot => "..".to_string(),
            EntryType::Signature | EntryType::Comment => e.raw_name.clone(),
            EntryType::Special => join_line(&e.raw_name, &e.keywords),
            EntryType::Full => join_line(&e.raw_name, &e.keywords),
            EntryType::Relative => {
                if e.is_dir() {
                    join_line(&e.raw_name, &e.keywords)
                } else {
                    format!("    {}", join_line(&e.raw_name, &e.keywords))
                }
            }
        }
    }

    /// Serialize the whole hierarchy in position order. The output parses
    /// back to an equal hierarchy; for parsed input it is byte-identical.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<u64> {
        let mut order: Vec<EntryId> = (0..self.entries.len()).collect();
        order.sort_by_key(|&id| self.entries[id].pos);

        let mut written = 0u64;
        for id in order {
            let line = self.format_entry(id);
            w.write_all(line.as_bytes())?;
            w.write_all(b"\n")?;
            written += line.len() as u64 + 1;
        }
        Ok(written)
    }
}

fn join_line(name: &str, keywords: &[crate::keywords::KeyVal]) -> String {
    let mut line = name.to_string();
    for kv in keywords {
        line.push(' ');
        line.push_str(kv.as_str());
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keywords::KeyVal;
    use std::ffi::OsStr;

    fn kv(tok: &str) -> KeyVal {
        KeyVal::from_token(tok)
    }

    #[test]
    fn writer_layout() {
        let mut dh = DirectoryHierarchy::new();

        let mut sig = Entry::new(EntryType::Signature);
        sig.raw_name = "#mtree v2.0".to_string();
        dh.push(sig);
        dh.push(Entry::new(EntryType::Blank));

        let mut set = Entry::named(EntryType::Special, OsStr::new("/set")).unwrap();
        set.keywords = vec![kv("type=file"), kv("uid=0")];
        dh.push(set);

        let mut root = Entry::named(EntryType::Relative, OsStr::new(".")).unwrap();
        root.keywords = vec![kv("type=dir"), kv("mode=0755")];
        dh.push(root);

        let mut f = Entry::named(EntryType::Relative, OsStr::new("file1")).unwrap();
        f.keywords = vec![kv("size=6")];
        f.parent = Some(3);
        dh.push(f);

        dh.push(Entry::new(EntryType::DotDot));

        let mut out = Vec::new();
        dh.write_to(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "#mtree v2.0\n\n/set type=file uid=0\n. type=dir mode=0755\n    file1 size=6\n..\n"
        );
    }

    #[test]
    fn used_keywords_deduplicated_in_order() {
        let mut dh = DirectoryHierarchy::new();
        let mut set = Entry::named(EntryType::Special, OsStr::new("/set")).unwrap();
        set.keywords = vec![kv("type=file"), kv("uid=0")];
        dh.push(set);
        let mut f = Entry::named(EntryType::Relative, OsStr::new("a")).unwrap();
        f.keywords = vec![kv("size=1"), kv("uid=1")];
        dh.push(f);

        let used: Vec<String> = dh
            .used_keywords()
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();
        assert_eq!(used, vec!["type", "uid", "size"]);
    }
}

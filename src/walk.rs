//! Deterministic filesystem traversal producing a nested manifest.
//!
//! The walk order is part of the format contract: within every directory,
//! non-directories come first, then directories, each group sorted by name.
//! Each directory opens a block (blank line, `# path` comment, `/set` when
//! the factored keywords change, the directory's own entry), lists its
//! files, recurses, and closes with `..`.

use std::ffi::OsString;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use crate::entry::{os_bytes, Entry, EntryId, EntryType};
use crate::hierarchy::DirectoryHierarchy;
use crate::keywords::{self, FileType, KeyVal, Keyword, Stat};
use crate::{platform, Error, ReadSeek, Result};

/// Exclusion predicate; `true` prunes the path (and its subtree).
pub type ExcludeFn = dyn Fn(&Path, &Stat) -> bool;

/// Walk `root` and build a manifest recording `keywords` for every entry.
pub fn walk(root: &Path, excludes: &[&ExcludeFn], keywords: &[Keyword]) -> Result<DirectoryHierarchy> {
    for k in keywords {
        if keywords::lookup(k).is_none() {
            return Err(Error::UnknownKeyword {
                name: k.as_str().to_string(),
                path: root.display().to_string(),
            });
        }
    }
    keywords::check_mutual_exclusion(keywords)?;

    let mut walker = Walker {
        root: root.to_path_buf(),
        excludes,
        keywords: keywords.to_vec(),
        want_xattrs: keywords.iter().any(|k| k.prefix() == "xattr"),
        dh: DirectoryHierarchy::new(),
        active_set: None,
    };

    for e in signature_entries(&root.display().to_string()) {
        walker.dh.push(e);
    }
    let start = walker.root.clone();
    walker.visit(&start, Path::new("."), None)?;
    Ok(walker.dh)
}

/// The `#mtree v2.0` signature plus the metadata comment block.
pub(crate) fn signature_entries(tree: &str) -> Vec<Entry> {
    let user = platform::current_username().unwrap_or_else(|| "unknown".to_string());
    let machine = platform::hostname().unwrap_or_else(|| "unknown".to_string());
    let date = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");

    let mut sig = Entry::new(EntryType::Signature);
    sig.raw_name = "#mtree v2.0".to_string();

    let comment = |text: String| {
        let mut e = Entry::new(EntryType::Comment);
        e.raw_name = text;
        e
    };

    vec![
        sig,
        comment(format!("# user: {user}")),
        comment(format!("# machine: {machine}")),
        comment(format!("# tree: {tree}")),
        comment(format!("# date: {date}")),
    ]
}

struct Walker<'a> {
    root: PathBuf,
    excludes: &'a [&'a ExcludeFn],
    keywords: Vec<Keyword>,
    want_xattrs: bool,
    dh: DirectoryHierarchy,
    active_set: Option<Vec<KeyVal>>,
}

impl Walker<'_> {
    fn visit(&mut self, dir: &Path, rel: &Path, parent: Option<EntryId>) -> Result<()> {
        debug!(path = %dir.display(), "walking directory");
        let dir_stat = Stat::from_path(dir, self.want_xattrs)?;

        // List, exclude, stat, and split the children.
        let mut files: Vec<(OsString, Stat)> = Vec::new();
        let mut dirs: Vec<(OsString, Stat)> = Vec::new();
        for dent in std::fs::read_dir(dir)? {
            let dent = dent?;
            let name = dent.file_name();
            let path = dir.join(&name);
            let stat = Stat::from_path(&path, self.want_xattrs)?;
            if self.excludes.iter().any(|ex| ex(&path, &stat)) {
                debug!(path = %path.display(), "excluded");
                continue;
            }
            if stat.file_type == FileType::Dir {
                dirs.push((name, stat));
            } else {
                files.push((name, stat));
            }
        }
        files.sort_by(|a, b| os_bytes(&a.0).cmp(os_bytes(&b.0)));
        dirs.sort_by(|a, b| os_bytes(&a.0).cmp(os_bytes(&b.0)));

        // Open the block.
        self.dh.push(Entry::new(EntryType::Blank));
        let mut comment = Entry::new(EntryType::Comment);
        comment.raw_name = format!("# {}", rel.display());
        self.dh.push(comment);

        self.emit_set(dir, &dir_stat)?;

        // The directory's own entry is the step-in line.
        let base = if parent.is_none() {
            OsString::from(".")
        } else {
            dir.file_name().map(|n| n.to_os_string()).unwrap_or_default()
        };
        let mut own = self.evaluate(dir, &dir_stat)?;
        ensure_dir_type(&mut own);
        let mut dent = Entry::named(EntryType::Relative, &base)?;
        dent.keywords = self.strip_set(own);
        dent.parent = parent;
        dent.set = None;
        let dir_id = self.dh.push(dent);
        if let Some(pid) = parent {
            self.dh.entries[pid].children.push(dir_id);
        }

        for (name, stat) in &files {
            let path = dir.join(name);
            let kvs = self.evaluate(&path, stat)?;
            let mut fent = Entry::named(EntryType::Relative, name)?;
            fent.keywords = self.strip_set(kvs);
            fent.parent = Some(dir_id);
            let id = self.dh.push(fent);
            self.dh.entries[dir_id].children.push(id);
        }

        for (name, _) in &dirs {
            let sub = dir.join(name);
            let sub_rel = if parent.is_none() {
                PathBuf::from(name)
            } else {
                rel.join(name)
            };
            self.visit(&sub, &sub_rel, Some(dir_id))?;
        }

        self.dh.push(Entry::new(EntryType::DotDot));
        Ok(())
    }

    /// Emit a `/set` line when this directory's factored keywords differ
    /// from the set already in effect.
    fn emit_set(&mut self, dir: &Path, dir_stat: &Stat) -> Result<()> {
        let candidate = self.set_candidate(dir, dir_stat)?;
        if candidate.is_empty() || self.active_set.as_deref() == Some(candidate.as_slice()) {
            return Ok(());
        }
        let mut e = Entry::named(EntryType::Special, std::ffi::OsStr::new("/set"))?;
        e.keywords = candidate.clone();
        self.dh.push(e);
        self.active_set = Some(candidate);
        Ok(())
    }

    fn set_candidate(&self, dir: &Path, dir_stat: &Stat) -> Result<Vec<KeyVal>> {
        let selected = |name: &str| self.keywords.iter().any(|k| k.as_str() == name);
        let mut out = Vec::new();
        for tok in ["type=file", "nlink=1", "flags=none", "mode=0664"] {
            let kv = KeyVal::from_token(tok);
            if selected(kv.keyword().as_str()) {
                out.push(kv);
            }
        }
        for name in keywords::SET_KEYWORDS {
            if !selected(name) {
                continue;
            }
            out.extend(keywords::evaluate(
                &Keyword::new(name),
                dir,
                dir_stat,
                None,
            )?);
        }
        Ok(out)
    }

    /// Evaluate every selected keyword for one filesystem object. Regular
    /// files are opened once; the handle is rewound before each keyword.
    fn evaluate(&self, path: &Path, stat: &Stat) -> Result<Vec<KeyVal>> {
        let mut reader: Option<File> = if stat.file_type == FileType::File {
            Some(File::open(path)?)
        } else {
            None
        };

        let mut out = Vec::new();
        for k in &self.keywords {
            if let Some(f) = reader.as_mut() {
                f.seek(SeekFrom::Start(0))?;
            }
            out.extend(keywords::evaluate(
                k,
                path,
                stat,
                reader.as_mut().map(|f| f as &mut dyn ReadSeek),
            )?);
        }
        Ok(out)
    }

    /// Drop keywords already supplied by the active `/set`.
    fn strip_set(&self, kvs: Vec<KeyVal>) -> Vec<KeyVal> {
        match &self.active_set {
            None => kvs,
            Some(set) => kvs.into_iter().filter(|kv| !set.contains(kv)).collect(),
        }
    }
}

/// Directory entries are the nesting protocol's step-in lines; they must
/// carry `type=dir` for the parser to rebuild the tree.
fn ensure_dir_type(kvs: &mut Vec<KeyVal>) {
    if !kvs.iter().any(|kv| kv.as_str() == "type=dir") {
        kvs.insert(0, KeyVal::from_token("type=dir"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_spec;
    use std::fs;

    fn kws(names: &[&str]) -> Vec<Keyword> {
        names.iter().map(|n| Keyword::new(n)).collect()
    }

    fn sample_tree() -> tempfile::TempDir {
        let td = tempfile::TempDir::new().unwrap();
        fs::write(td.path().join("file1"), b"hello\n").unwrap();
        fs::write(td.path().join("file2"), b"world\n").unwrap();
        fs::create_dir(td.path().join("sub")).unwrap();
        fs::write(td.path().join("sub/inner"), b"deep\n").unwrap();
        td
    }

    #[test]
    fn walk_emits_nested_blocks() {
        let td = sample_tree();
        let dh = walk(td.path(), &[], &kws(&["size", "type", "sha1digest"])).unwrap();
        let mut out = Vec::new();
        dh.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("#mtree v2.0\n"));
        assert!(text.contains("\n# .\n"));
        assert!(text.contains("\n# sub\n"));
        // `type=file` is inherited from the /set line, so files do not repeat it
        assert!(text.contains("/set type=file\n"));
        assert!(text.contains("    file1 size=6 sha1digest=f572d396fae9206628714fb2ce00f72e94f2258f\n"));
        let sub_line = text.lines().find(|l| l.starts_with("sub ")).unwrap();
        assert!(sub_line.contains("type=dir"), "{sub_line}");
        // one step-out per directory
        assert_eq!(text.lines().filter(|l| *l == "..").count(), 2);
    }

    #[test]
    fn walk_output_reparses() {
        let td = sample_tree();
        let dh = walk(td.path(), &[], &keywords::default_keywords()).unwrap();
        let mut out = Vec::new();
        dh.write_to(&mut out).unwrap();
        let reparsed = parse_spec(out.as_slice()).unwrap();
        assert_eq!(
            reparsed.entries().iter().filter(|e| e.is_path()).count(),
            dh.entries().iter().filter(|e| e.is_path()).count()
        );
    }

    #[test]
    fn files_sort_before_directories() {
        let td = tempfile::TempDir::new().unwrap();
        fs::create_dir(td.path().join("aaa")).unwrap();
        fs::write(td.path().join("zzz"), b"x").unwrap();
        let dh = walk(td.path(), &[], &kws(&["type"])).unwrap();
        let names: Vec<String> = dh
            .entries()
            .iter()
            .filter(|e| e.is_path())
            .map(|e| e.raw_name.clone())
            .collect();
        assert_eq!(names, vec![".", "zzz", "aaa"]);
    }

    #[test]
    fn set_line_factors_uid_gid() {
        let td = sample_tree();
        let dh = walk(td.path(), &[], &kws(&["type", "uid", "gid", "mode", "nlink"])).unwrap();
        let mut out = Vec::new();
        dh.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("/set type=file nlink=1 mode=0664 uid="));
        // entries do not repeat inherited uid
        let file_line = text
            .lines()
            .find(|l| l.trim_start().starts_with("file1"))
            .unwrap();
        assert!(!file_line.contains("uid="), "{file_line}");
    }

    #[test]
    fn excludes_prune_subtrees() {
        let td = sample_tree();
        let ex = |p: &Path, _: &Stat| p.file_name().is_some_and(|n| n == "sub");
        let dh = walk(td.path(), &[&ex], &kws(&["type", "size"])).unwrap();
        let mut out = Vec::new();
        dh.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("sub"));
        assert!(!text.contains("inner"));
    }

    #[test]
    fn unknown_keyword_rejected_up_front() {
        let td = sample_tree();
        assert!(matches!(
            walk(td.path(), &[], &kws(&["frobnicate"])),
            Err(Error::UnknownKeyword { .. })
        ));
    }

    #[test]
    fn walk_twice_is_stable() {
        let td = sample_tree();
        let keywords = kws(&["size", "type", "sha256digest", "mode"]);
        let a = walk(td.path(), &[], &keywords).unwrap();
        let b = walk(td.path(), &[], &keywords).unwrap();
        let deltas = crate::compare::compare(&a, &b, None).unwrap();
        assert!(deltas.is_empty(), "{deltas:?}");
    }
}

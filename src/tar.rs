//! Builds a manifest out of a tar stream.
//!
//! Tar archives arrive in whatever order they were written, so headers are
//! first materialized into a logical tree keyed on their cleaned paths, with
//! placeholder directories for components that have not shown up (yet). Once
//! the stream ends the tree is flattened with the same nesting protocol and
//! `/set` factoring the filesystem walker uses.
//!
//! Payloads are staged to anonymous scratch files so every content keyword
//! can take its own pass; the scratch file is unlinked from the start, so it
//! is released on every exit path.
//!
//! The caller drives the data path: bytes read from the stream are tee'd
//! through a pipe to the producer thread running the tar reader.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::entry::{os_bytes, Entry, EntryId, EntryType};
use crate::hierarchy::DirectoryHierarchy;
use crate::keywords::{self, FileType, KeyVal, Keyword, Stat};
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::walk::signature_entries;
use crate::{Error, ReadSeek, Result};

/// Start ingesting a tar stream. Read the returned stream to completion
/// (or let [`TarIngestStream::hierarchy`] drain it), then collect the
/// hierarchy.
pub fn ingest_tar<R: Read>(input: R, keywords: &[Keyword]) -> Result<TarIngestStream<R>> {
    // Tar headers only store whole seconds, so `time` silently becomes
    // `tar_time` for the whole ingest.
    let keywords: Vec<Keyword> = keywords
        .iter()
        .map(|k| {
            if k.as_str() == "time" {
                Keyword::new("tar_time")
            } else {
                k.clone()
            }
        })
        .collect();
    for k in &keywords {
        if keywords::lookup(k).is_none() {
            return Err(Error::UnknownKeyword {
                name: k.as_str().to_string(),
                path: "<tar archive>".to_string(),
            });
        }
    }
    keywords::check_mutual_exclusion(&keywords)?;

    let (reader, writer) = pipe();
    let handle = thread::spawn(move || run_ingest(reader, keywords));
    Ok(TarIngestStream {
        input,
        tee: Some(writer),
        handle: Some(handle),
    })
}

pub struct TarIngestStream<R: Read> {
    input: R,
    tee: Option<PipeWriter>,
    handle: Option<JoinHandle<Result<DirectoryHierarchy>>>,
}

impl<R: Read> Read for TarIngestStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.input.read(buf)?;
        if n == 0 {
            // EOF: close the tee so the producer sees end of archive.
            self.tee.take();
            return Ok(0);
        }
        if let Some(tee) = self.tee.as_mut() {
            if let Err(e) = tee.write_all(&buf[..n]) {
                // Producer went away; its reason surfaces via hierarchy().
                self.tee.take();
                return Err(e);
            }
        }
        Ok(n)
    }
}

impl<R: Read> TarIngestStream<R> {
    /// Drain whatever is left of the stream and return the hierarchy the
    /// producer built.
    pub fn hierarchy(mut self) -> Result<DirectoryHierarchy> {
        let mut sink = [0u8; 32 * 1024];
        loop {
            match self.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                // A broken tee means the producer stopped; join for the cause.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.tee.take();
        match self.handle.take().expect("hierarchy called once").join() {
            Ok(res) => res,
            Err(_) => Err(Error::TarFormat("ingest thread panicked".to_string())),
        }
    }
}

// ── Producer ──────────────────────────────────────────────────────────────────

fn run_ingest(reader: PipeReader, keywords: Vec<Keyword>) -> Result<DirectoryHierarchy> {
    let want_xattrs = keywords.iter().any(|k| k.prefix() == "xattr");
    let mut archive = tar::Archive::new(reader);
    let mut root = Node::placeholder_dir(OsString::from("."));

    for entry in archive.entries().map_err(Error::Io)? {
        let mut entry = entry.map_err(|e| Error::TarFormat(e.to_string()))?;
        let hdr = entry.header().clone();
        let path = entry
            .path()
            .map_err(|e| Error::TarFormat(e.to_string()))?
            .into_owned();

        let xattrs = if want_xattrs {
            pax_xattrs(&mut entry)?
        } else {
            BTreeMap::new()
        };

        // Stage the payload somewhere seekable; content keywords may take
        // several passes over it.
        let mut scratch = tempfile::tempfile()?;
        io::copy(&mut entry, &mut scratch)?;
        scratch.seek(SeekFrom::Start(0))?;

        let mut stat = Stat::from_tar_header(&hdr, xattrs)?;
        if hdr.entry_type() == tar::EntryType::Link {
            // The payload lives with the link target.
            stat.size = 0;
        }

        debug!(path = %path.display(), type_ = stat.file_type.as_str(), "tar header");

        let kvs = evaluate_keywords(&keywords, &path, &stat, &mut scratch)?;
        let comps: Vec<OsString> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(n) => Some(n.to_os_string()),
                _ => None,
            })
            .collect();

        if stat.file_type == FileType::Dir {
            let set_candidate = set_candidate(&keywords, &path, &stat)?;
            root.insert_dir(&comps, kvs, set_candidate);
        } else {
            root.insert_file(&comps, kvs)?;
        }
    }

    let mut flattener = Flattener {
        dh: DirectoryHierarchy::new(),
        active_set: None,
    };
    for e in signature_entries("<user specified tar archive>") {
        flattener.dh.push(e);
    }
    flattener.emit(&root, Path::new("."), None)?;
    flattener.dh.tar_derived = true;
    Ok(flattener.dh)
}

fn evaluate_keywords(
    keywords: &[Keyword],
    path: &Path,
    stat: &Stat,
    scratch: &mut std::fs::File,
) -> Result<Vec<KeyVal>> {
    let mut out = Vec::new();
    for k in keywords {
        // Tar archives do not reliably carry directory sizes.
        if stat.file_type == FileType::Dir && k.as_str() == "size" {
            continue;
        }
        scratch.seek(SeekFrom::Start(0))?;
        out.extend(keywords::evaluate(
            k,
            path,
            stat,
            Some(&mut *scratch as &mut dyn ReadSeek),
        )?);
    }
    Ok(out)
}

fn set_candidate(keywords: &[Keyword], path: &Path, stat: &Stat) -> Result<Vec<KeyVal>> {
    let selected = |name: &str| keywords.iter().any(|k| k.as_str() == name);
    let mut out = Vec::new();
    for tok in ["type=file", "nlink=1", "flags=none", "mode=0664"] {
        let kv = KeyVal::from_token(tok);
        if selected(kv.keyword().as_str()) {
            out.push(kv);
        }
    }
    for name in keywords::SET_KEYWORDS {
        if selected(name) {
            out.extend(keywords::evaluate(&Keyword::new(name), path, stat, None)?);
        }
    }
    Ok(out)
}

fn pax_xattrs<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut out = BTreeMap::new();
    if let Some(exts) = entry
        .pax_extensions()
        .map_err(|e| Error::TarFormat(e.to_string()))?
    {
        for ext in exts {
            let ext = ext.map_err(|e| Error::TarFormat(e.to_string()))?;
            let Ok(key) = ext.key() else { continue };
            if let Some(name) = key.strip_prefix("SCHILY.xattr.") {
                out.insert(name.to_string(), ext.value_bytes().to_vec());
            }
        }
    }
    Ok(out)
}

// ── Logical tree ──────────────────────────────────────────────────────────────

struct Node {
    name: OsString,
    keywords: Vec<KeyVal>,
    /// Factored `/set` keywords; directories only.
    set_candidate: Vec<KeyVal>,
    files: BTreeMap<Vec<u8>, Node>,
    dirs: BTreeMap<Vec<u8>, Node>,
}

impl Node {
    fn placeholder_dir(name: OsString) -> Node {
        Node {
            name,
            keywords: vec![KeyVal::from_token("type=dir")],
            set_candidate: Vec::new(),
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
        }
    }

    fn leaf(name: OsString, keywords: Vec<KeyVal>) -> Node {
        Node {
            name,
            keywords,
            set_candidate: Vec::new(),
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
        }
    }

    fn descend(&mut self, comps: &[OsString]) -> &mut Node {
        let mut cur = self;
        for comp in comps {
            cur = cur
                .dirs
                .entry(os_bytes(comp).to_vec())
                .or_insert_with(|| Node::placeholder_dir(comp.clone()));
        }
        cur
    }

    /// Attach a directory header, merging into the placeholder if its
    /// children arrived first. An empty component list is the root itself.
    fn insert_dir(&mut self, comps: &[OsString], keywords: Vec<KeyVal>, set: Vec<KeyVal>) {
        let node = self.descend(comps);
        node.keywords = keywords;
        ensure_dir_keyword(&mut node.keywords);
        node.set_candidate = set;
    }

    fn insert_file(&mut self, comps: &[OsString], keywords: Vec<KeyVal>) -> Result<()> {
        let (name, parents) = comps.split_last().ok_or_else(|| {
            Error::TarFormat("tar entry with empty path".to_string())
        })?;
        let dir = self.descend(parents);
        dir.files.insert(
            os_bytes(name).to_vec(),
            Node::leaf(name.clone(), keywords),
        );
        Ok(())
    }
}

fn ensure_dir_keyword(kvs: &mut Vec<KeyVal>) {
    if !kvs.iter().any(|kv| kv.as_str() == "type=dir") {
        kvs.insert(0, KeyVal::from_token("type=dir"));
    }
}

// ── Flattening ────────────────────────────────────────────────────────────────

struct Flattener {
    dh: DirectoryHierarchy,
    active_set: Option<Vec<KeyVal>>,
}

impl Flattener {
    fn emit(&mut self, node: &Node, rel: &Path, parent: Option<EntryId>) -> Result<()> {
        self.dh.push(Entry::new(EntryType::Blank));
        let mut comment = Entry::new(EntryType::Comment);
        comment.raw_name = format!("# {}", rel.display());
        self.dh.push(comment);

        if !node.set_candidate.is_empty()
            && self.active_set.as_deref() != Some(node.set_candidate.as_slice())
        {
            let mut set = Entry::named(EntryType::Special, std::ffi::OsStr::new("/set"))?;
            set.keywords = node.set_candidate.clone();
            self.dh.push(set);
            self.active_set = Some(node.set_candidate.clone());
        }

        let mut own = Entry::named(EntryType::Relative, &node.name)?;
        own.keywords = self.strip_set(node.keywords.clone());
        ensure_dir_keyword(&mut own.keywords);
        own.parent = parent;
        let dir_id = self.dh.push(own);
        if let Some(pid) = parent {
            self.dh.entries[pid].children.push(dir_id);
        }

        for file in node.files.values() {
            let mut fent = Entry::named(EntryType::Relative, &file.name)?;
            fent.keywords = self.strip_set(file.keywords.clone());
            fent.parent = Some(dir_id);
            let id = self.dh.push(fent);
            self.dh.entries[dir_id].children.push(id);
        }

        for dir in node.dirs.values() {
            let sub_rel = if parent.is_none() {
                PathBuf::from(&dir.name)
            } else {
                rel.join(&dir.name)
            };
            self.emit(dir, &sub_rel, Some(dir_id))?;
        }

        self.dh.push(Entry::new(EntryType::DotDot));
        Ok(())
    }

    fn strip_set(&self, kvs: Vec<KeyVal>) -> Vec<KeyVal> {
        match &self.active_set {
            None => kvs,
            Some(set) => kvs.into_iter().filter(|kv| !set.contains(kv)).collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    fn kws(names: &[&str]) -> Vec<Keyword> {
        names.iter().map(|n| Keyword::new(n)).collect()
    }

    pub(crate) fn sample_archive() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir = tar::Header::new_ustar();
        dir.set_path("x/").unwrap();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_uid(0);
        dir.set_gid(0);
        dir.set_size(0);
        dir.set_mtime(1_300_000_000);
        dir.set_cksum();
        builder.append(&dir, Cursor::new(Vec::new())).unwrap();

        let mut file = tar::Header::new_ustar();
        file.set_path("x/files").unwrap();
        file.set_mode(0o644);
        file.set_uid(0);
        file.set_gid(0);
        file.set_size(6);
        file.set_mtime(1_300_000_005);
        file.set_cksum();
        builder
            .append(&file, Cursor::new(b"howdy\n".to_vec()))
            .unwrap();

        builder.into_inner().unwrap()
    }

    fn ingest_all(archive: &[u8], keywords: &[Keyword]) -> DirectoryHierarchy {
        let stream = ingest_tar(Cursor::new(archive.to_vec()), keywords).unwrap();
        stream.hierarchy().unwrap()
    }

    #[test]
    fn builds_nested_spec_from_archive() {
        let dh = ingest_all(
            &sample_archive(),
            &kws(&["size", "type", "sha1digest", "tar_time"]),
        );
        assert!(dh.tar_derived);

        let mut out = Vec::new();
        dh.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("# tree: <user specified tar archive>\n"));
        assert!(text.contains("\n# .\n"));
        assert!(text.contains("\n# x\n"));
        assert!(text.contains(
            "    files size=6 sha1digest=28f53220949ff23fe398b6f88482da775406b625 tar_time=1300000005.000000000\n"
        ));
        // directories carry no size keyword in tar mode
        let x_line = text.lines().find(|l| l.starts_with("x ")).unwrap();
        assert!(!x_line.contains("size="), "{x_line}");
        assert!(x_line.contains("type=dir"));
    }

    #[test]
    fn time_is_remapped_to_tar_time() {
        let dh = ingest_all(&sample_archive(), &kws(&["type", "time"]));
        let used: Vec<String> = dh
            .used_keywords()
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();
        assert!(used.contains(&"tar_time".to_string()), "{used:?}");
        assert!(!used.contains(&"time".to_string()));
    }

    #[test]
    fn placeholder_directories_are_synthesized() {
        // Archive mentioning only a deep file; the intermediate dirs have to
        // be invented.
        let mut builder = tar::Builder::new(Vec::new());
        let mut file = tar::Header::new_ustar();
        file.set_path("a/b/leaf").unwrap();
        file.set_mode(0o644);
        file.set_uid(0);
        file.set_gid(0);
        file.set_size(2);
        file.set_cksum();
        builder.append(&file, Cursor::new(b"hi".to_vec())).unwrap();
        let archive = builder.into_inner().unwrap();

        let dh = ingest_all(&archive, &kws(&["type", "size"]));
        let paths: Vec<String> = dh
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_path())
            .map(|(i, _)| dh.path(i).display().to_string())
            .collect();
        assert_eq!(paths, vec![".", "a", "a/b", "a/b/leaf"]);
    }

    #[test]
    fn stream_passes_through_while_ingesting() {
        let archive = sample_archive();
        let mut stream =
            ingest_tar(Cursor::new(archive.clone()), &kws(&["type", "size"])).unwrap();
        let mut seen = Vec::new();
        stream.read_to_end(&mut seen).unwrap();
        assert_eq!(seen, archive);
        let dh = stream.hierarchy().unwrap();
        assert!(dh.tar_derived);
    }

    #[test]
    fn garbage_input_surfaces_tar_error() {
        let garbage = vec![0x55u8; 2048];
        let stream = ingest_tar(Cursor::new(garbage), &kws(&["type"])).unwrap();
        let err = stream.hierarchy().unwrap_err();
        assert!(matches!(err, Error::TarFormat(_) | Error::Io(_)), "{err}");
    }
}

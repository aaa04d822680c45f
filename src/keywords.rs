//! The keyword registry: every attribute a manifest can record, and the
//! function that produces its serialized `keyword=value` token from a path,
//! its stat, and (for content keywords) a rewindable payload reader.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crc::Crc;
use digest::Digest;
use serde::{Deserialize, Serialize};

use crate::{platform, vis, Error, ReadSeek, Result};

// ── Keyword ───────────────────────────────────────────────────────────────────

/// A keyword name, normalized to its canonical spelling (`sha1` is stored as
/// `sha1digest`, and so on).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Keyword(String);

impl Keyword {
    pub fn new(name: &str) -> Keyword {
        Keyword(canonical_name(name).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The registry name this keyword resolves under. `xattr.security.selinux`
    /// resolves as `xattr`.
    pub fn prefix(&self) -> &str {
        match self.0.split_once('.') {
            Some((p, _)) if p == "xattr" => p,
            _ => &self.0,
        }
    }

    pub fn is_default(&self) -> bool {
        lookup(self).is_some_and(|d| d.default)
    }

    pub fn is_bsd(&self) -> bool {
        lookup(self).is_some_and(|d| d.bsd)
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Keyword {
    fn from(s: &str) -> Keyword {
        Keyword::new(s)
    }
}

fn canonical_name(name: &str) -> &str {
    match name {
        "md5" => "md5digest",
        "sha1" => "sha1digest",
        "sha256" => "sha256digest",
        "sha384" => "sha384digest",
        "sha512" => "sha512digest",
        "rmd160" | "rmd160digest" => "ripemd160digest",
        other => other,
    }
}

// ── KeyVal ────────────────────────────────────────────────────────────────────

/// One `keyword=value` token. Equality is byte equality of the whole token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyVal(String);

impl KeyVal {
    pub fn new(keyword: &str, value: &str) -> KeyVal {
        KeyVal(format!("{keyword}={value}"))
    }

    /// Build from a raw token, folding keyword synonyms to canonical form.
    pub fn from_token(token: &str) -> KeyVal {
        match token.split_once('=') {
            Some((k, v)) => KeyVal::new(canonical_name(k), v),
            None => KeyVal(canonical_name(token).to_string()),
        }
    }

    pub fn keyword(&self) -> Keyword {
        match self.0.split_once('=') {
            Some((k, _)) => Keyword(k.to_string()),
            None => Keyword(self.0.clone()),
        }
    }

    pub fn value(&self) -> &str {
        self.0.split_once('=').map(|(_, v)| v).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Merge an inherited `/set` keyword list with an entry's own keywords.
/// The entry wins per keyword; `xattr.*` keys are matched on the full name.
pub fn merge_set(set: &[KeyVal], own: &[KeyVal]) -> Vec<KeyVal> {
    let mut out: Vec<KeyVal> = set.to_vec();
    for kv in own {
        let name = kv.keyword();
        match out.iter_mut().find(|have| have.keyword() == name) {
            Some(have) => *have = kv.clone(),
            None => out.push(kv.clone()),
        }
    }
    out
}

// ── Stat abstraction ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
    Link,
    Char,
    Block,
    Fifo,
    Socket,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Dir => "dir",
            FileType::Link => "link",
            FileType::Char => "char",
            FileType::Block => "block",
            FileType::Fifo => "fifo",
            FileType::Socket => "socket",
        }
    }
}

/// Everything keyword functions may ask about a filesystem object, whether it
/// came from lstat(2) or from a tar header.
#[derive(Debug, Clone)]
pub struct Stat {
    pub file_type: FileType,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub nlink: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub link_target: Option<PathBuf>,
    /// Owner names when the source already knows them (tar headers do).
    pub uname: Option<String>,
    pub gname: Option<String>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl Stat {
    /// lstat `path`; never follows symlinks. Extended attributes are only
    /// gathered when a selected keyword will consume them.
    #[cfg(unix)]
    pub fn from_path(path: &Path, want_xattrs: bool) -> std::io::Result<Stat> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let md = fs::symlink_metadata(path)?;
        let ft = md.file_type();
        let file_type = if ft.is_symlink() {
            FileType::Link
        } else if ft.is_dir() {
            FileType::Dir
        } else if ft.is_file() {
            FileType::File
        } else if ft.is_char_device() {
            FileType::Char
        } else if ft.is_block_device() {
            FileType::Block
        } else if ft.is_fifo() {
            FileType::Fifo
        } else {
            FileType::Socket
        };

        let link_target = if ft.is_symlink() {
            Some(fs::read_link(path)?)
        } else {
            None
        };
        let xattrs = if want_xattrs && !ft.is_symlink() {
            platform::list_xattrs(path)?
        } else {
            BTreeMap::new()
        };

        Ok(Stat {
            file_type,
            mode: md.mode() & 0o7777,
            uid: u64::from(md.uid()),
            gid: u64::from(md.gid()),
            size: md.size(),
            nlink: md.nlink(),
            mtime_sec: md.mtime(),
            mtime_nsec: md.mtime_nsec() as u32,
            link_target,
            uname: None,
            gname: None,
            xattrs,
        })
    }

    #[cfg(not(unix))]
    pub fn from_path(path: &Path, _want_xattrs: bool) -> std::io::Result<Stat> {
        let md = fs::symlink_metadata(path)?;
        let file_type = if md.file_type().is_symlink() {
            FileType::Link
        } else if md.is_dir() {
            FileType::Dir
        } else {
            FileType::File
        };
        Ok(Stat {
            file_type,
            mode: 0,
            uid: 0,
            gid: 0,
            size: md.len(),
            nlink: 1,
            mtime_sec: 0,
            mtime_nsec: 0,
            link_target: None,
            uname: None,
            gname: None,
            xattrs: BTreeMap::new(),
        })
    }

    /// Build from a tar header. Timestamps carry second precision only, which
    /// is why the ingester swaps `time` for `tar_time`.
    pub fn from_tar_header(
        hdr: &tar::Header,
        xattrs: BTreeMap<String, Vec<u8>>,
    ) -> Result<Stat> {
        use tar::EntryType;

        let bad = |what: &str| Error::TarFormat(format!("header has no parseable {what}"));

        let file_type = match hdr.entry_type() {
            EntryType::Directory => FileType::Dir,
            EntryType::Symlink => FileType::Link,
            EntryType::Char => FileType::Char,
            EntryType::Block => FileType::Block,
            EntryType::Fifo => FileType::Fifo,
            // Hardlinks resolve to regular files, like everything else.
            _ => FileType::File,
        };

        let link_target = hdr
            .link_name()
            .map_err(|_| bad("link name"))?
            .map(|c| c.into_owned());

        Ok(Stat {
            file_type,
            mode: hdr.mode().map_err(|_| bad("mode"))? & 0o7777,
            uid: hdr.uid().map_err(|_| bad("uid"))?,
            gid: hdr.gid().map_err(|_| bad("gid"))?,
            size: hdr.size().map_err(|_| bad("size"))?,
            nlink: 1,
            mtime_sec: hdr.mtime().map_err(|_| bad("mtime"))? as i64,
            mtime_nsec: 0,
            link_target,
            uname: hdr
                .username()
                .ok()
                .flatten()
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            gname: hdr
                .groupname()
                .ok()
                .flatten()
                .filter(|g| !g.is_empty())
                .map(str::to_string),
            xattrs,
        })
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Evaluator signature. An empty vec means "not applicable for this entry";
/// content keywords require `reader` to be positioned at offset 0 and leave
/// it wherever reading stopped.
pub type KeywordFn = fn(&Path, &Stat, Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>>;

pub struct KeywordDef {
    pub name: &'static str,
    pub synonyms: &'static [&'static str],
    /// In the default keyword set used by create mode.
    pub default: bool,
    /// Interoperable with BSD mtree(8).
    pub bsd: bool,
    pub func: KeywordFn,
}

pub static KEYWORDS: &[KeywordDef] = &[
    KeywordDef { name: "size", synonyms: &[], default: true, bsd: true, func: kw_size },
    KeywordDef { name: "type", synonyms: &[], default: true, bsd: true, func: kw_type },
    KeywordDef { name: "uid", synonyms: &[], default: true, bsd: true, func: kw_uid },
    KeywordDef { name: "gid", synonyms: &[], default: true, bsd: true, func: kw_gid },
    KeywordDef { name: "uname", synonyms: &[], default: false, bsd: true, func: kw_uname },
    KeywordDef { name: "gname", synonyms: &[], default: false, bsd: true, func: kw_gname },
    KeywordDef { name: "mode", synonyms: &[], default: true, bsd: true, func: kw_mode },
    KeywordDef { name: "link", synonyms: &[], default: true, bsd: true, func: kw_link },
    KeywordDef { name: "nlink", synonyms: &[], default: true, bsd: true, func: kw_nlink },
    KeywordDef { name: "time", synonyms: &[], default: true, bsd: true, func: kw_time },
    KeywordDef { name: "tar_time", synonyms: &[], default: false, bsd: false, func: kw_tar_time },
    KeywordDef { name: "flags", synonyms: &[], default: false, bsd: true, func: kw_flags },
    KeywordDef { name: "cksum", synonyms: &[], default: false, bsd: true, func: kw_cksum },
    KeywordDef {
        name: "md5digest",
        synonyms: &["md5"],
        default: false,
        bsd: true,
        func: kw_md5,
    },
    KeywordDef {
        name: "sha1digest",
        synonyms: &["sha1"],
        default: false,
        bsd: true,
        func: kw_sha1,
    },
    KeywordDef {
        name: "sha256digest",
        synonyms: &["sha256"],
        default: false,
        bsd: true,
        func: kw_sha256,
    },
    KeywordDef {
        name: "sha384digest",
        synonyms: &["sha384"],
        default: false,
        bsd: true,
        func: kw_sha384,
    },
    KeywordDef {
        name: "sha512digest",
        synonyms: &["sha512"],
        default: false,
        bsd: true,
        func: kw_sha512,
    },
    KeywordDef {
        name: "ripemd160digest",
        synonyms: &["rmd160", "rmd160digest"],
        default: false,
        bsd: true,
        func: kw_ripemd160,
    },
    KeywordDef { name: "xattr", synonyms: &[], default: false, bsd: false, func: kw_xattr },
];

/// Keywords a walker-produced `/set` line may factor out.
pub static SET_KEYWORDS: &[&str] = &["uid", "gid"];

pub fn default_keywords() -> Vec<Keyword> {
    KEYWORDS
        .iter()
        .filter(|d| d.default)
        .map(|d| Keyword::new(d.name))
        .collect()
}

/// Resolve a keyword (after synonym folding) to its registry definition.
pub fn lookup(k: &Keyword) -> Option<&'static KeywordDef> {
    let prefix = k.prefix();
    KEYWORDS.iter().find(|d| d.name == prefix)
}

/// Registry index, used for stable key ordering in comparison output.
/// Unknown keywords sort last.
pub fn registry_order(k: &Keyword) -> usize {
    let prefix = k.prefix();
    KEYWORDS
        .iter()
        .position(|d| d.name == prefix)
        .unwrap_or(KEYWORDS.len())
}

/// Evaluate one keyword against a filesystem object.
pub fn evaluate(
    k: &Keyword,
    path: &Path,
    stat: &Stat,
    reader: Option<&mut dyn ReadSeek>,
) -> Result<Vec<KeyVal>> {
    let def = lookup(k).ok_or_else(|| Error::UnknownKeyword {
        name: k.as_str().to_string(),
        path: path.display().to_string(),
    })?;
    (def.func)(path, stat, reader)
}

/// Reject selections containing both `time` and `tar_time`.
pub fn check_mutual_exclusion(keywords: &[Keyword]) -> Result<()> {
    let has = |n: &str| keywords.iter().any(|k| k.as_str() == n);
    if has("time") && has("tar_time") {
        return Err(Error::MutualExclusion);
    }
    Ok(())
}

// ── Keyword functions ─────────────────────────────────────────────────────────

fn one(keyword: &str, value: &str) -> Result<Vec<KeyVal>> {
    Ok(vec![KeyVal::new(keyword, value)])
}

fn kw_size(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    one("size", &stat.size.to_string())
}

fn kw_type(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    one("type", stat.file_type.as_str())
}

fn kw_uid(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    one("uid", &stat.uid.to_string())
}

fn kw_gid(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    one("gid", &stat.gid.to_string())
}

fn kw_uname(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    if let Some(name) = &stat.uname {
        return one("uname", name);
    }
    match platform::username(stat.uid as u32) {
        Some(name) => one("uname", &name),
        None => Ok(vec![]),
    }
}

fn kw_gname(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    if let Some(name) = &stat.gname {
        return one("gname", name);
    }
    match platform::groupname(stat.gid as u32) {
        Some(name) => one("gname", &name),
        None => Ok(vec![]),
    }
}

fn kw_mode(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    one("mode", &format_octal(stat.mode))
}

pub(crate) fn format_octal(mode: u32) -> String {
    if mode == 0 {
        "0".to_string()
    } else {
        format!("0{mode:o}")
    }
}

fn kw_link(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    match &stat.link_target {
        Some(target) => {
            let encoded = vis::vis(path_bytes(target), vis::DEFAULT_VIS_FLAGS)?;
            one("link", &encoded)
        }
        None => Ok(vec![]),
    }
}

#[cfg(unix)]
fn path_bytes(p: &Path) -> &[u8] {
    use std::os::unix::ffi::OsStrExt;
    p.as_os_str().as_bytes()
}

#[cfg(not(unix))]
fn path_bytes(p: &Path) -> &[u8] {
    p.to_str().map(str::as_bytes).unwrap_or(b"")
}

fn kw_nlink(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    one("nlink", &stat.nlink.to_string())
}

fn kw_time(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    one("time", &format!("{}.{:09}", stat.mtime_sec, stat.mtime_nsec))
}

fn kw_tar_time(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    one("tar_time", &format!("{}.000000000", stat.mtime_sec))
}

fn kw_flags(p: &Path, _stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    match platform::file_flags(p) {
        Some(flags) => one("flags", &flags),
        None => Ok(vec![]),
    }
}

// POSIX 1003.2 checksum: CRC-32/CKSUM over the contents, then the content
// length as a minimal little-endian byte sequence.
const CKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_CKSUM);

fn kw_cksum(_p: &Path, stat: &Stat, r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    if stat.file_type != FileType::File {
        return Ok(vec![]);
    }
    let Some(r) = r else { return Ok(vec![]) };

    let mut digest = CKSUM.digest();
    let mut buf = [0u8; 32 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
        total += n as u64;
    }
    let mut len = total;
    while len != 0 {
        digest.update(&[(len & 0xff) as u8]);
        len >>= 8;
    }
    one("cksum", &digest.finalize().to_string())
}

fn hashed<D: Digest>(
    name: &'static str,
    stat: &Stat,
    r: Option<&mut dyn ReadSeek>,
) -> Result<Vec<KeyVal>> {
    if stat.file_type != FileType::File {
        return Ok(vec![]);
    }
    let Some(r) = r else { return Ok(vec![]) };

    let mut hasher = D::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    one(name, &hex::encode(hasher.finalize()))
}

fn kw_md5(_p: &Path, stat: &Stat, r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    hashed::<md5::Md5>("md5digest", stat, r)
}

fn kw_sha1(_p: &Path, stat: &Stat, r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    hashed::<sha1::Sha1>("sha1digest", stat, r)
}

fn kw_sha256(_p: &Path, stat: &Stat, r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    hashed::<sha2::Sha256>("sha256digest", stat, r)
}

fn kw_sha384(_p: &Path, stat: &Stat, r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    hashed::<sha2::Sha384>("sha384digest", stat, r)
}

fn kw_sha512(_p: &Path, stat: &Stat, r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    hashed::<sha2::Sha512>("sha512digest", stat, r)
}

fn kw_ripemd160(_p: &Path, stat: &Stat, r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    hashed::<ripemd::Ripemd160>("ripemd160digest", stat, r)
}

// The value of each attribute is hidden behind a SHA1 digest, so ordering is
// the only thing that keeps the serialized form deterministic.
fn kw_xattr(_p: &Path, stat: &Stat, _r: Option<&mut dyn ReadSeek>) -> Result<Vec<KeyVal>> {
    let mut out = Vec::with_capacity(stat.xattrs.len());
    for (name, value) in &stat.xattrs {
        let digest = sha1::Sha1::digest(value);
        out.push(KeyVal::new(
            &format!("xattr.{name}"),
            &hex::encode(digest),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn file_stat(size: u64) -> Stat {
        Stat {
            file_type: FileType::File,
            mode: 0o644,
            uid: 1000,
            gid: 100,
            size,
            nlink: 1,
            mtime_sec: 5,
            mtime_nsec: 123_456_789,
            link_target: None,
            uname: None,
            gname: None,
            xattrs: BTreeMap::new(),
        }
    }

    #[test]
    fn synonyms_fold_to_canonical() {
        assert_eq!(Keyword::new("sha1").as_str(), "sha1digest");
        assert_eq!(Keyword::new("md5").as_str(), "md5digest");
        assert_eq!(Keyword::new("rmd160").as_str(), "ripemd160digest");
        assert_eq!(Keyword::new("size").as_str(), "size");
        assert_eq!(
            KeyVal::from_token("sha256=abc").as_str(),
            "sha256digest=abc"
        );
    }

    #[test]
    fn xattr_prefix_resolves() {
        let k = Keyword::new("xattr.security.selinux");
        assert_eq!(k.prefix(), "xattr");
        assert!(lookup(&k).is_some());
        assert!(lookup(&Keyword::new("weirdkw")).is_none());
    }

    #[test]
    fn time_tokens() {
        let stat = file_stat(6);
        let kvs = kw_time(Path::new("f"), &stat, None).unwrap();
        assert_eq!(kvs[0].as_str(), "time=5.123456789");
        let kvs = kw_tar_time(Path::new("f"), &stat, None).unwrap();
        assert_eq!(kvs[0].as_str(), "tar_time=5.000000000");
    }

    #[test]
    fn mode_renders_octal() {
        assert_eq!(format_octal(0o755), "0755");
        assert_eq!(format_octal(0o644), "0644");
        assert_eq!(format_octal(0), "0");
        assert_eq!(format_octal(0o4755), "04755");
    }

    #[test]
    fn sha1_of_hello() {
        let stat = file_stat(6);
        let mut payload = Cursor::new(b"hello\n".to_vec());
        let kvs = kw_sha1(Path::new("f"), &stat, Some(&mut payload)).unwrap();
        assert_eq!(
            kvs[0].as_str(),
            "sha1digest=f572d396fae9206628714fb2ce00f72e94f2258f"
        );
    }

    #[test]
    fn content_keywords_skip_non_regular() {
        let mut stat = file_stat(0);
        stat.file_type = FileType::Dir;
        let mut payload = Cursor::new(Vec::new());
        assert!(kw_sha1(Path::new("d"), &stat, Some(&mut payload))
            .unwrap()
            .is_empty());
        assert!(kw_cksum(Path::new("d"), &stat, None).unwrap().is_empty());
    }

    #[test]
    fn cksum_matches_posix_reference() {
        // `printf 'hello\n' | cksum` → 3015617425 6
        let stat = file_stat(6);
        let mut payload = Cursor::new(b"hello\n".to_vec());
        let kvs = kw_cksum(Path::new("f"), &stat, Some(&mut payload)).unwrap();
        assert_eq!(kvs[0].as_str(), "cksum=3015617425");
    }

    #[test]
    fn merge_set_prefers_own_keywords() {
        let set = vec![
            KeyVal::from_token("type=file"),
            KeyVal::from_token("uid=0"),
        ];
        let own = vec![
            KeyVal::from_token("uid=1000"),
            KeyVal::from_token("size=6"),
        ];
        let merged = merge_set(&set, &own);
        let joined: Vec<&str> = merged.iter().map(KeyVal::as_str).collect();
        assert_eq!(joined, vec!["type=file", "uid=1000", "size=6"]);
    }

    #[test]
    fn mutual_exclusion_detected() {
        let both = vec![Keyword::new("time"), Keyword::new("tar_time")];
        assert!(matches!(
            check_mutual_exclusion(&both),
            Err(Error::MutualExclusion)
        ));
        assert!(check_mutual_exclusion(&[Keyword::new("time")]).is_ok());
    }

    #[test]
    fn xattr_tokens_are_sorted_and_hashed() {
        let mut stat = file_stat(0);
        stat.xattrs
            .insert("user.b".to_string(), b"two".to_vec());
        stat.xattrs
            .insert("user.a".to_string(), b"one".to_vec());
        let kvs = kw_xattr(Path::new("f"), &stat, None).unwrap();
        assert_eq!(kvs.len(), 2);
        assert!(kvs[0].as_str().starts_with("xattr.user.a="));
        assert!(kvs[1].as_str().starts_with("xattr.user.b="));
        // sha1("one")
        assert_eq!(
            kvs[0].value(),
            "fe05bcdcdc4928012781a5f1a2a77cbb5398e106"
        );
    }
}

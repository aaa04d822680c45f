//! Record types and side storage for the tar splitter/assembler.
//!
//! A split is an ordered stream of records: `Segment`s carry raw archive
//! bytes (headers, padding, trailers) inline, `File`s carry only the entry
//! name, payload size, and a CRC-64 of the payload, while the payload itself
//! goes to a [`FilePutter`]. The wire format is one JSON document per line.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crc::Crc;
use serde::{Deserialize, Serialize};

use crate::entry::bytes_to_os;
use crate::{Error, Result};

/// CRC-64 with the ISO polynomial; file payload integrity, not cryptography.
pub const CRC64: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_GO_ISO);

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RecordKind {
    /// Raw bytes from the archive stream: headers and padding.
    Segment = 1,
    /// A file payload, stored externally and checksummed here.
    File = 2,
}

impl From<RecordKind> for u8 {
    fn from(k: RecordKind) -> u8 {
        k as u8
    }
}

impl TryFrom<u8> for RecordKind {
    type Error = String;
    fn try_from(v: u8) -> std::result::Result<RecordKind, String> {
        match v {
            1 => Ok(RecordKind::Segment),
            2 => Ok(RecordKind::File),
            other => Err(format!("unknown record type {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Set instead of `name` when the entry name is not valid UTF-8.
    #[serde(
        default,
        rename = "name_raw",
        with = "opt_base64",
        skip_serializing_if = "Option::is_none"
    )]
    pub name_raw: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    /// Segment: the raw bytes. File: the 8-byte CRC-64 digest.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub position: usize,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Record {
    pub fn segment(payload: Vec<u8>) -> Record {
        Record {
            kind: RecordKind::Segment,
            name: String::new(),
            name_raw: None,
            size: 0,
            payload,
            position: 0,
        }
    }

    pub fn file(name: &[u8], size: u64, checksum: Vec<u8>) -> Record {
        let mut rec = Record {
            kind: RecordKind::File,
            name: String::new(),
            name_raw: None,
            size,
            payload: checksum,
            position: 0,
        };
        match std::str::from_utf8(name) {
            Ok(s) => rec.name = s.to_string(),
            Err(_) => rec.name_raw = Some(name.to_vec()),
        }
        rec
    }

    /// Entry name regardless of which field carries it.
    pub fn name_bytes(&self) -> &[u8] {
        match &self.name_raw {
            Some(raw) if !raw.is_empty() => raw,
            _ => self.name.as_bytes(),
        }
    }

    pub fn name_path(&self) -> PathBuf {
        PathBuf::from(bytes_to_os(self.name_bytes().to_vec()))
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        if bytes.is_empty() {
            s.serialize_none()
        } else {
            s.serialize_str(&STANDARD.encode(bytes))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
        }
    }
}

mod opt_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(opt: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match opt {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(s) => STANDARD
                .decode(s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

// ── Packing ───────────────────────────────────────────────────────────────────

pub trait Packer {
    /// Store one record, assigning its position. Returns the position.
    fn add(&mut self, rec: Record) -> Result<usize>;
}

pub trait Unpacker {
    /// The next record, or `None` at end of stream.
    fn next(&mut self) -> Result<Option<Record>>;
}

/// Writes one JSON document per record, one per line.
#[derive(Debug)]
pub struct JsonPacker<W: Write> {
    w: W,
    pos: usize,
}

impl<W: Write> JsonPacker<W> {
    pub fn new(w: W) -> JsonPacker<W> {
        JsonPacker { w, pos: 0 }
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}

impl<W: Write> Packer for JsonPacker<W> {
    fn add(&mut self, mut rec: Record) -> Result<usize> {
        rec.position = self.pos;
        let line = serde_json::to_string(&rec)
            .map_err(|e| Error::TarFormat(format!("record encode: {e}")))?;
        self.w.write_all(line.as_bytes())?;
        self.w.write_all(b"\n")?;
        self.pos += 1;
        Ok(rec.position)
    }
}

/// Reads the format [`JsonPacker`] writes.
pub struct JsonUnpacker<R: Read> {
    r: BufReader<R>,
}

impl<R: Read> JsonUnpacker<R> {
    pub fn new(r: R) -> JsonUnpacker<R> {
        JsonUnpacker {
            r: BufReader::new(r),
        }
    }
}

impl<R: Read> Unpacker for JsonUnpacker<R> {
    fn next(&mut self) -> Result<Option<Record>> {
        loop {
            let mut line = String::new();
            let n = self.r.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            let rec = serde_json::from_str(&line)
                .map_err(|e| Error::TarFormat(format!("record decode: {e}")))?;
            return Ok(Some(rec));
        }
    }
}

// ── File payload storage ──────────────────────────────────────────────────────

/// Source of file payloads for reassembly, addressed by archive-relative name.
pub trait FileGetter {
    fn get(&self, name: &Path) -> io::Result<Box<dyn Read + Send + '_>>;
}

/// Sink for file payloads during a split. Returns the byte count and CRC-64.
pub trait FilePutter {
    fn put(&mut self, name: &Path, r: &mut dyn Read) -> io::Result<(u64, Vec<u8>)>;
}

fn copy_with_crc(r: &mut dyn Read, mut sink: impl Write) -> io::Result<(u64, Vec<u8>)> {
    let mut digest = CRC64.digest();
    let mut buf = [0u8; 32 * 1024];
    let mut total = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
        sink.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok((total, digest.finalize().to_be_bytes().to_vec()))
}

/// Reads payloads from files under a root directory.
pub struct PathFileGetter {
    root: PathBuf,
}

impl PathFileGetter {
    pub fn new(root: impl Into<PathBuf>) -> PathFileGetter {
        PathFileGetter { root: root.into() }
    }
}

impl FileGetter for PathFileGetter {
    fn get(&self, name: &Path) -> io::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(File::open(self.root.join(name))?))
    }
}

/// Writes payloads as files under a root directory.
pub struct PathFilePutter {
    root: PathBuf,
}

impl PathFilePutter {
    pub fn new(root: impl Into<PathBuf>) -> PathFilePutter {
        PathFilePutter { root: root.into() }
    }
}

impl FilePutter for PathFilePutter {
    fn put(&mut self, name: &Path, r: &mut dyn Read) -> io::Result<(u64, Vec<u8>)> {
        let dest = self.root.join(name);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let f = File::create(&dest)?;
        copy_with_crc(r, f)
    }
}

/// Keeps every payload in memory; both a getter and a putter. Handy for
/// tests and small archives, expensive for anything else.
#[derive(Default, Debug)]
pub struct BufferFileGetPutter {
    files: HashMap<PathBuf, Vec<u8>>,
}

impl BufferFileGetPutter {
    pub fn new() -> BufferFileGetPutter {
        BufferFileGetPutter::default()
    }
}

impl FileGetter for BufferFileGetPutter {
    fn get(&self, name: &Path) -> io::Result<Box<dyn Read + Send + '_>> {
        match self.files.get(name) {
            Some(data) => Ok(Box::new(data.as_slice())),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such payload {name:?}"),
            )),
        }
    }
}

impl FilePutter for BufferFileGetPutter {
    fn put(&mut self, name: &Path, r: &mut dyn Read) -> io::Result<(u64, Vec<u8>)> {
        let mut data = Vec::new();
        let (n, crc) = copy_with_crc(r, &mut data)?;
        self.files.insert(name.to_path_buf(), data);
        Ok((n, crc))
    }
}

/// Checksums and discards payloads; for splits that only need the records.
#[derive(Default)]
pub struct DiscardFilePutter;

impl DiscardFilePutter {
    pub fn new() -> DiscardFilePutter {
        DiscardFilePutter
    }
}

impl FilePutter for DiscardFilePutter {
    fn put(&mut self, _name: &Path, r: &mut dyn Read) -> io::Result<(u64, Vec<u8>)> {
        copy_with_crc(r, io::sink())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn crc64_iso_check_value() {
        let (n, crc) = DiscardFilePutter::new()
            .put(Path::new("x"), &mut &b"123456789"[..])
            .unwrap();
        assert_eq!(n, 9);
        assert_eq!(hex::encode(crc), "b90956c775a41001");
    }

    #[test]
    fn records_roundtrip_as_json_lines() {
        let mut buf = Vec::new();
        {
            let mut packer = JsonPacker::new(&mut buf);
            packer.add(Record::segment(vec![0x1f, 0x8b, 0x00])).unwrap();
            packer
                .add(Record::file(b"x/files", 6, vec![1, 2, 3, 4, 5, 6, 7, 8]))
                .unwrap();
        }

        let text = String::from_utf8(buf.clone()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            r#"{"type":1,"payload":"H4sA","position":0}"#
        );
        assert_eq!(
            lines.next().unwrap(),
            r#"{"type":2,"name":"x/files","size":6,"payload":"AQIDBAUGBwg=","position":1}"#
        );

        let mut unpacker = JsonUnpacker::new(buf.as_slice());
        let seg = unpacker.next().unwrap().unwrap();
        assert_eq!(seg.kind, RecordKind::Segment);
        assert_eq!(seg.payload, vec![0x1f, 0x8b, 0x00]);
        assert_eq!(seg.position, 0);
        let file = unpacker.next().unwrap().unwrap();
        assert_eq!(file.kind, RecordKind::File);
        assert_eq!(file.name, "x/files");
        assert_eq!(file.size, 6);
        assert!(unpacker.next().unwrap().is_none());
    }

    #[test]
    fn null_payload_decodes_to_empty() {
        let mut unpacker =
            JsonUnpacker::new(&br#"{"type":2,"name":"a","payload":null,"position":0}"#[..]);
        let rec = unpacker.next().unwrap().unwrap();
        assert_eq!(rec.payload, Vec::<u8>::new());
        assert_eq!(rec.size, 0);
    }

    #[test]
    fn non_utf8_names_use_name_raw() {
        let rec = Record::file(&[0x66, 0xff, 0x6f], 1, vec![0; 8]);
        assert!(rec.name.is_empty());
        assert_eq!(rec.name_raw.as_deref(), Some(&[0x66, 0xff, 0x6f][..]));
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"name_raw\":\"Zv9v\""));
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name_bytes(), &[0x66, 0xff, 0x6f]);
    }

    #[test]
    fn buffer_getputter_roundtrips() {
        let mut store = BufferFileGetPutter::new();
        let (n, crc1) = store
            .put(Path::new("a/b"), &mut &b"payload"[..])
            .unwrap();
        assert_eq!(n, 7);
        let mut back = Vec::new();
        store.get(Path::new("a/b")).unwrap().read_to_end(&mut back).unwrap();
        assert_eq!(back, b"payload");

        // same content, same crc; different content, different crc
        let (_, crc2) = store
            .put(Path::new("c"), &mut &b"payload"[..])
            .unwrap();
        assert_eq!(crc1, crc2);
        let (_, crc3) = store
            .put(Path::new("d"), &mut &b"payloae"[..])
            .unwrap();
        assert_ne!(crc1, crc3);

        assert!(store.get(Path::new("missing")).is_err());
    }
}

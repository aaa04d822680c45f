//! Bit-exact tar stream disassembly.
//!
//! The splitter walks the archive 512-byte header blocks itself: stock tar
//! readers coalesce extension headers and swallow padding, and this job is
//! to account for every raw byte. Bytes between one payload's end and the
//! next payload's start (padding, PAX/GNU extension headers, the real
//! header) become one Segment record; each entry payload becomes a File
//! record whose bytes go to the [`FilePutter`]; the end-of-archive zero
//! blocks plus any tail padding become the final Segment.
//!
//! The caller reads the original stream back out of the returned
//! [`SplitStream`]; records and payloads are emitted as a side effect.

use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::storage::{FilePutter, Packer, Record};
use crate::{Error, Result};

const BLOCK: usize = 512;

/// Split a tar byte stream. The returned stream yields the input verbatim;
/// drain it (or just call [`SplitStream::finish`]) to drive the split.
pub fn split<R, P, F>(input: R, packer: P, putter: F) -> SplitStream<P, F>
where
    R: Read + Send + 'static,
    P: Packer + Send + 'static,
    F: FilePutter + Send + 'static,
{
    let (reader, writer) = pipe();
    let handle = thread::spawn(move || run_split(input, writer, packer, putter));
    SplitStream {
        reader,
        handle: Some(handle),
    }
}

pub struct SplitStream<P, F> {
    reader: PipeReader,
    handle: Option<JoinHandle<Result<(P, F)>>>,
}

impl<P, F> Read for SplitStream<P, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl<P, F> SplitStream<P, F> {
    /// Drain whatever the caller has not read yet and recover the packer and
    /// putter. Surfaces the producer's error, if any.
    pub fn finish(mut self) -> Result<(P, F)> {
        // A pipe error here mirrors the producer's own result; the join
        // below reports the structured version.
        let _ = io::copy(&mut self.reader, &mut io::sink());
        match self.handle.take().expect("finish called once").join() {
            Ok(res) => res,
            Err(_) => Err(Error::TarFormat("splitter thread panicked".to_string())),
        }
    }
}

fn run_split<R: Read, P: Packer, F: FilePutter>(
    mut input: R,
    mut out: PipeWriter,
    mut packer: P,
    mut putter: F,
) -> Result<(P, F)> {
    match split_loop(&mut input, &mut out, &mut packer, &mut putter) {
        Ok(()) => Ok((packer, putter)),
        Err(e) => {
            out.close_with_error(io::Error::new(io::ErrorKind::Other, e.to_string()));
            Err(e)
        }
    }
}

fn split_loop(
    input: &mut dyn Read,
    out: &mut PipeWriter,
    packer: &mut dyn Packer,
    putter: &mut dyn FilePutter,
) -> Result<()> {
    // Raw bytes captured since the last payload ended.
    let mut seg: Vec<u8> = Vec::new();
    let mut block = [0u8; BLOCK];

    // Name and size overrides announced by extension headers, consumed by
    // the next real entry.
    let mut gnu_longname: Option<Vec<u8>> = None;
    let mut pax_path: Option<Vec<u8>> = None;
    let mut pax_size: Option<u64> = None;

    loop {
        let n = read_full(input, &mut block)?;
        if n == 0 {
            // Archive ended without trailer blocks. Unusual but reproducible.
            if !seg.is_empty() {
                packer.add(Record::segment(std::mem::take(&mut seg)))?;
            }
            return Ok(());
        }
        out.write_all(&block[..n])?;
        seg.extend_from_slice(&block[..n]);
        if n < BLOCK {
            packer.add(Record::segment(std::mem::take(&mut seg)))?;
            return Err(Error::TarFormat(
                "unexpected EOF inside a header block".to_string(),
            ));
        }

        if block.iter().all(|&b| b == 0) {
            // Start of the end-of-archive trailer. Everything from here on,
            // including arbitrary tail padding, is one final segment.
            let mut chunk = [0u8; 32 * 1024];
            loop {
                let n = input.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                out.write_all(&chunk[..n])?;
                seg.extend_from_slice(&chunk[..n]);
            }
            packer.add(Record::segment(std::mem::take(&mut seg)))?;
            return Ok(());
        }

        if !verify_checksum(&block) {
            packer.add(Record::segment(std::mem::take(&mut seg)))?;
            return Err(Error::TarFormat("header checksum mismatch".to_string()));
        }

        let size = parse_numeric(&block[124..136])?;
        let typeflag = block[156];

        match typeflag {
            // GNU long name / long link: the payload is metadata and stays
            // inside the segment.
            b'L' | b'K' => {
                let payload = read_meta_payload(input, out, &mut seg, size)?;
                if typeflag == b'L' {
                    gnu_longname = Some(trim_nul(&payload));
                }
            }
            // PAX extended headers. Global ('g') records are captured but
            // not applied; per-entry ('x') path and size override the next
            // real header.
            b'x' | b'g' => {
                let payload = read_meta_payload(input, out, &mut seg, size)?;
                if typeflag == b'x' {
                    for (key, value) in parse_pax_records(&payload)? {
                        match key.as_slice() {
                            b"path" => pax_path = Some(value),
                            b"size" => {
                                let text = String::from_utf8_lossy(&value);
                                pax_size = Some(text.trim().parse().map_err(|_| {
                                    Error::TarFormat(format!("bad pax size {text:?}"))
                                })?);
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => {
                // Old GNU sparse entries chain extra map blocks before the
                // payload; they belong to the segment.
                if typeflag == b'S' && block[482] != 0 {
                    loop {
                        let n = read_full(input, &mut block)?;
                        if n < BLOCK {
                            if n > 0 {
                                out.write_all(&block[..n])?;
                                seg.extend_from_slice(&block[..n]);
                            }
                            packer.add(Record::segment(std::mem::take(&mut seg)))?;
                            return Err(Error::TarFormat(
                                "unexpected EOF in sparse map".to_string(),
                            ));
                        }
                        out.write_all(&block[..n])?;
                        seg.extend_from_slice(&block[..n]);
                        if block[504] == 0 {
                            break;
                        }
                    }
                }

                let name = entry_name(&block, pax_path.take(), gnu_longname.take());
                // Link, device, directory, and fifo entries carry no payload
                // regardless of their size field.
                let payload_size = match typeflag {
                    b'1' | b'2' | b'3' | b'4' | b'5' | b'6' => 0,
                    // The size field of a sparse entry counts the bytes
                    // actually stored, which is exactly what we copy.
                    b'S' => size,
                    _ => pax_size.unwrap_or(size),
                };
                pax_size = None;

                debug!(
                    name = %String::from_utf8_lossy(&name),
                    size = payload_size,
                    "tar entry"
                );
                packer.add(Record::segment(std::mem::take(&mut seg)))?;

                let mut checksum = Vec::new();
                if payload_size > 0 {
                    let mut payload = PayloadReader {
                        input: &mut *input,
                        out: &mut *out,
                        remaining: payload_size,
                    };
                    let name_path =
                        std::path::PathBuf::from(crate::entry::bytes_to_os(name.clone()));
                    let (copied, crc) = putter.put(&name_path, &mut payload)?;
                    if copied != payload_size {
                        return Err(Error::TarFormat(format!(
                            "unexpected EOF in payload of {:?} ({copied} of {payload_size} bytes)",
                            String::from_utf8_lossy(&name)
                        )));
                    }
                    checksum = crc;

                    // Alignment padding opens the next segment.
                    let pad = (BLOCK - (payload_size as usize % BLOCK)) % BLOCK;
                    if pad > 0 {
                        let n = read_full(input, &mut block[..pad])?;
                        out.write_all(&block[..n])?;
                        seg.extend_from_slice(&block[..n]);
                        if n < pad {
                            packer.add(Record::segment(std::mem::take(&mut seg)))?;
                            return Err(Error::TarFormat(
                                "unexpected EOF in padding".to_string(),
                            ));
                        }
                    }
                }
                packer.add(Record::file(&name, payload_size, checksum))?;
            }
        }
    }
}

/// Reads exactly the payload bytes of one entry out of the archive,
/// forwarding them to the data-path pipe as they pass.
struct PayloadReader<'a> {
    input: &'a mut dyn Read,
    out: &'a mut PipeWriter,
    remaining: u64,
}

impl Read for PayloadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.input.read(&mut buf[..want])?;
        if n > 0 {
            self.out.write_all(&buf[..n])?;
            self.remaining -= n as u64;
        }
        Ok(n)
    }
}

fn read_full(r: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

/// Metadata payloads (long names, PAX records) are read block-aligned and
/// stay inside the current segment.
fn read_meta_payload(
    input: &mut dyn Read,
    out: &mut PipeWriter,
    seg: &mut Vec<u8>,
    size: u64,
) -> Result<Vec<u8>> {
    let blocks = (size as usize).div_ceil(BLOCK);
    let mut raw = vec![0u8; blocks * BLOCK];
    let n = read_full(input, &mut raw)?;
    out.write_all(&raw[..n])?;
    seg.extend_from_slice(&raw[..n]);
    if n < raw.len() {
        return Err(Error::TarFormat(
            "unexpected EOF in extension header".to_string(),
        ));
    }
    raw.truncate(size as usize);
    Ok(raw)
}

fn trim_nul(bytes: &[u8]) -> Vec<u8> {
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(bytes.len());
    bytes[..end].to_vec()
}

/// Resolve the logical entry name: PAX `path` wins, then a GNU long name,
/// then the ustar prefix/name fields.
fn entry_name(block: &[u8; BLOCK], pax: Option<Vec<u8>>, gnu: Option<Vec<u8>>) -> Vec<u8> {
    if let Some(name) = pax {
        return name;
    }
    if let Some(name) = gnu {
        return name;
    }
    let name = trim_nul(&block[0..100]);
    // The prefix field only exists in POSIX ustar headers.
    if &block[257..263] == b"ustar\0" {
        let prefix = trim_nul(&block[345..500]);
        if !prefix.is_empty() {
            let mut full = prefix;
            full.push(b'/');
            full.extend_from_slice(&name);
            return full;
        }
    }
    name
}

/// Numeric header field: octal text, or base-256 when the high bit of the
/// first byte is set.
fn parse_numeric(field: &[u8]) -> Result<u64> {
    if field.first().is_some_and(|&b| b & 0x80 != 0) {
        let mut val: u64 = u64::from(field[0] & 0x7f);
        for &b in &field[1..] {
            val = (val << 8) | u64::from(b);
        }
        return Ok(val);
    }
    parse_octal(field)
}

fn parse_octal(field: &[u8]) -> Result<u64> {
    let mut val: u64 = 0;
    let mut seen = false;
    for &b in field {
        match b {
            b'0'..=b'7' => {
                val = (val << 3) | u64::from(b - b'0');
                seen = true;
            }
            b' ' | 0 => {
                if seen {
                    break;
                }
            }
            _ => {
                return Err(Error::TarFormat(format!(
                    "invalid octal field {:?}",
                    String::from_utf8_lossy(field)
                )))
            }
        }
    }
    Ok(val)
}

/// Sum of the header bytes with the checksum field blanked. Accepts the
/// signed variant some historic producers wrote.
fn verify_checksum(block: &[u8; BLOCK]) -> bool {
    let Ok(stored) = parse_octal(&block[148..156]) else {
        return false;
    };
    let mut unsigned: u64 = 0;
    let mut signed: i64 = 0;
    for (i, &b) in block.iter().enumerate() {
        let v = if (148..156).contains(&i) { b' ' } else { b };
        unsigned += u64::from(v);
        signed += i64::from(v as i8);
    }
    stored == unsigned || i64::try_from(stored).is_ok_and(|s| s == signed)
}

/// `len key=value\n` sequences from a PAX extension payload.
fn parse_pax_records(payload: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::TarFormat("malformed pax record".to_string()))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::TarFormat("malformed pax record length".to_string()))?;
        if len <= space + 1 || len > rest.len() {
            return Err(Error::TarFormat("malformed pax record length".to_string()));
        }
        let body = &rest[space + 1..len];
        let body = body.strip_suffix(b"\n").unwrap_or(body);
        let eq = body
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| Error::TarFormat("malformed pax record".to_string()))?;
        out.push((body[..eq].to_vec(), body[eq + 1..].to_vec()));
        rest = &rest[len..];
    }
    Ok(out)
}

//! Reassembles the original tar byte stream from a record stream plus a
//! file payload source. Segments are copied verbatim; File records pull
//! their payload from the [`FileGetter`] and are verified against the
//! recorded CRC-64 on the way through.

use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};

use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::storage::{FileGetter, Unpacker, CRC64};
use crate::{Error, Result};

/// Produce the reassembled stream. Read it to drive the producer; a failing
/// payload lookup or checksum surfaces on the data path after the bytes
/// written so far.
pub fn assemble<G, U>(getter: G, unpacker: U) -> AssembleStream
where
    G: FileGetter + Send + 'static,
    U: Unpacker + Send + 'static,
{
    let (reader, mut writer) = pipe();
    let handle = thread::spawn(move || {
        match assemble_loop(&getter, unpacker, &mut writer) {
            Ok(()) => Ok(()),
            Err(e) => {
                writer.close_with_error(io::Error::new(io::ErrorKind::Other, e.to_string()));
                Err(e)
            }
        }
    });
    AssembleStream {
        reader,
        handle: Some(handle),
    }
}

pub struct AssembleStream {
    reader: PipeReader,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Read for AssembleStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl AssembleStream {
    /// Drain the remainder and surface the producer's structured result.
    pub fn finish(mut self) -> Result<()> {
        let _ = io::copy(&mut self.reader, &mut io::sink());
        match self.handle.take().expect("finish called once").join() {
            Ok(res) => res,
            Err(_) => Err(Error::TarFormat("assembler thread panicked".to_string())),
        }
    }
}

fn assemble_loop(
    getter: &dyn FileGetter,
    mut unpacker: impl Unpacker,
    out: &mut PipeWriter,
) -> Result<()> {
    while let Some(rec) = unpacker.next()? {
        match rec.kind {
            crate::storage::RecordKind::Segment => out.write_all(&rec.payload)?,
            crate::storage::RecordKind::File => {
                // Hardlinks and empty files carry no payload.
                if rec.size == 0 {
                    continue;
                }
                let mut src = getter.get(&rec.name_path())?;
                let mut digest = CRC64.digest();
                let mut remaining = rec.size;
                let mut buf = [0u8; 32 * 1024];
                while remaining > 0 {
                    let want = buf.len().min(remaining as usize);
                    let n = src.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(Error::TarFormat(format!(
                            "short payload for {:?}: {} of {} bytes",
                            rec.name_path(),
                            rec.size - remaining,
                            rec.size
                        )));
                    }
                    digest.update(&buf[..n]);
                    out.write_all(&buf[..n])?;
                    remaining -= n as u64;
                }
                let crc = digest.finalize().to_be_bytes();
                if !rec.payload.is_empty() && rec.payload != crc {
                    return Err(Error::TarFormat(format!(
                        "file integrity checksum failed for {:?}",
                        rec.name_path()
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::tests::{build_archive, split_records};
    use crate::storage::{
        BufferFileGetPutter, FilePutter, JsonPacker, JsonUnpacker, Record, RecordKind,
    };
    use sha1::{Digest, Sha1};
    use std::io::Cursor;
    use std::path::Path;

    fn reassemble(records: Vec<Record>, store: BufferFileGetPutter) -> Result<Vec<u8>> {
        let mut json = Vec::new();
        {
            let mut packer = JsonPacker::new(&mut json);
            for rec in records {
                crate::storage::Packer::add(&mut packer, rec).unwrap();
            }
        }
        let mut stream = assemble(store, JsonUnpacker::new(Cursor::new(json)));
        let mut out = Vec::new();
        let read_err = stream.read_to_end(&mut out);
        match stream.finish() {
            Ok(()) => {
                read_err?;
                Ok(out)
            }
            Err(e) => Err(e),
        }
    }

    fn roundtrip(archive: &[u8]) {
        let (records, store) = split_records(archive);
        let out = reassemble(records, store).unwrap();
        assert_eq!(out, archive, "reassembled stream differs");
    }

    #[test]
    fn roundtrips_simple_archives() {
        roundtrip(&build_archive(&[("a.txt", b"hello\n")]));
        roundtrip(&build_archive(&[
            ("a.txt", b"hello\n"),
            ("b.txt", b""),
            ("dir/c.bin", &[0xa5; 1000]),
        ]));
        roundtrip(&[]);
    }

    #[test]
    fn roundtrips_long_names() {
        let long = "deep/".repeat(30) + "leaf";
        let mut builder = tar::Builder::new(Vec::new());
        let mut hdr = tar::Header::new_gnu();
        hdr.set_size(4);
        hdr.set_mode(0o644);
        hdr.set_cksum();
        builder
            .append_data(&mut hdr, long.as_str(), Cursor::new(b"data".to_vec()))
            .unwrap();
        roundtrip(&builder.into_inner().unwrap());
    }

    #[test]
    fn roundtrips_hardlinks_and_trailing_padding() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut hdr = tar::Header::new_ustar();
        hdr.set_path("orig").unwrap();
        hdr.set_size(5);
        hdr.set_mode(0o644);
        hdr.set_cksum();
        builder.append(&hdr, Cursor::new(b"files".to_vec())).unwrap();
        let mut link = tar::Header::new_ustar();
        link.set_path("alias").unwrap();
        link.set_entry_type(tar::EntryType::Link);
        link.set_link_name("orig").unwrap();
        link.set_size(0);
        link.set_cksum();
        builder.append(&link, Cursor::new(Vec::new())).unwrap();
        let mut archive = builder.into_inner().unwrap();

        // Some producers pad archives out past the two zero blocks.
        archive.extend_from_slice(&[0u8; 3072]);
        archive.extend_from_slice(b"stray tail bytes");
        roundtrip(&archive);
    }

    // Hand-built header for the formats tar::Builder will not produce.
    fn raw_header(name: &str, size: u64, typeflag: u8, gnu_magic: bool) -> [u8; 512] {
        let mut b = [0u8; 512];
        b[..name.len()].copy_from_slice(name.as_bytes());
        b[100..108].copy_from_slice(b"0000644\0");
        b[108..116].copy_from_slice(b"0000000\0");
        b[116..124].copy_from_slice(b"0000000\0");
        b[124..136].copy_from_slice(format!("{size:011o}\0").as_bytes());
        b[136..148].copy_from_slice(b"00000000000\0");
        b[156] = typeflag;
        if gnu_magic {
            b[257..265].copy_from_slice(b"ustar  \0");
        } else {
            b[257..263].copy_from_slice(b"ustar\0");
            b[263..265].copy_from_slice(b"00");
        }
        let mut sum: u64 = 0;
        for (i, &v) in b.iter().enumerate() {
            sum += u64::from(if (148..156).contains(&i) { b' ' } else { v });
        }
        b[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());
        b
    }

    fn pad_block(data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        let pad = (512 - data.len() % 512) % 512;
        out.extend(std::iter::repeat(0u8).take(pad));
        out
    }

    #[test]
    fn roundtrips_pax_path_and_size_overrides() {
        let pax_payload = b"32 path=renamed/via/pax/records\n11 size=10\n";
        let mut archive = Vec::new();
        archive.extend_from_slice(&raw_header(
            "PaxHeaders.0/short",
            pax_payload.len() as u64,
            b'x',
            false,
        ));
        archive.extend_from_slice(&pad_block(pax_payload));
        // The ustar size field is zeroed so only the pax override can be right.
        archive.extend_from_slice(&raw_header("short", 0, b'0', false));
        archive.extend_from_slice(&pad_block(b"0123456789"));
        archive.extend_from_slice(&[0u8; 1024]);

        let (records, store) = split_records(&archive);
        let file = records
            .iter()
            .find(|r| r.kind == RecordKind::File)
            .unwrap();
        assert_eq!(file.name, "renamed/via/pax/records");
        assert_eq!(file.size, 10);

        let out = reassemble(records, store).unwrap();
        assert_eq!(out, archive);
    }

    #[test]
    fn roundtrips_old_gnu_sparse() {
        // Stored size is what the size field counts; the expanded size lives
        // in the realsize field, which reassembly never needs.
        let stored = b"sparse-stored-bytes";
        let mut hdr = raw_header("sparse.bin", stored.len() as u64, b'S', true);
        hdr[483..495].copy_from_slice(b"00000100000\0");
        // recompute the checksum after editing realsize
        let mut sum: u64 = 0;
        for (i, &v) in hdr.iter().enumerate() {
            sum += u64::from(if (148..156).contains(&i) { b' ' } else { v });
        }
        hdr[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());

        let mut archive = Vec::new();
        archive.extend_from_slice(&hdr);
        archive.extend_from_slice(&pad_block(stored));
        archive.extend_from_slice(&[0u8; 1024]);

        let (records, store) = split_records(&archive);
        let file = records
            .iter()
            .find(|r| r.kind == RecordKind::File)
            .unwrap();
        assert_eq!(file.size, stored.len() as u64);
        let out = reassemble(records, store).unwrap();
        assert_eq!(out, archive);
    }

    #[test]
    fn roundtrips_gzipped_corpus() {
        // The reference corpus ships gzipped; inflate, split, reassemble,
        // and compare digests of the streams.
        let archive = build_archive(&[("t/file1", b"hello\n"), ("t/file2", &[9u8; 2048])]);
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&archive).unwrap();
        let gzipped = gz.finish().unwrap();

        let mut inflated = Vec::new();
        flate2::read::GzDecoder::new(Cursor::new(gzipped))
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, archive);

        let (records, store) = split_records(&inflated);
        let out = reassemble(records, store).unwrap();
        assert_eq!(
            Sha1::digest(&out),
            Sha1::digest(&inflated),
            "digest of reassembled stream differs"
        );
        assert_eq!(out.len(), inflated.len());
    }

    #[test]
    fn tampered_payload_fails_checksum() {
        let archive = build_archive(&[("a.txt", b"hello!")]);
        let (records, _) = split_records(&archive);

        // Same length, different bytes.
        let mut store = BufferFileGetPutter::new();
        store
            .put(Path::new("a.txt"), &mut &b"HELLO!"[..])
            .unwrap();
        let err = reassemble(records, store).unwrap_err();
        assert!(
            err.to_string().contains("integrity checksum failed"),
            "{err}"
        );
    }

    #[test]
    fn missing_payload_surfaces_getter_error() {
        let archive = build_archive(&[("a.txt", b"hello!")]);
        let (records, _) = split_records(&archive);
        let err = reassemble(records, BufferFileGetPutter::new()).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
    }
}

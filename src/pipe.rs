//! A bounded in-process byte pipe connecting a producer thread to a
//! consumer, with an error slot so either side can close with a cause.
//!
//! Semantics follow the pipes the tar producers are built around: the reader
//! drains buffered bytes before it sees EOF or the error; a writer touching
//! a dropped reader gets `BrokenPipe` so the producer unwinds and releases
//! its scratch state.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

const DEFAULT_CAPACITY: usize = 64 * 1024;

struct Inner {
    buf: VecDeque<u8>,
    capacity: usize,
    write_closed: bool,
    read_closed: bool,
    // (kind, message) so the error can be re-materialized on every observe.
    error: Option<(io::ErrorKind, String)>,
}

impl Inner {
    fn take_error(&self) -> Option<io::Error> {
        self.error
            .as_ref()
            .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

pub struct PipeWriter {
    shared: Arc<Shared>,
}

/// Create a connected reader/writer pair with the default buffer size.
pub fn pipe() -> (PipeReader, PipeWriter) {
    pipe_with_capacity(DEFAULT_CAPACITY)
}

pub fn pipe_with_capacity(capacity: usize) -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            buf: VecDeque::new(),
            capacity: capacity.max(1),
            write_closed: false,
            read_closed: false,
            error: None,
        }),
        cond: Condvar::new(),
    });
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

impl PipeWriter {
    /// Close the write end, handing `err` to the reader once it drains.
    pub fn close_with_error(&mut self, err: io::Error) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.error.is_none() {
            inner.error = Some((err.kind(), err.to_string()));
        }
        inner.write_closed = true;
        self.shared.cond.notify_all();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if inner.read_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe reader dropped",
                ));
            }
            if inner.write_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write after close",
                ));
            }
            let room = inner.capacity - inner.buf.len();
            if room > 0 {
                let n = room.min(data.len());
                inner.buf.extend(&data[..n]);
                self.shared.cond.notify_all();
                return Ok(n);
            }
            inner = self.shared.cond.wait(inner).unwrap();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.write_closed = true;
        self.shared.cond.notify_all();
    }
}

impl PipeReader {
    /// Close the read end with a cause; pending and future writes fail.
    pub fn close_with_error(&mut self, err: io::Error) {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.error.is_none() {
            inner.error = Some((err.kind(), err.to_string()));
        }
        inner.read_closed = true;
        self.shared.cond.notify_all();
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if !inner.buf.is_empty() {
                let n = out.len().min(inner.buf.len());
                for (slot, b) in out.iter_mut().zip(inner.buf.drain(..n)) {
                    *slot = b;
                }
                self.shared.cond.notify_all();
                return Ok(n);
            }
            if inner.write_closed {
                return match inner.take_error() {
                    Some(err) => Err(err),
                    None => Ok(0),
                };
            }
            inner = self.shared.cond.wait(inner).unwrap();
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.read_closed = true;
        self.shared.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn bytes_flow_through() {
        let (mut r, mut w) = pipe_with_capacity(4);
        let producer = thread::spawn(move || {
            w.write_all(b"hello, pipe!").unwrap();
        });
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        producer.join().unwrap();
        assert_eq!(out, b"hello, pipe!");
    }

    #[test]
    fn error_arrives_after_buffered_bytes() {
        let (mut r, mut w) = pipe();
        w.write_all(b"abc").unwrap();
        w.close_with_error(io::Error::new(io::ErrorKind::InvalidData, "boom"));
        drop(w);

        let mut buf = [0u8; 8];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
        let err = r.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        // the error persists across reads
        let err = r.read(&mut buf).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn dropped_reader_breaks_writer() {
        let (r, mut w) = pipe_with_capacity(2);
        drop(r);
        let err = w.write_all(b"xyz").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn clean_close_is_eof() {
        let (mut r, mut w) = pipe();
        w.write_all(b"ok").unwrap();
        drop(w);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ok");
    }
}

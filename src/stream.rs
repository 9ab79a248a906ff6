//! A unified seekable byte source, the one I/O abstraction every format
//! parser in this crate is built on.
//!
//! The teacher crate this is grounded on is sans-io and lets the caller's
//! own `std::io::{Read, Seek}` stand in directly; this crate's callers are
//! expected to decompress synchronously against a single archive handle, so
//! [`Stream`] is a small trait over exactly the three operations the format
//! parsers need: `read`, `seek`, `tell`.

use std::io::{self, Read, Seek, SeekFrom};

/// Where a [`Stream::seek`] is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    /// Relative to the start of the stream.
    Start,
    /// Relative to the current position.
    Current,
    /// Relative to the end of the stream.
    End,
}

/// A seekable byte source. Implemented for files, in-memory buffers, and any
/// user-supplied backend that can answer `read`/`seek`/`tell`.
///
/// A short read (fewer bytes than requested) is the normal end-of-stream
/// signal, not an error — mirroring the specification's stream contract.
pub trait Stream {
    /// Read up to `buf.len()` bytes, returning the number actually read. `0`
    /// means end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Move the stream's position.
    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> io::Result<u64>;

    /// Return the stream's current position.
    fn tell(&mut self) -> io::Result<u64>;

    /// Total length of the stream, if knowable up front.
    fn len(&mut self) -> io::Result<u64>;

    /// Read exactly `buf.len()` bytes, treating a short read as
    /// [`io::ErrorKind::UnexpectedEof`].
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            filled += n;
        }
        Ok(())
    }

    /// Read exactly `n` bytes into a freshly allocated `Vec`.
    ///
    /// `n` is often a header-declared size (a central directory's claimed
    /// entry count, a 7z/tar record length) rather than something already
    /// bounds-checked against the stream, so the allocation is reserved
    /// fallibly instead of letting an oversized `n` abort the process.
    fn read_vec(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut v = Vec::new();
        v.try_reserve_exact(n)
            .map_err(|_| io::Error::other(format!("out of memory allocating {n} bytes")))?;
        v.resize(n, 0);
        self.read_exact(&mut v)?;
        Ok(v)
    }

    /// Skip forward `n` bytes.
    fn skip(&mut self, n: u64) -> io::Result<()> {
        self.seek(n as i64, SeekOrigin::Current)?;
        Ok(())
    }
}

fn seek_from(offset: i64, origin: SeekOrigin) -> SeekFrom {
    match origin {
        SeekOrigin::Start => SeekFrom::Start(offset as u64),
        SeekOrigin::Current => SeekFrom::Current(offset),
        SeekOrigin::End => SeekFrom::End(offset),
    }
}

/// A [`Stream`] backed by any `Read + Seek` implementor (typically
/// [`std::fs::File`]), with the length cached at construction time.
pub struct FileStream<F> {
    inner: F,
    len: u64,
}

impl<F: Read + Seek> FileStream<F> {
    /// Wrap a reader/seeker, determining its length by seeking to the end
    /// and back.
    pub fn new(mut inner: F) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, len })
    }
}

impl<F: Read + Seek> Stream for FileStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> io::Result<u64> {
        self.inner.seek(seek_from(offset, origin))
    }

    fn tell(&mut self) -> io::Result<u64> {
        self.inner.stream_position()
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.len)
    }
}

/// A [`Stream`] backed by an in-memory byte buffer.
pub struct MemoryStream<T> {
    inner: T,
    pos: u64,
}

impl<T: AsRef<[u8]>> MemoryStream<T> {
    /// Wrap an owned or borrowed byte buffer.
    pub fn new(inner: T) -> Self {
        Self { inner, pos: 0 }
    }
}

impl<T: AsRef<[u8]>> Stream for MemoryStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.inner.as_ref();
        let start = self.pos.min(data.len() as u64) as usize;
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> io::Result<u64> {
        let base = match origin {
            SeekOrigin::Start => 0i64,
            SeekOrigin::Current => self.pos as i64,
            SeekOrigin::End => self.inner.as_ref().len() as i64,
        };
        let new_pos = base
            .checked_add(offset)
            .filter(|&p| p >= 0)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    fn tell(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.inner.as_ref().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_read_and_seek() {
        let mut s = MemoryStream::new(vec![1u8, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        assert_eq!(s.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(s.tell().unwrap(), 2);

        s.seek(-1, SeekOrigin::End).unwrap();
        assert_eq!(s.tell().unwrap(), 4);
        assert_eq!(s.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], 5);
    }

    #[test]
    fn memory_stream_short_read_at_eof() {
        let mut s = MemoryStream::new(vec![1u8, 2, 3]);
        s.seek(2, SeekOrigin::Start).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(s.read(&mut buf).unwrap(), 1);
    }
}

use super::locked::LockedStream;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tracing::trace;

/// Default refill size for a [`WindowedStream`]
pub const DEFAULT_WINDOW_BUFFER_SIZE: usize = 4096;

/// Buffered view over the byte range `[start, end)` of a [`LockedStream`]
///
/// Positions reported by `Seek` are relative to `start`. An `end` of `None`
/// leaves the window open; its bound is the source's true end, discovered
/// lazily either by a `SeekFrom::End` request or by a refill that comes back
/// empty.
#[derive(Debug)]
pub struct WindowedStream {
    source: LockedStream,
    start: u64,
    end: Option<u64>,
    buffer: Vec<u8>,
    /// Unused prefix of `buffer` left behind by a short refill
    head: usize,
    /// One past the last valid byte in `buffer`
    filled: usize,
    /// Logical offset of `buffer[head]`
    buffer_base: u64,
    /// Logical cursor
    pos: u64,
}

impl WindowedStream {
    /// Window over `[start, end)`; the source handle is borrowed, never released
    pub fn new(source: &LockedStream, start: u64, end: Option<u64>) -> Self {
        Self::with_capacity(source, start, end, DEFAULT_WINDOW_BUFFER_SIZE)
    }

    pub fn with_capacity(source: &LockedStream, start: u64, end: Option<u64>, capacity: usize) -> Self {
        debug_assert!(end.map_or(true, |end| end >= start));
        Self {
            source: source.borrow(),
            start,
            end,
            buffer: vec![0; capacity.max(1)],
            head: 0,
            filled: 0,
            buffer_base: 0,
            pos: 0,
        }
    }

    /// Absolute offset of the first byte in the window
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Absolute bound, if known yet
    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// Length of the window, resolving an open bound if necessary
    pub fn len(&mut self) -> io::Result<u64> {
        let end = self.resolve_end()?;
        Ok(end.saturating_sub(self.start))
    }

    pub fn is_empty(&mut self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    fn resolve_end(&mut self) -> io::Result<u64> {
        match self.end {
            Some(end) => Ok(end),
            None => {
                let end = self.source.seek_to_end()?.max(self.start);
                self.end = Some(end);
                Ok(end)
            }
        }
    }

    fn buffered(&self) -> &[u8] {
        &self.buffer[self.head..self.filled]
    }

    fn invalidate(&mut self) {
        self.head = 0;
        self.filled = 0;
        self.buffer_base = 0;
    }

    /// Refill the buffer at the logical cursor; returns the bytes now available
    fn underflow(&mut self) -> io::Result<usize> {
        let absolute = self.start + self.pos;
        let capacity = self.buffer.len();
        let wanted = match self.end {
            Some(end) if absolute >= end => return Ok(0),
            Some(end) => ((end - absolute).min(capacity as u64)) as usize,
            None => capacity,
        };

        let outcome = self.source.atomic_seek_read(absolute, &mut self.buffer[..wanted])?;
        let count = outcome.count;
        trace!(absolute, wanted, count, "window refill");

        if count < wanted {
            // Keep the valid bytes at the top of the buffer so the unused
            // prefix is never mistaken for data.
            self.buffer.copy_within(0..count, capacity - count);
            self.head = capacity - count;
            self.filled = capacity;
            if count == 0 && self.end.is_none() {
                self.end = Some(absolute);
            }
        } else {
            self.head = 0;
            self.filled = count;
        }
        self.buffer_base = self.pos;
        Ok(count)
    }
}

impl Read for WindowedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let in_buffer = self.pos >= self.buffer_base
            && self.pos < self.buffer_base + self.buffered().len() as u64;
        if !in_buffer && self.underflow()? == 0 {
            return Ok(0);
        }

        let offset = (self.pos - self.buffer_base) as usize;
        let available = &self.buffered()[offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        self.pos += count as u64;
        Ok(count)
    }
}

impl Seek for WindowedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target: i128 = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
            SeekFrom::End(delta) => {
                let end = self.resolve_end()?;
                (end - self.start) as i128 + delta as i128
            }
        };
        // Clamped to the start of the window
        self.pos = target.max(0) as u64;
        Ok(self.pos)
    }
}

impl Write for WindowedStream {
    /// Writes go straight through to the source, truncated at a known bound
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let absolute = self.start + self.pos;
        let count = match self.end {
            Some(end) if absolute >= end => return Ok(0),
            Some(end) => ((end - absolute).min(buf.len() as u64)) as usize,
            None => buf.len(),
        };
        self.source.atomic_seek_write(absolute, &buf[..count])?;
        self.invalidate();
        self.pos += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.source.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source() -> LockedStream {
        LockedStream::owned(Cursor::new((0u8..100).collect::<Vec<u8>>()))
    }

    #[test]
    fn test_bounded_window() {
        let stream = source();
        let mut window = WindowedStream::new(&stream, 10, Some(20));
        let mut data = Vec::new();
        window.read_to_end(&mut data).unwrap();
        assert_eq!(data, (10u8..20).collect::<Vec<u8>>());

        let mut buf = [0u8; 4];
        assert_eq!(window.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_open_window_discovers_end() {
        let stream = source();
        let mut window = WindowedStream::with_capacity(&stream, 90, None, 8);
        let mut data = Vec::new();
        window.read_to_end(&mut data).unwrap();
        assert_eq!(data, (90u8..100).collect::<Vec<u8>>());
        assert_eq!(window.end(), Some(100));
    }

    #[test]
    fn test_seek_modes() {
        let stream = source();
        let mut window = WindowedStream::with_capacity(&stream, 50, None, 4);

        assert_eq!(window.seek(SeekFrom::End(-2)).unwrap(), 48);
        let mut buf = [0u8; 2];
        window.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [98, 99]);

        assert_eq!(window.seek(SeekFrom::Current(-100)).unwrap(), 0);
        window.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [50, 51]);

        window.seek(SeekFrom::Start(5)).unwrap();
        window.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [55, 56]);
    }

    #[test]
    fn test_short_refill_keeps_prefix_unused() {
        let stream = source();
        let mut window = WindowedStream::with_capacity(&stream, 97, None, 16);
        let mut buf = [0u8; 16];
        assert_eq!(window.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[97, 98, 99]);

        // Seeking back lands inside the short buffer, not its unused prefix
        window.seek(SeekFrom::Start(1)).unwrap();
        let mut one = [0u8; 1];
        window.read_exact(&mut one).unwrap();
        assert_eq!(one[0], 98);
    }

    #[test]
    fn test_write_through_is_bounded() {
        let stream = source();
        let mut window = WindowedStream::new(&stream, 0, Some(4));
        assert_eq!(window.write(b"abcdef").unwrap(), 4);

        let mut buf = [0u8; 5];
        stream.atomic_seek_read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd\x04");
    }
}

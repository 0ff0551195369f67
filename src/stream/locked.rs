use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread;
use tracing::trace;

/// Any byte stream a [`LockedStream`] can guard
pub trait SeekableStream: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> SeekableStream for T {}

/// Who is responsible for closing the underlying stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Another handle owns the stream; `release` is a no-op
    Borrowed,
    /// This handle closes the stream on `release`
    Owned,
}

/// Outcome of an atomic read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOutcome {
    /// Bytes actually transferred into the destination buffer
    pub count: usize,
    /// The source ran dry before the buffer was full
    pub eof: bool,
}

type Slot = Option<Box<dyn SeekableStream>>;

/// Thread-safe wrapper providing atomic seek+read and seek+write
///
/// Every operation holds an exclusive lock for its whole seek+transfer, so no
/// other caller's seek can land between this caller's seek and transfer.
/// Handles are cheap to clone through [`LockedStream::borrow`]; all handles
/// share the same underlying stream.
pub struct LockedStream {
    slot: Arc<Mutex<Slot>>,
    ownership: Ownership,
}

impl fmt::Debug for LockedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedStream")
            .field("ownership", &self.ownership)
            .field("open", &self.is_open())
            .finish()
    }
}

impl LockedStream {
    /// Wrap a stream and take ownership of it
    pub fn owned<S: SeekableStream + 'static>(stream: S) -> Self {
        Self::new(Box::new(stream), Ownership::Owned)
    }

    /// Wrap an already boxed stream with an explicit ownership tag
    pub fn new(stream: Box<dyn SeekableStream>, ownership: Ownership) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(stream))),
            ownership,
        }
    }

    /// A non-owning handle to the same stream
    pub fn borrow(&self) -> LockedStream {
        LockedStream {
            slot: Arc::clone(&self.slot),
            ownership: Ownership::Borrowed,
        }
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// False once an owning handle has released the stream
    pub fn is_open(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// True if both handles guard the same underlying stream
    pub fn same_stream(&self, other: &LockedStream) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Hold the lock for a compound operation
    ///
    /// The guard is the only sanctioned way to issue raw seeks on the stream.
    pub fn acquire(&self) -> io::Result<StreamGuard<'_>> {
        let guard = self.slot.lock();
        if guard.is_none() {
            return Err(released());
        }
        Ok(StreamGuard { guard })
    }

    /// Read from the current position until `buf` is full or the source ends
    pub fn atomic_read(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let mut guard = self.acquire()?;
        read_full(&mut guard, buf)
    }

    /// Seek to `pos` and read under a single lock acquisition
    pub fn atomic_seek_read(&self, pos: u64, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let mut guard = self.acquire()?;
        guard.seek(SeekFrom::Start(pos))?;
        read_full(&mut guard, buf)
    }

    /// Read without short-read detection
    ///
    /// A short read releases the lock, yields, and resumes at the position
    /// reached so far. Each retry must make progress: the first retry that
    /// returns zero bytes zero-fills the rest of `buf` and returns. The loop
    /// therefore runs at most `buf.len()` times.
    pub fn atomic_read_fill(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (mut filled, mut resume) = {
            let mut guard = self.acquire()?;
            let count = read_once(&mut guard, buf)?;
            (count, guard.stream_position()?)
        };

        while filled < buf.len() {
            thread::yield_now();
            let mut guard = self.acquire()?;
            guard.seek(SeekFrom::Start(resume))?;
            let count = read_once(&mut guard, &mut buf[filled..])?;
            trace!(resume, count, wanted = buf.len() - filled, "short read retry");
            if count == 0 {
                buf[filled..].fill(0);
                break;
            }
            filled += count;
            resume = guard.stream_position()?;
        }

        Ok(filled)
    }

    /// Write all of `buf` at the current position
    pub fn atomic_write(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.acquire()?;
        guard.write_all(buf)
    }

    /// Seek to `pos` and write under a single lock acquisition
    pub fn atomic_seek_write(&self, pos: u64, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.acquire()?;
        guard.seek(SeekFrom::Start(pos))?;
        guard.write_all(buf)
    }

    /// Position of the true end of the stream
    pub fn seek_to_end(&self) -> io::Result<u64> {
        let mut guard = self.acquire()?;
        guard.seek(SeekFrom::End(0))
    }

    pub fn flush(&self) -> io::Result<()> {
        let mut guard = self.acquire()?;
        guard.flush()
    }

    /// Close the stream if this handle owns it
    ///
    /// Every handle sharing the stream reports `NotConnected` afterwards.
    /// Borrowed handles never close anything.
    pub fn release(&self) -> io::Result<()> {
        if self.ownership == Ownership::Borrowed {
            return Ok(());
        }
        let stream = self.slot.lock().take();
        match stream {
            Some(mut stream) => stream.flush(),
            None => Ok(()),
        }
    }
}

/// Exclusive access to the guarded stream
pub struct StreamGuard<'a> {
    guard: MutexGuard<'a, Slot>,
}

impl StreamGuard<'_> {
    fn stream(&mut self) -> io::Result<&mut (dyn SeekableStream + 'static)> {
        self.guard.as_deref_mut().ok_or_else(released)
    }
}

impl Read for StreamGuard<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

impl Write for StreamGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream()?.flush()
    }
}

impl Seek for StreamGuard<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.stream()?.seek(pos)
    }
}

/// Adapter for sources that cannot be written
#[derive(Debug)]
pub struct ReadOnly<R>(pub R);

impl<R: Read> Read for ReadOnly<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Seek> Seek for ReadOnly<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl<R> Write for ReadOnly<R> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "stream is read-only",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream has been released")
}

fn read_once<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut count = 0;
    while count < buf.len() {
        let n = read_once(reader, &mut buf[count..])?;
        if n == 0 {
            return Ok(ReadOutcome { count, eof: true });
        }
        count += n;
    }
    Ok(ReadOutcome { count, eof: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Serves at most `chunk` bytes per read call
    struct Trickle {
        inner: Cursor<Vec<u8>>,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..n])
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for Trickle {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    fn sample() -> LockedStream {
        LockedStream::owned(Cursor::new((0u8..=255).collect::<Vec<u8>>()))
    }

    #[test]
    fn test_seek_read() {
        let stream = sample();
        let mut buf = [0u8; 4];
        let outcome = stream.atomic_seek_read(10, &mut buf).unwrap();
        assert_eq!(outcome, ReadOutcome { count: 4, eof: false });
        assert_eq!(buf, [10, 11, 12, 13]);

        let outcome = stream.atomic_seek_read(254, &mut buf).unwrap();
        assert_eq!(outcome, ReadOutcome { count: 2, eof: true });
        assert_eq!(&buf[..2], &[254, 255]);
    }

    #[test]
    fn test_seek_write_then_read() {
        let stream = sample();
        stream.atomic_seek_write(300, b"tail").unwrap();
        assert_eq!(stream.seek_to_end().unwrap(), 304);

        let mut buf = [0u8; 4];
        stream.atomic_seek_read(300, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn test_read_fill_trickle() {
        let stream = LockedStream::owned(Trickle {
            inner: Cursor::new(b"abcdefg".to_vec()),
            chunk: 3,
        });
        let mut buf = [0xFFu8; 10];
        let count = stream.atomic_read_fill(&mut buf).unwrap();
        assert_eq!(count, 7);
        assert_eq!(&buf, b"abcdefg\0\0\0");
    }

    #[test]
    fn test_release_owned_closes_all_handles() {
        let owner = sample();
        let borrowed = owner.borrow();
        assert_eq!(borrowed.ownership(), Ownership::Borrowed);
        assert!(borrowed.same_stream(&owner));

        // Borrowed handles never close the stream
        borrowed.release().unwrap();
        assert!(owner.is_open());

        owner.release().unwrap();
        assert!(!borrowed.is_open());
        let mut buf = [0u8; 1];
        let err = borrowed.atomic_seek_read(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let stream = LockedStream::owned(ReadOnly(Cursor::new(vec![1u8, 2, 3])));
        let err = stream.atomic_seek_write(0, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }
}

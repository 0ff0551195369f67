//! Thread-safe stream access
//!
//! [`LockedStream`] guards one underlying byte stream so that every seek and
//! its transfer happen atomically. [`WindowedStream`] exposes a buffered,
//! independently seekable sub-range of a locked stream.

mod locked;
mod windowed;

pub use locked::{LockedStream, Ownership, ReadOnly, ReadOutcome, SeekableStream, StreamGuard};
pub use windowed::{WindowedStream, DEFAULT_WINDOW_BUFFER_SIZE};

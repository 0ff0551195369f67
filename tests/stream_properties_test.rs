//! Property-based tests for stream and path invariants
//!
//! Uses proptest to check that windows always expose exactly their slice of
//! the source, whatever the buffer size, bounds or access pattern.

use layerfs_rs::archive::standardize_name;
use layerfs_rs::path;
use layerfs_rs::stream::ReadOnly;
use layerfs_rs::{LockedStream, WindowedStream};
use proptest::prelude::*;
use std::io::{Cursor, Read, Seek, SeekFrom};

/// Reads that stop after at most `step` bytes, to exercise retry paths
struct Trickle {
    inner: Cursor<Vec<u8>>,
    step: usize,
}

impl Read for Trickle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let len = buf.len().min(self.step);
        self.inner.read(&mut buf[..len])
    }
}

impl Seek for Trickle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

fn source_and_bounds() -> impl Strategy<Value = (Vec<u8>, u64, u64)> {
    prop::collection::vec(any::<u8>(), 0..4096).prop_flat_map(|data| {
        let len = data.len() as u64;
        (Just(data), 0..=len).prop_flat_map(move |(data, start)| {
            (Just(data), Just(start), start..=len)
        })
    })
}

proptest! {
    #[test]
    fn prop_window_reads_its_slice(
        (data, start, end) in source_and_bounds(),
        capacity in 1usize..512,
        chunk in 1usize..300,
    ) {
        let stream = LockedStream::owned(Cursor::new(data.clone()));
        let mut window = WindowedStream::with_capacity(&stream, start, Some(end), capacity);

        let mut collected = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = window.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        prop_assert_eq!(&collected[..], &data[start as usize..end as usize]);
    }

    #[test]
    fn prop_open_window_ends_at_source_end(
        (data, start, _end) in source_and_bounds(),
        capacity in 1usize..512,
    ) {
        let stream = LockedStream::owned(Cursor::new(data.clone()));
        let mut window = WindowedStream::with_capacity(&stream, start, None, capacity);

        let mut collected = Vec::new();
        window.read_to_end(&mut collected).unwrap();
        prop_assert_eq!(&collected[..], &data[start as usize..]);
        prop_assert_eq!(window.end(), Some(data.len() as u64));
    }

    #[test]
    fn prop_seek_then_read_matches_slice(
        (data, start, end) in source_and_bounds(),
        capacity in 1usize..256,
        seeks in prop::collection::vec((0u64..5000, 1usize..64), 1..20),
    ) {
        let stream = LockedStream::owned(Cursor::new(data.clone()));
        let mut window = WindowedStream::with_capacity(&stream, start, Some(end), capacity);
        let window_len = (end - start) as usize;

        for (target, wanted) in seeks {
            let pos = window.seek(SeekFrom::Start(target)).unwrap();
            prop_assert_eq!(pos, target);

            let mut buf = vec![0u8; wanted];
            let n = window.read(&mut buf).unwrap();
            let offset = (target as usize).min(window_len);
            let expected = &data[start as usize + offset..end as usize];
            prop_assert!(n <= wanted);
            prop_assert_eq!(&buf[..n], &expected[..n]);
            if !expected.is_empty() {
                prop_assert!(n > 0);
            }
        }
    }

    #[test]
    fn prop_seek_from_end_is_window_relative(
        (data, start, end) in source_and_bounds(),
        back in 0i64..64,
    ) {
        let stream = LockedStream::owned(Cursor::new(data));
        let mut window = WindowedStream::new(&stream, start, Some(end));
        let len = (end - start) as i64;

        let pos = window.seek(SeekFrom::End(-back)).unwrap();
        prop_assert_eq!(pos as i64, (len - back).max(0));
        prop_assert_eq!(window.len().unwrap(), len as u64);
    }

    #[test]
    fn prop_atomic_read_fill_pads_with_zeros(
        data in prop::collection::vec(1u8..=255, 0..1024),
        start in 0u64..1100,
        wanted in 0usize..512,
        step in 1usize..64,
    ) {
        let source = Trickle { inner: Cursor::new(data.clone()), step };
        let stream = LockedStream::owned(ReadOnly(source));
        stream.atomic_seek_read(start, &mut []).unwrap();

        let mut buf = vec![0xAAu8; wanted];
        let filled = stream.atomic_read_fill(&mut buf).unwrap();

        let available = data.len().saturating_sub(start as usize);
        prop_assert_eq!(filled, wanted.min(available));
        let from = (start as usize).min(data.len());
        prop_assert_eq!(&buf[..filled], &data[from..from + filled]);
        prop_assert!(buf[filled..].iter().all(|&b| b == 0));
    }

    #[test]
    fn prop_standardized_names_are_fixed_points(
        parts in prop::collection::vec(prop_oneof!["[a-z]{1,6}", Just(".".to_string()), Just("..".to_string()), Just(String::new())], 1..8),
    ) {
        let name = parts.join("/");
        if let Ok(clean) = standardize_name(&name) {
            prop_assert!(!clean.starts_with('/'));
            prop_assert!(!clean.split('/').any(|p| p.is_empty() || p == "." || p == ".."));
            prop_assert_eq!(standardize_name(&clean).unwrap(), clean.clone());
        }
    }

    #[test]
    fn prop_resolved_paths_stay_absolute(
        parts in prop::collection::vec(prop_oneof!["[a-z]{1,6}", Just("..".to_string()), Just(".".to_string())], 0..8),
        cwd_parts in prop::collection::vec("[a-z]{1,4}", 0..4),
    ) {
        let cwd = format!("/{}", cwd_parts.join("/"));
        let resolved = path::resolve(&parts.join("/"), &cwd);
        prop_assert!(resolved.starts_with('/'));
        prop_assert!(resolved == "/" || !resolved.ends_with('/'));
        if resolved != "/" {
            let mut components = resolved.split('/').skip(1);
            prop_assert!(!components.any(|p| p.is_empty() || p == "." || p == ".."));
        }
        prop_assert_eq!(path::standardize(&resolved), resolved.clone());
    }
}

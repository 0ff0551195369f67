//! Interrupted writes
//!
//! Payloads are written eagerly but the index only switches over on flush.
//! These tests abandon containers mid-update (leaking them so no close runs)
//! and check what a fresh reader sees.

use layerfs_rs::{ArchiveContainer, ArchiveFormat};
use std::fs::OpenOptions;
use tempfile::NamedTempFile;

/// Helper: complete archive with ten small subfiles
fn create_complete_archive(format: ArchiveFormat) -> NamedTempFile {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), format).unwrap();
    for i in 0..10 {
        archive
            .add_subfile(&format!("file{}.txt", i), format!("data{}", i).as_bytes(), 0)
            .unwrap();
    }
    archive.close().unwrap();
    temp_file
}

#[test]
fn test_linear_unflushed_additions_are_invisible() {
    let temp_file = create_complete_archive(ArchiveFormat::Linear);

    let mut archive = ArchiveContainer::open_read_write(temp_file.path(), ArchiveFormat::Linear).unwrap();
    archive.add_subfile("late.txt", b"never committed", 0).unwrap();
    archive.add_subfile("later.txt", b"also lost", 6).unwrap();
    std::mem::forget(archive);

    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    assert_eq!(archive.num_subfiles(), 10);
    assert!(archive.find_subfile("late.txt").is_none());
    for i in 0..10 {
        let index = archive.find_subfile(&format!("file{}.txt", i)).unwrap();
        assert_eq!(archive.read_subfile(index).unwrap(), format!("data{}", i).as_bytes());
    }
}

#[test]
fn test_linear_unflushed_removal_is_invisible() {
    let temp_file = create_complete_archive(ArchiveFormat::Linear);

    let mut archive = ArchiveContainer::open_read_write(temp_file.path(), ArchiveFormat::Linear).unwrap();
    let index = archive.find_subfile("file3.txt").unwrap();
    archive.remove_subfile(index).unwrap();
    std::mem::forget(archive);

    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    assert_eq!(archive.num_subfiles(), 10);
    assert!(archive.find_subfile("file3.txt").is_some());
}

#[test]
fn test_linear_trailing_garbage_after_commit() {
    let temp_file = create_complete_archive(ArchiveFormat::Linear);

    // Bytes appended after the last committed entry are unreachable
    let len = std::fs::metadata(temp_file.path()).unwrap().len();
    let file = OpenOptions::new().write(true).open(temp_file.path()).unwrap();
    file.set_len(len + 512).unwrap();
    drop(file);

    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    assert_eq!(archive.num_subfiles(), 10);
    assert!(archive.verify().unwrap().is_ok());
}

#[test]
fn test_zip_flush_is_a_consistent_snapshot() {
    let temp_file = create_complete_archive(ArchiveFormat::Zip);

    let mut archive = ArchiveContainer::open_read_write(temp_file.path(), ArchiveFormat::Zip).unwrap();
    archive.add_subfile("extra.txt", b"flushed", 0).unwrap();
    archive.flush().unwrap();
    std::mem::forget(archive);

    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    assert_eq!(archive.num_subfiles(), 11);
    let index = archive.find_subfile("extra.txt").unwrap();
    assert_eq!(archive.read_subfile(index).unwrap(), b"flushed");
    assert!(archive.verify().unwrap().is_ok());
}

#[test]
fn test_zip_shrinking_update_keeps_index_at_end() {
    let temp_file = create_complete_archive(ArchiveFormat::Zip);

    // Removing entries shrinks the directory; it must still end the file
    let mut archive = ArchiveContainer::open_read_write(temp_file.path(), ArchiveFormat::Zip).unwrap();
    for _ in 0..5 {
        archive.remove_subfile(0).unwrap();
    }
    archive.close().unwrap();

    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    assert_eq!(archive.num_subfiles(), 5);
    assert!(archive.find_subfile("file9.txt").is_some());
    assert!(archive.verify().unwrap().is_ok());
}

#[test]
fn test_repack_reclaims_space() {
    for format in [ArchiveFormat::Zip, ArchiveFormat::Linear] {
        let temp_file = NamedTempFile::new().unwrap();
        let mut archive = ArchiveContainer::open_write(temp_file.path(), format).unwrap();
        archive.add_subfile("big.bin", &vec![1u8; 64 * 1024], 0).unwrap();
        archive.add_subfile("small.txt", b"small", 0).unwrap();
        archive.flush().unwrap();
        archive.add_subfile("big.bin", b"now tiny", 0).unwrap();
        archive.flush().unwrap();
        assert!(archive.needs_repack());
        let before = std::fs::metadata(temp_file.path()).unwrap().len();

        archive.repack().unwrap();
        assert!(!archive.needs_repack());
        let after = std::fs::metadata(temp_file.path()).unwrap().len();
        assert!(after < before / 4, "{:?}: {} -> {}", format, before, after);

        let index = archive.find_subfile("big.bin").unwrap();
        assert_eq!(archive.read_subfile(index).unwrap(), b"now tiny");
        archive.add_subfile("post.txt", b"after repack", 0).unwrap();
        archive.close().unwrap();

        let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
        assert_eq!(archive.num_subfiles(), 3);
        assert!(archive.verify().unwrap().is_ok());
    }
}

#[test]
fn test_repack_requires_file_backing() {
    let stream = layerfs_rs::LockedStream::owned(std::io::Cursor::new(Vec::new()));
    let mut archive = ArchiveContainer::open_write_stream(stream.borrow(), ArchiveFormat::Zip).unwrap();
    archive.add_subfile("a.txt", b"a", 0).unwrap();
    assert!(matches!(
        archive.repack(),
        Err(layerfs_rs::VfsError::Unsupported(_))
    ));
}

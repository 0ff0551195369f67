//! Corruption detection
//!
//! Damaged archives must fail to open or fail verification; they must never
//! hand back wrong bytes silently when a checksum is available.

use layerfs_rs::{ArchiveContainer, ArchiveFormat, VfsError};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Helper: archive with one stored and one compressed subfile; returns the
/// absolute payload start of the stored one
fn create_test_archive(format: ArchiveFormat) -> (NamedTempFile, u64) {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), format).unwrap();
    archive.add_subfile("test.txt", b"Hello, World!", 0).unwrap();
    archive.add_subfile("data.bin", &vec![0xAB; 1024], 6).unwrap();
    let index = archive.find_subfile("test.txt").unwrap();
    let data_start = archive.subfile(index).unwrap().data_start;
    archive.close().unwrap();
    (temp_file, data_start)
}

/// Helper: overwrite bytes at an offset
fn write_at(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(bytes).unwrap();
}

/// Helper: truncate file at specific offset
fn truncate_at(path: &Path, new_length: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(new_length).unwrap();
}

#[test]
fn test_empty_file_is_rejected() {
    let temp_file = NamedTempFile::new().unwrap();
    assert!(ArchiveContainer::open_read(temp_file.path()).is_err());
}

#[test]
fn test_garbage_file_is_rejected() {
    let temp_file = NamedTempFile::new().unwrap();
    std::fs::write(temp_file.path(), vec![0xAB; 4096]).unwrap();
    assert!(ArchiveContainer::open_read(temp_file.path()).is_err());
}

#[test]
fn test_truncated_archives_are_rejected() {
    for format in [ArchiveFormat::Zip, ArchiveFormat::Linear] {
        let (temp_file, _) = create_test_archive(format);
        let len = std::fs::metadata(temp_file.path()).unwrap().len();
        truncate_at(temp_file.path(), len / 2);
        assert!(
            ArchiveContainer::open_read(temp_file.path()).is_err(),
            "{:?}",
            format
        );
    }
}

#[test]
fn test_flipped_payload_byte_fails_verification() {
    let (temp_file, data_start) = create_test_archive(ArchiveFormat::Zip);
    write_at(temp_file.path(), data_start, b"J");

    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    let report = archive.verify().unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].name, "test.txt");
    assert!(matches!(report.failures[0].error, VfsError::CrcMismatch { .. }));
}

#[test]
fn test_damaged_local_header() {
    let (temp_file, _) = create_test_archive(ArchiveFormat::Zip);
    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    let index = archive.find_subfile("data.bin").unwrap();
    let header_offset = archive.subfile(index).unwrap().index_start;
    drop(archive);

    write_at(temp_file.path(), header_offset, b"XXXX");
    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    let index = archive.find_subfile("data.bin").unwrap();
    assert!(archive.read_subfile(index).is_err());
    assert!(!archive.verify().unwrap().is_ok());

    // The other subfile is unaffected
    let other = archive.find_subfile("test.txt").unwrap();
    assert_eq!(archive.read_subfile(other).unwrap(), b"Hello, World!");
}

#[test]
fn test_inflated_entry_count_is_corrupt_index() {
    let (temp_file, _) = create_test_archive(ArchiveFormat::Zip);
    let len = std::fs::metadata(temp_file.path()).unwrap().len();
    // Entries on this disk and in total, inside the 22-byte end record
    write_at(temp_file.path(), len - 22 + 8, &500u16.to_le_bytes());
    write_at(temp_file.path(), len - 22 + 10, &500u16.to_le_bytes());

    let result = ArchiveContainer::open_read(temp_file.path());
    assert!(matches!(result, Err(VfsError::CorruptIndex(_))));
}

#[test]
fn test_directory_offset_past_end_is_corrupt_index() {
    let (temp_file, _) = create_test_archive(ArchiveFormat::Zip);
    let len = std::fs::metadata(temp_file.path()).unwrap().len();
    write_at(temp_file.path(), len - 22 + 16, &(len as u32).to_le_bytes());

    let result = ArchiveContainer::open_read(temp_file.path());
    assert!(matches!(result, Err(VfsError::CorruptIndex(_))));
}

#[test]
fn test_linear_unsupported_version() {
    let (temp_file, _) = create_test_archive(ArchiveFormat::Linear);
    // Major version follows the six magic bytes
    write_at(temp_file.path(), 6, &2i16.to_le_bytes());

    match ArchiveContainer::open_read(temp_file.path()) {
        Err(VfsError::UnsupportedVersion { major, .. }) => assert_eq!(major, 2),
        other => panic!("Expected UnsupportedVersion, got: {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_linear_backward_link_is_corrupt_index() {
    let (temp_file, _) = create_test_archive(ArchiveFormat::Linear);
    // The anchor entry sits right after the 18-byte header
    write_at(temp_file.path(), 18, &1u32.to_le_bytes());

    let result = ArchiveContainer::open_read(temp_file.path());
    assert!(matches!(result, Err(VfsError::CorruptIndex(_))));
}

#[test]
fn test_linear_bad_magic_is_not_linear() {
    let (temp_file, _) = create_test_archive(ArchiveFormat::Linear);
    write_at(temp_file.path(), 0, b"xyz");
    assert!(ArchiveContainer::open_read(temp_file.path()).is_err());
}

#[test]
fn test_linear_payload_past_end_is_corrupt_index() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), ArchiveFormat::Linear).unwrap();
    archive.add_subfile("big.bin", &vec![7u8; 4096], 0).unwrap();
    archive.close().unwrap();

    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    let entry_offset = archive.subfile(0).unwrap().index_start;
    drop(archive);

    // Data length is the third word of the entry
    write_at(temp_file.path(), entry_offset + 8, &1_000_000u32.to_le_bytes());
    let result = ArchiveContainer::open_read(temp_file.path());
    assert!(matches!(result, Err(VfsError::CorruptIndex(_))));
}

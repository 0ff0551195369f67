//! Encrypted subfiles
//!
//! Payload confidentiality and integrity: plaintext never reaches the disk,
//! the wrong password or a flipped ciphertext byte is refused, and
//! unsupported parameters are rejected up front.

use layerfs_rs::archive::encryption::ENVELOPE_HEADER_SIZE;
use layerfs_rs::{ArchiveContainer, ArchiveFormat, EncryptionParams, VfsError};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

const SECRET: &[u8] = b"The launch codes are 0000, as always.";

/// Fast key derivation keeps the suite quick
fn params(password: &str) -> EncryptionParams {
    EncryptionParams::new(password).with_iteration_count(1000)
}

/// Helper: archive with one encrypted compressed and one encrypted stored subfile
fn create_encrypted_archive(format: ArchiveFormat, password: &str) -> NamedTempFile {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), format).unwrap();
    archive.set_encryption(Some(params(password))).unwrap();
    archive.add_subfile("secret.txt", SECRET, 6).unwrap();
    archive.add_subfile("raw.bin", SECRET, 0).unwrap();
    archive.close().unwrap();
    temp_file
}

#[test]
fn test_encrypted_roundtrip_both_formats() {
    for format in [ArchiveFormat::Zip, ArchiveFormat::Linear] {
        let temp_file = create_encrypted_archive(format, "correct horse");

        let mut archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
        archive.set_password(Some("correct horse".to_string()));
        for name in ["secret.txt", "raw.bin"] {
            let index = archive.find_subfile(name).unwrap();
            assert!(archive.is_subfile_encrypted(index).unwrap());
            assert_eq!(archive.subfile_length(index).unwrap(), SECRET.len() as u64);
            assert_eq!(archive.read_subfile(index).unwrap(), SECRET);

            let mut streamed = Vec::new();
            archive
                .open_read_subfile(index)
                .unwrap()
                .read_to_end(&mut streamed)
                .unwrap();
            assert_eq!(streamed, SECRET);
        }
        assert!(archive.verify().unwrap().is_ok());
    }
}

#[test]
fn test_plaintext_never_reaches_disk() {
    for format in [ArchiveFormat::Zip, ArchiveFormat::Linear] {
        let temp_file = create_encrypted_archive(format, "pw");
        let bytes = fs::read(temp_file.path()).unwrap();
        let found = bytes.windows(SECRET.len()).any(|window| window == SECRET);
        assert!(!found, "{:?} archive leaks plaintext", format);
    }
}

#[test]
fn test_missing_and_wrong_password() {
    let temp_file = create_encrypted_archive(ArchiveFormat::Zip, "right");

    let mut archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    let index = archive.find_subfile("secret.txt").unwrap();
    assert!(matches!(archive.read_subfile(index), Err(VfsError::MissingPassword)));

    archive.set_password(Some("wrong".to_string()));
    assert!(matches!(archive.read_subfile(index), Err(VfsError::DecryptionFailed)));
    assert!(matches!(
        archive.open_read_subfile(index).map(|_| ()),
        Err(VfsError::DecryptionFailed)
    ));

    archive.set_password(Some("right".to_string()));
    assert_eq!(archive.read_subfile(index).unwrap(), SECRET);
}

#[test]
fn test_tampered_ciphertext_is_rejected() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), ArchiveFormat::Zip).unwrap();
    archive.set_encryption(Some(params("pw"))).unwrap();
    archive.add_subfile("secret.txt", SECRET, 0).unwrap();
    let data_start = archive.subfile(0).unwrap().data_start;
    archive.close().unwrap();

    let target = data_start + ENVELOPE_HEADER_SIZE as u64 + 3;
    let mut file = OpenOptions::new().read(true).write(true).open(temp_file.path()).unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(target)).unwrap();
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(target)).unwrap();
    file.write_all(&[byte[0] ^ 0x01]).unwrap();
    drop(file);

    let mut archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    archive.set_password(Some("pw".to_string()));
    assert!(matches!(archive.read_subfile(0), Err(VfsError::DecryptionFailed)));

    let report = archive.verify().unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].error, VfsError::DecryptionFailed));
}

#[test]
fn test_each_payload_uses_fresh_salt_and_nonce() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), ArchiveFormat::Zip).unwrap();
    archive.set_encryption(Some(params("pw"))).unwrap();
    archive.add_subfile("one.bin", SECRET, 0).unwrap();
    archive.add_subfile("two.bin", SECRET, 0).unwrap();

    let one = archive.subfile(0).unwrap().clone();
    let two = archive.subfile(1).unwrap().clone();
    archive.close().unwrap();

    let bytes = fs::read(temp_file.path()).unwrap();
    let payload = |start: u64, len: u64| bytes[start as usize..(start + len) as usize].to_vec();
    assert_ne!(payload(one.data_start, one.data_length), payload(two.data_start, two.data_length));
}

#[test]
fn test_key_lengths() {
    for key_length in [16u16, 32] {
        let temp_file = NamedTempFile::new().unwrap();
        let mut archive = ArchiveContainer::open_write(temp_file.path(), ArchiveFormat::Linear).unwrap();
        archive
            .set_encryption(Some(params("pw").with_key_length(key_length)))
            .unwrap();
        archive.add_subfile("k.txt", SECRET, 6).unwrap();
        archive.close().unwrap();

        let mut archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
        archive.set_password(Some("pw".to_string()));
        assert_eq!(archive.read_subfile(0).unwrap(), SECRET);
    }
}

#[test]
fn test_unsupported_parameters_are_rejected() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), ArchiveFormat::Zip).unwrap();

    let cases = [
        params("pw").with_algorithm("rc4"),
        params("pw").with_key_length(24),
        params("pw").with_algorithm("aes-128-gcm").with_key_length(32),
    ];
    for case in cases {
        assert!(matches!(
            archive.set_encryption(Some(case)),
            Err(VfsError::Unsupported(_))
        ));
    }
    assert!(matches!(
        archive.set_encryption(Some(params("pw").with_iteration_count(0))),
        Err(VfsError::InvalidConfig(_))
    ));
}

#[test]
fn test_encryption_applies_only_to_later_subfiles() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), ArchiveFormat::Zip).unwrap();
    archive.add_subfile("public.txt", b"public", 0).unwrap();
    archive.set_encryption(Some(params("pw"))).unwrap();
    archive.add_subfile("private.txt", b"private", 0).unwrap();
    archive.close().unwrap();

    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    let public = archive.find_subfile("public.txt").unwrap();
    assert!(!archive.is_subfile_encrypted(public).unwrap());
    assert_eq!(archive.read_subfile(public).unwrap(), b"public");
    let private = archive.find_subfile("private.txt").unwrap();
    assert!(archive.is_subfile_encrypted(private).unwrap());
}

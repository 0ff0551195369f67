//! Archive signatures
//!
//! Signatures cover every non-signature subfile through a manifest; any
//! change to the contents, a forged signature or an unknown algorithm must
//! show up in the verification result.

use ed25519_dalek::SigningKey;
use layerfs_rs::archive::{SignatureEntry, SignatureManifest, MANIFEST_NAME};
use layerfs_rs::{
    ArchiveContainer, ArchiveFormat, Ed25519Signer, EncryptionParams, SignatureStatus,
};
use rand::rngs::OsRng;
use tempfile::NamedTempFile;

fn signer(alias: &str) -> Ed25519Signer {
    Ed25519Signer::new(SigningKey::generate(&mut OsRng), alias)
}

/// Helper: signed archive with two content subfiles
fn create_signed_archive(format: ArchiveFormat) -> NamedTempFile {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), format).unwrap();
    archive.add_subfile("models/panda.egg", b"panda model", 6).unwrap();
    archive.add_subfile("textures/panda.png", &vec![0x89; 512], 0).unwrap();
    archive.add_signature(&signer("release")).unwrap();
    archive.close().unwrap();
    temp_file
}

#[test]
fn test_signed_archive_verifies() {
    for format in [ArchiveFormat::Zip, ArchiveFormat::Linear] {
        let temp_file = create_signed_archive(format);
        let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();

        let checks = archive.verify_signatures().unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].alias, "RELEASE");
        assert_eq!(checks[0].status, SignatureStatus::Valid);

        let manifest = archive.find_subfile(MANIFEST_NAME).unwrap();
        assert!(archive.is_subfile_signature(manifest).unwrap());
        let signature = archive.find_subfile("META-INF/RELEASE.SIG").unwrap();
        assert!(archive.is_subfile_signature(signature).unwrap());
        assert!(!archive
            .is_subfile_signature(archive.find_subfile("models/panda.egg").unwrap())
            .unwrap());
    }
}

#[test]
fn test_unsigned_archive_has_no_checks() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), ArchiveFormat::Zip).unwrap();
    archive.add_subfile("a.txt", b"a", 0).unwrap();
    archive.close().unwrap();

    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    assert!(archive.signatures().unwrap().is_empty());
    assert!(archive.verify_signatures().unwrap().is_empty());
}

#[test]
fn test_multiple_signers() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), ArchiveFormat::Zip).unwrap();
    archive.add_subfile("data.bin", b"payload", 0).unwrap();
    archive.add_signature(&signer("vendor")).unwrap();
    archive.add_signature(&signer("release key 2024!")).unwrap();
    archive.close().unwrap();

    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    let mut checks = archive.verify_signatures().unwrap();
    checks.sort_by(|a, b| a.alias.cmp(&b.alias));
    let aliases: Vec<_> = checks.iter().map(|c| c.alias.as_str()).collect();
    assert_eq!(aliases, vec!["RELEASEK", "VENDOR"]);
    assert!(checks.iter().all(|c| c.status == SignatureStatus::Valid));
}

#[test]
fn test_modified_content_breaks_signature() {
    for format in [ArchiveFormat::Zip, ArchiveFormat::Linear] {
        let temp_file = create_signed_archive(format);

        let mut archive = ArchiveContainer::open_read_write(temp_file.path(), format).unwrap();
        archive.add_subfile("models/panda.egg", b"evil panda", 6).unwrap();
        archive.close().unwrap();

        let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
        let checks = archive.verify_signatures().unwrap();
        assert_eq!(checks[0].status, SignatureStatus::ManifestMismatch);
    }
}

#[test]
fn test_added_content_breaks_signature() {
    let temp_file = create_signed_archive(ArchiveFormat::Zip);

    let mut archive = ArchiveContainer::open_read_write(temp_file.path(), ArchiveFormat::Zip).unwrap();
    archive.add_subfile("extra/trojan.py", b"import os", 0).unwrap();
    let checks = archive.verify_signatures().unwrap();
    assert_eq!(checks[0].status, SignatureStatus::ManifestMismatch);
}

#[test]
fn test_forged_signature_is_bad() {
    let temp_file = create_signed_archive(ArchiveFormat::Zip);
    let mut archive = ArchiveContainer::open_read_write(temp_file.path(), ArchiveFormat::Zip).unwrap();

    let manifest_index = archive.find_subfile(MANIFEST_NAME).unwrap();
    let manifest = SignatureManifest::from_json(&archive.read_subfile(manifest_index).unwrap()).unwrap();

    // Signed by one key but claiming another key's certificate
    let impostor = signer("forged");
    let victim = signer("victim");
    let mut entry = SignatureEntry::create(&manifest, &impostor, 0).unwrap();
    entry.certificate_chain = vec![hex::encode(victim.verifying_key().to_bytes())];
    archive
        .add_subfile("META-INF/FORGED.SIG", &entry.to_json().unwrap(), 0)
        .unwrap();

    let checks = archive.verify_signatures().unwrap();
    let forged = checks.iter().find(|c| c.alias == "FORGED").unwrap();
    assert_eq!(forged.status, SignatureStatus::BadSignature);
    let release = checks.iter().find(|c| c.alias == "RELEASE").unwrap();
    assert_eq!(release.status, SignatureStatus::Valid);
}

#[test]
fn test_unknown_algorithm_is_reported() {
    let temp_file = create_signed_archive(ArchiveFormat::Zip);
    let mut archive = ArchiveContainer::open_read_write(temp_file.path(), ArchiveFormat::Zip).unwrap();

    let manifest_index = archive.find_subfile(MANIFEST_NAME).unwrap();
    let manifest = SignatureManifest::from_json(&archive.read_subfile(manifest_index).unwrap()).unwrap();
    let mut entry = SignatureEntry::create(&manifest, &signer("legacy"), 0).unwrap();
    entry.algorithm = "rsa-sha1".to_string();
    archive
        .add_subfile("META-INF/LEGACY.SIG", &entry.to_json().unwrap(), 0)
        .unwrap();

    let checks = archive.verify_signatures().unwrap();
    let legacy = checks.iter().find(|c| c.alias == "LEGACY").unwrap();
    assert_eq!(legacy.status, SignatureStatus::UnsupportedAlgorithm);
}

#[test]
fn test_signature_subfiles_are_never_encrypted() {
    let temp_file = NamedTempFile::new().unwrap();
    let mut archive = ArchiveContainer::open_write(temp_file.path(), ArchiveFormat::Zip).unwrap();
    archive
        .set_encryption(Some(EncryptionParams::new("pw").with_iteration_count(1000)))
        .unwrap();
    archive.add_subfile("secret.txt", b"secret", 6).unwrap();
    archive.add_signature(&signer("release")).unwrap();
    archive.close().unwrap();

    // Signatures check out without any password
    let archive = ArchiveContainer::open_read(temp_file.path()).unwrap();
    let manifest = archive.find_subfile(MANIFEST_NAME).unwrap();
    assert!(!archive.is_subfile_encrypted(manifest).unwrap());
    assert!(archive.signatures().unwrap().len() == 1);

    let mut archive = archive;
    archive.set_password(Some("pw".to_string()));
    let checks = archive.verify_signatures().unwrap();
    assert_eq!(checks[0].status, SignatureStatus::Valid);
}

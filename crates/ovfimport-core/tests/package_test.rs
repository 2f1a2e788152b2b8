//! Integration tests for package access and manifest verification.

mod common;

use std::fs;
use std::io::Read;
use std::path::Path;

use common::{descriptor, stream_vmdk, write_ovf_package};
use ovfimport_core::manifest::{digest_hex, ManifestReport};
use ovfimport_core::package::Package;
use ovfimport_core::Error;
use sha2::{Sha256, Sha512};
use tempfile::TempDir;

fn sha256_of(data: &[u8]) -> String {
    digest_hex::<Sha256>(&mut &data[..]).unwrap()
}

fn build_ova(path: &Path, members: &[(&str, &[u8])]) {
    let mut builder = tar::Builder::new(fs::File::create(path).unwrap());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.finish().unwrap();
}

#[test]
fn test_open_directory_package() {
    let dir = TempDir::new().unwrap();
    let disk = stream_vmdk(2048);
    let path = write_ovf_package(dir.path(), &["VM Network"], &[("disk-0.vmdk", disk.clone())]);

    let package = Package::open(&path).unwrap();
    assert!(!package.is_archive());
    assert_eq!(package.descriptor_name(), "photon.ovf");
    assert!(package.manifest().is_none());
    assert!(package.descriptor_text().unwrap().contains("<Envelope"));

    let payload = package.open_payload("disk-0.vmdk").unwrap();
    assert_eq!(payload.len, 2048);
    let mut data = Vec::new();
    payload.into_reader().read_to_end(&mut data).unwrap();
    assert_eq!(data, disk);
}

#[test]
fn test_payloads_resolve_against_descriptor_directory() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("images").join("photon");
    fs::create_dir_all(&nested).unwrap();
    let path = write_ovf_package(&nested, &[], &[("disk-0.vmdk", stream_vmdk(512))]);

    // A file of the same name in the parent directory must not be picked up
    fs::write(dir.path().join("disk-0.vmdk"), b"wrong").unwrap();

    let package = Package::open(&path).unwrap();
    let payload = package.open_payload("disk-0.vmdk").unwrap();
    assert_eq!(payload.len, 512);
    assert!(payload.path.starts_with(&nested));
}

#[test]
fn test_open_payload_rejects_escapes() {
    let dir = TempDir::new().unwrap();
    let path = write_ovf_package(dir.path(), &[], &[("disk-0.vmdk", stream_vmdk(512))]);
    let package = Package::open(&path).unwrap();

    for bad in ["../disk-0.vmdk", "/etc/passwd", "", "sub/../../x"] {
        let err = package.open_payload(bad).unwrap_err();
        assert!(
            matches!(err, Error::LocalFileMissing { .. }),
            "'{}' should be rejected",
            bad
        );
    }
}

#[test]
fn test_open_payload_missing_and_directory() {
    let dir = TempDir::new().unwrap();
    let path = write_ovf_package(dir.path(), &[], &[("disk-0.vmdk", stream_vmdk(512))]);
    fs::create_dir(dir.path().join("folder.vmdk")).unwrap();
    let package = Package::open(&path).unwrap();

    assert!(matches!(
        package.open_payload("disk-9.vmdk").unwrap_err(),
        Error::LocalFileMissing { .. }
    ));
    assert!(matches!(
        package.open_payload("folder.vmdk").unwrap_err(),
        Error::LocalFileMissing { .. }
    ));
}

#[test]
fn test_open_archive_package() {
    let dir = TempDir::new().unwrap();
    let disk = stream_vmdk(3000);
    let xml = descriptor(&["VM Network"], &[("disk-0.vmdk", disk.len() as u64)]);
    let manifest = format!(
        "SHA256(photon.ovf)= {}\nSHA256(disk-0.vmdk)= {}\n",
        sha256_of(xml.as_bytes()),
        sha256_of(&disk)
    );

    let ova = dir.path().join("photon.OVA");
    build_ova(
        &ova,
        &[
            ("./photon.ovf", xml.as_bytes()),
            ("photon.mf", manifest.as_bytes()),
            ("disk-0.vmdk", &disk),
        ],
    );

    let package = Package::open(&ova).unwrap();
    assert!(package.is_archive());
    assert_eq!(package.descriptor_name(), "photon.ovf");
    assert_eq!(package.descriptor(), xml.as_bytes());

    // Payloads read straight from the archive
    let payload = package.open_payload("disk-0.vmdk").unwrap();
    assert_eq!(payload.len, 3000);
    let mut data = Vec::new();
    payload.into_reader().read_to_end(&mut data).unwrap();
    assert_eq!(data, disk);

    let report = package.manifest().unwrap().verify(&package).unwrap();
    assert_eq!(
        report,
        ManifestReport {
            verified: 2,
            skipped: 0
        }
    );
}

#[test]
fn test_archive_without_descriptor() {
    let dir = TempDir::new().unwrap();
    let ova = dir.path().join("empty.ova");
    build_ova(&ova, &[("disk-0.vmdk", b"data")]);

    let err = Package::open(&ova).unwrap_err();
    assert!(matches!(err, Error::Archive { .. }));
}

#[test]
fn test_archive_missing_member() {
    let dir = TempDir::new().unwrap();
    let xml = descriptor(&[], &[("disk-0.vmdk", 512)]);
    let ova = dir.path().join("photon.ova");
    build_ova(&ova, &[("photon.ovf", xml.as_bytes())]);

    let package = Package::open(&ova).unwrap();
    assert!(matches!(
        package.open_payload("disk-0.vmdk").unwrap_err(),
        Error::LocalFileMissing { .. }
    ));
}

#[test]
fn test_manifest_verification_in_directory() {
    let dir = TempDir::new().unwrap();
    let disk = stream_vmdk(1024);
    let path = write_ovf_package(dir.path(), &[], &[("disk-0.vmdk", disk.clone())]);

    let sha512 = digest_hex::<Sha512>(&mut &disk[..]).unwrap();
    fs::write(
        dir.path().join("photon.mf"),
        format!(
            "SHA512(disk-0.vmdk)= {}\nSHA1(photon.ovf)= da39a3ee5e6b4b0d3255bfef95601890afd80709\n",
            sha512.to_uppercase()
        ),
    )
    .unwrap();

    let package = Package::open(&path).unwrap();
    let report = package.manifest().unwrap().verify(&package).unwrap();
    // SHA1 entries are not checked
    assert_eq!(report.verified, 1);
    assert_eq!(report.skipped, 1);
}

#[test]
fn test_manifest_mismatch() {
    let dir = TempDir::new().unwrap();
    let disk = stream_vmdk(1024);
    let path = write_ovf_package(dir.path(), &[], &[("disk-0.vmdk", disk.clone())]);
    let expected = sha256_of(b"something else");
    fs::write(
        dir.path().join("photon.mf"),
        format!("SHA256(disk-0.vmdk)= {}\n", expected),
    )
    .unwrap();

    let package = Package::open(&path).unwrap();
    match package.manifest().unwrap().verify(&package).unwrap_err() {
        Error::ManifestMismatch {
            file,
            expected: reported,
            actual,
        } => {
            assert_eq!(file, "disk-0.vmdk");
            assert_eq!(reported, expected);
            assert_eq!(actual, sha256_of(&disk));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_malformed_manifest_fails_open() {
    let dir = TempDir::new().unwrap();
    let path = write_ovf_package(dir.path(), &[], &[("disk-0.vmdk", stream_vmdk(512))]);
    fs::write(dir.path().join("photon.mf"), "this is not a manifest\n").unwrap();

    assert!(matches!(
        Package::open(&path).unwrap_err(),
        Error::Archive { .. }
    ));
}

#[test]
fn test_archive_with_oversized_member_header() {
    let dir = TempDir::new().unwrap();
    let ova = dir.path().join("corrupt.ova");

    // The header claims a terabyte descriptor backed by a few bytes
    let mut header = tar::Header::new_gnu();
    header.set_path("photon.ovf").unwrap();
    header.set_size(1 << 40);
    header.set_mode(0o644);
    header.set_cksum();
    let mut bytes = header.as_bytes().to_vec();
    bytes.extend_from_slice(b"<Envelope/>");
    fs::write(&ova, bytes).unwrap();

    match Package::open(&ova) {
        Ok(package) => assert!(package.descriptor().len() < 4096),
        Err(err) => assert!(matches!(err, Error::Archive { .. } | Error::Io { .. })),
    }
}

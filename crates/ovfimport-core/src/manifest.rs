//! Package manifest (`.mf`) parsing and verification.
//!
//! Manifest lines have the form `SHA256(disk-0.vmdk)= <hex digest>`. SHA-256
//! and SHA-512 entries are verified; SHA-1 entries are skipped.

use std::fmt;
use std::io::{self, Read, Write};

use rayon::prelude::*;
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::package::Package;

/// Digest algorithms that appear in OVF manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_ascii_uppercase().as_str() {
            "SHA1" => Some(DigestAlgorithm::Sha1),
            "SHA256" => Some(DigestAlgorithm::Sha256),
            "SHA512" => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestAlgorithm::Sha1 => write!(f, "SHA1"),
            DigestAlgorithm::Sha256 => write!(f, "SHA256"),
            DigestAlgorithm::Sha512 => write!(f, "SHA512"),
        }
    }
}

/// One manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub algorithm: DigestAlgorithm,
    /// Package-relative file name.
    pub file: String,
    /// Lowercase hex digest.
    pub digest: String,
}

/// A parsed manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

/// Result of checking one manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryCheck {
    Verified,
    Skipped,
}

/// Counts from a manifest verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifestReport {
    pub verified: usize,
    pub skipped: usize,
}

/// Parse manifest text.
///
/// Blank lines are ignored. Any other line that is not `ALG(file)= digest`
/// with a known algorithm is an error.
pub fn parse_manifest(text: &str) -> Result<Manifest> {
    let mut entries = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bad_line = || {
            Error::archive(format!("invalid manifest line {}: '{}'", index + 1, line))
        };

        let open = line.find('(').ok_or_else(bad_line)?;
        let close = line.rfind(")=").ok_or_else(bad_line)?;
        if close < open {
            return Err(bad_line());
        }

        let algorithm = DigestAlgorithm::from_tag(line[..open].trim()).ok_or_else(bad_line)?;
        let file = line[open + 1..close].trim().to_string();
        let digest = line[close + 2..].trim().to_ascii_lowercase();
        if file.is_empty() || digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(bad_line());
        }

        entries.push(ManifestEntry {
            algorithm,
            file,
            digest,
        });
    }

    Ok(Manifest { entries })
}

impl Manifest {
    /// Verify every entry against the package payloads.
    ///
    /// Payloads are hashed in parallel; the first failure in manifest order
    /// is returned.
    pub fn verify(&self, package: &Package) -> Result<ManifestReport> {
        let results: Vec<Result<EntryCheck>> = self
            .entries
            .par_iter()
            .map(|entry| verify_entry(package, entry))
            .collect();

        let mut report = ManifestReport::default();
        for result in results {
            match result? {
                EntryCheck::Verified => report.verified += 1,
                EntryCheck::Skipped => report.skipped += 1,
            }
        }
        debug!(verified = report.verified, skipped = report.skipped, "manifest checked");
        Ok(report)
    }
}

fn verify_entry(package: &Package, entry: &ManifestEntry) -> Result<EntryCheck> {
    let hash: fn(&mut dyn Read) -> io::Result<String> = match entry.algorithm {
        DigestAlgorithm::Sha1 => {
            warn!(file = %entry.file, "skipping SHA1 manifest entry");
            return Ok(EntryCheck::Skipped);
        }
        DigestAlgorithm::Sha256 => digest_hex::<Sha256>,
        DigestAlgorithm::Sha512 => digest_hex::<Sha512>,
    };

    let payload = package.open_payload(&entry.file)?;
    let path = payload.path.clone();
    let mut reader = payload.into_reader();
    let actual = hash(&mut reader).map_err(|e| Error::io(e, &path))?;

    if actual != entry.digest {
        return Err(Error::ManifestMismatch {
            file: entry.file.clone(),
            expected: entry.digest.clone(),
            actual,
        });
    }
    Ok(EntryCheck::Verified)
}

/// Stream a reader through a digest and return the lowercase hex result.
pub fn digest_hex<D: Digest + Write>(reader: &mut dyn Read) -> io::Result<String> {
    let mut hasher = D::new();
    io::copy(reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let text = "SHA256(appliance.ovf)= ABCDEF0123\nSHA1(disk-0.vmdk)= 0011\n\n";
        let manifest = parse_manifest(text).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.entries[0].algorithm, DigestAlgorithm::Sha256);
        assert_eq!(manifest.entries[0].file, "appliance.ovf");
        assert_eq!(manifest.entries[0].digest, "abcdef0123");
        assert_eq!(manifest.entries[1].algorithm, DigestAlgorithm::Sha1);
    }

    #[test]
    fn test_parse_manifest_file_with_parentheses() {
        let manifest = parse_manifest("SHA512(disk (1).vmdk)= ff").unwrap();
        assert_eq!(manifest.entries[0].file, "disk (1).vmdk");
    }

    #[test]
    fn test_parse_manifest_rejects_garbage() {
        for bad in ["hello", "MD5(a)= 00", "SHA256(a)= xyz", "SHA256()= 00"] {
            assert!(parse_manifest(bad).is_err(), "'{}' should be rejected", bad);
        }
    }

    #[test]
    fn test_digest_hex() {
        let mut data: &[u8] = b"hello world";
        let hash = digest_hex::<Sha256>(&mut data).unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_algorithm_display() {
        assert_eq!(DigestAlgorithm::Sha256.to_string(), "SHA256");
    }
}

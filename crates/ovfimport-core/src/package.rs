//! OVF/OVA package access.
//!
//! A package is either a loose `.ovf` descriptor whose payloads sit next to
//! it, or an `.ova` tar archive holding the descriptor, an optional manifest
//! and the payloads. Payload paths are always resolved relative to the
//! descriptor's own directory (or the archive root), never the process
//! working directory.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::manifest::{parse_manifest, Manifest};

/// Location of a payload inside an OVA archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArchiveMember {
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone)]
enum Layout {
    /// Payloads live in the descriptor's directory.
    Directory { base_dir: PathBuf },
    /// Payloads are members of a tar archive.
    Archive {
        members: BTreeMap<String, ArchiveMember>,
    },
}

/// An opened OVF or OVA package.
#[derive(Debug, Clone)]
pub struct Package {
    path: PathBuf,
    descriptor_name: String,
    descriptor: Vec<u8>,
    manifest: Option<Manifest>,
    layout: Layout,
}

/// A payload opened for reading.
pub struct Payload {
    /// Path shown in errors and logs.
    pub path: PathBuf,
    /// Measured length in bytes.
    pub len: u64,
    reader: Box<dyn Read + Send>,
}

impl Payload {
    /// Take the underlying reader.
    pub fn into_reader(self) -> Box<dyn Read + Send> {
        self.reader
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl Package {
    /// Open a package from a `.ovf` or `.ova` path.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the path cannot be read, or an archive error if
    /// an `.ova` is not a readable tar or holds no descriptor.
    pub fn open(path: &Path) -> Result<Self> {
        let is_archive = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("ova"))
            .unwrap_or(false);

        if is_archive {
            Self::open_archive(path)
        } else {
            Self::open_descriptor(path)
        }
    }

    fn open_descriptor(path: &Path) -> Result<Self> {
        let descriptor = fs::read(path).map_err(|e| Error::io(e, path))?;
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let descriptor_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::malformed("descriptor path has no file name"))?;

        let manifest_path = path.with_extension("mf");
        let manifest = if manifest_path.is_file() {
            let text = fs::read_to_string(&manifest_path).map_err(|e| Error::io(e, &manifest_path))?;
            Some(parse_manifest(&text)?)
        } else {
            None
        };

        debug!(path = %path.display(), manifest = manifest.is_some(), "opened descriptor");

        Ok(Self {
            path: path.to_path_buf(),
            descriptor_name,
            descriptor,
            manifest,
            layout: Layout::Directory { base_dir },
        })
    }

    fn open_archive(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let mut archive = tar::Archive::new(file);

        let mut members = BTreeMap::new();
        let mut descriptor: Option<(String, Vec<u8>)> = None;
        let mut manifest_text: Option<String> = None;

        let entries = archive
            .entries()
            .map_err(|e| Error::archive(format!("cannot read '{}': {}", path.display(), e)))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| Error::archive(format!("corrupt archive entry: {}", e)))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let name = entry
                .path()
                .map_err(|e| Error::archive(format!("invalid member name: {}", e)))?
                .to_string_lossy()
                .trim_start_matches("./")
                .to_string();
            let member = ArchiveMember {
                offset: entry.raw_file_position(),
                size: entry.size(),
            };

            // The first descriptor and manifest win, as in the OVA layout.
            if descriptor.is_none() && name.to_ascii_lowercase().ends_with(".ovf") {
                let mut bytes = Vec::new();
                entry
                    .read_to_end(&mut bytes)
                    .map_err(|e| Error::archive(format!("cannot read '{}': {}", name, e)))?;
                descriptor = Some((name.clone(), bytes));
            } else if manifest_text.is_none() && name.to_ascii_lowercase().ends_with(".mf") {
                let mut text = String::new();
                entry
                    .read_to_string(&mut text)
                    .map_err(|e| Error::archive(format!("cannot read '{}': {}", name, e)))?;
                manifest_text = Some(text);
            }

            members.insert(name, member);
        }

        let (descriptor_name, descriptor) = descriptor
            .ok_or_else(|| Error::archive(format!("no .ovf descriptor in '{}'", path.display())))?;
        let manifest = manifest_text.as_deref().map(parse_manifest).transpose()?;

        debug!(
            path = %path.display(),
            members = members.len(),
            manifest = manifest.is_some(),
            "opened archive"
        );

        Ok(Self {
            path: path.to_path_buf(),
            descriptor_name,
            descriptor,
            manifest,
            layout: Layout::Archive { members },
        })
    }

    /// Path the package was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the package is an OVA archive.
    pub fn is_archive(&self) -> bool {
        matches!(self.layout, Layout::Archive { .. })
    }

    /// File name of the descriptor (inside the archive for an OVA).
    pub fn descriptor_name(&self) -> &str {
        &self.descriptor_name
    }

    /// Raw descriptor bytes.
    pub fn descriptor(&self) -> &[u8] {
        &self.descriptor
    }

    /// Descriptor as text, as sent to the platform.
    pub fn descriptor_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.descriptor)
            .map(|text| text.trim_start_matches('\u{feff}'))
            .map_err(|e| Error::malformed(format!("descriptor is not valid UTF-8: {}", e)))
    }

    /// The package manifest, if one was found.
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Open a payload by its descriptor-relative path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LocalFileMissing`] if the path is absolute, escapes
    /// the package, or names a file that does not exist or cannot be opened.
    pub fn open_payload(&self, relative: &str) -> Result<Payload> {
        let relative_path = checked_relative_path(relative)?;

        match &self.layout {
            Layout::Directory { base_dir } => {
                let path = base_dir.join(&relative_path);
                let file = File::open(&path).map_err(|e| Error::missing(&path, e.to_string()))?;
                let metadata = file
                    .metadata()
                    .map_err(|e| Error::missing(&path, e.to_string()))?;
                if !metadata.is_file() {
                    return Err(Error::missing(&path, "not a regular file"));
                }
                Ok(Payload {
                    path,
                    len: metadata.len(),
                    reader: Box::new(file),
                })
            }
            Layout::Archive { members } => {
                let key = relative_path.to_string_lossy().to_string();
                let display = self.path.join(&key);
                let member = members
                    .get(&key)
                    .ok_or_else(|| Error::missing(&display, "not present in archive"))?;

                let mut file =
                    File::open(&self.path).map_err(|e| Error::missing(&display, e.to_string()))?;
                file.seek(SeekFrom::Start(member.offset))
                    .map_err(|e| Error::missing(&display, e.to_string()))?;

                Ok(Payload {
                    path: display,
                    len: member.size,
                    reader: Box::new(file.take(member.size)),
                })
            }
        }
    }
}

/// Validate that a payload path stays inside the package.
fn checked_relative_path(relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let mut clean = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::missing(
                    path,
                    "payload path must stay inside the descriptor directory",
                ));
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(Error::missing(path, "empty payload path"));
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_relative_path() {
        assert_eq!(
            checked_relative_path("disk-0.vmdk").unwrap(),
            PathBuf::from("disk-0.vmdk")
        );
        assert_eq!(
            checked_relative_path("./disks/disk-0.vmdk").unwrap(),
            PathBuf::from("disks/disk-0.vmdk")
        );
    }

    #[test]
    fn test_checked_relative_path_rejects_escape() {
        for bad in ["../secret.vmdk", "/etc/passwd", "disks/../../x", "", "."] {
            let err = checked_relative_path(bad).unwrap_err();
            assert!(
                matches!(err, Error::LocalFileMissing { .. }),
                "'{}' should be rejected",
                bad
            );
        }
    }
}

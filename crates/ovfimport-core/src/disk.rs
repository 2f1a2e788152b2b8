//! Stream-optimized VMDK header checks.
//!
//! Disks declared with the streamOptimized format must carry a hosted sparse
//! header with compressed grains and stream markers. The check peeks the
//! first sector of the payload and hands back a reader that replays it, so
//! the upload still sends the file from byte zero.

use std::io::{Cursor, Read};

use crate::error::{Error, Result};

/// Sparse extent magic number ("KDMV" in little-endian).
pub const VMDK_MAGIC: u32 = 0x564D_444B;

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

const FLAG_COMPRESSED: u32 = 1 << 16;
const FLAG_MARKERS: u32 = 1 << 17;

/// Deflate grain compression.
const COMPRESSION_DEFLATE: u16 = 1;

/// Parsed hosted sparse extent header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseHeader {
    pub version: u32,
    pub flags: u32,
    /// Capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    pub compress_algorithm: u16,
}

impl SparseHeader {
    /// Parse a header from the first sector of an extent.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, String> {
        if data.len() < SECTOR_SIZE as usize {
            return Err(format!(
                "file is {} bytes, shorter than a sparse header",
                data.len()
            ));
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != VMDK_MAGIC {
            return Err(format!(
                "invalid VMDK magic: expected 0x{:X}, got 0x{:X}",
                VMDK_MAGIC, magic
            ));
        }

        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let flags = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        let capacity = u64::from_le_bytes([
            data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
        ]);
        let grain_size = u64::from_le_bytes([
            data[20], data[21], data[22], data[23], data[24], data[25], data[26], data[27],
        ]);
        let compress_algorithm = u16::from_le_bytes([data[77], data[78]]);

        Ok(Self {
            version,
            flags,
            capacity,
            grain_size,
            compress_algorithm,
        })
    }

    /// Check if grains are compressed.
    pub fn is_compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    /// Check if the extent uses stream markers.
    pub fn has_markers(&self) -> bool {
        (self.flags & FLAG_MARKERS) != 0
    }

    /// Validate the header against the streamOptimized layout.
    pub fn check_stream_optimized(&self) -> std::result::Result<(), String> {
        if self.version > 3 {
            return Err(format!("unsupported sparse version {}", self.version));
        }
        if !self.is_compressed() || !self.has_markers() {
            return Err("extent is not stream-optimized (missing compressed grains or markers)".to_string());
        }
        if self.compress_algorithm != COMPRESSION_DEFLATE {
            return Err(format!(
                "unsupported grain compression {}",
                self.compress_algorithm
            ));
        }
        if self.grain_size == 0 {
            return Err("grain size is zero".to_string());
        }
        Ok(())
    }
}

/// Check that a payload is a stream-optimized VMDK.
///
/// Reads the first sector from `reader` and returns a reader that yields the
/// complete payload, header included.
///
/// # Errors
///
/// Returns [`Error::DiskFormat`] if the header is short, has the wrong magic,
/// or lacks the stream-optimized flags.
pub fn verify_stream_optimized(
    path: &str,
    mut reader: Box<dyn Read + Send>,
) -> Result<Box<dyn Read + Send>> {
    let mut header = Vec::with_capacity(SECTOR_SIZE as usize);
    (&mut reader)
        .take(SECTOR_SIZE)
        .read_to_end(&mut header)
        .map_err(|e| disk_error(path, e.to_string()))?;

    SparseHeader::from_bytes(&header)
        .and_then(|parsed| parsed.check_stream_optimized())
        .map_err(|message| disk_error(path, message))?;

    Ok(Box::new(Cursor::new(header).chain(reader)))
}

fn disk_error(path: &str, message: String) -> Error {
    Error::DiskFormat {
        path: path.to_string(),
        message,
    }
}

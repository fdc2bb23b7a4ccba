//! Checkpoint file header (spec §3 `Header`, §6 "Checkpoint file format").
//!
//! ```text
//! offset   bytes       meaning
//! 0        8           region count N
//! 8        N*(4+8)     N tuples { id: i32, size: u64 }
//! 8+12N    >=0         region payloads, in header order
//! ```

use std::io::{self, Read, Write};

use crate::error::{EngineError, EngineResult};

/// One region's `(id, size)` entry in a checkpoint header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionEntry {
    /// Region id, as registered by the application.
    pub id: i32,
    /// Byte length of the region's payload.
    pub size: u64,
}

/// Parsed checkpoint header.
#[derive(Debug, Clone, Default)]
pub struct Header {
    /// Regions in the order they were written, matching payload order.
    pub entries: Vec<RegionEntry>,
}

impl Header {
    /// Size in bytes of the encoded header (not including payloads).
    pub fn encoded_len(&self) -> u64 {
        8 + self.entries.len() as u64 * 12
    }

    /// Sum of all region payload sizes.
    pub fn payload_len(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Write `region count` then the `(id, size)` tuples.
    pub fn write_to<W: Write>(&self, mut w: W) -> EngineResult<()> {
        w.write_all(&(self.entries.len() as u64).to_le_bytes())?;
        for entry in &self.entries {
            w.write_all(&entry.id.to_le_bytes())?;
            w.write_all(&entry.size.to_le_bytes())?;
        }
        Ok(())
    }

    /// Read and validate a header from the start of `r`. Does not read the
    /// payload bytes that follow.
    pub fn read_from<R: Read>(mut r: R) -> EngineResult<Header> {
        let mut count_buf = [0u8; 8];
        r.read_exact(&mut count_buf)
            .map_err(|e| wrap_truncated(e, "region count"))?;
        let count = u64::from_le_bytes(count_buf);

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut id_buf = [0u8; 4];
            let mut size_buf = [0u8; 8];
            r.read_exact(&mut id_buf)
                .map_err(|e| wrap_truncated(e, "region id"))?;
            r.read_exact(&mut size_buf)
                .map_err(|e| wrap_truncated(e, "region size"))?;
            entries.push(RegionEntry {
                id: i32::from_le_bytes(id_buf),
                size: u64::from_le_bytes(size_buf),
            });
        }
        Ok(Header { entries })
    }

    /// Validate that `file_size` is exactly the header plus the sum of
    /// region sizes (spec §8 "Header consistency").
    pub fn validate_file_size(&self, file_size: u64) -> EngineResult<()> {
        let expected = self.encoded_len() + self.payload_len();
        if expected != file_size {
            return Err(EngineError::HeaderCorrupt(format!(
                "declared {expected} bytes, file is {file_size} bytes"
            )));
        }
        Ok(())
    }
}

fn wrap_truncated(e: io::Error, what: &str) -> EngineError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        EngineError::HeaderCorrupt(format!("truncated while reading {what}"))
    } else {
        EngineError::IoFailure(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_and_validates_size() {
        let header = Header {
            entries: vec![
                RegionEntry { id: 0, size: 4 },
                RegionEntry { id: 1, size: 32 },
                RegionEntry { id: 2, size: 11 },
            ],
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        let parsed = Header::read_from(Cursor::new(&buf)).unwrap();
        assert_eq!(parsed.entries, header.entries);

        let file_size = header.encoded_len() + header.payload_len();
        header.validate_file_size(file_size).unwrap();
        assert!(header.validate_file_size(file_size - 1).is_err());
    }

    #[test]
    fn truncated_header_is_header_corrupt() {
        let bytes = 5u64.to_le_bytes();
        let err = Header::read_from(Cursor::new(&bytes[..4])).unwrap_err();
        assert!(matches!(err, EngineError::HeaderCorrupt(_)));
    }
}

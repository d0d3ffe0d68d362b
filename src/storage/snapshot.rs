//! Snapshot file codec.
//!
//! Layout:
//! ```text
//! [magic: 4 bytes "KGRF"][version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```
//! Link contents are hex-encoded inside the JSON body.

use std::fs::{self, File};
use std::io::{BufReader, Error as IoError, ErrorKind, Read, Result as IoResult, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::addr::Addr;
use crate::error::{GraphError, GraphResult};
use crate::storage::element::Element;

/// Current snapshot version.
const SNAPSHOT_VERSION: u8 = 1;

/// Magic bytes identifying a snapshot file.
pub const MAGIC: [u8; 4] = *b"KGRF";

/// Largest body accepted on load (1 GiB).
const MAX_BODY_SIZE: usize = 1 << 30;

/// Hex-encoded link content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Link address.
    pub addr: Addr,
    /// Content bytes as lowercase hex.
    pub hex: String,
}

/// Everything needed to rebuild a store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// Slots per segment at save time.
    pub segment_capacity: u16,
    /// Live elements at their addresses.
    pub elements: Vec<(Addr, Element)>,
    /// Link contents.
    pub contents: Vec<ContentRecord>,
    /// System identifier bindings.
    #[serde(default)]
    pub identifiers: Vec<(String, Addr)>,
}

impl Snapshot {
    /// Builds a snapshot from element and content copies.
    #[must_use]
    pub fn new(segment_capacity: u16, elements: Vec<(Addr, Element)>, contents: Vec<(Addr, Vec<u8>)>) -> Self {
        Self {
            created_at: Utc::now(),
            segment_capacity,
            elements,
            contents: contents
                .into_iter()
                .map(|(addr, bytes)| ContentRecord {
                    addr,
                    hex: hex::encode(bytes),
                })
                .collect(),
            identifiers: Vec::new(),
        }
    }

    /// Attaches system identifier bindings.
    #[must_use]
    pub fn with_identifiers(mut self, identifiers: Vec<(String, Addr)>) -> Self {
        self.identifiers = identifiers;
        self
    }

    /// Decoded link contents.
    pub fn decoded_contents(&self) -> GraphResult<Vec<(Addr, Vec<u8>)>> {
        self.contents
            .iter()
            .map(|rec| {
                hex::decode(&rec.hex)
                    .map(|bytes| (rec.addr, bytes))
                    .map_err(|e| GraphError::StreamIo {
                        reason: format!("content of {} is not hex: {e}", rec.addr),
                    })
            })
            .collect()
    }
}

fn encode(snapshot: &Snapshot, writer: &mut impl Write) -> IoResult<()> {
    let data = serde_json::to_vec(snapshot)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len())
        .map_err(|_| IoError::new(ErrorKind::InvalidData, "snapshot body too large"))?;

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    writer.write_all(&MAGIC)?;
    writer.write_all(&[SNAPSHOT_VERSION])?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&data)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

fn decode(reader: &mut impl Read) -> IoResult<Snapshot> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("invalid magic bytes: expected {MAGIC:?}, got {magic:?}"),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != SNAPSHOT_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported snapshot version: {} (expected {SNAPSHOT_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_BODY_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("snapshot size {len} exceeds maximum {MAX_BODY_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);
    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x} (data corrupted)"),
        ));
    }

    serde_json::from_slice(&data)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Writes `snapshot` to `path`, replacing any previous file atomically.
pub fn save(path: &Path, snapshot: &Snapshot) -> GraphResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        encode(snapshot, &mut file)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a snapshot. Returns `None` if no file exists at `path`.
pub fn load(path: &Path) -> GraphResult<Option<Snapshot>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    Ok(Some(decode(&mut reader)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementType;
    use std::io::Cursor;

    fn sample() -> Snapshot {
        let el = Element {
            ty: ElementType::CONST_LINK,
            ..Element::fresh()
        };
        Snapshot::new(16, vec![(Addr::new(1, 3), el)], vec![(Addr::new(1, 3), b"hi".to_vec())])
            .with_identifiers(vec![("greeting".to_string(), Addr::new(1, 3))])
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.snapshot");
        save(&path, &sample()).unwrap();

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.segment_capacity, 16);
        assert_eq!(loaded.elements[0].0, Addr::new(1, 3));
        assert_eq!(loaded.decoded_contents().unwrap()[0].1, b"hi");
        assert_eq!(loaded.identifiers[0].0, "greeting");
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn test_detects_corruption() {
        let mut buf = Vec::new();
        encode(&sample(), &mut buf).unwrap();
        let idx = buf.len() / 2;
        buf[idx] ^= 0xFF;

        let err = decode(&mut Cursor::new(buf)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("CRC") || msg.contains("deserialization"));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let err = decode(&mut Cursor::new(b"NOPE\x01".to_vec())).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_bad_hex_reported() {
        let mut snap = sample();
        snap.contents[0].hex = "zz".to_string();
        assert_eq!(
            snap.decoded_contents().unwrap_err().code(),
            crate::error::ResultCode::StreamIo
        );
    }
}

//! Link payloads.
//!
//! Contents are held in memory and indexed by their blake3 digest so that
//! links carrying identical bytes can be found without scanning.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, RwLock};

use crate::addr::Addr;
use crate::error::{GraphError, GraphResult};

/// Seekable byte source used to pass link contents in and out.
pub trait ContentStream: Read + Seek + Send {
    /// Total length in bytes. The stream position is preserved.
    fn length(&mut self) -> io::Result<u64> {
        let pos = self.stream_position()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(end)
    }
}

impl<T: AsRef<[u8]> + Send> ContentStream for Cursor<T> {}

impl ContentStream for std::fs::File {}

/// Growable in-memory stream.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    inner: Cursor<Vec<u8>>,
}

impl MemoryStream {
    /// Creates a stream positioned at the start of `bytes`.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: Cursor::new(bytes),
        }
    }

    /// Creates a stream holding the UTF-8 bytes of `text`.
    #[must_use]
    pub fn from_text(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }

    /// Borrowed view of the whole buffer.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.get_ref()
    }

    /// Consumes the stream and returns its buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_inner()
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl ContentStream for MemoryStream {
    fn length(&mut self) -> io::Result<u64> {
        Ok(self.inner.get_ref().len() as u64)
    }
}

/// Reads a whole stream from its start.
pub fn read_stream(stream: &mut dyn ContentStream) -> GraphResult<Vec<u8>> {
    let stream_err = |e: io::Error| GraphError::StreamIo {
        reason: e.to_string(),
    };
    let len = stream.length().map_err(stream_err)?;
    stream.seek(SeekFrom::Start(0)).map_err(stream_err)?;
    let mut bytes = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
    stream.read_to_end(&mut bytes).map_err(stream_err)?;
    Ok(bytes)
}

#[derive(Debug, Default)]
struct Tables {
    contents: HashMap<Addr, Arc<[u8]>>,
    by_digest: HashMap<blake3::Hash, BTreeSet<Addr>>,
}

impl Tables {
    fn unindex(&mut self, addr: Addr, old: &[u8]) {
        let digest = blake3::hash(old);
        if let Some(set) = self.by_digest.get_mut(&digest) {
            set.remove(&addr);
            if set.is_empty() {
                self.by_digest.remove(&digest);
            }
        }
    }
}

/// Contents of every link, with an exact-match index.
#[derive(Debug)]
pub struct LinkContentStore {
    max_searchable: usize,
    tables: RwLock<Tables>,
}

impl LinkContentStore {
    /// Creates an empty store. Contents longer than `max_searchable` are not indexed.
    #[must_use]
    pub fn new(max_searchable: usize) -> Self {
        Self {
            max_searchable,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Replaces the content of `addr`.
    pub fn set(&self, addr: Addr, bytes: Vec<u8>) -> GraphResult<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| GraphError::poisoned("content.set"))?;
        if let Some(old) = tables.contents.remove(&addr) {
            tables.unindex(addr, &old);
        }
        if bytes.len() <= self.max_searchable {
            tables
                .by_digest
                .entry(blake3::hash(&bytes))
                .or_default()
                .insert(addr);
        }
        tables.contents.insert(addr, bytes.into());
        Ok(())
    }

    /// Content of `addr`, if any was set.
    pub fn get(&self, addr: Addr) -> GraphResult<Option<Arc<[u8]>>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| GraphError::poisoned("content.get"))?;
        Ok(tables.contents.get(&addr).cloned())
    }

    /// Drops the content of `addr`.
    pub fn remove(&self, addr: Addr) -> GraphResult<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| GraphError::poisoned("content.remove"))?;
        if let Some(old) = tables.contents.remove(&addr) {
            tables.unindex(addr, &old);
        }
        Ok(())
    }

    /// Links whose content equals `bytes`, in address order.
    pub fn find(&self, bytes: &[u8]) -> GraphResult<Vec<Addr>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| GraphError::poisoned("content.find"))?;
        Ok(tables
            .by_digest
            .get(&blake3::hash(bytes))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Number of links with content.
    pub fn len(&self) -> GraphResult<usize> {
        let tables = self
            .tables
            .read()
            .map_err(|_| GraphError::poisoned("content.len"))?;
        Ok(tables.contents.len())
    }

    /// Copies of every stored content.
    pub fn entries(&self) -> GraphResult<Vec<(Addr, Vec<u8>)>> {
        let tables = self
            .tables
            .read()
            .map_err(|_| GraphError::poisoned("content.entries"))?;
        let mut entries: Vec<(Addr, Vec<u8>)> = tables
            .contents
            .iter()
            .map(|(addr, bytes)| (*addr, bytes.to_vec()))
            .collect();
        entries.sort_by_key(|(addr, _)| *addr);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_stream_length_keeps_position() {
        let mut stream = MemoryStream::from_text("hello");
        let mut first = [0u8; 2];
        stream.read_exact(&mut first).unwrap();
        assert_eq!(stream.length().unwrap(), 5);
        let mut rest = String::new();
        stream.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "llo");
    }

    #[test]
    fn test_read_stream_rewinds() {
        let mut cursor = Cursor::new(b"abc".to_vec());
        cursor.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(read_stream(&mut cursor).unwrap(), b"abc");
    }

    #[test]
    fn test_set_replaces_and_reindexes() {
        let store = LinkContentStore::new(1024);
        let a = Addr::new(1, 1);
        let b = Addr::new(1, 2);
        store.set(a, b"apple".to_vec()).unwrap();
        store.set(b, b"apple".to_vec()).unwrap();
        assert_eq!(store.find(b"apple").unwrap(), vec![a, b]);

        store.set(a, b"pear".to_vec()).unwrap();
        assert_eq!(store.find(b"apple").unwrap(), vec![b]);
        assert_eq!(store.find(b"pear").unwrap(), vec![a]);
        assert_eq!(&*store.get(a).unwrap().unwrap(), b"pear");
    }

    #[test]
    fn test_remove_clears_index() {
        let store = LinkContentStore::new(1024);
        let a = Addr::new(2, 7);
        store.set(a, b"x".to_vec()).unwrap();
        store.remove(a).unwrap();
        assert!(store.find(b"x").unwrap().is_empty());
        assert!(store.get(a).unwrap().is_none());
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn test_large_content_not_indexed() {
        let store = LinkContentStore::new(4);
        let a = Addr::new(1, 1);
        store.set(a, b"too long".to_vec()).unwrap();
        assert!(store.find(b"too long").unwrap().is_empty());
        assert!(store.get(a).unwrap().is_some());
        assert_eq!(store.entries().unwrap().len(), 1);
    }
}

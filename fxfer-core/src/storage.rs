//! Storage collaborator: where listed, hashed, sent and received files live.

use std::collections::BTreeMap;
use std::io;

use crate::integrity;

/// File access the engine needs. Implemented by the host (a directory, flash, ...).
pub trait Storage: Send {
    /// Names offered to a FILES_LIST_REQ, in listing order.
    fn list_files(&mut self) -> io::Result<Vec<String>>;

    /// 32-bit content hash answered to a FILE_HASH_REQ.
    fn file_hash(&mut self, name: &str) -> io::Result<u32>;

    fn file_size(&mut self, name: &str) -> io::Result<u64>;

    /// Fill `out` with the bytes at `offset`. Short files are an error.
    fn read_chunk(&mut self, name: &str, offset: u64, out: &mut [u8]) -> io::Result<()>;

    /// Called on FILE_SEND_REQ before it is acknowledged; a failure is reported to the peer.
    fn begin_receive(&mut self, _name: &str) -> io::Result<()> {
        Ok(())
    }

    /// Append a received chunk. `last` is set for segment 0. Returns true when the file is complete.
    fn append(&mut self, name: &str, data: &[u8], last: bool) -> io::Result<bool>;
}

/// In-memory storage, for tests and hosts without a filesystem.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: BTreeMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.files.insert(name.into(), data);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    fn file(&self, name: &str) -> io::Result<&Vec<u8>> {
        self.files
            .get(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no file {}", name)))
    }
}

impl Storage for MemoryStorage {
    fn list_files(&mut self) -> io::Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }

    fn file_hash(&mut self, name: &str) -> io::Result<u32> {
        self.file(name).map(|data| integrity::checksum(data))
    }

    fn file_size(&mut self, name: &str) -> io::Result<u64> {
        self.file(name).map(|data| data.len() as u64)
    }

    fn read_chunk(&mut self, name: &str, offset: u64, out: &mut [u8]) -> io::Result<()> {
        let data = self.file(name)?;
        let start = usize::try_from(offset).map_err(|_| io::ErrorKind::InvalidInput)?;
        let src = start
            .checked_add(out.len())
            .and_then(|end| data.get(start..end))
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn begin_receive(&mut self, name: &str) -> io::Result<()> {
        self.files.insert(name.to_owned(), Vec::new());
        Ok(())
    }

    fn append(&mut self, name: &str, data: &[u8], last: bool) -> io::Result<bool> {
        self.files
            .entry(name.to_owned())
            .or_default()
            .extend_from_slice(data);
        Ok(last)
    }
}

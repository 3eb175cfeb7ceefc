//! Integrity: CRC32 over packets and whole files.

use std::io::{self, Read};

use crc32fast::Hasher;

/// Read size used when hashing a stream.
const HASH_READ_CHUNK: usize = 8192;

/// CRC32 of a byte slice.
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Verify bytes against an expected CRC32.
pub fn verify(bytes: &[u8], expected: u32) -> bool {
    checksum(bytes) == expected
}

/// CRC32 of everything the reader yields. Used by storages to answer file hash requests.
pub fn checksum_reader<R: Read>(mut reader: R) -> io::Result<u32> {
    let mut hasher = Hasher::new();
    let mut buf = [0u8; HASH_READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

//! On-disk snapshot of the in-memory queue.
//!
//! Layout: a 32-bit big-endian count `N`, followed by `N` entries each a
//! 16-bit big-endian length `L` and `L` payload bytes. Read and write both
//! take an exclusive, non-blocking advisory `flock` — failure to acquire it
//! is logged and treated as a no-op, never fatal. Atomicity is best-effort:
//! no fsync, no rename-swap. The spool is a hint, not a WAL; losing up to
//! one snapshot interval of records on crash is acceptable.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use crate::error::BrokerError;

/// Take an exclusive, non-blocking BSD `flock` on `file`.
///
/// Shared with [`crate::status`] and [`crate::lifecycle`] — all three treat
/// the lock as a coordination hint, not a mutual-exclusion primitive:
/// failing to acquire one is non-fatal to the caller.
pub(crate) fn lock_exclusive_nonblocking(file: &File) -> io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Load the spooled records from `path`.
///
/// On a partial or corrupt read, the records read so far are returned and
/// the remainder is abandoned with a warning — this mirrors the reference
/// broker's "stop at the first short read" behavior rather than treating a
/// truncated spool as a hard failure.
pub fn load(path: &Path) -> Result<Vec<Vec<u8>>, BrokerError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BrokerError::SpoolIo(format!("open {}: {e}", path.display()))),
    };

    if let Err(e) = lock_exclusive_nonblocking(&file) {
        return Err(BrokerError::SpoolIo(format!(
            "lock {}: {e}",
            path.display()
        )));
    }

    let mut reader = io::BufReader::new(file);
    let mut count_buf = [0u8; 4];
    if reader.read_exact(&mut count_buf).is_err() {
        return Ok(Vec::new());
    }
    let count = u32::from_be_bytes(count_buf);

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len_buf = [0u8; 2];
        if reader.read_exact(&mut len_buf).is_err() {
            log::warn!(
                "spool {} ended early; read {} of {count} record(s)",
                path.display(),
                records.len()
            );
            break;
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        if reader.read_exact(&mut payload).is_err() {
            log::warn!(
                "spool {} truncated mid-record; read {} of {count} record(s)",
                path.display(),
                records.len()
            );
            break;
        }
        records.push(payload);
    }

    Ok(records)
}

/// Persist `records` to `path`, truncating any prior content.
///
/// Failures are logged as warnings; the caller keeps the records in memory
/// regardless — the spool is a hint, not a write-ahead log.
pub fn save(path: &Path, records: &[Vec<u8>]) -> Result<(), BrokerError> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| BrokerError::SpoolIo(format!("open {}: {e}", path.display())))?;

    lock_exclusive_nonblocking(&file)
        .map_err(|e| BrokerError::SpoolIo(format!("lock {}: {e}", path.display())))?;

    let mut writer = io::BufWriter::new(file);
    writer
        .write_all(&(records.len() as u32).to_be_bytes())
        .map_err(|e| BrokerError::SpoolIo(e.to_string()))?;
    for record in records {
        writer
            .write_all(&(record.len() as u16).to_be_bytes())
            .map_err(|e| BrokerError::SpoolIo(e.to_string()))?;
        writer
            .write_all(record)
            .map_err(|e| BrokerError::SpoolIo(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| BrokerError::SpoolIo(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_a_sequence_of_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spool.bin");
        let records = vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()];

        save(&path, &records).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded, records);
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.bin");
        assert_eq!(load(&path).unwrap(), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn truncated_file_yields_partial_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spool.bin");

        // Declare 3 records but only write 1 fully.
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.extend_from_slice(b"one");
        std::fs::write(&path, &buf).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, vec![b"one".to_vec()]);
    }

    #[test]
    fn empty_sequence_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spool.bin");
        save(&path, &[]).unwrap();
        assert_eq!(load(&path).unwrap(), Vec::<Vec<u8>>::new());
    }
}

//! The YAML status snapshot.
//!
//! Written via the same create-exclusive-plus-advisory-lock rendezvous the
//! reference daemon module uses for its pidfile (`write_pid_file`), adapted
//! to a dual role the `<path>~` sentinel is kept for external-contract
//! compatibility: a `USR2` consumer creates `<path>~` to request a fresh
//! write, and the writer also uses it as its own advisory lock while
//! composing the payload.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::BrokerError;
use crate::listener::Signature;
use crate::upstream::{HostPort, State};

#[derive(Debug, Serialize)]
pub struct ListenerStatus {
    pub socket: String,
    pub signature: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UpstreamStatus {
    pub state: u8,
    pub hostport: String,
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub pid: u32,
    pub queue_length: usize,
    pub start_time: String,
    pub uptime_seconds: u64,
    pub listener: ListenerStatus,
    pub socket: String,
    pub upstream: UpstreamStatus,
}

impl Status {
    pub fn new(
        queue_length: usize,
        start_time: SystemTime,
        listener_path: &Path,
        listener_signature: Option<Signature>,
        hostport: &HostPort,
        upstream_state: State,
    ) -> Self {
        let start_epoch = start_time
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        let uptime = SystemTime::now()
            .duration_since(start_time)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        Self {
            pid: std::process::id(),
            queue_length,
            start_time: start_epoch.to_string(),
            uptime_seconds: uptime,
            listener: ListenerStatus {
                socket: listener_path.display().to_string(),
                signature: listener_signature.map(Signature::to_hex),
            },
            socket: listener_path.display().to_string(),
            upstream: UpstreamStatus {
                state: upstream_state.as_numeric(),
                hostport: hostport.to_string(),
            },
        }
    }
}

/// Write the status payload atomically: create `<path>~` with exclusive
/// create + advisory lock, write `path`, remove `<path>~`. Failure to
/// acquire the rendezvous lock is logged and treated as a skipped round
/// rather than a fatal error.
pub fn write(path: &Path, status: &Status) -> Result<(), BrokerError> {
    let lock_path = lockfile_path(path);
    let lock_file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(f) => f,
        Err(e) => {
            log::warn!("status lockfile {} unavailable: {e}", lock_path.display());
            return Err(BrokerError::SpoolIo(format!(
                "status lockfile {}: {e}",
                lock_path.display()
            )));
        }
    };
    if let Err(e) = crate::spool::lock_exclusive_nonblocking(&lock_file) {
        let _ = std::fs::remove_file(&lock_path);
        return Err(BrokerError::SpoolIo(format!(
            "lock {}: {e}",
            lock_path.display()
        )));
    }

    let yaml = serde_yaml::to_string(status)
        .map_err(|e| BrokerError::SpoolIo(format!("serialize status: {e}")))?;
    let result = std::fs::write(path, yaml)
        .map_err(|e| BrokerError::SpoolIo(format!("write status {}: {e}", path.display())));

    let _ = std::fs::remove_file(&lock_path);
    result
}

fn lockfile_path(path: &Path) -> std::path::PathBuf {
    let mut os_string = path.as_os_str().to_os_string();
    os_string.push("~");
    os_string.into()
}

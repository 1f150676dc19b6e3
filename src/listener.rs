//! Owner of the Unix datagram intake socket.
//!
//! Grounded on `socket/server.rs`'s accept-loop idiom (stale-file removal,
//! explicit permission bits, std-to-tokio socket handoff), adapted from a
//! connection-oriented `UnixListener` to a connectionless `UnixDatagram`,
//! and extended with a signature/integrity self-check: the accept-loop
//! version never needs to detect a third party swapping the socket file
//! out from under it, but a datagram listener bound for a long-running
//! daemon does.

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::path::{Path, PathBuf};

use tokio::net::UnixDatagram;

use crate::envelope::PROBE_MAX_LEN;
use crate::error::BrokerError;

/// Device+inode pair identifying the bound socket file, packed for display
/// and comparison. Detects the file being unlinked and recreated out from
/// under the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    dev: u64,
    ino: u64,
}

impl Signature {
    fn of(path: &Path) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::symlink_metadata(path)?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    pub fn to_hex(self) -> String {
        format!("{:016x}{:016x}", self.dev, self.ino)
    }
}

pub struct Listener {
    socket: UnixDatagram,
    path: PathBuf,
    signature: Signature,
}

/// Probe `path`: does a live peer already answer there? Sends a single NUL
/// byte (the liveness-probe datagram) and does not wait for
/// a reply — `UnixDatagram` delivery to an existing listener is the signal;
/// absence of a listener surfaces as a connect-time error.
fn probe_is_alive(path: &Path) -> bool {
    let probe = match StdUnixDatagram::unbound() {
        Ok(s) => s,
        Err(_) => return false,
    };
    probe.connect(path).and_then(|()| probe.send(&[0u8])).is_ok()
}

impl Listener {
    /// Bind the intake socket at `path`, optionally applying `perms` (masked
    /// to the low 9 bits). Returns [`BrokerError::FatalListenerConflict`] if
    /// a live broker already answers there.
    pub fn bind(path: &Path, perms: Option<u32>) -> Result<Self, BrokerError> {
        if path.exists() {
            let is_socket = std::fs::symlink_metadata(path)
                .map(|m| m.file_type().is_socket())
                .unwrap_or(false);
            if is_socket && probe_is_alive(path) {
                return Err(BrokerError::FatalListenerConflict(path.to_path_buf()));
            }
            std::fs::remove_file(path).map_err(|e| {
                BrokerError::TransientListener(format!("unlink stale {}: {e}", path.display()))
            })?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BrokerError::TransientListener(format!(
                        "create parent dir for {}: {e}",
                        path.display()
                    ))
                })?;
            }
        }

        let std_socket = StdUnixDatagram::bind(path)
            .map_err(|e| BrokerError::TransientListener(format!("bind {}: {e}", path.display())))?;

        if let Some(mode) = perms {
            let perms = std::fs::Permissions::from_mode(mode & 0o777);
            std::fs::set_permissions(path, perms).map_err(|e| {
                BrokerError::TransientListener(format!(
                    "set permissions on {}: {e}",
                    path.display()
                ))
            })?;
        }

        let signature = Signature::of(path)
            .map_err(|e| BrokerError::TransientListener(format!("stat {}: {e}", path.display())))?;

        std_socket.set_nonblocking(true).map_err(|e| {
            BrokerError::TransientListener(format!("set nonblocking {}: {e}", path.display()))
        })?;
        let socket = UnixDatagram::from_std(std_socket)
            .map_err(|e| BrokerError::TransientListener(format!("tokio handoff: {e}")))?;

        log::info!("listener bound at {}", path.display());

        Ok(Self {
            socket,
            path: path.to_path_buf(),
            signature,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Verify the on-disk file is still the one this listener bound:
    /// exists, is a socket, matches the captured signature, and answers a
    /// probe. Any failure means a rebind is due at the next tick.
    pub fn check(&self) -> bool {
        let meta = match std::fs::symlink_metadata(&self.path) {
            Ok(m) => m,
            Err(_) => return false,
        };
        if !meta.file_type().is_socket() {
            return false;
        }
        match Signature::of(&self.path) {
            Ok(sig) if sig == self.signature => {}
            _ => return false,
        }
        probe_is_alive(&self.path)
    }

    /// Receive one datagram, if any is pending. Returns `Ok(None)` for a
    /// liveness probe (length ≤ [`PROBE_MAX_LEN`]) and `Ok(Some(record))`
    /// for a decoded record.
    pub async fn recv(&self) -> Result<Option<Vec<u8>>, BrokerError> {
        let mut buf = vec![0u8; 65536];
        let n = self
            .socket
            .recv(&mut buf)
            .await
            .map_err(|e| BrokerError::TransientListener(format!("recv: {e}")))?;
        buf.truncate(n);
        if n <= PROBE_MAX_LEN {
            return Ok(None);
        }
        match crate::envelope::decode_intake(&buf) {
            Ok(Some(record)) => Ok(Some(record.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn readable(&self) -> std::io::Result<()> {
        self.socket.readable().await
    }

    /// Remove the socket from the event loop and unlink the file on disk.
    /// Only called at shutdown; a routine rebind drops the `Listener` value
    /// without unlinking.
    pub fn close_and_unlink(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bind_creates_socket_with_requested_perms() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intake.sock");
        let listener = Listener::bind(&path, Some(0o600)).unwrap();
        let meta = std::fs::symlink_metadata(listener.path()).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn bind_removes_stale_non_listening_socket_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intake.sock");
        {
            let stale = StdUnixDatagram::bind(&path).unwrap();
            drop(stale);
        }
        // File lingers on disk after the binder drops without unlinking.
        assert!(path.exists());
        let listener = Listener::bind(&path, None);
        assert!(listener.is_ok());
    }

    #[test]
    fn bind_rejects_when_a_live_peer_already_listens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intake.sock");
        let _first = Listener::bind(&path, None).unwrap();
        let second = Listener::bind(&path, None);
        assert!(matches!(second, Err(BrokerError::FatalListenerConflict(_))));
    }

    #[test]
    fn check_detects_signature_drift_after_swap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intake.sock");
        let listener = Listener::bind(&path, None).unwrap();
        assert!(listener.check());

        // A third party removes and recreates the file.
        std::fs::remove_file(&path).unwrap();
        let _replacement = StdUnixDatagram::bind(&path).unwrap();

        assert!(!listener.check());
    }

    #[test]
    fn check_fails_when_file_is_gone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intake.sock");
        let listener = Listener::bind(&path, None).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(!listener.check());
    }

    #[tokio::test]
    async fn recv_decodes_a_well_formed_datagram() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intake.sock");
        let listener = Listener::bind(&path, None).unwrap();

        let sender = StdUnixDatagram::unbound().unwrap();
        sender.connect(&path).unwrap();
        let datagram = crate::envelope::encode_intake(b"hello");
        sender.send(&datagram).unwrap();

        let received = listener.recv().await.unwrap();
        assert_eq!(received, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn recv_accepts_probe_without_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intake.sock");
        let listener = Listener::bind(&path, None).unwrap();

        let sender = StdUnixDatagram::unbound().unwrap();
        sender.connect(&path).unwrap();
        sender.send(&[0u8]).unwrap();

        let received = listener.recv().await.unwrap();
        assert_eq!(received, None);
    }
}
